#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{BrokenProvider, Tmp};
use devjail_core::{Dispatcher, Request};
use serde_json::{json, Value};

async fn call(dispatcher: &Dispatcher, kind: &str, args: Value) -> Result<Value, String> {
    let request = Request::from_parts(kind, args).unwrap();
    dispatcher.dispatch(request).await.map_err(|e| e.kind().to_string())
}

/// Drain `term.read` until `needle` shows up or five seconds pass.
async fn read_until(dispatcher: &Dispatcher, session_id: &str, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = String::new();
    while Instant::now() < deadline {
        let out = call(dispatcher, "term.read", json!({ "session_id": session_id }))
            .await
            .unwrap();
        seen.push_str(out["output"].as_str().unwrap_or_default());
        if seen.contains(needle) {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {needle:?}; got {seen:?}");
}

#[tokio::test]
async fn echo_is_drained_exactly_once() {
    let tmp = Tmp::new();
    let dispatcher = tmp.dispatcher(Arc::new(BrokenProvider));

    call(&dispatcher, "term.open", json!({ "session_id": "s1" })).await.unwrap();
    call(&dispatcher, "term.exec", json!({ "session_id": "s1", "command": "echo hi" }))
        .await
        .unwrap();

    let output = read_until(&dispatcher, "s1", "hi\n").await;
    assert_eq!(output, "hi\n");

    let again = call(&dispatcher, "term.read", json!({ "session_id": "s1" })).await.unwrap();
    assert_eq!(again["output"], "");
    assert_eq!(again["status"], "running");

    call(&dispatcher, "term.close", json!({ "session_id": "s1" })).await.unwrap();
}

#[tokio::test]
async fn shell_state_persists_between_commands() {
    let tmp = Tmp::new();
    std::fs::create_dir(tmp.path().join("sub")).unwrap();
    let dispatcher = tmp.dispatcher(Arc::new(BrokenProvider));

    call(&dispatcher, "term.open", json!({ "session_id": "s" })).await.unwrap();
    for command in ["cd sub", "export GREETING=hello", "echo \"$GREETING from $(basename \"$PWD\")\""] {
        call(&dispatcher, "term.exec", json!({ "session_id": "s", "command": command }))
            .await
            .unwrap();
    }

    let output = read_until(&dispatcher, "s", "hello from sub").await;
    assert!(output.contains("hello from sub"));

    dispatcher.sessions().shutdown().await;
}

#[tokio::test]
async fn duplicate_open_is_rejected() {
    let tmp = Tmp::new();
    let dispatcher = tmp.dispatcher(Arc::new(BrokenProvider));

    call(&dispatcher, "term.open", json!({ "session_id": "dup" })).await.unwrap();
    let err = call(&dispatcher, "term.open", json!({ "session_id": "dup" })).await.unwrap_err();
    assert_eq!(err, "DuplicateSession");

    let listed = call(&dispatcher, "term.list", json!({})).await.unwrap();
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    dispatcher.sessions().shutdown().await;
}

#[tokio::test]
async fn closed_session_is_forgotten() {
    let tmp = Tmp::new();
    let dispatcher = tmp.dispatcher(Arc::new(BrokenProvider));

    call(&dispatcher, "term.open", json!({ "session_id": "gone" })).await.unwrap();
    call(&dispatcher, "term.close", json!({ "session_id": "gone" })).await.unwrap();

    for kind in ["term.read", "term.close"] {
        let err = call(&dispatcher, kind, json!({ "session_id": "gone" })).await.unwrap_err();
        assert_eq!(err, "UnknownSession", "{kind}");
    }
    let err = call(&dispatcher, "term.exec", json!({ "session_id": "gone", "command": "ls" }))
        .await
        .unwrap_err();
    assert_eq!(err, "UnknownSession");

    let listed = call(&dispatcher, "term.list", json!({})).await.unwrap();
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn exited_shell_reports_exit_code() {
    let tmp = Tmp::new();
    let dispatcher = tmp.dispatcher(Arc::new(BrokenProvider));

    call(&dispatcher, "term.open", json!({ "session_id": "e" })).await.unwrap();
    call(&dispatcher, "term.exec", json!({ "session_id": "e", "command": "exit 7" }))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let out = call(&dispatcher, "term.read", json!({ "session_id": "e" })).await.unwrap();
        if out["status"] == "exited" {
            assert_eq!(out["exit_code"], 7);
            break;
        }
        assert!(Instant::now() < deadline, "shell never exited");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let err = call(&dispatcher, "term.exec", json!({ "session_id": "e", "command": "ls" }))
        .await
        .unwrap_err();
    assert_eq!(err, "SessionExited");

    call(&dispatcher, "term.close", json!({ "session_id": "e" })).await.unwrap();
}
