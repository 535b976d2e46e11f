//! # devjail Terminal Sessions
//!
//! Long-lived shell processes addressed by caller-chosen ids.
//!
//! Each session runs in its own process group with three background tasks:
//! - a supervisor that exclusively owns the `Child` handle, waits for it and
//!   publishes the exit on a `watch` channel
//! - two readers pumping stdout and stderr into one [`OutputBuffer`]
//!
//! Callers only ever write to stdin and drain the buffer, so `exec` and
//! `read` return immediately whatever the shell is doing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devjail_common::process_utils::{group_alive, signal_group, GroupSignal};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::{JailError, JailResult};
use crate::output_buffer::OutputBuffer;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Published by the supervisor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Exited(Option<i32>),
}

impl ProcessState {
    fn status(self) -> SessionStatus {
        match self {
            ProcessState::Running => SessionStatus::Running,
            ProcessState::Exited(_) => SessionStatus::Exited,
        }
    }

    fn exit_code(self) -> Option<i32> {
        match self {
            ProcessState::Running => None,
            ProcessState::Exited(code) => code,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub buffered_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecAck {
    pub session_id: String,
    pub bytes_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutput {
    pub session_id: String,
    pub output: String,
    pub dropped_bytes: u64,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub session_id: String,
    pub exit_code: Option<i32>,
    /// SIGKILL was needed after the grace period
    pub forced: bool,
}

struct Session {
    id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stdin: Mutex<Option<ChildStdin>>,
    output: Arc<OutputBuffer>,
    state: watch::Receiver<ProcessState>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    #[cfg(not(unix))]
    kill: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl Session {
    fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            session_id: self.id.clone(),
            pid: self.pid,
            status: state.status(),
            exit_code: state.exit_code(),
            started_at: self.started_at,
            buffered_bytes: self.output.len(),
        }
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }

    fn send_signal(&self, signal: GroupSignal) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.pid {
                if let Err(e) = signal_group(pgid, signal) {
                    warn!(session = %self.id, pgid, error = %e, "failed to signal process group");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            let kill = self
                .kill
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
        }
    }

    /// Wait until the supervisor reports an exit, at most `limit`.
    async fn wait_exit(&self, limit: Duration) -> Option<ProcessState> {
        let mut state = self.state.clone();
        let waited = timeout(limit, state.wait_for(|s| matches!(s, ProcessState::Exited(_))))
            .await
            .map(|changed| changed.map(|current| *current));
        match waited {
            Ok(Ok(current)) => Some(current),
            // supervisor gone; report whatever it published last
            Ok(Err(_)) => Some(self.state()),
            Err(_) => None,
        }
    }
}

/// Owner of every live terminal session.
pub struct SessionManager {
    root: PathBuf,
    shell: String,
    shell_args: Vec<String>,
    allow_shell: bool,
    output_limit: usize,
    close_grace: Duration,
    write_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    /// Sessions start in `root`, which should be the jail's canonical root.
    pub fn new(root: PathBuf, config: &EngineConfig) -> Self {
        Self {
            root,
            shell: config.shell.clone(),
            shell_args: config.shell_args.clone(),
            allow_shell: config.allow_shell,
            output_limit: config.session.output_limit_bytes,
            close_grace: config.session.close_grace(),
            write_timeout: config.session.write_timeout(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a shell for `session_id`.
    ///
    /// Must run on a runtime worker, not a `spawn_blocking` thread: on Linux
    /// the parent-death signal fires when the spawning thread exits.
    pub async fn open(&self, session_id: &str) -> JailResult<SessionInfo> {
        if !self.allow_shell {
            return Err(JailError::ShellDisabled);
        }

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            return Err(JailError::DuplicateSession {
                session_id: session_id.to_string(),
            });
        }

        let session = Arc::new(self.spawn_session(session_id)?);
        let info = session.info();
        sessions.insert(session_id.to_string(), session);

        info!(session = %session_id, pid = ?info.pid, shell = %self.shell, "terminal session opened");
        Ok(info)
    }

    /// Write `command` and a newline to the session's shell.
    pub async fn exec(&self, session_id: &str, command: &str) -> JailResult<ExecAck> {
        let session = self.get(session_id).await?;
        if let ProcessState::Exited(exit_code) = session.state() {
            return Err(exited(session_id, exit_code));
        }

        let line = format!("{command}\n");
        let mut stdin = session.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(exited(session_id, session.state().exit_code()));
        };

        let write = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await
        };
        let written = timeout(self.write_timeout, write).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                *stdin = None;
                return Err(exited(session_id, session.state().exit_code()));
            }
            Ok(Err(e)) => return Err(JailError::io_failure(None, "write to shell", e)),
            Err(_) => {
                warn!(session = %session_id, "shell stdin write timed out");
                return Err(JailError::io_failure(
                    None,
                    "write to shell",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "shell is not reading input"),
                ));
            }
        }

        debug!(session = %session_id, bytes = line.len(), "command sent");
        Ok(ExecAck {
            session_id: session_id.to_string(),
            bytes_written: line.len(),
        })
    }

    /// Output accumulated since the last draining read.
    pub async fn read(&self, session_id: &str, peek: bool) -> JailResult<SessionOutput> {
        let session = self.get(session_id).await?;
        let state = session.state();

        let chunk = if peek {
            session.output.peek()
        } else {
            session.output.drain(state == ProcessState::Running)
        };

        Ok(SessionOutput {
            session_id: session_id.to_string(),
            output: chunk.text,
            dropped_bytes: chunk.dropped_bytes,
            status: state.status(),
            exit_code: state.exit_code(),
        })
    }

    /// Terminate the session's process group and forget the session.
    pub async fn close(&self, session_id: &str) -> JailResult<CloseOutcome> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| JailError::UnknownSession {
                session_id: session_id.to_string(),
            })?;

        let outcome = terminate(&session, self.close_grace).await;
        info!(
            session = %session_id,
            exit_code = ?outcome.exit_code,
            forced = outcome.forced,
            "terminal session closed"
        );
        Ok(outcome)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Close every session; used on daemon shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }

        info!(count = drained.len(), "closing all terminal sessions");
        let mut closing = JoinSet::new();
        for session in drained {
            let grace = self.close_grace;
            closing.spawn(async move { terminate(&session, grace).await });
        }
        while closing.join_next().await.is_some() {}
    }

    async fn get(&self, session_id: &str) -> JailResult<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| JailError::UnknownSession {
                session_id: session_id.to_string(),
            })
    }

    fn spawn_session(&self, session_id: &str) -> JailResult<Session> {
        let mut command = Command::new(&self.shell);
        command
            .args(&self.shell_args)
            .current_dir(&self.root)
            .env("TERM", "dumb")
            .env("PAGER", "cat")
            .env("GIT_PAGER", "cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(devjail_common::process_utils::become_group_leader);
        }

        let mut child = command.spawn().map_err(|e| {
            JailError::io_failure(PathBuf::from(&self.shell), "spawn shell", e)
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let output = Arc::new(OutputBuffer::new(self.output_limit));
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        let mut tasks = Vec::with_capacity(3);
        if let Some(stdout) = stdout {
            tasks.push(tokio::spawn(pump(stdout, Arc::clone(&output))));
        }
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(pump(stderr, Arc::clone(&output))));
        }

        #[cfg(unix)]
        tasks.push(tokio::spawn(supervise(session_id.to_string(), child, state_tx)));

        #[cfg(not(unix))]
        let (kill_tx, kill_rx) = tokio::sync::oneshot::channel();
        #[cfg(not(unix))]
        tasks.push(tokio::spawn(supervise(
            session_id.to_string(),
            child,
            state_tx,
            kill_rx,
        )));

        Ok(Session {
            id: session_id.to_string(),
            pid,
            started_at: Utc::now(),
            stdin: Mutex::new(stdin),
            output,
            state: state_rx,
            tasks: std::sync::Mutex::new(tasks),
            #[cfg(not(unix))]
            kill: std::sync::Mutex::new(Some(kill_tx)),
        })
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL; finally stop the session tasks.
async fn terminate(session: &Session, grace: Duration) -> CloseOutcome {
    // EOF on stdin lets a well-behaved shell leave on its own
    session.stdin.lock().await.take();

    let mut forced = false;
    let mut state = session.state();
    let was_running = state == ProcessState::Running;

    if was_running {
        session.send_signal(GroupSignal::Terminate);
        state = match session.wait_exit(grace).await {
            Some(state) => state,
            None => {
                warn!(session = %session.id, "shell ignored SIGTERM, killing process group");
                forced = true;
                session.send_signal(GroupSignal::Kill);
                session.wait_exit(grace).await.unwrap_or(state)
            }
        };
    }

    // background jobs may outlive the shell itself; a group whose leader was
    // reaped before this close began may already name someone else's pgid
    #[cfg(unix)]
    {
        if let Some(pgid) = session.pid.filter(|_| was_running) {
            if group_alive(pgid) {
                let _ = signal_group(pgid, GroupSignal::Kill);
            }
        }
    }

    session.abort_tasks();

    CloseOutcome {
        session_id: session.id.clone(),
        exit_code: state.exit_code(),
        forced,
    }
}

#[cfg(unix)]
async fn supervise(session_id: String, mut child: Child, state: watch::Sender<ProcessState>) {
    let status = child.wait().await;
    publish_exit(&session_id, status, &state);
}

#[cfg(not(unix))]
async fn supervise(
    session_id: String,
    mut child: Child,
    state: watch::Sender<ProcessState>,
    kill: tokio::sync::oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    publish_exit(&session_id, status, &state);
}

fn publish_exit(
    session_id: &str,
    status: std::io::Result<std::process::ExitStatus>,
    state: &watch::Sender<ProcessState>,
) {
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(session = %session_id, error = %e, "failed to wait for shell");
            None
        }
    };
    debug!(session = %session_id, exit_code = ?code, "shell exited");
    let _ = state.send(ProcessState::Exited(code));
}

async fn pump<R>(mut reader: R, output: Arc<OutputBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => output.push(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "session output stream closed");
                break;
            }
        }
    }
}

fn exited(session_id: &str, exit_code: Option<i32>) -> JailError {
    JailError::SessionExited {
        session_id: session_id.to_string(),
        exit_code,
    }
}
