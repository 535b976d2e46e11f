//! Diff providers backing `edit.suggest`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use devjail_core::{DiffProvider, LlmConfig};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are a precise code editor that generates unified diffs.";
const TEMPERATURE: f32 = 0.1;
const MAX_TOKENS: u32 = 2000;

/// Provider for `config`: the chat-completions client when an API key is
/// set, the offline fallback otherwise.
pub fn provider_from_config(config: &LlmConfig) -> Result<Arc<dyn DiffProvider>> {
    match config.api_key.as_deref() {
        Some(key) => Ok(Arc::new(ChatCompletionsProvider::new(config, key)?)),
        None => {
            warn!("no LLM API key configured; edit.suggest uses the offline fallback");
            Ok(Arc::new(FallbackProvider))
        }
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsProvider {
    pub fn new(config: &LlmConfig, api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .user_agent(concat!("devjaild/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl DiffProvider for ChatCompletionsProvider {
    async fn suggest_diff(
        &self,
        filename: &str,
        goal: &str,
        current_content: &str,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(filename, goal, current_content) },
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });

        debug!(endpoint = %self.endpoint, model = %self.model, filename, "requesting diff");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("LLM endpoint returned {status}: {}", text.trim());
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("LLM endpoint returned an unexpected body")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("LLM response has no content")?;

        Ok(strip_fences(&content))
    }
}

fn user_prompt(filename: &str, goal: &str, current_content: &str) -> String {
    format!(
        "Generate a unified diff that modifies the file below according to the instruction.\n\n\
         Filename: {filename}\n\
         Instruction: {goal}\n\n\
         Original code:\n```\n{current_content}\n```\n\n\
         Use --- and +++ headers and @@ hunk headers with exact line numbers and \
         unchanged context lines. Keep the change minimal. \
         Return ONLY the unified diff, no explanations."
    )
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return ensure_newline(trimmed);
    };
    // drop the info string (```diff)
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    ensure_newline(body.trim_end_matches('\n'))
}

fn ensure_newline(text: &str) -> String {
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Deterministic provider used without an API key: appends a TODO comment
/// naming the goal to the end of the file.
pub struct FallbackProvider;

#[async_trait]
impl DiffProvider for FallbackProvider {
    async fn suggest_diff(
        &self,
        filename: &str,
        goal: &str,
        current_content: &str,
    ) -> Result<String> {
        Ok(fallback_diff(filename, goal, current_content))
    }
}

pub fn fallback_diff(filename: &str, goal: &str, current_content: &str) -> String {
    let goal = goal.replace(['\r', '\n'], " ");
    let todo = format!("+// TODO: {}\n", goal.trim());
    let mut diff = format!("--- a/{filename}\n+++ b/{filename}\n");

    if current_content.is_empty() {
        diff.push_str("@@ -0,0 +1 @@\n");
        diff.push_str(&todo);
        return diff;
    }

    let has_newline = current_content.ends_with('\n');
    let body = current_content.strip_suffix('\n').unwrap_or(current_content);
    let lines: Vec<&str> = body.split('\n').collect();
    let count = lines.len();

    diff.push_str(&format!("@@ -1,{count} +1,{} @@\n", count + 1));
    for (i, line) in lines.iter().enumerate() {
        if i + 1 == count && !has_newline {
            diff.push_str(&format!("-{line}\n\\ No newline at end of file\n+{line}\n"));
        } else {
            diff.push_str(&format!(" {line}\n"));
        }
    }
    diff.push_str(&todo);
    diff
}
