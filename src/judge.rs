// src/judge.rs
//! External judgment calls (LLM chat completion). Moderation and insight
//! extraction share this client; each stage owns its own prompt, timeout and
//! retry policy.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait JudgmentClient: Send + Sync {
    /// Send one prompt, return the raw model text. Callers parse the JSON the
    /// prompt asks for and decide what a failure degrades to.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

/// OpenAI-compatible chat completions endpoint (Groq in production).
pub struct ChatCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatCompletionClient {
    pub fn new(endpoint: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl JudgmentClient for ChatCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(anyhow!("LLM_API_KEY not configured"));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
            max_tokens: 1024,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("judgment call send")?
            .error_for_status()
            .context("judgment call non-2xx")?;

        let body: Resp = resp.json().await.context("judgment call body")?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("judgment response had no choices"))
    }

    fn name(&self) -> &'static str {
        "chat-completions"
    }
}

/// Scripted client for tests: pops pre-seeded outcomes in order and fails
/// once the script is exhausted.
pub struct ScriptedJudgment {
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: std::sync::atomic::AtomicU32,
}

impl ScriptedJudgment {
    pub fn new(script: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// A client that fails every call, for fail-closed paths.
    pub fn always_failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgmentClient for ScriptedJudgment {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("scripted judgment exhausted")),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
