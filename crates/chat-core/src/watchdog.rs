//! Stuck Watchdog
//!
//! Long-running tools periodically hand a [`CommandProbe`] to a [`Watchdog`]
//! and abort when it answers [`Verdict::Stop`]. The stock implementation,
//! [`ModelJudge`], asks a model for a one-word classification and falls back
//! to [`Verdict::Continue`] whenever that call fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::message::Message;
use crate::provider::{ChatRequest, ModelGateway, ProviderEndpoint};

/// Character budget for the output tail shown to the judge
pub const JUDGE_TAIL_CHARS: usize = 2000;

/// Upper bound on a single judge call
pub const JUDGE_TIMEOUT: Duration = Duration::from_secs(20);

const STDERR_SEPARATOR: &str = "\n----- stderr -----\n";

const JUDGE_PROMPT: &str = r"You monitor a shell command that is still running.
Decide whether it is stuck (waiting for input that will never come, looping without progress, hung on the network) or still making progress.
Answer with exactly one word: STOP if it should be killed, CONTINUE otherwise.
When unsure, answer CONTINUE.";

/// Watchdog decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop,
}

impl Verdict {
    pub const fn is_stop(self) -> bool {
        matches!(self, Self::Stop)
    }
}

/// Snapshot of a running command
#[derive(Clone, Debug, Default)]
pub struct CommandProbe {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandProbe {
    /// Combined output, keeping only the last `budget` characters
    pub fn tail(&self, budget: usize) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            combined.push_str(STDERR_SEPARATOR);
            combined.push_str(&self.stderr);
        }

        let total = combined.chars().count();
        if total <= budget {
            return combined;
        }
        let skipped: String = combined.chars().skip(total - budget).collect();
        format!("...{skipped}")
    }
}

/// Strategy consulted by long-running tools
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Classify the probe. Implementations must not fail; when they cannot
    /// decide they answer `Continue`.
    async fn classify(&self, probe: &CommandProbe) -> Verdict;
}

/// Watchdog backed by a short model call
pub struct ModelJudge {
    gateway: Arc<dyn ModelGateway>,
    endpoint: ProviderEndpoint,
    model: String,
    timeout: Duration,
}

impl ModelJudge {
    pub fn new(gateway: Arc<dyn ModelGateway>, endpoint: ProviderEndpoint, model: impl Into<String>) -> Self {
        Self {
            gateway,
            endpoint,
            model: model.into(),
            timeout: JUDGE_TIMEOUT,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_request(&self, probe: &CommandProbe) -> ChatRequest {
        let question = format!(
            "Command: {}\nRunning for: {}s\nRecent output:\n{}",
            probe.command,
            probe.elapsed.as_secs(),
            probe.tail(JUDGE_TAIL_CHARS)
        );

        let mut extra = Map::new();
        extra.insert("max_tokens".into(), json!(5));
        extra.insert("temperature".into(), Value::from(0));

        ChatRequest::new(
            self.endpoint.clone(),
            self.model.clone(),
            vec![Message::system(JUDGE_PROMPT), Message::user(question)],
        )
        .with_extra(Some(extra))
    }
}

#[async_trait]
impl Watchdog for ModelJudge {
    async fn classify(&self, probe: &CommandProbe) -> Verdict {
        let request = self.build_request(probe);
        let verdict = match tokio::time::timeout(self.timeout, self.gateway.complete(&request)).await {
            Ok(Ok(completion)) => parse_verdict(&completion.content),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "judge call failed, letting command continue");
                Verdict::Continue
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "judge call timed out, letting command continue");
                Verdict::Continue
            }
        };

        tracing::debug!(command = %probe.command, ?verdict, "watchdog verdict");
        verdict
    }
}

/// `Stop` only for an unambiguous STOP answer
pub fn parse_verdict(text: &str) -> Verdict {
    let upper = text.trim().to_uppercase();
    let first_word: String = upper
        .chars()
        .skip_while(|c| !c.is_alphanumeric())
        .take_while(|c| c.is_alphanumeric())
        .collect();

    if first_word == "STOP" && !upper.contains("CONTINUE") {
        Verdict::Stop
    } else {
        Verdict::Continue
    }
}
