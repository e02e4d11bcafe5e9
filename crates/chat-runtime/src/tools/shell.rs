//! `run_shell`
//!
//! Runs a command in the scratch directory. Output is captured concurrently
//! from both pipes; while the command runs, the context's watchdog (if any)
//! is consulted at a fixed cadence and can have the command killed.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chat_core::{
    error::{ChatError, Result},
    message::truncate_text,
    tool::{ParameterSchema, Tool, ToolContext, ToolKind, ToolOutcome, ToolSchema},
    watchdog::CommandProbe,
};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default hard limit on a command's run time
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound a caller may request
pub const MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Time between watchdog consultations
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);

/// Characters of each stream kept in memory and in the result
const OUTPUT_LIMIT: usize = 8 * 1024;

/// How long to wait for the pipes to drain after the process ended
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands refused in safe mode
const DENIED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "mkfs",
    "dd if=",
    "shutdown",
    "reboot",
    "poweroff",
    "halt",
    ":(){",
    "> /dev/sd",
    "chmod -r 777 /",
    "sudo ",
];

/// Shared capture buffer for one output stream
type Capture = Arc<Mutex<String>>;

enum Finish {
    Exited(ExitStatus),
    TimedOut,
    Stopped,
}

/// Shell command execution
#[derive(Clone, Debug)]
pub struct ShellTool {
    timeout: Duration,
    watchdog_interval: Duration,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            watchdog_interval: WATCHDOG_INTERVAL,
        }
    }
}

impl ShellTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub const fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// First denied pattern the command contains
    fn denied(command: &str) -> Option<&'static str> {
        let lower = command.to_lowercase();
        DENIED_PATTERNS.iter().copied().find(|p| lower.contains(p))
    }

    fn effective_timeout(&self, arguments: &Map<String, Value>) -> Duration {
        arguments
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map_or(self.timeout, Duration::from_secs)
            .min(MAX_TIMEOUT)
    }

    async fn wait(
        &self,
        child: &mut tokio::process::Child,
        command: &str,
        stdout: &Capture,
        stderr: &Capture,
        timeout: Duration,
        ctx: &ToolContext,
    ) -> Result<Finish> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut next_check = started + self.watchdog_interval;

        loop {
            let wake = if ctx.watchdog.is_some() {
                next_check.min(deadline)
            } else {
                deadline
            };

            tokio::select! {
                status = child.wait() => return Ok(Finish::Exited(status?)),
                () = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                tracing::warn!(command, timeout_secs = timeout.as_secs(), "command timed out");
                child.kill().await?;
                return Ok(Finish::TimedOut);
            }

            if let Some(watchdog) = &ctx.watchdog {
                let probe = CommandProbe {
                    command: command.to_string(),
                    stdout: snapshot(stdout),
                    stderr: snapshot(stderr),
                    elapsed: started.elapsed(),
                };
                if watchdog.classify(&probe).await.is_stop() {
                    tracing::warn!(command, elapsed_secs = probe.elapsed.as_secs(), "watchdog stopped command");
                    child.kill().await?;
                    return Ok(Finish::Stopped);
                }
                next_check = Instant::now() + self.watchdog_interval;
            }
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            kind: ToolKind::RunShell,
            description: "Run a shell command in the scratch directory and return its exit code, stdout and stderr. \
                Long-running commands are watched and stopped when they appear stuck."
                .into(),
            parameters: vec![
                ParameterSchema::new("command", "string", "The shell command to run", true),
                ParameterSchema::new(
                    "timeout_secs",
                    "integer",
                    "Optional time limit in seconds (default 120, max 600)",
                    false,
                ),
            ],
        }
    }

    async fn execute(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<ToolOutcome> {
        let command = arguments
            .get("command")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if command.is_empty() {
            return Ok(ToolOutcome::failure("command must not be empty"));
        }
        if ctx.safe_mode {
            if let Some(pattern) = Self::denied(command) {
                tracing::warn!(command, pattern, "command refused in safe mode");
                return Ok(ToolOutcome::failure(format!(
                    "command refused in safe mode (matches '{pattern}')"
                )));
            }
        }

        tokio::fs::create_dir_all(&ctx.scratch_dir).await?;
        let timeout = self.effective_timeout(arguments);

        let mut child = shell(command)
            .current_dir(&ctx.scratch_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChatError::ToolExecution(format!("failed to start command: {e}")))?;

        let stdout = Capture::default();
        let stderr = Capture::default();
        let readers = [
            child.stdout.take().map(|pipe| capture(pipe, stdout.clone())),
            child.stderr.take().map(|pipe| capture(pipe, stderr.clone())),
        ];

        let started = Instant::now();
        tracing::debug!(command, cwd = %ctx.scratch_dir.display(), "running command");
        let finish = self.wait(&mut child, command, &stdout, &stderr, timeout, ctx).await?;

        for reader in readers.into_iter().flatten() {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::debug!(command, "output pipe still open after exit");
            }
        }

        let mut data = json!({
            "command": command,
            "stdout": truncate_text(&snapshot(&stdout), OUTPUT_LIMIT),
            "stderr": truncate_text(&snapshot(&stderr), OUTPUT_LIMIT),
            "elapsed_ms": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });

        let outcome = match finish {
            Finish::Exited(status) => {
                data["exit_code"] = json!(status.code());
                if status.success() {
                    ToolOutcome::success("command finished")
                } else {
                    ToolOutcome::failure(format!("command exited with {status}"))
                }
            }
            Finish::TimedOut => ToolOutcome::failure(format!(
                "command timed out after {}s; output so far is included",
                timeout.as_secs()
            )),
            Finish::Stopped => ToolOutcome::failure(
                "command stopped by the watchdog because it appeared stuck; output so far is included",
            ),
        };
        Ok(outcome.with_data(data))
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn snapshot(buffer: &Capture) -> String {
    buffer.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Copy a pipe into `buffer`, keeping only the most recent output
fn capture<R>(mut pipe: R, buffer: Capture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0_u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    buffer.push_str(&text);
                    keep_tail(&mut buffer, OUTPUT_LIMIT);
                }
            }
        }
    })
}

/// Drop leading characters once `buffer` exceeds twice `limit`
fn keep_tail(buffer: &mut String, limit: usize) {
    if buffer.len() <= limit * 2 {
        return;
    }
    let mut cut = buffer.len() - limit;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}
