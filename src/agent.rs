//! Agent runner — invoke the external agent executable and extract its answer
//!
//! The agent is run as `<exe> agent --agent <id> --message <text>`. The
//! instruction is a single argv element and never goes through a shell.

use crate::config::AgentConfig;
use crate::types::AgentReply;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Answer used when the agent exits cleanly but prints nothing usable
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "Completed with no response content.";

/// Something that turns an instruction into a reply
///
/// Implementations recover from their own failures: a failed run still
/// yields an `AgentReply` carrying an error description.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one instruction to completion
    async fn run(&self, message: &str) -> AgentReply;

    /// Runner name for logs
    fn name(&self) -> &str;
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The process exited (with any code)
    Completed,
    /// The wall-clock limit was reached and the process was killed
    TimedOut,
    /// The process could not be spawned or waited on
    Failed(String),
}

/// Raw result of one agent process run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// Exit code; `None` when killed by a signal or never started
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub outcome: InvocationOutcome,
}

impl AgentInvocation {
    fn not_completed(outcome: InvocationOutcome) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            outcome,
        }
    }

    /// True for a completed run with exit code 0
    pub fn succeeded(&self) -> bool {
        self.outcome == InvocationOutcome::Completed && self.exit_code == Some(0)
    }

    /// Turn the raw result into the text published as `response`
    pub fn into_reply(self, config: &AgentConfig) -> AgentReply {
        let product = &config.product_name;
        match self.outcome {
            InvocationOutcome::Completed if self.exit_code == Some(0) => {
                let answer = extract_response(&self.stdout, &config.banner_marker, product);
                if answer.is_empty() {
                    AgentReply::success(EMPTY_RESPONSE_PLACEHOLDER)
                } else {
                    AgentReply::success(answer)
                }
            }
            InvocationOutcome::Completed => {
                let error = format!("{} command failed: {}", product, self.stderr);
                tracing::error!(exit_code = ?self.exit_code, "{}", error);
                AgentReply::failure(format!("Error: {}", error))
            }
            InvocationOutcome::TimedOut => {
                let error = format!(
                    "{} command timed out (over {}).",
                    product,
                    describe_timeout(config.timeout())
                );
                tracing::error!("{}", error);
                AgentReply::failure(format!("Error: {}", error))
            }
            InvocationOutcome::Failed(reason) => {
                let error = format!("{} invocation failed: {}", product, reason);
                tracing::error!("{}", error);
                AgentReply::failure(format!("Error: {}", error))
            }
        }
    }
}

/// Runs the configured agent executable as a subprocess
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
}

impl CommandAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Argument vector passed after the executable
    pub fn args<'a>(&'a self, message: &'a str) -> [&'a str; 5] {
        ["agent", "--agent", self.config.agent_id.as_str(), "--message", message]
    }

    /// Run the agent once and capture its raw result
    pub async fn invoke(&self, message: &str) -> AgentInvocation {
        let args = self.args(message);
        tracing::debug!(executable = %self.config.executable, ?args, "Running agent command");

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return AgentInvocation::not_completed(InvocationOutcome::Failed(e.to_string())),
        };

        // Dropping the wait future on timeout kills the child (kill_on_drop).
        match tokio::time::timeout(self.config.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => AgentInvocation {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                outcome: InvocationOutcome::Completed,
            },
            Ok(Err(e)) => AgentInvocation::not_completed(InvocationOutcome::Failed(e.to_string())),
            Err(_) => AgentInvocation::not_completed(InvocationOutcome::TimedOut),
        }
    }
}

#[async_trait]
impl AgentRunner for CommandAgent {
    async fn run(&self, message: &str) -> AgentReply {
        let invocation = self.invoke(message).await;
        tracing::debug!(
            exit_code = ?invocation.exit_code,
            outcome = ?invocation.outcome,
            stdout_bytes = invocation.stdout.len(),
            "Agent command finished"
        );
        invocation.into_reply(&self.config)
    }

    fn name(&self) -> &str {
        &self.config.executable
    }
}

/// Strip the agent's banner from its stdout
///
/// The answer starts at the first line that is non-blank, does not start
/// with `marker`, and does not mention `product`. If no line qualifies the
/// whole trimmed output is returned. Coupled to the agent's current output
/// layout.
pub fn extract_response(stdout: &str, marker: &str, product: &str) -> String {
    let output = stdout.trim();
    let lines: Vec<&str> = output.lines().collect();

    let start = lines
        .iter()
        .position(|line| {
            !line.trim().is_empty()
                && (marker.is_empty() || !line.starts_with(marker))
                && (product.is_empty() || !line.contains(product))
        })
        .unwrap_or(0);

    lines[start..].join("\n").trim().to_string()
}

/// "5 minutes" for whole minutes, "N seconds" otherwise
fn describe_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    match secs {
        60 => "1 minute".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{} seconds", s),
    }
}
