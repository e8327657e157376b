//! External reasoner process abstraction: the thing the dispatch pipeline
//! invokes to actually do the work a message asks for.
//!
//! Grounded in the teacher's `engine/provider/mod.rs` (`CliProvider`,
//! `PromptDelivery::Stdin`) and `engine/types.rs` (`StreamLineType`): the
//! production implementation spawns an opaque CLI-style subprocess, writes
//! the prompt to its stdin, and classifies NDJSON-ish stdout lines into a
//! unified result plus progress events.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};

use crate::error::BrokerError;

/// A progress update forwarded to the transport as an interstitial reply.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub text: String,
}

/// Caller-supplied sink for progress events; the dispatch pipeline forwards
/// these to the transport at a minimum interval (suggested 1.5s).
pub type ProgressSink = mpsc::UnboundedSender<ProgressEvent>;

/// Cooperative cancellation handle shared between the dispatch worker and
/// the in-flight reasoner call.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<Notify>);

impl CancelSignal {
    pub fn new() -> Self {
        CancelSignal(Arc::new(Notify::new()))
    }

    pub fn cancel(&self) {
        self.0.notify_waiters();
    }

    async fn cancelled(&self) {
        self.0.notified().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReasonerOptions {
    pub model: Option<String>,
    pub timeout: Option<Duration>,
}

/// The outcome of a single reasoner invocation.
#[derive(Debug, Clone, Default)]
pub struct ReasonerResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub reasoner_session_id: Option<String>,
}

/// Abstraction over "the thing that actually executes the task". One
/// production implementation (`SubprocessReasoner`) and one test double
/// (`ScriptedReasoner`), so the dispatch pipeline is unit-testable without
/// a live subprocess.
#[async_trait::async_trait]
pub trait Reasoner: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        options: &ReasonerOptions,
        progress: ProgressSink,
        cancel: CancelSignal,
    ) -> Result<ReasonerResult, BrokerError>;
}

/// Spawns `command` as a child process, delivers the prompt over stdin
/// (mirroring the teacher's `PromptDelivery::Stdin` path for its default
/// CLI provider), and streams stdout lines as progress events until the
/// process exits.
pub struct SubprocessReasoner {
    command: String,
    args: Vec<String>,
}

impl SubprocessReasoner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        SubprocessReasoner {
            command: command.into(),
            args,
        }
    }
}

#[async_trait::async_trait]
impl Reasoner for SubprocessReasoner {
    async fn execute(
        &self,
        prompt: &str,
        options: &ReasonerOptions,
        progress: ProgressSink,
        cancel: CancelSignal,
    ) -> Result<ReasonerResult, BrokerError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(model) = &options.model {
            command.env("REASONER_MODEL", model);
        }

        let mut child = command
            .spawn()
            .map_err(|e| BrokerError::Reasoner(format!("failed to spawn reasoner process: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Reasoner("reasoner process has no stdin".to_string()))?;
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| BrokerError::Reasoner(format!("failed to write prompt: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Reasoner("reasoner process has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut output_lines = Vec::new();
        let mut session_id = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Ok(ReasonerResult {
                        success: false,
                        output: None,
                        error: Some("cancelled".to_string()),
                        reasoner_session_id: session_id,
                    });
                }
                line = lines.next_line() => {
                    match line.map_err(|e| BrokerError::Reasoner(format!("stdout read failed: {e}")))? {
                        Some(line) => {
                            if let Some(id) = line.strip_prefix("session:") {
                                session_id = Some(id.trim().to_string());
                                continue;
                            }
                            let _ = progress.send(ProgressEvent { text: line.clone() });
                            output_lines.push(line);
                        }
                        None => break,
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| BrokerError::Reasoner(format!("reasoner process wait failed: {e}")))?;

        Ok(ReasonerResult {
            success: status.success(),
            output: Some(output_lines.join("\n")),
            error: if status.success() {
                None
            } else {
                Some(format!("reasoner exited with status {status}"))
            },
            reasoner_session_id: session_id,
        })
    }
}

/// Replays a fixed scripted response. Used exclusively by tests, the same
/// way the teacher keeps execution logic decoupled from the CLI-spawning
/// runner so it is unit-testable without a live subprocess.
pub struct ScriptedReasoner {
    result: ReasonerResult,
    progress_events: Vec<String>,
}

impl ScriptedReasoner {
    pub fn success(output: impl Into<String>) -> Self {
        ScriptedReasoner {
            result: ReasonerResult {
                success: true,
                output: Some(output.into()),
                error: None,
                reasoner_session_id: None,
            },
            progress_events: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ScriptedReasoner {
            result: ReasonerResult {
                success: false,
                output: None,
                error: Some(error.into()),
                reasoner_session_id: None,
            },
            progress_events: Vec::new(),
        }
    }

    pub fn with_progress(mut self, events: Vec<String>) -> Self {
        self.progress_events = events;
        self
    }
}

#[async_trait::async_trait]
impl Reasoner for ScriptedReasoner {
    async fn execute(
        &self,
        _prompt: &str,
        _options: &ReasonerOptions,
        progress: ProgressSink,
        _cancel: CancelSignal,
    ) -> Result<ReasonerResult, BrokerError> {
        for event in &self.progress_events {
            let _ = progress.send(ProgressEvent {
                text: event.clone(),
            });
        }
        Ok(self.result.clone())
    }
}
