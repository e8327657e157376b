//! Thin local smoke-test binary for the broker library. Reads
//! `chat_id<TAB>text` lines from stdin, dispatches each as an inbound
//! message, and prints every outbound reply to stdout. Not part of the
//! library's public surface — mirrors how the teacher keeps its
//! `personas-mcp`/`personas-daemon` bin targets thin wrappers around
//! library code.

use std::env;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use persona_broker::error::BrokerError;
use persona_broker::reasoner::SubprocessReasoner;
use persona_broker::transport::{MediaPayload, MessageEvent, MessageKind, Transport};

struct StdoutTransport;

#[async_trait]
impl Transport for StdoutTransport {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), BrokerError> {
        println!("[{chat_id}] {text}");
        Ok(())
    }

    async fn send_media(&self, chat_id: &str, media: MediaPayload) -> Result<(), BrokerError> {
        println!(
            "[{chat_id}] <media {} bytes, {}>",
            media.bytes.len(),
            media.mimetype
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    persona_broker::logging::init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "broker.toml".to_string());
    let db_path = env::args().nth(2).unwrap_or_else(|| "broker.sqlite3".to_string());
    let reasoner_cmd = env::var("REASONER_CMD").unwrap_or_else(|_| "cat".to_string());

    let reasoner = Arc::new(SubprocessReasoner::new(reasoner_cmd, Vec::new()));
    let transport = Arc::new(StdoutTransport);

    let state = match persona_broker::bootstrap(&config_path, &db_path, reasoner, transport) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    };

    let broker = state.broker.clone();
    let stdin_task = tokio::task::spawn_blocking(move || -> Vec<(String, String)> {
        let mut lines = Vec::new();
        for line in io::stdin().lock().lines().map_while(Result::ok) {
            let Some((chat_id, text)) = line.split_once('\t') else {
                continue;
            };
            lines.push((chat_id.to_string(), text.to_string()));
        }
        lines
    });

    tokio::select! {
        lines = stdin_task => {
            if let Ok(lines) = lines {
                for (chat_id, text) in lines {
                    let event = MessageEvent {
                        message_id: uuid::Uuid::new_v4().to_string(),
                        chat_id: chat_id.clone(),
                        is_group: false,
                        display_name: None,
                        sender_id: "demo-user".to_string(),
                        sender_display: None,
                        from_self: false,
                        kind: MessageKind::Text,
                        body: text,
                        media: None,
                    };
                    if let Err(e) = broker.handle_message(event).await {
                        tracing::error!(chat_id = %chat_id, error = %e, "dispatch failed");
                    }
                }
                // Give the last spawned worker a moment to finish and reply
                // before the process exits.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, draining");
            state.shutdown().await;
        }
    }
}
