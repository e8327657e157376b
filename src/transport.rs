//! Inbound message events and the outbound `Transport` abstraction.
//!
//! Grounded in the teacher's event-payload structs in `engine/types.rs`
//! (`ExecutionOutputEvent`, `ExecutionStatusEvent`) for the shape of a
//! transport-facing payload, and in its provider-abstraction pattern
//! (`CliProvider` trait + concrete implementations) for keeping the
//! transport itself swappable and test-doubled.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::BrokerError;

/// The inbound payload kind, used both for routing priority and for
/// Learning Store query scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Media,
    Image,
}

/// A single inbound message event. Shaped after spec §6's inbound
/// transport contract.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub message_id: String,
    pub chat_id: String,
    pub is_group: bool,
    pub display_name: Option<String>,
    pub sender_id: String,
    pub sender_display: Option<String>,
    pub from_self: bool,
    pub kind: MessageKind,
    pub body: String,
    pub media: Option<MediaReference>,
}

/// Opaque reference to inbound media, resolved by an external media
/// handler and re-enqueued as text plus a marker (spec §6).
#[derive(Debug, Clone)]
pub struct MediaReference {
    pub reference: String,
    pub mimetype: Option<String>,
}

/// Outbound media payload for `send_media`.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub mimetype: String,
    pub caption: Option<String>,
}

/// Outbound delivery abstraction. Implementations must deliver in
/// submission order within a single chat.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), BrokerError>;
    async fn send_media(&self, chat_id: &str, media: MediaPayload) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
pub enum RecordedCall {
    Send { chat_id: String, text: String },
    SendMedia {
        chat_id: String,
        mimetype: String,
        caption: Option<String>,
        byte_len: usize,
    },
}

/// Captures every emitted call for assertion in tests. Send order is
/// preserved per the trait's ordering contract.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<RecordedCall>>,
    fail_next: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport::default()
    }

    /// Make the next `send` call fail once, to exercise the dispatch
    /// pipeline's single-retry-on-transport-failure behavior (spec §7).
    pub fn fail_next_send(&self) {
        *self.fail_next.lock().expect("recording transport lock poisoned") = true;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("recording transport lock poisoned").clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCall::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), BrokerError> {
        let mut fail_next = self.fail_next.lock().expect("recording transport lock poisoned");
        if *fail_next {
            *fail_next = false;
            return Err(BrokerError::Transport("simulated send failure".to_string()));
        }
        drop(fail_next);
        self.calls
            .lock()
            .expect("recording transport lock poisoned")
            .push(RecordedCall::Send {
                chat_id: chat_id.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }

    async fn send_media(&self, chat_id: &str, media: MediaPayload) -> Result<(), BrokerError> {
        self.calls
            .lock()
            .expect("recording transport lock poisoned")
            .push(RecordedCall::SendMedia {
                chat_id: chat_id.to_string(),
                mimetype: media.mimetype,
                caption: media.caption,
                byte_len: media.bytes.len(),
            });
        Ok(())
    }
}
