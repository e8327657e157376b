//! Dispatch queue (C5 support): per-serialization-key FIFO with priority
//! displacement backpressure.
//!
//! Grounded in the teacher's `engine/queue.rs` `ConcurrencyTracker` —
//! same priority-ordered `VecDeque` per key, same `AdmitResult`-shaped
//! enqueue outcome — adapted from per-persona concurrency limiting to the
//! spec's per-chat FIFO-with-displacement model (§3, §4.5 backpressure).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::transport::MessageKind;

/// Soft bound on pending items per serialization key (spec §4.5).
pub const DEFAULT_SOFT_BOUND: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    Elevated,
}

impl Priority {
    /// Slash-prefixed commands get elevated priority (spec §3).
    pub fn for_payload(payload_kind: PayloadKind, text: &str) -> Self {
        if matches!(payload_kind, PayloadKind::Slash) || text.starts_with('/') {
            Priority::Elevated
        } else {
            Priority::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Command,
    Slash,
    Image,
    Media,
}

impl From<MessageKind> for PayloadKind {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => PayloadKind::Command,
            MessageKind::Image => PayloadKind::Image,
            MessageKind::Media => PayloadKind::Media,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemStatus {
    Pending,
    Running,
    Blocked,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub serialization_key: String,
    pub persona_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub display_name: Option<String>,
    pub payload_text: String,
    pub payload_kind: PayloadKind,
    pub priority: Priority,
    pub status: QueueItemStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(
        serialization_key: impl Into<String>,
        persona_id: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        display_name: Option<String>,
        payload_text: impl Into<String>,
        payload_kind: PayloadKind,
    ) -> Self {
        let payload_text = payload_text.into();
        let priority = Priority::for_payload(payload_kind, &payload_text);
        QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            serialization_key: serialization_key.into(),
            persona_id: persona_id.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            display_name,
            payload_text,
            payload_kind,
            priority,
            status: QueueItemStatus::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Outcome of attempting to enqueue an item.
#[derive(Debug)]
pub enum AdmitResult {
    /// Admitted without displacing anything.
    Admitted,
    /// Admitted by displacing an older, lower-priority pending item, which
    /// is returned so the caller can emit a "bumped" reply for it.
    Displaced(QueueItem),
    /// Rejected: the queue is at its soft bound and no lower-priority
    /// pending item exists to displace.
    Rejected,
}

/// Per-serialization-key FIFO queues with priority-displacement
/// backpressure. At most one item per key may be `running` at a time —
/// enforced by the dispatch pipeline's one-worker-per-key loop, not by
/// this structure, which only orders pending items.
pub struct KeyedQueue {
    queues: HashMap<String, VecDeque<QueueItem>>,
    soft_bound: usize,
}

impl KeyedQueue {
    pub fn new() -> Self {
        KeyedQueue::with_soft_bound(DEFAULT_SOFT_BOUND)
    }

    pub fn with_soft_bound(soft_bound: usize) -> Self {
        KeyedQueue {
            queues: HashMap::new(),
            soft_bound,
        }
    }

    /// Attempt to enqueue `item` under its serialization key.
    pub fn enqueue(&mut self, item: QueueItem) -> AdmitResult {
        let queue = self.queues.entry(item.serialization_key.clone()).or_default();

        if queue.len() < self.soft_bound {
            queue.push_back(item);
            return AdmitResult::Admitted;
        }

        // At the soft bound: find the oldest pending item with strictly
        // lower priority than the incoming one. Pending items only —
        // running/blocked items are never displaced.
        let displace_index = queue
            .iter()
            .enumerate()
            .filter(|(_, existing)| {
                existing.status == QueueItemStatus::Pending && existing.priority < item.priority
            })
            .min_by_key(|(_, existing)| existing.enqueued_at)
            .map(|(idx, _)| idx);

        match displace_index {
            Some(idx) => {
                let evicted = queue.remove(idx).expect("index just found in the same queue");
                queue.push_back(item);
                AdmitResult::Displaced(evicted)
            }
            None => AdmitResult::Rejected,
        }
    }

    /// Pop the next pending item for `key`, in FIFO order within equal
    /// priority (elevated-priority items are not reordered ahead of
    /// already-queued elevated items — only displacement changes order).
    pub fn pop_next(&mut self, key: &str) -> Option<QueueItem> {
        let queue = self.queues.get_mut(key)?;
        let idx = queue
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == QueueItemStatus::Pending)
            .max_by_key(|(idx, item)| (item.priority, std::cmp::Reverse(*idx)))
            .map(|(idx, _)| idx)?;
        queue.remove(idx)
    }

    pub fn depth(&self, key: &str) -> usize {
        self.queues.get(key).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.depth(key) == 0
    }

    /// Remove a single pending item by id, wherever it sits in its key's
    /// queue. Cancellation of a pending item simply drops it (spec §4.5) —
    /// no reply is synthesized here; the caller decides what, if anything,
    /// to tell the user.
    pub fn remove_pending(&mut self, item_id: &str) -> Option<QueueItem> {
        for queue in self.queues.values_mut() {
            if let Some(idx) = queue.iter().position(|item| item.id == item_id) {
                return queue.remove(idx);
            }
        }
        None
    }

    /// Empty every key's queue of its pending items, returning them all.
    /// Used by shutdown to cancel everything not already running.
    pub fn drain_all_pending(&mut self) -> Vec<QueueItem> {
        let mut drained = Vec::new();
        for queue in self.queues.values_mut() {
            drained.extend(queue.drain(..));
        }
        drained
    }
}

impl Default for KeyedQueue {
    fn default() -> Self {
        KeyedQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, text: &str) -> QueueItem {
        QueueItem::new(key, "persona", key, "sender", None, text, PayloadKind::Command)
    }

    #[test]
    fn fifo_order_within_a_key() {
        let mut queue = KeyedQueue::new();
        queue.enqueue(item("chat-1", "first"));
        queue.enqueue(item("chat-1", "second"));
        let first = queue.pop_next("chat-1").unwrap();
        assert_eq!(first.payload_text, "first");
        let second = queue.pop_next("chat-1").unwrap();
        assert_eq!(second.payload_text, "second");
    }

    #[test]
    fn elevated_priority_is_dequeued_before_normal() {
        let mut queue = KeyedQueue::new();
        queue.enqueue(item("chat-1", "normal message"));
        queue.enqueue(item("chat-1", "/slash command"));
        let next = queue.pop_next("chat-1").unwrap();
        assert_eq!(next.payload_text, "/slash command");
    }

    #[test]
    fn overflow_displaces_oldest_lower_priority_pending_item() {
        let mut queue = KeyedQueue::with_soft_bound(2);
        queue.enqueue(item("chat-1", "low 1"));
        queue.enqueue(item("chat-1", "low 2"));
        let result = queue.enqueue(item("chat-1", "/urgent"));
        match result {
            AdmitResult::Displaced(evicted) => assert_eq!(evicted.payload_text, "low 1"),
            other => panic!("expected displacement, got {other:?}"),
        }
        assert_eq!(queue.depth("chat-1"), 2);
    }

    #[test]
    fn overflow_rejects_when_no_lower_priority_candidate_exists() {
        let mut queue = KeyedQueue::with_soft_bound(2);
        queue.enqueue(item("chat-1", "/urgent 1"));
        queue.enqueue(item("chat-1", "/urgent 2"));
        let result = queue.enqueue(item("chat-1", "/urgent 3"));
        assert!(matches!(result, AdmitResult::Rejected));
    }

    #[test]
    fn independent_keys_do_not_interact() {
        let mut queue = KeyedQueue::new();
        queue.enqueue(item("chat-1", "a"));
        queue.enqueue(item("chat-2", "b"));
        assert_eq!(queue.depth("chat-1"), 1);
        assert_eq!(queue.depth("chat-2"), 1);
    }
}
