//! Dispatch Pipeline (C5): one worker per serialization key, each running
//! its key's queue to completion before yielding the key back.
//!
//! Grounded in the teacher's channel-based hand-off idiom
//! (`engine/background.rs`/`engine/bus.rs`: long-lived tokio tasks reading
//! from an `mpsc` channel) and its `AppState`-level `child_pids` process
//! bookkeeping for cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::classifier::{self, Level};
use crate::error::BrokerError;
use crate::learning::{LearningStore, Lesson, LessonFilter, TaskHistoryEntry};
use crate::outcome;
use crate::persona::PersonaRegistry;
use crate::policy::PolicyRegistry;
use crate::prompt::assemble_prompt;
use crate::queue::{AdmitResult, KeyedQueue, PayloadKind, QueueItem, QueueItemStatus};
use crate::reasoner::{CancelSignal, ProgressEvent, Reasoner, ReasonerOptions};
use crate::resolver::{ChatContext, PersonaResolver};
use crate::transport::{MediaReference, MessageEvent, Transport};

/// Per-message-size bound on an outbound reply (spec §5 resource bounds).
const REPLY_BYTE_LIMIT: usize = 4_000;
/// Default deadline for a running item (spec §5).
const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);
/// Default bound on automatic retries recommended by the Outcome Analyzer.
const DEFAULT_RETRY_BOUND: u32 = 1;
/// Minimum interval between two forwarded progress updates (spec §4.5).
const PROGRESS_FORWARD_INTERVAL: Duration = Duration::from_millis(1_500);
/// Drain window running items get before a shutdown force-terminates them
/// (spec §5).
const SHUTDOWN_DRAIN_WINDOW: Duration = Duration::from_secs(30);

/// Shared, immutable-after-construction set of components the dispatch
/// pipeline wires together. Each is independently reloadable/swappable
/// per the spec's component ownership rules.
pub struct Broker {
    policies: Arc<PolicyRegistry>,
    personas: Arc<PersonaRegistry>,
    resolver: Arc<PersonaResolver>,
    learning: Arc<LearningStore>,
    reasoner: Arc<dyn Reasoner>,
    transport: Arc<dyn Transport>,
    queues: Arc<Mutex<KeyedQueue>>,
    active_keys: Arc<Mutex<HashMap<String, ()>>>,
    /// Cancel handles for items currently `running`, keyed by item id —
    /// mirrors the teacher's `child_pids: Arc<Mutex<HashMap<String, u32>>>`
    /// bookkeeping, but tracking a cooperative cancel signal instead of an
    /// OS pid (the reasoner process itself is opaque to this layer).
    running: Arc<Mutex<HashMap<String, CancelSignal>>>,
    retry_bound: u32,
    deadline: Duration,
}

impl Broker {
    pub fn new(
        policies: Arc<PolicyRegistry>,
        personas: Arc<PersonaRegistry>,
        resolver: Arc<PersonaResolver>,
        learning: Arc<LearningStore>,
        reasoner: Arc<dyn Reasoner>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Broker {
            policies,
            personas,
            resolver,
            learning,
            reasoner,
            transport,
            queues: Arc::new(Mutex::new(KeyedQueue::new())),
            active_keys: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            retry_bound: DEFAULT_RETRY_BOUND,
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Cancel a single item by id, wherever it currently sits. A pending
    /// item is simply dropped from its queue; a running item has its
    /// cancellation flag raised, which the reasoner call observes on its
    /// next `tokio::select!` poll (spec §4.5). Returns `true` if an item
    /// matching `item_id` was found in either state.
    pub async fn cancel_item(&self, item_id: &str) -> bool {
        if let Some(cancel) = self.running.lock().await.get(item_id) {
            cancel.cancel();
            return true;
        }
        self.queues.lock().await.remove_pending(item_id).is_some()
    }

    /// Process-wide shutdown (spec §5): every still-pending item is
    /// dropped and told so, running items are given `SHUTDOWN_DRAIN_WINDOW`
    /// to finish naturally, and anything still running after that is
    /// force-cancelled (which kills the underlying reasoner subprocess —
    /// see `SubprocessReasoner::execute`'s cancel branch).
    pub async fn shutdown(&self) {
        let pending = self.queues.lock().await.drain_all_pending();
        for item in pending {
            let _ = self
                .transport
                .send(&item.chat_id, "Shutting down; this request was cancelled.")
                .await;
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN_WINDOW;
        while Instant::now() < deadline {
            if self.running.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let stragglers: Vec<CancelSignal> =
            self.running.lock().await.values().cloned().collect();
        for cancel in stragglers {
            cancel.cancel();
        }
    }

    /// Ingest one inbound message event. Discards `from_self` events and
    /// media events are expected to already have been resolved to text by
    /// an external media handler before reaching here (spec §6).
    pub async fn handle_message(self: &Arc<Self>, event: MessageEvent) -> Result<(), BrokerError> {
        if event.from_self {
            return Ok(());
        }

        let resolution = self.resolver.resolve(&ChatContext {
            chat_id: event.chat_id.clone(),
            display_name: event.display_name.clone().unwrap_or_default(),
            is_group: event.is_group,
        });

        let payload_kind = match event.kind {
            crate::transport::MessageKind::Text if event.body.starts_with('/') => {
                PayloadKind::Slash
            }
            other => PayloadKind::from(other),
        };

        let item = QueueItem::new(
            event.chat_id.clone(),
            resolution.persona_id,
            event.chat_id.clone(),
            event.sender_id,
            event.display_name,
            event.body,
            payload_kind,
        );

        self.enqueue(item).await
    }

    async fn enqueue(self: &Arc<Self>, item: QueueItem) -> Result<(), BrokerError> {
        let key = item.serialization_key.clone();
        let chat_id = item.chat_id.clone();
        let admit = self.queues.lock().await.enqueue(item);

        match admit {
            AdmitResult::Admitted => {}
            AdmitResult::Displaced(evicted) => {
                let _ = self
                    .transport
                    .send(&evicted.chat_id, "Your earlier request was bumped by a higher-priority one and will not run.")
                    .await;
            }
            AdmitResult::Rejected => {
                let _ = self
                    .transport
                    .send(&chat_id, "Busy right now, please try again shortly.")
                    .await;
                return Ok(());
            }
        }

        self.ensure_worker(key).await;
        Ok(())
    }

    /// Spawn a worker for `key` if one isn't already draining it. The
    /// worker owns the key until its queue is empty, then exits — the next
    /// enqueue for that key spawns a fresh worker.
    async fn ensure_worker(self: &Arc<Self>, key: String) {
        let mut active = self.active_keys.lock().await;
        if active.contains_key(&key) {
            return;
        }
        active.insert(key.clone(), ());
        drop(active);

        let broker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = broker.queues.lock().await.pop_next(&key);
                let Some(item) = next else { break };
                broker.process_item(item).await;
            }
            broker.active_keys.lock().await.remove(&key);
        });
    }

    async fn process_item(&self, mut item: QueueItem) {
        item.status = QueueItemStatus::Running;
        item.started_at = Some(chrono::Utc::now());

        let Some(persona) = self.personas.current().get(&item.persona_id).cloned() else {
            tracing::warn!(persona_id = %item.persona_id, "dropping item for unknown persona");
            return;
        };

        let decision = classifier::classify(&item.payload_text, &persona, &self.policies);

        if decision.level == Level::Blacklisted {
            item.status = QueueItemStatus::Blocked;
            let _ = self
                .reply(&item.chat_id, &format!("Blocked: {}", decision.reason))
                .await;
            return;
        }

        if decision.level == Level::Red {
            item.status = QueueItemStatus::Blocked;
            let timeout = self.policies.approval_timeout(&decision.policy_used);
            let _ = self
                .reply(
                    &item.chat_id,
                    &format!(
                        "This action requires approval (times out in {timeout}s): {}",
                        item.payload_text
                    ),
                )
                .await;
            // The approval UX itself is external (spec §6); this broker
            // only owns the timeout. If nothing arrives within the
            // policy's window, the item surfaces as timed out (spec §5).
            let transport = Arc::clone(&self.transport);
            let chat_id = item.chat_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout)).await;
                let _ = transport
                    .send(&chat_id, "Approval timed out; this request was not run.")
                    .await;
            });
            return;
        }

        let memory_scope = (!persona.memory_scope.is_empty()).then(|| persona.memory_scope.clone());

        let lessons = self.learning.query_lessons(&LessonFilter {
            task_type: Some(payload_kind_label(item.payload_kind).to_string()),
            category: memory_scope.clone(),
            search_text: Some(item.payload_text.clone()),
            limit: 3,
            ..Default::default()
        });
        let lesson_ids: Vec<i64> = lessons.iter().map(|l| l.id).collect();

        let prompt = assemble_prompt(&persona, &lessons, &item.payload_text);

        let outcome = self.run_with_retries(&item, &prompt).await;

        self.post_execution(item, outcome, lesson_ids, memory_scope).await;
    }

    async fn run_with_retries(
        &self,
        item: &QueueItem,
        prompt: &str,
    ) -> crate::reasoner::ReasonerResult {
        let mut attempt = 0u32;
        let mut last = self.run_once(item, prompt).await;

        while attempt < self.retry_bound && !last.success {
            let outcome = crate::outcome::ExecutionOutcome {
                success: last.success,
                error: last.error.clone(),
            };
            let analysis = outcome::analyze(&outcome, &self.learning);
            if !analysis.retry_eligible {
                break;
            }
            tracing::info!(
                chat_id = %item.chat_id,
                attempt,
                "retrying after recommended remembered solution"
            );
            attempt += 1;
            last = self.run_once(item, prompt).await;
        }

        last
    }

    async fn run_once(&self, item: &QueueItem, prompt: &str) -> crate::reasoner::ReasonerResult {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let cancel = CancelSignal::new();

        self.running.lock().await.insert(item.id.clone(), cancel.clone());

        let transport = Arc::clone(&self.transport);
        let chat_id = item.chat_id.clone();
        let forward_task = tokio::spawn(forward_progress(progress_rx, transport, chat_id));

        let call = self.reasoner.execute(
            prompt,
            &ReasonerOptions::default(),
            progress_tx,
            cancel.clone(),
        );

        let result = match tokio::time::timeout(self.deadline, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => crate::reasoner::ReasonerResult {
                success: false,
                output: None,
                error: Some(e.to_string()),
                reasoner_session_id: None,
            },
            Err(_) => {
                cancel.cancel();
                crate::reasoner::ReasonerResult {
                    success: false,
                    output: None,
                    error: Some("deadline exceeded".to_string()),
                    reasoner_session_id: None,
                }
            }
        };

        self.running.lock().await.remove(&item.id);
        let _ = forward_task.await;
        result
    }

    async fn post_execution(
        &self,
        mut item: QueueItem,
        result: crate::reasoner::ReasonerResult,
        lesson_ids: Vec<i64>,
        memory_scope: Option<String>,
    ) {
        item.status = if result.success {
            QueueItemStatus::Completed
        } else {
            QueueItemStatus::Failed
        };
        item.completed_at = Some(chrono::Utc::now());

        let duration_ms = item
            .started_at
            .zip(item.completed_at)
            .map(|(start, end)| (end - start).num_milliseconds().max(0))
            .unwrap_or(0);

        self.learning.save_task_history(TaskHistoryEntry {
            persona_id: Some(item.persona_id.clone()),
            category: memory_scope.clone(),
            task_type: payload_kind_label(item.payload_kind).to_string(),
            task_shape: item.payload_text.clone(),
            success: result.success,
            duration_ms,
            output: result.output.clone(),
            lesson_ids,
            ..Default::default()
        });

        let outcome_input = crate::outcome::ExecutionOutcome {
            success: result.success,
            error: result.error.clone(),
        };
        let analysis = outcome::analyze(&outcome_input, &self.learning);

        let is_substantial = !result.success || duration_ms > 30_000;
        if is_substantial {
            self.learning.save_lesson(Lesson {
                task_type: payload_kind_label(item.payload_kind).to_string(),
                category: memory_scope.unwrap_or_else(|| "dispatch".to_string()),
                task_description: item.payload_text.clone(),
                success: result.success,
                error_message: result.error.clone(),
                lesson_summary: if result.success {
                    "completed after an extended run".to_string()
                } else {
                    analysis
                        .remembered_solution
                        .as_ref()
                        .map(|l| l.lesson_summary.clone())
                        .unwrap_or_else(|| "needs human attention".to_string())
                },
                solution: analysis.remembered_solution.as_ref().and_then(|l| l.solution.clone()),
                ..Default::default()
            });
        }

        let reply = format_reply(&item.persona_id, &result);
        let _ = self.reply(&item.chat_id, &reply).await;
    }

    /// Send a reply, retrying once after a short delay on transport
    /// failure before giving up (spec §4.5 transport-failure handling).
    async fn reply(&self, chat_id: &str, text: &str) -> Result<(), BrokerError> {
        let truncated = truncate_bytes(text, REPLY_BYTE_LIMIT);
        match self.transport.send(chat_id, &truncated).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "reply send failed, retrying once");
                tokio::time::sleep(Duration::from_millis(250)).await;
                self.transport.send(chat_id, &truncated).await
            }
        }
    }
}

async fn forward_progress(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    transport: Arc<dyn Transport>,
    chat_id: String,
) {
    let mut last_forwarded = Instant::now() - PROGRESS_FORWARD_INTERVAL;
    while let Some(event) = rx.recv().await {
        let now = Instant::now();
        if now.duration_since(last_forwarded) < PROGRESS_FORWARD_INTERVAL {
            continue;
        }
        last_forwarded = now;
        let _ = transport.send(&chat_id, &event.text).await;
    }
}

fn format_reply(persona_id: &str, result: &crate::reasoner::ReasonerResult) -> String {
    if result.success {
        result
            .output
            .clone()
            .unwrap_or_else(|| format!("[{persona_id}] done."))
    } else {
        format!(
            "[{persona_id}] failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

fn payload_kind_label(kind: PayloadKind) -> &'static str {
    match kind {
        PayloadKind::Command => "command",
        PayloadKind::Slash => "slash",
        PayloadKind::Image => "image",
        PayloadKind::Media => "media",
    }
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Re-enqueue a resolved media event as text plus a marker (spec §6: media
/// events carry an opaque reference resolved by an external handler).
pub fn media_to_text_marker(media: &MediaReference) -> String {
    format!("[media:{}]", media.reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfigFile;
    use crate::db::init_test_db;
    use crate::reasoner::ScriptedReasoner;
    use crate::transport::{MessageKind, RecordingTransport};

    fn config(raw: &str) -> BrokerConfigFile {
        BrokerConfigFile::from_toml_str(raw).unwrap()
    }

    async fn broker(raw: &str, reasoner: ScriptedReasoner) -> (Arc<Broker>, Arc<RecordingTransport>) {
        let cfg = config(raw);
        let policies = Arc::new(PolicyRegistry::load(&cfg).unwrap());
        let personas = Arc::new(PersonaRegistry::load(&cfg, &policies).unwrap());
        let resolver = Arc::new(PersonaResolver::load(&cfg));
        let learning = Arc::new(LearningStore::new(init_test_db().unwrap()));
        let transport = Arc::new(RecordingTransport::new());
        let broker = Arc::new(Broker::new(
            policies,
            personas,
            resolver,
            learning,
            Arc::new(reasoner),
            transport.clone() as Arc<dyn Transport>,
        ));
        (broker, transport)
    }

    fn event(chat_id: &str, body: &str) -> MessageEvent {
        MessageEvent {
            message_id: "m1".to_string(),
            chat_id: chat_id.to_string(),
            is_group: false,
            display_name: None,
            sender_id: "u1".to_string(),
            sender_display: None,
            from_self: false,
            kind: MessageKind::Text,
            body: body.to_string(),
            media: None,
        }
    }

    #[tokio::test]
    async fn successful_dispatch_sends_reasoner_output() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
        "#;
        let (broker, transport) = broker(raw, ScriptedReasoner::success("deployed ok")).await;
        broker.handle_message(event("chat-1", "deploy it")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let texts = transport.sent_texts();
        assert!(texts.iter().any(|t| t.contains("deployed ok")));
    }

    #[tokio::test]
    async fn blacklisted_command_never_reaches_reasoner() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"

            [policies.default.blacklist]
            patterns = ["rm -rf /"]
        "#;
        let (broker, transport) = broker(raw, ScriptedReasoner::success("should not run")).await;
        broker.handle_message(event("chat-1", "rm -rf /")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let texts = transport.sent_texts();
        assert!(texts.iter().any(|t| t.contains("Blocked")));
        assert!(!texts.iter().any(|t| t.contains("should not run")));
    }

    #[tokio::test]
    async fn red_decision_requests_approval_without_executing() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"

            [policies.default.classification.red]
            patterns = ["^deploy prod$"]
        "#;
        let (broker, transport) = broker(raw, ScriptedReasoner::success("should not run")).await;
        broker.handle_message(event("chat-1", "deploy prod")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let texts = transport.sent_texts();
        assert!(texts.iter().any(|t| t.contains("requires approval")));
        assert!(!texts.iter().any(|t| t.contains("should not run")));
    }

    #[tokio::test]
    async fn messages_from_self_are_discarded() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
        "#;
        let (broker, transport) = broker(raw, ScriptedReasoner::success("x")).await;
        let mut e = event("chat-1", "hello");
        e.from_self = true;
        broker.handle_message(e).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn same_key_messages_are_replied_to_in_enqueue_order() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
        "#;
        let (broker, transport) = broker(raw, ScriptedReasoner::success("ok")).await;
        broker.handle_message(event("chat-1", "first")).await.unwrap();
        broker.handle_message(event("chat-1", "second")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let texts = transport.sent_texts();
        assert_eq!(texts.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_drops_pending_items_with_a_shutdown_reply() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
        "#;
        // Enqueued directly rather than via handle_message, so no worker is
        // ever spawned to drain it — it is still pending when shutdown runs.
        let (broker, transport) = broker(raw, ScriptedReasoner::success("ok")).await;
        broker.queues.lock().await.enqueue(QueueItem::new(
            "chat-1", "general", "chat-1", "u1", None, "queued", PayloadKind::Command,
        ));

        broker.shutdown().await;

        let texts = transport.sent_texts();
        assert!(texts.iter().any(|t| t.contains("Shutting down")));
    }

    #[tokio::test]
    async fn cancel_item_drops_a_pending_item() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
        "#;
        let (broker, _transport) = broker(raw, ScriptedReasoner::success("ok")).await;
        let item = QueueItem::new("chat-1", "general", "chat-1", "u1", None, "queued", PayloadKind::Command);
        let id = item.id.clone();
        broker.queues.lock().await.enqueue(item);

        assert!(broker.cancel_item(&id).await);
        assert_eq!(broker.queues.lock().await.depth("chat-1"), 0);
        assert!(!broker.cancel_item(&id).await);
    }
}
