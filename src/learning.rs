//! Learning Store (C1): durable lessons and task history, with
//! error-canonicalization so semantically identical failures are matched as
//! the same `error_pattern` regardless of embedded timestamps or addresses.
//!
//! Grounded in the teacher's `db/repos/execution/knowledge.rs` upsert/query
//! shape, adapted from its running-average knowledge graph to the spec's
//! simpler save/query/stats contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::DbPool;
use crate::error::BrokerError;

/// A durable record of a past task outcome.
#[derive(Debug, Clone, Default)]
pub struct Lesson {
    pub id: i64,
    pub task_type: String,
    pub category: String,
    pub tags: Option<String>,
    pub task_description: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_pattern: Option<String>,
    pub root_cause: Option<String>,
    pub solution: Option<String>,
    pub lesson_summary: String,
    pub attempts_before_success: i64,
    pub time_to_resolution_ms: i64,
    pub relevance_score: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// A single append-only dispatch record.
#[derive(Debug, Clone, Default)]
pub struct TaskHistoryEntry {
    pub id: i64,
    pub persona_id: Option<String>,
    pub category: Option<String>,
    pub task_type: String,
    pub task_shape: String,
    pub success: bool,
    pub duration_ms: i64,
    pub output: Option<String>,
    pub lesson_ids: Vec<i64>,
    pub created_at: String,
}

/// Filter for `query_lessons`. Every field is an optional partial match;
/// absent fields are not constrained.
#[derive(Debug, Clone, Default)]
pub struct LessonFilter {
    pub task_type: Option<String>,
    pub category: Option<String>,
    pub success: Option<bool>,
    pub error_pattern: Option<String>,
    pub search_text: Option<String>,
    pub limit: i64,
}

impl LessonFilter {
    pub fn with_limit(limit: i64) -> Self {
        LessonFilter {
            limit,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LearningStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
}

/// Output-field truncation bound for task-history rows (spec §4.1).
const TASK_HISTORY_OUTPUT_LIMIT: usize = 10_000;
/// `error_pattern` truncation bound (spec §4.1).
const ERROR_PATTERN_LIMIT: usize = 200;

/// Storage availability, tracked so the "single warning per contiguous
/// outage" rule (spec §7) doesn't re-log on every failed query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningStoreStatus {
    Available,
    Unavailable { since: DateTime<Utc> },
}

/// Mirrors the teacher's atomics-backed `SchedulerState`: a flag plus a
/// timestamp, swapped without holding a lock across the warning log call.
#[derive(Debug, Default)]
struct AvailabilityTracker {
    degraded: AtomicBool,
    since: RwLock<Option<DateTime<Utc>>>,
}

impl AvailabilityTracker {
    fn note_failure(&self, op: &str, err: &BrokerError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            let now = Utc::now();
            *self.since.write().expect("learning store lock poisoned") = Some(now);
            tracing::warn!(operation = op, error = %err, "learning store unavailable, proceeding in degraded mode");
        }
    }

    fn note_success(&self) {
        self.degraded.store(false, Ordering::SeqCst);
        *self.since.write().expect("learning store lock poisoned") = None;
    }

    fn status(&self) -> LearningStoreStatus {
        if self.degraded.load(Ordering::SeqCst) {
            let since = self
                .since
                .read()
                .expect("learning store lock poisoned")
                .unwrap_or_else(Utc::now);
            LearningStoreStatus::Unavailable { since }
        } else {
            LearningStoreStatus::Available
        }
    }
}

/// The Learning Store. Holds a connection pool and an availability
/// tracker; all operations degrade gracefully rather than panicking.
pub struct LearningStore {
    pool: DbPool,
    availability: AvailabilityTracker,
}

impl LearningStore {
    pub fn new(pool: DbPool) -> Self {
        LearningStore {
            pool,
            availability: AvailabilityTracker::default(),
        }
    }

    pub fn status(&self) -> LearningStoreStatus {
        self.availability.status()
    }

    fn record_outcome<T>(&self, op: &str, result: Result<T, BrokerError>) -> Option<T> {
        let tracker = &self.availability;
        match result {
            Ok(v) => {
                tracker.note_success();
                Some(v)
            }
            Err(e) => {
                tracker.note_failure(op, &e);
                None
            }
        }
    }

    /// Insert a lesson, computing `error_pattern` from `error_message` when
    /// absent. Returns `None` on storage failure (degraded mode).
    pub fn save_lesson(&self, mut lesson: Lesson) -> Option<i64> {
        if lesson.error_pattern.is_none() {
            lesson.error_pattern = lesson.error_message.as_deref().map(canonicalize);
        }
        self.record_outcome("save_lesson", self.try_save_lesson(&lesson))
    }

    fn try_save_lesson(&self, lesson: &Lesson) -> Result<i64, BrokerError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO lessons
                (task_type, category, tags, task_description, success, error_message,
                 error_pattern, root_cause, solution, lesson_summary,
                 attempts_before_success, time_to_resolution_ms, relevance_score,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                lesson.task_type,
                lesson.category,
                lesson.tags,
                lesson.task_description,
                lesson.success as i64,
                lesson.error_message,
                lesson.error_pattern,
                lesson.root_cause,
                lesson.solution,
                lesson.lesson_summary,
                lesson.attempts_before_success,
                lesson.time_to_resolution_ms,
                if lesson.relevance_score == 0.0 { 1.0 } else { lesson.relevance_score },
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Partial-match query honoring `filter`, ordered by relevance then
    /// recency. Returns an empty vec (not `None`) on storage failure, since
    /// callers treat "no lessons found" and "store unavailable" the same.
    pub fn query_lessons(&self, filter: &LessonFilter) -> Vec<Lesson> {
        self.record_outcome("query_lessons", self.try_query_lessons(filter))
            .unwrap_or_default()
    }

    fn try_query_lessons(&self, filter: &LessonFilter) -> Result<Vec<Lesson>, BrokerError> {
        let conn = self.pool.get()?;
        let limit = if filter.limit > 0 { filter.limit } else { 20 };

        let mut sql = String::from("SELECT * FROM lessons WHERE 1=1");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(task_type) = &filter.task_type {
            sql.push_str(" AND task_type = ?");
            binds.push(Box::new(task_type.clone()));
        }
        if let Some(category) = &filter.category {
            sql.push_str(" AND category = ?");
            binds.push(Box::new(category.clone()));
        }
        if let Some(success) = filter.success {
            sql.push_str(" AND success = ?");
            binds.push(Box::new(success as i64));
        }
        if let Some(error_pattern) = &filter.error_pattern {
            sql.push_str(" AND error_pattern LIKE ?");
            binds.push(Box::new(format!("%{error_pattern}%")));
        }
        if let Some(search_text) = &filter.search_text {
            let tokens = significant_tokens(search_text);
            let fragments = if tokens.is_empty() { vec![search_text.clone()] } else { tokens };
            sql.push_str(" AND (");
            for (i, fragment) in fragments.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" OR ");
                }
                sql.push_str("task_description LIKE ? OR lesson_summary LIKE ? OR solution LIKE ?");
                let pattern = format!("%{fragment}%");
                binds.push(Box::new(pattern.clone()));
                binds.push(Box::new(pattern.clone()));
                binds.push(Box::new(pattern));
            }
            sql.push(')');
        }
        sql.push_str(" ORDER BY relevance_score DESC, created_at DESC LIMIT ?");
        binds.push(Box::new(limit));

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), row_to_lesson)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(BrokerError::from)
    }

    /// Canonicalize `error_message`, then delegate to `query_lessons`
    /// scoped to successful lessons with a matching `error_pattern`.
    pub fn find_lessons_for_error(&self, error_message: &str, limit: i64) -> Vec<Lesson> {
        let pattern = canonicalize(error_message);
        self.query_lessons(&LessonFilter {
            error_pattern: Some(pattern),
            success: Some(true),
            limit,
            ..Default::default()
        })
    }

    /// Append a task-history row, truncating `output` to the configured
    /// byte bound. Returns `None` on storage failure.
    pub fn save_task_history(&self, mut entry: TaskHistoryEntry) -> Option<i64> {
        if let Some(output) = &entry.output {
            entry.output = Some(truncate_bytes(output, TASK_HISTORY_OUTPUT_LIMIT));
        }
        self.record_outcome("save_task_history", self.try_save_task_history(&entry))
    }

    fn try_save_task_history(&self, entry: &TaskHistoryEntry) -> Result<i64, BrokerError> {
        let conn = self.pool.get()?;
        let lesson_ids = serde_json::to_string(&entry.lesson_ids).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT INTO task_history
                (persona_id, category, task_type, task_shape, success, duration_ms,
                 output, lesson_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.persona_id,
                entry.category,
                entry.task_type,
                entry.task_shape,
                entry.success as i64,
                entry.duration_ms,
                entry.output,
                lesson_ids,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn stats(&self) -> LearningStats {
        self.record_outcome("stats", self.try_stats()).unwrap_or_default()
    }

    fn try_stats(&self) -> Result<LearningStats, BrokerError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT COUNT(*), SUM(success), SUM(1 - success) FROM lessons",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    ))
                },
            )
            .optional()?;
        let (total, successful, failed) = row.unwrap_or((0, 0, 0));
        Ok(LearningStats {
            total,
            successful,
            failed,
        })
    }
}

fn row_to_lesson(row: &Row) -> rusqlite::Result<Lesson> {
    Ok(Lesson {
        id: row.get("id")?,
        task_type: row.get("task_type")?,
        category: row.get("category")?,
        tags: row.get("tags")?,
        task_description: row.get("task_description")?,
        success: row.get::<_, i64>("success")? != 0,
        error_message: row.get("error_message")?,
        error_pattern: row.get("error_pattern")?,
        root_cause: row.get("root_cause")?,
        solution: row.get("solution")?,
        lesson_summary: row.get("lesson_summary")?,
        attempts_before_success: row.get("attempts_before_success")?,
        time_to_resolution_ms: row.get("time_to_resolution_ms")?,
        relevance_score: row.get("relevance_score")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Split free text into deduplicated, lowercased words of at least 4
/// characters, so `search_text` matches on keyword overlap rather than
/// requiring the stored text to contain the query verbatim (a longer query
/// phrase should still find a lesson whose shorter `task_description`
/// merely contains one of its significant words).
fn significant_tokens(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        let lower = word.to_lowercase();
        if lower.len() >= 4 && seen.insert(lower.clone()) {
            tokens.push(lower);
        }
    }
    tokens
}

/// Truncate to at most `max` bytes on a char boundary.
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

/// Replace volatile substrings (dates, times, hex addresses, digit runs,
/// and "line/column/position N" phrases) with fixed tokens so two error
/// messages differing only in these details canonicalize identically.
/// Idempotent: re-canonicalizing an already-canonicalized string is a
/// no-op, since the replacement tokens contain no digits of their own.
pub fn canonicalize(error_message: &str) -> String {
    static PATTERNS: std::sync::OnceLock<Vec<(Regex, &'static str)>> = std::sync::OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            (Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap(), "DATE"),
            (Regex::new(r"\d{2}:\d{2}:\d{2}").unwrap(), "TIME"),
            (Regex::new(r"0x[0-9a-fA-F]+").unwrap(), "HEX"),
            (Regex::new(r"(?i)line \d+").unwrap(), "line N"),
            (Regex::new(r"(?i)column \d+").unwrap(), "column N"),
            (Regex::new(r"(?i)at position \d+").unwrap(), "at position N"),
            (Regex::new(r"\d+").unwrap(), "N"),
        ]
    });

    let mut result = error_message.to_string();
    for (pattern, token) in patterns {
        result = pattern.replace_all(&result, *token).into_owned();
    }
    truncate_bytes(&result, ERROR_PATTERN_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use proptest::prelude::*;

    fn store() -> LearningStore {
        LearningStore::new(init_test_db().unwrap())
    }

    #[test]
    fn canonicalization_is_idempotent_and_unifies_variants() {
        let a = canonicalize("Error at line 1337 on 2024-06-01 12:00:00 pointer 0xdeadbeef");
        let b = canonicalize("Error at line 42 on 2025-01-01 03:14:15 pointer 0xcafebabe");
        assert_eq!(a, b);
        assert_eq!(canonicalize(&a), a);
        assert!(!a.chars().collect::<Vec<_>>().windows(2).any(|w| w[0].is_ascii_digit() && w[1].is_ascii_digit()));
    }

    #[test]
    fn save_and_find_lessons_for_error_round_trips() {
        let store = store();
        let id = store
            .save_lesson(Lesson {
                task_type: "command".to_string(),
                category: "deployment".to_string(),
                task_description: "deploy the service".to_string(),
                success: true,
                error_message: Some("Error at line 1337 on 2024-06-01 12:00:00".to_string()),
                lesson_summary: "retry with --dry-run first".to_string(),
                solution: Some("run with --dry-run first".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(id > 0);

        let found = store.find_lessons_for_error("Error at line 42 on 2025-01-01 03:14:15", 5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].solution.as_deref(), Some("run with --dry-run first"));
    }

    #[test]
    fn query_lessons_filters_by_search_text() {
        let store = store();
        store
            .save_lesson(Lesson {
                task_type: "command".to_string(),
                category: "deployment".to_string(),
                task_description: "please deploy the service".to_string(),
                success: true,
                lesson_summary: "dry run first".to_string(),
                solution: Some("run with --dry-run first".to_string()),
                ..Default::default()
            })
            .unwrap();
        store
            .save_lesson(Lesson {
                task_type: "command".to_string(),
                category: "other".to_string(),
                task_description: "unrelated task".to_string(),
                success: true,
                lesson_summary: "unrelated".to_string(),
                ..Default::default()
            })
            .unwrap();

        let found = store.query_lessons(&LessonFilter {
            search_text: Some("deploy".to_string()),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn query_lessons_matches_a_keyword_from_a_longer_search_phrase() {
        let store = store();
        store
            .save_lesson(Lesson {
                task_type: "command".to_string(),
                category: "deployment".to_string(),
                task_description: "contains deploy".to_string(),
                success: true,
                lesson_summary: "dry run first".to_string(),
                solution: Some("run with --dry-run first".to_string()),
                ..Default::default()
            })
            .unwrap();

        let found = store.query_lessons(&LessonFilter {
            search_text: Some("please deploy the service".to_string()),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].solution.as_deref(), Some("run with --dry-run first"));
    }

    #[test]
    fn task_history_output_is_truncated() {
        let store = store();
        let huge = "x".repeat(TASK_HISTORY_OUTPUT_LIMIT + 500);
        let id = store
            .save_task_history(TaskHistoryEntry {
                task_type: "command".to_string(),
                task_shape: "deploy prod".to_string(),
                success: true,
                output: Some(huge),
                ..Default::default()
            })
            .unwrap();
        assert!(id > 0);
    }

    #[test]
    fn stats_counts_success_and_failure() {
        let store = store();
        store
            .save_lesson(Lesson {
                task_type: "command".to_string(),
                category: "c".to_string(),
                task_description: "d".to_string(),
                success: true,
                lesson_summary: "s".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .save_lesson(Lesson {
                task_type: "command".to_string(),
                category: "c".to_string(),
                task_description: "d".to_string(),
                success: false,
                lesson_summary: "s".to_string(),
                ..Default::default()
            })
            .unwrap();
        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
    }

    proptest! {
        // §8 round-trip law: canon(canon(s)) == canon(s) for all strings.
        #[test]
        fn canonicalize_is_idempotent_for_any_string(s in ".{0,200}") {
            let once = canonicalize(&s);
            let twice = canonicalize(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
