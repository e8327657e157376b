//! Outcome Analyzer (C6): decides whether a failed execution is worth
//! retrying and whether a remembered solution exists for it.
//!
//! Grounded in the teacher's `engine/healing.rs` classify-then-diagnose
//! shape, reshaped around the spec's narrower contract: a fixed list of
//! canonical failure classes and a Learning Store lookup, with no backoff
//! or retry-count bookkeeping of its own (that lives in the dispatch
//! pipeline, which owns the retry budget).

use regex::Regex;

use crate::learning::{Lesson, LearningStore};

/// A canonical failure class recognized from an error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    SelectorNotFound,
    ElementNotFound,
    WaitTimeout,
    ModuleNotFound,
    ImportError,
    TypeError,
}

impl FailureClass {
    fn label(self) -> &'static str {
        match self {
            FailureClass::SelectorNotFound => "selector-not-found",
            FailureClass::ElementNotFound => "element-not-found",
            FailureClass::WaitTimeout => "wait-timeout",
            FailureClass::ModuleNotFound => "module-not-found",
            FailureClass::ImportError => "import-error",
            FailureClass::TypeError => "type-error",
        }
    }
}

/// The minimal shape of an execution outcome the analyzer needs. A
/// successful result (`error` absent) is never passed to `analyze` by the
/// dispatch pipeline, but the type permits it for completeness.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub retry_eligible: bool,
    pub remembered_solution: Option<Lesson>,
    pub matched_class: Option<FailureClass>,
}

/// Ordered list of (pattern, class) checked top to bottom; the first match
/// wins. Order mirrors the spec's enumeration, most specific UI-automation
/// classes first, then the more general language/runtime classes.
fn failure_classes() -> &'static [(Regex, FailureClass); 6] {
    use std::sync::OnceLock;
    static CLASSES: OnceLock<[(Regex, FailureClass); 6]> = OnceLock::new();
    CLASSES.get_or_init(|| {
        [
            (
                Regex::new(r"(?i)selector.*not found|no such selector").unwrap(),
                FailureClass::SelectorNotFound,
            ),
            (
                Regex::new(r"(?i)element.*not found|no such element").unwrap(),
                FailureClass::ElementNotFound,
            ),
            (
                Regex::new(r"(?i)wait.*timed? ?out|timeout.*waiting").unwrap(),
                FailureClass::WaitTimeout,
            ),
            (
                Regex::new(r"(?i)module.*not found|no module named|cannot find module").unwrap(),
                FailureClass::ModuleNotFound,
            ),
            (
                Regex::new(r"(?i)import ?error|failed to import").unwrap(),
                FailureClass::ImportError,
            ),
            (
                Regex::new(r"(?i)type ?error").unwrap(),
                FailureClass::TypeError,
            ),
        ]
    })
}

fn classify(error: &str) -> Option<FailureClass> {
    failure_classes()
        .iter()
        .find(|(pattern, _)| pattern.is_match(error))
        .map(|(_, class)| *class)
}

/// Analyze a failed execution outcome and recommend whether the dispatch
/// pipeline should retry it. Has no side effects beyond the Learning
/// Store's own query.
pub fn analyze(outcome: &ExecutionOutcome, learning: &LearningStore) -> AnalysisResult {
    let Some(error) = outcome.error.as_deref().filter(|e| !e.is_empty()) else {
        return AnalysisResult {
            retry_eligible: false,
            remembered_solution: None,
            matched_class: None,
        };
    };

    let Some(class) = classify(error) else {
        return AnalysisResult {
            retry_eligible: false,
            remembered_solution: None,
            matched_class: None,
        };
    };

    tracing::debug!(class = class.label(), "outcome analyzer matched failure class");
    let remembered = learning.find_lessons_for_error(error, 1).into_iter().next();
    AnalysisResult {
        retry_eligible: remembered.is_some(),
        remembered_solution: remembered,
        matched_class: Some(class),
    }
}
