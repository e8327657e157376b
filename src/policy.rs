//! Policy Registry (C2): loads named classification policies and exposes
//! compiled, ready-to-match pattern tiers.
//!
//! Compilation is eager at load time so the hot classification path
//! (`classifier::classify`) never touches the regex compiler. A malformed
//! pattern is skipped with a warning; the loader never aborts for it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::config::{BrokerConfigFile, PolicyConfig};
use crate::error::BrokerError;

/// Name of the implicit global policy.
pub const GLOBAL_POLICY_NAME: &str = "default";

/// Default RED approval wait, used when a policy doesn't specify one.
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 300;

/// A single compiled pattern, retaining its original source for
/// `matched_pattern` reporting in a `Decision`.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub source: String,
    regex: Regex,
}

impl CompiledPattern {
    fn compile(source: &str) -> Option<Self> {
        Regex::new(&format!("(?i){source}"))
            .ok()
            .map(|regex| CompiledPattern {
                source: source.to_string(),
                regex,
            })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// A fully compiled policy: blacklist + three classification tiers.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub name: String,
    pub blacklist_patterns: Vec<CompiledPattern>,
    pub blacklist_executables: Vec<String>,
    pub green_patterns: Vec<CompiledPattern>,
    pub yellow_patterns: Vec<CompiledPattern>,
    pub red_patterns: Vec<CompiledPattern>,
    pub approval_timeout: u64,
}

impl CompiledPolicy {
    /// A permissive-but-cautious empty policy, returned when a requested
    /// policy name is not configured. Matches nothing in any tier, so the
    /// classifier's "no pattern matched" fallback (YELLOW) always applies.
    fn empty(name: &str) -> Self {
        CompiledPolicy {
            name: name.to_string(),
            blacklist_patterns: Vec::new(),
            blacklist_executables: Vec::new(),
            green_patterns: Vec::new(),
            yellow_patterns: Vec::new(),
            red_patterns: Vec::new(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT_SECS,
        }
    }

    fn compile(name: &str, raw: &PolicyConfig) -> Self {
        let compile_tier = |patterns: &[String]| -> Vec<CompiledPattern> {
            patterns
                .iter()
                .filter_map(|p| match CompiledPattern::compile(p) {
                    Some(compiled) => Some(compiled),
                    None => {
                        tracing::warn!(policy = name, pattern = %p, "skipping malformed pattern");
                        None
                    }
                })
                .collect()
        };

        CompiledPolicy {
            name: name.to_string(),
            blacklist_patterns: compile_tier(&raw.blacklist.patterns),
            blacklist_executables: raw
                .blacklist
                .executables
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            green_patterns: compile_tier(&raw.classification.green.patterns),
            yellow_patterns: compile_tier(&raw.classification.yellow.patterns),
            red_patterns: compile_tier(&raw.classification.red.patterns),
            approval_timeout: raw
                .classification
                .approval_timeout
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS),
        }
    }
}

/// Owns the set of loaded, compiled policies. Immutable after load; reload
/// is an atomic swap of the whole map.
pub struct PolicyRegistry {
    policies: RwLock<Arc<HashMap<String, Arc<CompiledPolicy>>>>,
}

impl PolicyRegistry {
    pub fn load(config: &BrokerConfigFile) -> Result<Self, BrokerError> {
        Ok(Self {
            policies: RwLock::new(Arc::new(compile_all(config))),
        })
    }

    pub fn reload(&self, config: &BrokerConfigFile) -> Result<(), BrokerError> {
        let compiled = compile_all(config);
        *self.policies.write().expect("policy registry lock poisoned") = Arc::new(compiled);
        Ok(())
    }

    /// Whether `name` was present in the loaded configuration (distinct
    /// from `get`, which never fails and falls back silently).
    pub fn has_policy(&self, name: &str) -> bool {
        self.policies
            .read()
            .expect("policy registry lock poisoned")
            .contains_key(name)
    }

    /// Look up a compiled policy by name. Never fails: an unknown name
    /// yields a permissive-but-cautious empty policy.
    pub fn get(&self, name: &str) -> Arc<CompiledPolicy> {
        self.policies
            .read()
            .expect("policy registry lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::new(CompiledPolicy::empty(name)))
    }

    /// The global policy, i.e. `get(GLOBAL_POLICY_NAME)`.
    pub fn global(&self) -> Arc<CompiledPolicy> {
        self.get(GLOBAL_POLICY_NAME)
    }

    pub fn approval_timeout(&self, name: &str) -> u64 {
        self.get(name).approval_timeout
    }
}

fn compile_all(config: &BrokerConfigFile) -> HashMap<String, Arc<CompiledPolicy>> {
    config
        .policies
        .iter()
        .map(|(name, raw)| (name.clone(), Arc::new(CompiledPolicy::compile(name, raw))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_policy_falls_back_to_permissive_empty() {
        let config = BrokerConfigFile::default();
        let registry = PolicyRegistry::load(&config).unwrap();
        let policy = registry.get("does-not-exist");
        assert!(policy.blacklist_patterns.is_empty());
        assert_eq!(policy.approval_timeout, DEFAULT_APPROVAL_TIMEOUT_SECS);
    }

    #[test]
    fn malformed_pattern_is_skipped_not_fatal() {
        let raw = r#"
            [policies.default.classification.green]
            patterns = ["^ls$", "(unterminated"]
        "#;
        let config = BrokerConfigFile::from_toml_str(raw).unwrap();
        let registry = PolicyRegistry::load(&config).unwrap();
        let policy = registry.global();
        assert_eq!(policy.green_patterns.len(), 1);
        assert_eq!(policy.green_patterns[0].source, "^ls$");
    }

    #[test]
    fn blacklist_executable_matches_by_substring() {
        let raw = r#"
            [policies.default.blacklist]
            executables = ["rm -rf /"]
        "#;
        let config = BrokerConfigFile::from_toml_str(raw).unwrap();
        let registry = PolicyRegistry::load(&config).unwrap();
        let policy = registry.global();
        assert!(policy.blacklist_executables[0] == "rm -rf /");
    }
}
