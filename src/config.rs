//! Typed configuration model loaded once at startup from TOML.
//!
//! Mirrors the on-disk shape described in spec §6: a `[personas.*]` table, a
//! `[routing]` table (mapping rules + overrides + defaults), and a
//! `[policies.*]` table. Unknown keys are tolerated (no `deny_unknown_fields`)
//! so a config written for a newer version of the broker still loads, per the
//! "dynamic typing of config" design note — we just never read fields we
//! don't know about.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::BrokerError;

/// One persona's raw, uncompiled configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersonaConfig {
    pub system_prompt: String,
    #[serde(default)]
    pub allowed_skills: Vec<String>,
    #[serde(default = "default_policy_name")]
    pub guard_policy_name: String,
    #[serde(default)]
    pub memory_scope: String,
    #[serde(default)]
    pub priority_skill: Option<String>,
    #[serde(default)]
    pub requires_browser: bool,
}

fn default_policy_name() -> String {
    "default".to_string()
}

/// A single pattern → persona routing rule.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingRuleConfig {
    pub pattern: String,
    pub persona_id: String,
    pub priority: i64,
}

/// The ordered mapping table plus the id/default overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mappings: Vec<MappingRuleConfig>,
    #[serde(default)]
    pub id_override: HashMap<String, String>,
    pub default_persona_id: String,
    pub direct_message_persona_id: String,
}

/// Blacklist section of a policy: regex patterns plus bare executable tokens.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub executables: Vec<String>,
}

/// One classification tier's ordered pattern list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierConfig {
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// The three classification tiers plus the RED approval timeout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default)]
    pub green: TierConfig,
    #[serde(default)]
    pub yellow: TierConfig,
    #[serde(default)]
    pub red: TierConfig,
    #[serde(default)]
    pub approval_timeout: Option<u64>,
}

/// A single policy's raw configuration (global or persona-scoped).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
}

/// Root configuration file shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfigFile {
    #[serde(default)]
    pub personas: HashMap<String, PersonaConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

impl BrokerConfigFile {
    /// Parse from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, BrokerError> {
        let cfg: BrokerConfigFile = toml::from_str(raw)?;
        Ok(cfg)
    }

    /// Load and parse from a file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "You are a helpful assistant."
        "#;
        let cfg = BrokerConfigFile::from_toml_str(raw).unwrap();
        assert_eq!(cfg.routing.default_persona_id, "general");
        let persona = cfg.personas.get("general").unwrap();
        assert_eq!(persona.guard_policy_name, "default");
        assert!(persona.allowed_skills.is_empty());
    }

    #[test]
    fn tolerates_unknown_fields() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"
            some_future_field = "ignored"

            [personas.general]
            system_prompt = "hi"
            some_future_persona_field = 42
        "#;
        let cfg = BrokerConfigFile::from_toml_str(raw).unwrap();
        assert_eq!(cfg.personas.len(), 1);
    }
}
