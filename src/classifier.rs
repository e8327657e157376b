//! Tiered Classifier (C4): given a command string and a persona, produces a
//! four-level security classification. Pure function of
//! `(command, persona, policy_registry)` — no side effects, no I/O.

use crate::persona::Persona;
use crate::policy::{CompiledPattern, CompiledPolicy, PolicyRegistry, GLOBAL_POLICY_NAME};

/// The four classification levels, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Green,
    Yellow,
    Red,
    Blacklisted,
}

impl Level {
    pub fn auto_execute(self) -> bool {
        matches!(self, Level::Green | Level::Yellow)
    }

    pub fn requires_approval(self) -> bool {
        matches!(self, Level::Red)
    }

    pub fn surfaces_to_user(self) -> bool {
        !matches!(self, Level::Green)
    }
}

/// A classification decision with full provenance for §8's traceability
/// requirement (`policy_used` records exactly which policy produced it).
#[derive(Debug, Clone)]
pub struct Decision {
    pub level: Level,
    pub matched_pattern: Option<String>,
    pub reason: String,
    pub policy_used: String,
    pub persona_id: String,
}

impl Decision {
    fn blacklisted(policy_used: &str, persona_id: &str, matched_pattern: &str) -> Self {
        Decision {
            level: Level::Blacklisted,
            matched_pattern: Some(matched_pattern.to_string()),
            reason: format!("matched blacklist pattern in '{policy_used}' policy"),
            policy_used: policy_used.to_string(),
            persona_id: persona_id.to_string(),
        }
    }
}

/// A tier pattern match within a single policy, prior to attaching
/// `policy_used`/`persona_id` (the caller fills those in once it decides
/// which policy's result wins).
struct TierMatch {
    level: Level,
    pattern: String,
}

/// Check a policy's blacklist: ordered regex patterns first, then
/// substring-contained executable tokens against the lowercased command.
fn match_blacklist(policy: &CompiledPolicy, command: &str) -> Option<String> {
    for pattern in &policy.blacklist_patterns {
        if pattern.is_match(command) {
            return Some(pattern.source.clone());
        }
    }
    let lowered = command.to_lowercase();
    for exe in &policy.blacklist_executables {
        if lowered.contains(exe.as_str()) {
            return Some(exe.clone());
        }
    }
    None
}

/// First matching pattern across the three tiers, checked RED, then
/// YELLOW, then GREEN. RED-first is a deliberate security-first choice: a
/// broad GREEN catch-all pattern (e.g. `.*`) must never silently swallow a
/// more specific RED/YELLOW signal declared in the same policy. Returns
/// `None` if nothing in any tier matches — the "neutral default" case,
/// left for the caller to resolve (see `classify`).
fn classify_tiers(policy: &CompiledPolicy, command: &str) -> Option<TierMatch> {
    let first_match = |patterns: &[CompiledPattern]| -> Option<&CompiledPattern> {
        patterns.iter().find(|p| p.is_match(command))
    };

    if let Some(p) = first_match(&policy.red_patterns) {
        return Some(TierMatch {
            level: Level::Red,
            pattern: p.source.clone(),
        });
    }
    if let Some(p) = first_match(&policy.yellow_patterns) {
        return Some(TierMatch {
            level: Level::Yellow,
            pattern: p.source.clone(),
        });
    }
    if let Some(p) = first_match(&policy.green_patterns) {
        return Some(TierMatch {
            level: Level::Green,
            pattern: p.source.clone(),
        });
    }
    None
}

/// Classify `command` under `persona`'s policy, falling back to the global
/// policy as described in spec §4.4.
pub fn classify(command: &str, persona: &Persona, policies: &PolicyRegistry) -> Decision {
    let has_persona_policy = persona.guard_policy_name != GLOBAL_POLICY_NAME;
    let persona_policy = has_persona_policy.then(|| policies.get(&persona.guard_policy_name));
    let global_policy = policies.global();

    // Step 1: persona blacklist takes precedence over everything, including
    // the global blacklist (§8: "the global classification is never
    // consulted" for a persona-blacklisted command).
    if let Some(pp) = &persona_policy {
        if let Some(matched) = match_blacklist(pp, command) {
            return Decision::blacklisted(&pp.name, &persona.id, &matched);
        }
    }

    // Step 2: global blacklist.
    if let Some(matched) = match_blacklist(&global_policy, command) {
        return Decision::blacklisted(&global_policy.name, &persona.id, &matched);
    }

    // Step 3: persona tiers. RED/YELLOW (and, were it reachable, a
    // persona-specific hard-block BLACKLISTED) return immediately.
    let persona_match = persona_policy.as_ref().and_then(|pp| classify_tiers(pp, command));
    if let Some(m) = &persona_match {
        if !matches!(m.level, Level::Green) {
            let policy_used = persona_policy.as_ref().unwrap().name.clone();
            return Decision {
                level: m.level,
                matched_pattern: Some(m.pattern.clone()),
                reason: format!("matched {:?} pattern in '{}' policy", m.level, policy_used),
                policy_used,
                persona_id: persona.id.clone(),
            };
        }
    }

    // Step 4: global tiers.
    let global_match = classify_tiers(&global_policy, command);
    if let Some(m) = &global_match {
        if !matches!(m.level, Level::Green) {
            return Decision {
                level: m.level,
                matched_pattern: Some(m.pattern.clone()),
                reason: format!(
                    "matched {:?} pattern in '{}' policy",
                    m.level, global_policy.name
                ),
                policy_used: global_policy.name.clone(),
                persona_id: persona.id.clone(),
            };
        }
    }

    // Step 5: both paths bottomed out at GREEN-or-nothing. A persona GREEN
    // pattern that actually matched takes precedence over the global
    // GREEN/no-match result — this is the "if the persona produces
    // anything other than the neutral default, prefer the persona result"
    // rule from §4.4 step 5 / §9's second Open Question.
    if let Some(m) = &persona_match {
        let policy_used = persona_policy.as_ref().unwrap().name.clone();
        return Decision {
            level: m.level,
            matched_pattern: Some(m.pattern.clone()),
            reason: format!("matched GREEN pattern in '{policy_used}' policy"),
            policy_used,
            persona_id: persona.id.clone(),
        };
    }
    if let Some(m) = &global_match {
        return Decision {
            level: m.level,
            matched_pattern: Some(m.pattern.clone()),
            reason: format!("matched GREEN pattern in '{}' policy", global_policy.name),
            policy_used: global_policy.name.clone(),
            persona_id: persona.id.clone(),
        };
    }

    // Step 6: nothing matched anywhere. Cautious default.
    let policy_used = persona_policy
        .map(|pp| pp.name.clone())
        .unwrap_or_else(|| global_policy.name.clone());
    Decision {
        level: Level::Yellow,
        matched_pattern: None,
        reason: "unknown command type".to_string(),
        policy_used,
        persona_id: persona.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfigFile;
    use crate::persona::PersonaRegistry;
    use proptest::prelude::*;

    fn setup(raw: &str) -> (PolicyRegistry, PersonaRegistry) {
        let config = BrokerConfigFile::from_toml_str(raw).unwrap();
        let policies = PolicyRegistry::load(&config).unwrap();
        let personas = PersonaRegistry::load(&config, &policies).unwrap();
        (policies, personas)
    }

    #[test]
    fn persona_policy_overrides_global_green() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
            guard_policy_name = "general_guard"

            [policies.default.classification.green]
            patterns = ["^ls$"]

            [policies.general_guard.classification.red]
            patterns = ["^ls$"]
            approval_timeout = 120
        "#;
        let (policies, personas) = setup(raw);
        let snapshot = personas.current();
        let persona = snapshot.get("general").unwrap();
        let decision = classify("ls", persona, &policies);
        assert_eq!(decision.level, Level::Red);
        assert_eq!(decision.policy_used, "general_guard");
        assert!(decision.level.requires_approval());
    }

    #[test]
    fn blacklist_precedence_global_wins_over_persona_green_catchall() {
        let raw = r#"
            [routing]
            default_persona_id = "dev"
            direct_message_persona_id = "dev"

            [personas.dev]
            system_prompt = "hi"
            guard_policy_name = "dev_guard"

            [policies.default.blacklist]
            patterns = ["rm -rf /"]

            [policies.dev_guard.classification.green]
            patterns = [".*"]
        "#;
        let (policies, personas) = setup(raw);
        let snapshot = personas.current();
        let persona = snapshot.get("dev").unwrap();
        let decision = classify("rm -rf /", persona, &policies);
        assert_eq!(decision.level, Level::Blacklisted);
        assert_eq!(decision.policy_used, "default");
    }

    #[test]
    fn persona_blacklist_short_circuits_before_global_is_consulted() {
        let raw = r#"
            [routing]
            default_persona_id = "locked"
            direct_message_persona_id = "locked"

            [personas.locked]
            system_prompt = "hi"
            guard_policy_name = "locked_guard"

            [policies.default.classification.green]
            patterns = [".*"]

            [policies.locked_guard.blacklist]
            patterns = ["^danger$"]
        "#;
        let (policies, personas) = setup(raw);
        let snapshot = personas.current();
        let persona = snapshot.get("locked").unwrap();
        let decision = classify("danger", persona, &policies);
        assert_eq!(decision.level, Level::Blacklisted);
        assert_eq!(decision.policy_used, "locked_guard");
    }

    #[test]
    fn unknown_command_defaults_to_yellow() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
        "#;
        let (policies, personas) = setup(raw);
        let snapshot = personas.current();
        let persona = snapshot.get("general").unwrap();
        let decision = classify("anything at all", persona, &policies);
        assert_eq!(decision.level, Level::Yellow);
        assert_eq!(decision.reason, "unknown command type");
        assert!(decision.matched_pattern.is_none());
    }

    #[test]
    fn empty_blacklist_never_blacklists() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"
        "#;
        let (policies, personas) = setup(raw);
        let snapshot = personas.current();
        let persona = snapshot.get("general").unwrap();
        let decision = classify("rm -rf /", persona, &policies);
        assert_ne!(decision.level, Level::Blacklisted);
    }

    #[test]
    fn first_declared_pattern_in_tier_wins() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"

            [policies.default.classification.yellow]
            patterns = ["^deploy.*", "^deploy prod$"]
        "#;
        let (policies, personas) = setup(raw);
        let snapshot = personas.current();
        let persona = snapshot.get("general").unwrap();
        let decision = classify("deploy prod", persona, &policies);
        assert_eq!(decision.matched_pattern.as_deref(), Some("^deploy.*"));
    }

    #[test]
    fn determinism_same_inputs_same_decision() {
        let raw = r#"
            [routing]
            default_persona_id = "general"
            direct_message_persona_id = "general"

            [personas.general]
            system_prompt = "hi"

            [policies.default.classification.green]
            patterns = ["^ls$"]
        "#;
        let (policies, personas) = setup(raw);
        let snapshot = personas.current();
        let persona = snapshot.get("general").unwrap();
        let d1 = classify("ls", persona, &policies);
        let d2 = classify("ls", persona, &policies);
        assert_eq!(d1.level, d2.level);
        assert_eq!(d1.matched_pattern, d2.matched_pattern);
        assert_eq!(d1.policy_used, d2.policy_used);
    }

    proptest! {
        // §8 round-trip law: "given a stable registry, classify(c, p) ==
        // classify(c, p)" for every input, not just the fixed examples above.
        #[test]
        fn classification_is_deterministic_for_any_command(cmd in ".{0,64}") {
            let raw = r#"
                [routing]
                default_persona_id = "general"
                direct_message_persona_id = "general"

                [personas.general]
                system_prompt = "hi"
                guard_policy_name = "general_guard"

                [policies.default.classification.yellow]
                patterns = ["^deploy.*"]

                [policies.general_guard.classification.green]
                patterns = ["^ls.*"]

                [policies.general_guard.blacklist]
                patterns = ["^rm .*"]
            "#;
            let (policies, personas) = setup(raw);
            let snapshot = personas.current();
            let persona = snapshot.get("general").unwrap();
            let d1 = classify(&cmd, persona, &policies);
            let d2 = classify(&cmd, persona, &policies);
            prop_assert_eq!(d1.level, d2.level);
            prop_assert_eq!(d1.matched_pattern, d2.matched_pattern);
            prop_assert_eq!(d1.policy_used, d2.policy_used);
        }
    }
}
