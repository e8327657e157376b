//! Persona Resolver (C3): maps an inbound chat context to a persona id.

use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::config::BrokerConfigFile;

/// How a chat was routed to its persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    DirectMessage,
    IdOverride,
    Pattern,
    Default,
}

/// The chat-side facts the resolver needs. Mirrors the inbound transport
/// contract's routing-relevant fields (spec §6).
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub chat_id: String,
    pub display_name: String,
    pub is_group: bool,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub persona_id: String,
    pub match_kind: MatchKind,
}

struct CompiledRule {
    pattern: Regex,
    persona_id: String,
    priority: i64,
}

/// A point-in-time compiled routing table, atomically swapped on reload —
/// the same "snapshot behind an `RwLock<Arc<_>>`" shape `PersonaRegistry`
/// uses for personas.
struct ResolverSnapshot {
    rules: Vec<CompiledRule>,
    id_override: std::collections::HashMap<String, String>,
    default_persona_id: String,
    direct_message_persona_id: String,
}

fn build_snapshot(config: &BrokerConfigFile) -> ResolverSnapshot {
    let mut rules: Vec<CompiledRule> = config
        .routing
        .mappings
        .iter()
        .filter_map(|rule| match Regex::new(&format!("(?i){}", rule.pattern)) {
            Ok(pattern) => Some(CompiledRule {
                pattern,
                persona_id: rule.persona_id.clone(),
                priority: rule.priority,
            }),
            Err(e) => {
                tracing::warn!(pattern = %rule.pattern, error = %e, "skipping malformed mapping pattern");
                None
            }
        })
        .collect();
    // Declaration order is the tie-break for equal priority (spec §9:
    // "the source uses declaration order in JSON arrays for tie-breaks;
    // preserve this exactly"). `sort_by_key` is stable, so rules that
    // share a priority keep their original relative order.
    rules.sort_by_key(|r| r.priority);

    ResolverSnapshot {
        rules,
        id_override: config.routing.id_override.clone(),
        default_persona_id: config.routing.default_persona_id.clone(),
        direct_message_persona_id: config.routing.direct_message_persona_id.clone(),
    }
}

/// Compiled, priority-ordered routing table. Reload swaps in a fresh
/// snapshot atomically, mirroring `PersonaRegistry`/`PolicyRegistry` so all
/// three config-derived components stay reloadable the same way.
pub struct PersonaResolver {
    snapshot: RwLock<Arc<ResolverSnapshot>>,
}

impl PersonaResolver {
    pub fn load(config: &BrokerConfigFile) -> Self {
        PersonaResolver {
            snapshot: RwLock::new(Arc::new(build_snapshot(config))),
        }
    }

    /// Atomically swap in a freshly compiled routing table.
    pub fn reload(&self, config: &BrokerConfigFile) {
        let next = Arc::new(build_snapshot(config));
        *self.snapshot.write().expect("persona resolver lock poisoned") = next;
    }

    pub fn resolve(&self, ctx: &ChatContext) -> Resolution {
        let snapshot = self.snapshot.read().expect("persona resolver lock poisoned").clone();

        if !ctx.is_group {
            return Resolution {
                persona_id: snapshot.direct_message_persona_id.clone(),
                match_kind: MatchKind::DirectMessage,
            };
        }

        if let Some(persona_id) = snapshot.id_override.get(&ctx.chat_id) {
            return Resolution {
                persona_id: persona_id.clone(),
                match_kind: MatchKind::IdOverride,
            };
        }

        for rule in &snapshot.rules {
            if rule.pattern.is_match(&ctx.display_name) {
                return Resolution {
                    persona_id: rule.persona_id.clone(),
                    match_kind: MatchKind::Pattern,
                };
            }
        }

        Resolution {
            persona_id: snapshot.default_persona_id.clone(),
            match_kind: MatchKind::Default,
        }
    }
}
