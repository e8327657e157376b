//! Persona data model and the lifecycle registry that owns it.
//!
//! Personas are immutable after load until an explicit reload swaps in a new
//! `Arc<PersonaSnapshot>` — the same "singleton re-architected as an injected,
//! atomically-swapped component" shape the broker uses for the Policy
//! Registry (see `policy.rs`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::config::BrokerConfigFile;
use crate::error::BrokerError;
use crate::policy::PolicyRegistry;

/// Sentinel element of `allowed_skills` meaning "unrestricted".
pub const ALL_SKILLS: &str = "all";

/// A capability profile governing how a message is handled.
#[derive(Debug, Clone)]
pub struct Persona {
    pub id: String,
    pub system_prompt: String,
    pub allowed_skills: HashSet<String>,
    pub guard_policy_name: String,
    pub memory_scope: String,
    pub priority_skill: Option<String>,
    pub requires_browser: bool,
}

impl Persona {
    /// `allowed_skills = ["all"]` implies all skills permitted; any other
    /// list is a literal subset.
    pub fn allows_skill(&self, skill: &str) -> bool {
        self.allowed_skills.contains(ALL_SKILLS) || self.allowed_skills.contains(skill)
    }
}

/// An immutable point-in-time view of all loaded personas.
#[derive(Debug, Default)]
pub struct PersonaSnapshot {
    pub generation: u64,
    personas: HashMap<String, Persona>,
}

impl PersonaSnapshot {
    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.get(id)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

/// Owns the current `PersonaSnapshot`; reload is an atomic reference swap.
pub struct PersonaRegistry {
    snapshot: RwLock<Arc<PersonaSnapshot>>,
}

impl PersonaRegistry {
    /// Build a registry from a parsed config file, validating that every
    /// persona's `guard_policy_name` resolves in the given policy registry.
    /// A dangling reference is a fatal startup error, per spec §7
    /// ("Invalid configuration ... fatal at startup").
    pub fn load(
        config: &BrokerConfigFile,
        policies: &PolicyRegistry,
    ) -> Result<Self, BrokerError> {
        let snapshot = build_snapshot(config, policies, 0)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn current(&self) -> Arc<PersonaSnapshot> {
        self.snapshot.read().expect("persona registry lock poisoned").clone()
    }

    /// Atomically swap in a freshly loaded snapshot.
    pub fn reload(
        &self,
        config: &BrokerConfigFile,
        policies: &PolicyRegistry,
    ) -> Result<(), BrokerError> {
        let next_generation = self.current().generation + 1;
        let snapshot = build_snapshot(config, policies, next_generation)?;
        *self.snapshot.write().expect("persona registry lock poisoned") = Arc::new(snapshot);
        Ok(())
    }
}

fn build_snapshot(
    config: &BrokerConfigFile,
    policies: &PolicyRegistry,
    generation: u64,
) -> Result<PersonaSnapshot, BrokerError> {
    let mut personas = HashMap::new();
    for (id, raw) in &config.personas {
        if raw.guard_policy_name != "default" && !policies.has_policy(&raw.guard_policy_name) {
            return Err(BrokerError::Config(format!(
                "persona '{id}' references unresolvable guard_policy_name '{}'",
                raw.guard_policy_name
            )));
        }
        personas.insert(
            id.clone(),
            Persona {
                id: id.clone(),
                system_prompt: raw.system_prompt.clone(),
                allowed_skills: raw.allowed_skills.iter().cloned().collect(),
                guard_policy_name: raw.guard_policy_name.clone(),
                memory_scope: raw.memory_scope.clone(),
                priority_skill: raw.priority_skill.clone(),
                requires_browser: raw.requires_browser,
            },
        );
    }

    // Both default routing targets must themselves resolve to a loaded
    // persona, or misrouting would be silent.
    if !config.routing.default_persona_id.is_empty()
        && !personas.contains_key(&config.routing.default_persona_id)
    {
        return Err(BrokerError::Config(format!(
            "default_persona_id '{}' does not name a loaded persona",
            config.routing.default_persona_id
        )));
    }
    if !config.routing.direct_message_persona_id.is_empty()
        && !personas.contains_key(&config.routing.direct_message_persona_id)
    {
        return Err(BrokerError::Config(format!(
            "direct_message_persona_id '{}' does not name a loaded persona",
            config.routing.direct_message_persona_id
        )));
    }

    Ok(PersonaSnapshot {
        generation,
        personas,
    })
}
