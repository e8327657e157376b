pub mod classifier;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod learning;
pub mod logging;
pub mod outcome;
pub mod persona;
pub mod policy;
pub mod prompt;
pub mod queue;
pub mod reasoner;
pub mod resolver;
pub mod transport;

use std::path::Path;
use std::sync::Arc;

use config::BrokerConfigFile;
use db::DbPool;
use dispatch::Broker;
use error::BrokerError;
use learning::LearningStore;
use persona::PersonaRegistry;
use policy::PolicyRegistry;
use reasoner::Reasoner;
use resolver::PersonaResolver;
use transport::Transport;

/// Everything the broker needs to run, assembled once at startup. Mirrors
/// the teacher's `AppState` — a single struct of `Arc`-wrapped, atomically
/// reloadable components handed to the dispatch pipeline and to any
/// administrative surface (e.g. a config-reload command).
pub struct BrokerState {
    pub config_path: std::path::PathBuf,
    pub policies: Arc<PolicyRegistry>,
    pub personas: Arc<PersonaRegistry>,
    pub resolver: Arc<PersonaResolver>,
    pub learning: Arc<LearningStore>,
    pub broker: Arc<Broker>,
}

/// Load configuration and the database pool, compile the Policy Registry,
/// Persona Registry and Persona Resolver, and wire them with the given
/// reasoner and transport into a running `Broker`.
///
/// A dangling `guard_policy_name`, `default_persona_id` or
/// `direct_message_persona_id` reference is a fatal startup error (spec
/// §7) and is propagated here rather than papered over.
pub fn bootstrap(
    config_path: impl AsRef<Path>,
    db_path: impl AsRef<Path>,
    reasoner: Arc<dyn Reasoner>,
    transport: Arc<dyn Transport>,
) -> Result<BrokerState, BrokerError> {
    let config_path = config_path.as_ref().to_path_buf();
    let config = BrokerConfigFile::load(&config_path)?;

    let pool: DbPool = db::init_db(db_path.as_ref())?;

    let policies = Arc::new(PolicyRegistry::load(&config)?);
    let personas = Arc::new(PersonaRegistry::load(&config, &policies)?);
    let resolver = Arc::new(PersonaResolver::load(&config));
    let learning = Arc::new(LearningStore::new(pool));

    let broker = Arc::new(Broker::new(
        policies.clone(),
        personas.clone(),
        resolver.clone(),
        learning.clone(),
        reasoner,
        transport,
    ));

    Ok(BrokerState {
        config_path,
        policies,
        personas,
        resolver,
        learning,
        broker,
    })
}

impl BrokerState {
    /// Re-parse the on-disk config and atomically swap in fresh Policy and
    /// Persona registries. The resolver is rebuilt too, since routing rules
    /// live in the same file. Existing in-flight dispatch work is
    /// unaffected: it already holds `Arc` clones of the old snapshots.
    pub fn reload(&self) -> Result<(), BrokerError> {
        let config = BrokerConfigFile::load(&self.config_path)?;
        self.policies.reload(&config)?;
        self.personas.reload(&config, &self.policies)?;
        self.resolver.reload(&config);
        Ok(())
    }

    /// Drain pending work and give running items a chance to finish before
    /// the process exits (spec §5's process-wide shutdown signal).
    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
    }
}
