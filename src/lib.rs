//! Agent execution substrate: event bus, session registry, hybrid tool
//! registry, external tool-server manager, validation pipeline, dispatcher,
//! task DAG scheduler, ORPAR loop coordinator, and utility-learned memory.

pub mod bus;
pub mod config;
pub mod dag;
pub mod errors;
pub mod memory;
pub mod observability;
pub mod orpar;
pub mod session;
pub mod shutdown;
pub mod tool;
pub mod transport;
pub mod util;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::Arc;

use bus::EventBus;
use config::Config;
use dag::DagScheduler;
use memory::embeddings::{Embedder, HashEmbedder};
use memory::MemoryStore;
use orpar::OrparCoordinator;
use session::SessionRegistry;
use tool::dispatch::ToolDispatcher;
use tool::external::ExternalToolServerManager;
use tool::registry::ToolRegistry;
use validation::{PatternLearner, SecurityChecker, ValidationPipeline};

/// Every long-lived component, wired together explicitly rather than
/// through a global/static registry.
pub struct Substrate {
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub external_servers: Arc<ExternalToolServerManager>,
    pub validation: Arc<ValidationPipeline>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub dag: Arc<DagScheduler>,
    pub orpar: Arc<OrparCoordinator>,
    pub memory: Arc<MemoryStore>,
    pub config: Config,
}

impl Substrate {
    pub fn new(config: Config, memory_db_path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new(bus.clone(), config.heartbeat.clone()));
        let tools = Arc::new(ToolRegistry::new(
            bus.clone(),
            std::time::Duration::from_millis(50),
        ));
        let external_servers = Arc::new(ExternalToolServerManager::new(
            bus.clone(),
            config.external_server.clone(),
        ));
        let pattern_learner = Arc::new(PatternLearner::new());
        let security = Arc::new(SecurityChecker::default());
        let validation = Arc::new(ValidationPipeline::new(
            config.validation.clone(),
            pattern_learner.clone(),
            security,
            None,
            bus.clone(),
        ));
        let dispatcher = Arc::new(ToolDispatcher::new(
            tools.clone(),
            validation.clone(),
            sessions.clone(),
            bus.clone(),
            pattern_learner,
            &config,
        ));
        let dag = Arc::new(DagScheduler::new(bus.clone()));
        let orpar = Arc::new(OrparCoordinator::new(bus.clone(), 0.8));
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder);
        let memory = Arc::new(MemoryStore::new(
            memory_db_path,
            embedder,
            bus.clone(),
            config.memory.clone(),
        )?);

        Ok(Self {
            bus,
            sessions,
            tools,
            external_servers,
            validation,
            dispatcher,
            dag,
            orpar,
            memory,
            config,
        })
    }

    /// Starts the session-heartbeat sweeper. Call once after construction.
    pub fn spawn_background_tasks(&self) {
        self.sessions.clone().spawn_heartbeat_sweeper();
    }

    /// Drains sessions, stops external tool-servers, and flushes the
    /// memory layer's reindex queue, in that order. Call once, on exit.
    pub async fn shutdown(&self) {
        shutdown::shutdown(
            &self.sessions,
            &self.external_servers,
            &self.memory,
            std::time::Duration::from_millis(self.config.external_server.startup_timeout_ms),
        )
        .await;
    }
}
