use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strata_agent::{
    CircuitBreakers, DegradationController, ExecutorDeps, HeuristicDecisionSource,
    HttpDecisionSource, OrchestrationService, ProgressEmitter,
};
use strata_core::config::AppConfig;
use strata_core::event::EventBus;
use strata_core::traits::{DecisionSource, ProgressSink};
use strata_core::types::{ProgressEnvelope, SessionId};
use strata_gateway::{ConnectionRegistry, MessageBatcher};
use strata_store::{CheckpointBuffer, MemoryStateStore, SqliteCheckpointStore};
use strata_tools::ToolRegistry;

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let config = AppConfig::load(path)?;
        info!(path = %path.display(), "Config loaded");
        Ok(config)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

pub fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteCheckpointStore>> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(Arc::new(SqliteCheckpointStore::open(&db_path)?))
}

/// Where progress envelopes go.
pub enum Output {
    /// Batched to WebSocket sessions.
    Gateway,
    /// Printed to stderr, one line per envelope.
    Console,
}

/// Everything a running process owns, wired together.
pub struct Runtime {
    pub config: AppConfig,
    pub service: Arc<OrchestrationService>,
    pub events: Arc<EventBus>,
    pub connections: Arc<ConnectionRegistry>,
    pub batcher: Arc<MessageBatcher>,
    background: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn build(config: AppConfig, output: Output) -> anyhow::Result<Self> {
        let events = Arc::new(EventBus::default());
        let store = open_store(&config)?;

        let state = Arc::new(MemoryStateStore::new(Duration::from_secs(
            config.storage.state_ttl_secs,
        )));
        let checkpoints = Arc::new(CheckpointBuffer::new(
            store.clone(),
            config.checkpoint.batch_size,
            Duration::from_millis(config.checkpoint.max_age_ms),
        ));

        let connections = Arc::new(ConnectionRegistry::new(config.gateway.offline_queue_size));
        let batcher = Arc::new(MessageBatcher::from_config(
            Arc::clone(&connections),
            &config.gateway,
        ));
        let sink: Arc<dyn ProgressSink> = match output {
            Output::Gateway => batcher.clone(),
            Output::Console => Arc::new(ConsoleProgressSink),
        };

        let degradation = Arc::new(
            DegradationController::new(config.degradation.clone()).with_events(Arc::clone(&events)),
        );
        let breakers = Arc::new(CircuitBreakers::new(
            &config.breakers,
            Some(Arc::clone(&events)),
        ));
        let tools = Arc::new(ToolRegistry::with_builtins());

        let decision: Arc<dyn DecisionSource> = match &config.decision {
            Some(dc) => {
                info!(endpoint = %dc.endpoint, "Using HTTP decision source");
                Arc::new(HttpDecisionSource::new(dc.clone())?)
            }
            None => Arc::new(HeuristicDecisionSource::new(Arc::clone(&tools))),
        };

        let deps = Arc::new(ExecutorDeps {
            tools,
            state: state.clone(),
            checkpoints: Arc::clone(&checkpoints),
            breakers,
            progress: Arc::new(ProgressEmitter::new(sink, degradation.clone())),
            degradation,
            config: config.executor.clone(),
        });
        let service = Arc::new(OrchestrationService::new(
            deps,
            store,
            Some(decision),
            Arc::clone(&events),
        ));

        let background = CancellationToken::new();
        let tasks = vec![
            state.spawn_reaper(
                Duration::from_secs(config.storage.reaper_interval_secs.max(1)),
                background.child_token(),
            ),
            checkpoints.spawn_sweeper(
                Duration::from_millis(config.checkpoint.sweep_interval_ms.max(1)),
                background.child_token(),
            ),
        ];

        Ok(Self {
            config,
            service,
            events,
            connections,
            batcher,
            background,
            tasks,
        })
    }

    /// Cancel live executions, flush checkpoints, then stop background loops.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let flushed = self.service.shutdown().await;
        self.background.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        flushed?;
        info!("Runtime stopped");
        Ok(())
    }
}

/// Progress for one-shot CLI runs.
struct ConsoleProgressSink;

impl ProgressSink for ConsoleProgressSink {
    fn emit(&self, _session: &SessionId, envelope: ProgressEnvelope) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            eprintln!(
                "[{}] step {:>3}  {}/{:?}  {}",
                envelope.execution_id, envelope.step_number, envelope.kind, envelope.subtype, envelope.status
            );
        })
    }
}
