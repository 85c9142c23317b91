use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use strata_agent::OrchestrationService;
use strata_core::config::GatewayConfig;
use strata_core::event::EventBus;
use strata_core::types::SystemEvent;

use crate::batcher::MessageBatcher;
use crate::connection::ConnectionRegistry;
use crate::handlers::HandlerRegistry;
use crate::protocol::SystemNotice;
use crate::routes;
use crate::state::AppState;

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    state: Arc<AppState>,
    events: Arc<EventBus>,
}

impl GatewayServer {
    /// `batcher` must be the progress sink the service emits through,
    /// wired to `connections`.
    pub fn new(
        config: GatewayConfig,
        service: Arc<OrchestrationService>,
        connections: Arc<ConnectionRegistry>,
        batcher: Arc<MessageBatcher>,
        events: Arc<EventBus>,
    ) -> Self {
        let handlers = HandlerRegistry::with_defaults(
            Arc::clone(&service),
            Arc::clone(&connections),
            Arc::clone(&events),
            config.inbound_per_minute,
        );
        let state = Arc::new(AppState {
            config,
            service,
            connections,
            batcher,
            handlers: Arc::new(handlers),
        });
        Self { state, events }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            // WebSocket
            .route("/ws", get(routes::ws_handler))
            // REST API
            .route("/api/health", get(routes::health))
            .route("/api/executions", post(routes::start_execution))
            .route("/api/executions/{id}", get(routes::execution_status))
            .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
            .route(
                "/api/executions/{id}/checkpoints",
                get(routes::execution_checkpoints),
            )
            .route(
                "/api/sessions/{id}/executions",
                get(routes::session_executions),
            )
            .route("/api/degradation/override", put(routes::degradation_override))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.state.config.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let config = &self.state.config;
        let sweeper = self.state.batcher.spawn_sweeper(
            Duration::from_millis(config.sweep_interval_ms.max(1)),
            shutdown.child_token(),
        );
        let forwarder = spawn_event_forwarder(
            Arc::clone(&self.events),
            Arc::clone(&self.state.connections),
            shutdown.child_token(),
        );
        let ttl = Duration::from_secs(config.idle_session_ttl_secs.max(1));
        let reaper = spawn_idle_reaper(
            Arc::clone(&self.state.connections),
            Arc::clone(&self.state.handlers),
            ttl,
            (ttl / 4).max(Duration::from_secs(1)),
            shutdown.child_token(),
        );

        info!(bind = %listener.local_addr()?, "Gateway listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        let _ = sweeper.await;
        let _ = forwarder.await;
        let _ = reaper.await;
        info!("Gateway shut down");
        Ok(())
    }
}

/// Periodically drop offline queues and rate-limit buckets of sessions
/// idle for `ttl`, until `cancel` fires.
pub fn spawn_idle_reaper(
    connections: Arc<ConnectionRegistry>,
    handlers: Arc<HandlerRegistry>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let queues = connections.purge_idle(ttl);
                    let buckets = handlers.purge_idle(ttl);
                    if queues + buckets > 0 {
                        debug!(queues, buckets, "Idle session state purged");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Idle reaper stopping");
                    break;
                }
            }
        }
    })
}

/// Push degradation and breaker changes to every live connection.
pub fn spawn_event_forwarder(
    events: Arc<EventBus>,
    connections: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => event,
            };
            let notice = match event {
                Ok(SystemEvent::DegradationChanged { from, to }) => {
                    SystemNotice::new("degradation", serde_json::json!({ "from": from, "to": to }))
                }
                Ok(SystemEvent::CircuitChanged { class, mode }) => {
                    SystemNotice::new("circuit", serde_json::json!({ "class": class, "mode": mode }))
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event forwarder lagged");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            match serde_json::to_string(&notice) {
                Ok(json) => {
                    let delivered = connections.broadcast_all(&json);
                    debug!(event = %notice.event, delivered, "Forwarded system notice");
                }
                Err(e) => warn!(error = %e, "Failed to encode system notice"),
            }
        }
    })
}
