use std::sync::Arc;

use strata_agent::OrchestrationService;
use strata_core::config::GatewayConfig;

use crate::batcher::MessageBatcher;
use crate::connection::ConnectionRegistry;
use crate::handlers::HandlerRegistry;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub service: Arc<OrchestrationService>,
    pub connections: Arc<ConnectionRegistry>,
    pub batcher: Arc<MessageBatcher>,
    pub handlers: Arc<HandlerRegistry>,
}
