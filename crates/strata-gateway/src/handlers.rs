use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use strata_agent::{OrchestrationService, StartRequest};
use strata_core::error::{Result, StrataError};
use strata_core::event::EventBus;
use strata_core::types::{Condition, ExecutionId, SessionId, SystemEvent, WorkflowGraph};

use crate::connection::ConnectionRegistry;
use crate::protocol::{InboundMessage, ServerResponse};
use crate::rate_limit::InboundRateLimiter;

/// Who sent an inbound message.
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub session_id: SessionId,
    pub connection_id: Option<String>,
}

impl InboundContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            connection_id: None,
        }
    }

    pub fn with_connection(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }
}

/// Handles one inbound message type.
pub trait MessageHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a InboundContext,
        data: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Stable error code sent to clients.
pub fn error_code(err: &StrataError) -> &'static str {
    match err {
        StrataError::RateLimited { .. } => "rate_limited",
        StrataError::UnknownMessageType(_) => "unknown_type",
        StrataError::ExecutionNotFound(_) => "not_found",
        StrataError::ExecutionRejected(_) => "rejected",
        StrataError::GraphValidation(_) | StrataError::Gateway(_) | StrataError::Json(_) => {
            "invalid"
        }
        _ => "internal",
    }
}

/// Dispatches inbound messages by `type`.
///
/// Every message passes the session's rate limit first. Messages of one
/// session are handled one at a time, in arrival order; sessions never
/// wait on each other.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    limiter: InboundRateLimiter,
    session_locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl HandlerRegistry {
    pub fn new(limiter: InboundRateLimiter) -> Self {
        Self {
            handlers: HashMap::new(),
            limiter,
            session_locks: DashMap::new(),
        }
    }

    /// Registry with the heartbeat, sync, chat, tracking and execution handlers.
    pub fn with_defaults(
        service: Arc<OrchestrationService>,
        connections: Arc<ConnectionRegistry>,
        events: Arc<EventBus>,
        per_minute: u32,
    ) -> Self {
        let mut registry = Self::new(InboundRateLimiter::per_minute(per_minute));
        registry.register("heartbeat", HeartbeatHandler { connections });
        registry.register("sync", SyncHandler { service: Arc::clone(&service) });
        registry.register("chat", ChatHandler { events: Arc::clone(&events) });
        registry.register("tracking", TrackingHandler { events });
        registry.register("execution", ExecutionHandler { service });
        registry
    }

    pub fn register(&mut self, kind: &str, handler: impl MessageHandler + 'static) {
        self.handlers.insert(kind.to_string(), Arc::new(handler));
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Parse and handle a raw text frame.
    pub async fn dispatch(&self, ctx: &InboundContext, raw: &str) -> ServerResponse {
        match serde_json::from_str::<InboundMessage>(raw) {
            Ok(message) => self.handle(ctx, message).await,
            Err(e) => {
                debug!(session_id = %ctx.session_id, error = %e, "Unparseable inbound frame");
                ServerResponse::err("unknown", None, "parse_error", format!("Parse error: {e}"))
            }
        }
    }

    pub async fn handle(&self, ctx: &InboundContext, message: InboundMessage) -> ServerResponse {
        let InboundMessage {
            kind,
            request_id,
            data,
        } = message;

        let result = self.run(ctx, &kind, data).await;
        match result {
            Ok(value) => ServerResponse::ok(&kind, request_id, value),
            Err(e) => {
                if !matches!(e, StrataError::RateLimited { .. }) {
                    warn!(session_id = %ctx.session_id, kind = %kind, error = %e, "Inbound message failed");
                }
                ServerResponse::err(&kind, request_id, error_code(&e), e.to_string())
            }
        }
    }

    async fn run(
        &self,
        ctx: &InboundContext,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.limiter.check(&ctx.session_id)?;
        let handler = self
            .handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| StrataError::UnknownMessageType(kind.to_string()))?;

        let lock = self
            .session_locks
            .entry(ctx.session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serial = lock.lock().await;
        handler.handle(ctx, data).await
    }

    /// Drop a session's serialization lock once it has no connections.
    /// Its rate-limit bucket is kept so reconnecting does not reset it.
    pub fn forget_session(&self, session: &SessionId) {
        self.session_locks.remove(session);
    }

    /// Drop rate-limit buckets of sessions idle for `ttl`.
    pub fn purge_idle(&self, ttl: std::time::Duration) -> usize {
        self.limiter.purge_idle(ttl)
    }

    /// Sessions with a live rate-limit bucket.
    pub fn limited_sessions(&self) -> usize {
        self.limiter.tracked_sessions()
    }
}

// ── Built-in handlers ───────────────────────────────────────────

pub struct HeartbeatHandler {
    connections: Arc<ConnectionRegistry>,
}

impl MessageHandler for HeartbeatHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a InboundContext,
        _data: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            if let Some(id) = &ctx.connection_id {
                self.connections.touch(&ctx.session_id, id);
            }
            Ok(json!({ "pong": true, "server_time": Utc::now() }))
        })
    }
}

/// Replays a session's recent executions, e.g. after a reconnect.
pub struct SyncHandler {
    service: Arc<OrchestrationService>,
}

impl MessageHandler for SyncHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a InboundContext,
        data: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let limit = data["limit"].as_u64().unwrap_or(20) as usize;
            let executions = self.service.list(&ctx.session_id, limit).await?;
            let entries: Vec<serde_json::Value> = executions
                .iter()
                .map(|e| {
                    json!({
                        "execution": e,
                        "active": self.service.is_active(&e.id),
                    })
                })
                .collect();
            Ok(json!({ "executions": entries }))
        })
    }
}

pub struct ChatHandler {
    events: Arc<EventBus>,
}

impl MessageHandler for ChatHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a InboundContext,
        data: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let text = data["message"].as_str().unwrap_or("");
            if text.trim().is_empty() {
                return Err(StrataError::Gateway("chat message is empty".into()));
            }
            self.events.publish(SystemEvent::ChatReceived {
                session_id: ctx.session_id.clone(),
                message: data,
            });
            Ok(json!({ "received": true }))
        })
    }
}

pub struct TrackingHandler {
    events: Arc<EventBus>,
}

impl MessageHandler for TrackingHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a InboundContext,
        data: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            self.events.publish(SystemEvent::TrackingReceived {
                session_id: ctx.session_id.clone(),
                event: data,
            });
            Ok(json!({ "recorded": true }))
        })
    }
}

#[derive(Deserialize)]
struct StartParams {
    condition: Condition,
    #[serde(default)]
    graph: Option<WorkflowGraph>,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    input: serde_json::Value,
}

/// Execution control: `start`, `status`, `cancel`, `history`, `intervene`.
pub struct ExecutionHandler {
    service: Arc<OrchestrationService>,
}

fn execution_id(data: &serde_json::Value) -> Result<ExecutionId> {
    data["execution_id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(ExecutionId::from_string)
        .ok_or_else(|| StrataError::Gateway("execution_id is required".into()))
}

impl MessageHandler for ExecutionHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a InboundContext,
        data: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let action = data["action"].as_str().unwrap_or("").to_string();
            match action.as_str() {
                "start" => {
                    let params: StartParams = serde_json::from_value(data)?;
                    let started = self
                        .service
                        .start(StartRequest {
                            session_id: ctx.session_id.clone(),
                            condition: params.condition,
                            graph: params.graph,
                            goal: params.goal,
                            input: params.input,
                        })
                        .await?;
                    Ok(serde_json::to_value(started)?)
                }
                "status" => {
                    let report = self.service.status(&execution_id(&data)?).await?;
                    Ok(serde_json::to_value(report)?)
                }
                "cancel" => {
                    let id = execution_id(&data)?;
                    self.service.cancel(&id).await?;
                    Ok(json!({ "execution_id": id, "cancelled": true }))
                }
                "history" => {
                    let id = execution_id(&data)?;
                    let limit = data["limit"].as_u64().map(|n| n as usize);
                    let checkpoints = self.service.history(&id, limit).await?;
                    Ok(json!({ "execution_id": id, "checkpoints": checkpoints }))
                }
                "intervene" => {
                    let id = execution_id(&data)?;
                    self.service.intervene(&id, data["payload"].clone()).await?;
                    Ok(json!({ "execution_id": id, "accepted": true }))
                }
                other => Err(StrataError::Gateway(format!(
                    "unknown execution action '{other}'"
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    struct Echo;

    impl MessageHandler for Echo {
        fn handle<'a>(
            &'a self,
            _ctx: &'a InboundContext,
            data: serde_json::Value,
        ) -> BoxFuture<'a, Result<serde_json::Value>> {
            Box::pin(async move { Ok(data) })
        }
    }

    /// Logs entry and exit around a short sleep.
    struct Slow {
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl MessageHandler for Slow {
        fn handle<'a>(
            &'a self,
            _ctx: &'a InboundContext,
            data: serde_json::Value,
        ) -> BoxFuture<'a, Result<serde_json::Value>> {
            Box::pin(async move {
                let tag = data["tag"].as_str().unwrap_or("").to_string();
                self.log.lock().unwrap().push(format!("enter {tag}"));
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.log.lock().unwrap().push(format!("exit {tag}"));
                Ok(json!(null))
            })
        }
    }

    fn ctx(session: &str) -> InboundContext {
        InboundContext::new(SessionId::from_string(session))
    }

    #[tokio::test]
    async fn test_response_echoes_request_id() {
        let mut registry = HandlerRegistry::new(InboundRateLimiter::per_minute(100));
        registry.register("echo", Echo);

        let resp = registry
            .dispatch(&ctx("s1"), r#"{"type":"echo","request_id":"r-7","data":{"x":1}}"#)
            .await;
        assert!(resp.is_ok());
        assert_eq!(resp.request_id.as_deref(), Some("r-7"));
        assert_eq!(resp.reply_to, "echo");
        assert_eq!(resp.result.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn test_unknown_type_is_error_response() {
        let registry = HandlerRegistry::new(InboundRateLimiter::per_minute(100));
        let resp = registry
            .dispatch(&ctx("s1"), r#"{"type":"teleport","request_id":"r-1"}"#)
            .await;
        assert!(!resp.is_ok());
        assert_eq!(resp.request_id.as_deref(), Some("r-1"));
        assert_eq!(resp.error.unwrap().code, "unknown_type");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_parse_error() {
        let registry = HandlerRegistry::new(InboundRateLimiter::per_minute(100));
        let resp = registry.dispatch(&ctx("s1"), "not json").await;
        assert_eq!(resp.error.unwrap().code, "parse_error");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess_messages() {
        let mut registry = HandlerRegistry::new(InboundRateLimiter::per_minute(3));
        registry.register("echo", Echo);
        for _ in 0..3 {
            assert!(registry.dispatch(&ctx("s1"), r#"{"type":"echo"}"#).await.is_ok());
        }
        let resp = registry.dispatch(&ctx("s1"), r#"{"type":"echo"}"#).await;
        assert_eq!(resp.error.unwrap().code, "rate_limited");
        assert!(registry.dispatch(&ctx("s2"), r#"{"type":"echo"}"#).await.is_ok());
    }

    #[tokio::test]
    async fn test_same_session_messages_are_serialized() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new(InboundRateLimiter::per_minute(100));
        registry.register("slow", Slow { log: Arc::clone(&log) });

        let c = ctx("s1");
        tokio::join!(
            registry.dispatch(&c, r#"{"type":"slow","data":{"tag":"a"}}"#),
            registry.dispatch(&c, r#"{"type":"slow","data":{"tag":"b"}}"#),
        );
        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec!["enter a", "exit a", "enter b", "exit b"]);
    }

    #[tokio::test]
    async fn test_different_sessions_run_concurrently() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new(InboundRateLimiter::per_minute(100));
        registry.register("slow", Slow { log: Arc::clone(&log) });

        let (c1, c2) = (ctx("s1"), ctx("s2"));
        tokio::join!(
            registry.dispatch(&c1, r#"{"type":"slow","data":{"tag":"a"}}"#),
            registry.dispatch(&c2, r#"{"type":"slow","data":{"tag":"b"}}"#),
        );
        let log = log.lock().unwrap().clone();
        assert_eq!(&log[..2], &["enter a", "enter b"]);
    }

    #[tokio::test]
    async fn test_heartbeat_touches_connection() {
        let connections = Arc::new(ConnectionRegistry::new(10));
        let session = SessionId::from_string("s1");
        let (conn, _rx) = connections.connect(&session);
        let before = connections.connections(&session)[0].last_activity;

        let mut registry = HandlerRegistry::new(InboundRateLimiter::per_minute(100));
        registry.register("heartbeat", HeartbeatHandler { connections: Arc::clone(&connections) });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let c = InboundContext::new(session.clone()).with_connection(conn.id());
        let resp = registry.dispatch(&c, r#"{"type":"heartbeat"}"#).await;
        assert_eq!(resp.result.unwrap()["pong"], true);
        assert!(connections.connections(&session)[0].last_activity > before);
    }

    #[tokio::test]
    async fn test_chat_and_tracking_publish_events() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let mut registry = HandlerRegistry::new(InboundRateLimiter::per_minute(100));
        registry.register("chat", ChatHandler { events: Arc::clone(&events) });
        registry.register("tracking", TrackingHandler { events: Arc::clone(&events) });

        let resp = registry.dispatch(&ctx("s1"), r#"{"type":"chat","data":{"message":"hi"}}"#).await;
        assert!(resp.is_ok());
        match rx.recv().await.unwrap() {
            SystemEvent::ChatReceived { session_id, message } => {
                assert_eq!(session_id.as_str(), "s1");
                assert_eq!(message["message"], "hi");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let resp = registry.dispatch(&ctx("s1"), r#"{"type":"chat","data":{}}"#).await;
        assert_eq!(resp.error.unwrap().code, "invalid");

        registry
            .dispatch(&ctx("s1"), r#"{"type":"tracking","data":{"event":"click"}}"#)
            .await;
        assert!(matches!(rx.recv().await.unwrap(), SystemEvent::TrackingReceived { .. }));
    }
}
