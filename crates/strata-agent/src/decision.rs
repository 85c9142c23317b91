use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_core::config::DecisionConfig;
use strata_core::error::{Result, StrataError};
use strata_core::traits::DecisionSource;
use strata_core::types::{
    clamp_confidence, AgentDecision, DecisionOrigin, DecisionRequest, OperationClass,
    PositionConstraint,
};
use strata_tools::ToolRegistry;

/// Deterministic next action when no decision source can be used.
///
/// Walks the pipeline load → analyze → synthesize and finishes once every
/// stage is done. `done` holds the classes that already produced a result
/// or gave up; stages without a registered tool are skipped.
pub fn fallback_decision(done: &BTreeSet<OperationClass>, tools: &ToolRegistry) -> AgentDecision {
    let stages = [
        (OperationClass::Data, PositionConstraint::MustBeFirst, "load", "no data loaded yet"),
        (OperationClass::Analysis, PositionConstraint::Any, "analyze", "data loaded but not analyzed"),
        (OperationClass::Generation, PositionConstraint::Any, "synthesize", "analysis available but not synthesized"),
    ];

    for (class, position, action, why) in stages {
        if done.contains(&class) {
            continue;
        }
        if let Some(tool) = tools.preferred(class, position) {
            return AgentDecision::new(action, Some(tool.name().to_string()), why, 1.0)
                .with_origin(DecisionOrigin::Fallback);
        }
    }
    AgentDecision::finish("pipeline complete").with_origin(DecisionOrigin::Fallback)
}

/// Decision source that always applies the deterministic pipeline rule.
pub struct HeuristicDecisionSource {
    tools: Arc<ToolRegistry>,
}

impl HeuristicDecisionSource {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

impl DecisionSource for HeuristicDecisionSource {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn decide(&self, request: DecisionRequest) -> BoxFuture<'_, Result<AgentDecision>> {
        Box::pin(async move {
            let done: BTreeSet<OperationClass> = request.completed_classes.iter().copied().collect();
            Ok(fallback_decision(&done, &self.tools).with_origin(DecisionOrigin::Source))
        })
    }
}

// ── HTTP decision source ─────────────────────────────────────────

#[derive(Serialize)]
struct DecideBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    request: &'a DecisionRequest,
}

#[derive(Deserialize, Debug)]
struct DecideResponse {
    action: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    alternatives: Vec<String>,
}

impl From<DecideResponse> for AgentDecision {
    fn from(r: DecideResponse) -> Self {
        AgentDecision::new(r.action, r.tool, r.rationale, clamp_confidence(r.confidence))
            .with_alternatives(r.alternatives)
    }
}

const INITIAL_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 5_000;

fn is_retryable(e: &StrataError) -> bool {
    match e {
        StrataError::DecisionSource(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32) -> Duration {
    let ms = (INITIAL_BACKOFF_MS * 2u64.pow(attempt.min(16))).min(MAX_BACKOFF_MS);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Remote decision source: POSTs the request as JSON and parses the chosen action.
pub struct HttpDecisionSource {
    http: Client,
    config: DecisionConfig,
}

impl HttpDecisionSource {
    pub fn new(config: DecisionConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StrataError::DecisionSource(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    async fn request_once(&self, request: &DecisionRequest) -> Result<AgentDecision> {
        let body = DecideBody {
            model: self.config.model.as_deref(),
            request,
        };
        let mut req = self.http.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connection"
            } else {
                "request"
            };
            StrataError::DecisionSource(format!("{kind} error: {e}"))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StrataError::DecisionSource(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| StrataError::DecisionSource(format!("connection error: {e}")))?;
        parse_decision(&text)
    }
}

/// Parse a decision response body.
pub fn parse_decision(body: &str) -> Result<AgentDecision> {
    let parsed: DecideResponse = serde_json::from_str(body)
        .map_err(|e| StrataError::DecisionSource(format!("malformed decision: {e}")))?;
    Ok(parsed.into())
}

impl DecisionSource for HttpDecisionSource {
    fn name(&self) -> &str {
        "http"
    }

    fn decide(&self, request: DecisionRequest) -> BoxFuture<'_, Result<AgentDecision>> {
        Box::pin(async move {
            let max_retries = self.config.max_retries;
            let mut attempt = 0;
            loop {
                match self.request_once(&request).await {
                    Ok(decision) => {
                        debug!(
                            execution_id = %request.execution_id,
                            action = %decision.action,
                            confidence = decision.confidence,
                            "Decision received"
                        );
                        return Ok(decision);
                    }
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying decision request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
