use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning session of an execution (one participant / browser session).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Executions ──────────────────────────────────────────────────

/// Which executor drives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// A user-authored, validated DAG.
    Declared,
    /// A bounded plan → act → validate loop.
    Autonomous,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Declared => "declared",
            Condition::Autonomous => "autonomous",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "declared" => Some(Condition::Declared),
            "autonomous" => Some(Condition::Autonomous),
            _ => None,
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable summary record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub session_id: SessionId,
    pub condition: Condition,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub steps_completed: u64,
    #[serde(default)]
    pub checkpoints_written: u64,
    #[serde(default)]
    pub tool_calls: u64,
}

impl Execution {
    pub fn new(session_id: SessionId, condition: Condition, input: serde_json::Value) -> Self {
        Self {
            id: ExecutionId::new(),
            session_id,
            condition,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            input,
            result: None,
            error: None,
            steps_completed: 0,
            checkpoints_written: 0,
            tool_calls: 0,
        }
    }
}

// ── Tools ───────────────────────────────────────────────────────

/// Operation class of a tool call; one circuit breaker exists per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Decision,
    Data,
    Analysis,
    Generation,
    Output,
}

impl OperationClass {
    pub const ALL: [OperationClass; 5] = [
        OperationClass::Decision,
        OperationClass::Data,
        OperationClass::Analysis,
        OperationClass::Generation,
        OperationClass::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Decision => "decision",
            OperationClass::Data => "data",
            OperationClass::Analysis => "analysis",
            OperationClass::Generation => "generation",
            OperationClass::Output => "output",
        }
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a tool may appear in a declared graph.
///
/// `MustBeFirst` and `MustBeLast` also mark the node as critical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionConstraint {
    #[default]
    Any,
    MustBeFirst,
    MustBeLast,
}

impl PositionConstraint {
    pub fn is_critical(&self) -> bool {
        !matches!(self, PositionConstraint::Any)
    }
}

/// Static description of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub class: OperationClass,
    #[serde(default)]
    pub position: PositionConstraint,
    #[serde(default)]
    pub conditional: bool,
}

/// Input handed to a tool invocation, assembled from the current execution state.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInput {
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    /// Declared-graph node id; `None` for autonomous calls.
    pub node_id: Option<String>,
    /// Static node configuration (declared) or decision arguments (autonomous).
    pub config: serde_json::Value,
    /// The execution's input payload.
    pub payload: serde_json::Value,
    /// Working data accumulated so far.
    pub data: BTreeMap<String, serde_json::Value>,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    /// Branch label chosen by a conditional node.
    #[serde(default)]
    pub outcome: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            outcome: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }
}

/// Recorded result of one node (declared) or tool call (autonomous).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node_id: String,
    pub tool: String,
    pub class: OperationClass,
    pub succeeded: bool,
    #[serde(default)]
    pub outcome: Option<String>,
    pub step: u64,
    pub elapsed_ms: u64,
}

// ── Errors recorded in state ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StoreFatal,
    ToolCritical,
    ToolNonCritical,
    DecisionSource,
    CircuitOpen,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub step: u64,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ── Autonomous decisions ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    /// Produced by the configured decision source.
    Source,
    /// Produced by the deterministic fallback rule.
    Fallback,
}

/// One plan-step artifact of the autonomous loop. Never mutated after recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDecision {
    #[serde(default)]
    pub step: u64,
    pub action: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default = "default_origin")]
    pub origin: DecisionOrigin,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_origin() -> DecisionOrigin {
    DecisionOrigin::Source
}

impl AgentDecision {
    pub fn new(
        action: impl Into<String>,
        tool: Option<String>,
        rationale: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            step: 0,
            action: action.into(),
            tool,
            rationale: rationale.into(),
            confidence: clamp_confidence(confidence),
            alternatives: vec![],
            origin: DecisionOrigin::Source,
            timestamp: Utc::now(),
        }
    }

    /// A `finish` decision routing straight to validation.
    pub fn finish(rationale: impl Into<String>) -> Self {
        Self::new("finish", None, rationale, 1.0)
    }

    pub fn with_alternatives(mut self, alternatives: Vec<String>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn with_origin(mut self, origin: DecisionOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// `finish` and `complete` both end the plan/execute cycle.
    pub fn is_finish(&self) -> bool {
        let action = self.action.trim().to_ascii_lowercase();
        action == "finish" || action == "complete"
    }
}

/// Clamp a confidence score into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// What a decision source sees when asked for the next action.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub execution_id: ExecutionId,
    pub goal: String,
    pub step: u64,
    pub data_keys: Vec<String>,
    pub error_count: usize,
    /// Operation classes that already produced a successful result.
    pub completed_classes: Vec<OperationClass>,
    /// Last few decisions only.
    pub recent_decisions: Vec<AgentDecision>,
    pub tools: Vec<ToolDescriptor>,
}

// ── Live execution state ────────────────────────────────────────

/// Working state of one execution, as reconstructed from the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    pub condition: Condition,
    pub status: ExecutionStatus,
    pub step: u64,
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub timings_ms: BTreeMap<String, u64>,
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeOutcome>,
    #[serde(default)]
    pub decisions: Vec<AgentDecision>,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub checkpoints: u64,
    pub started_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(execution_id: ExecutionId, session_id: SessionId, condition: Condition) -> Self {
        Self {
            execution_id,
            session_id,
            condition,
            status: ExecutionStatus::Running,
            step: 0,
            current_node: None,
            data: BTreeMap::new(),
            errors: vec![],
            warnings: vec![],
            timings_ms: BTreeMap::new(),
            node_results: BTreeMap::new(),
            decisions: vec![],
            tool_calls: 0,
            checkpoints: 0,
            started_at: Utc::now(),
        }
    }
}

// ── Checkpoints ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    ExecutionStart,
    NodeStart,
    NodeEnd,
    AgentDecision,
    Error,
    UserIntervention,
    Cancelled,
    ExecutionEnd,
}

impl CheckpointKind {
    /// Critical kinds bypass batching and flush immediately.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            CheckpointKind::ExecutionStart
                | CheckpointKind::ExecutionEnd
                | CheckpointKind::Error
                | CheckpointKind::Cancelled
                | CheckpointKind::UserIntervention
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::ExecutionStart => "execution_start",
            CheckpointKind::NodeStart => "node_start",
            CheckpointKind::NodeEnd => "node_end",
            CheckpointKind::AgentDecision => "agent_decision",
            CheckpointKind::Error => "error",
            CheckpointKind::UserIntervention => "user_intervention",
            CheckpointKind::Cancelled => "cancelled",
            CheckpointKind::ExecutionEnd => "execution_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution_start" => Some(CheckpointKind::ExecutionStart),
            "node_start" => Some(CheckpointKind::NodeStart),
            "node_end" => Some(CheckpointKind::NodeEnd),
            "agent_decision" => Some(CheckpointKind::AgentDecision),
            "error" => Some(CheckpointKind::Error),
            "user_intervention" => Some(CheckpointKind::UserIntervention),
            "cancelled" => Some(CheckpointKind::Cancelled),
            "execution_end" => Some(CheckpointKind::ExecutionEnd),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot taken at a transition point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    pub step: u64,
    pub kind: CheckpointKind,
    #[serde(default)]
    pub node_id: Option<String>,
    /// Serialized `ExecutionState` (or a reduced subset).
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

// ── Declared graphs ─────────────────────────────────────────────

/// A node of a user-authored workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    /// Name of a registered tool.
    pub tool: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Directed edge; `branch` labels the outgoing edges of a conditional node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub branch: Option<String>,
}

impl GraphEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            branch: None,
        }
    }

    pub fn branch(
        source: impl Into<String>,
        target: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            branch: Some(label.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: GraphEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Linear chain `n0 → n1 → … → nk` over the given `(id, tool)` pairs.
    pub fn linear(steps: &[(&str, &str)]) -> Self {
        let mut graph = Self::new();
        for (id, tool) in steps {
            graph.nodes.push(GraphNode::new(*id, *tool));
        }
        for pair in steps.windows(2) {
            graph.edges.push(GraphEdge::new(pair[0].0, pair[1].0));
        }
        graph
    }
}

// ── Service levels ──────────────────────────────────────────────

/// Ordered service levels, `Full` being the healthiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Full,
    Reduced,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "full",
            DegradationLevel::Reduced => "reduced",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
        }
    }

    /// One level healthier, if any.
    pub fn better(&self) -> Option<Self> {
        match self {
            DegradationLevel::Full => None,
            DegradationLevel::Reduced => Some(DegradationLevel::Full),
            DegradationLevel::Minimal => Some(DegradationLevel::Reduced),
            DegradationLevel::Emergency => Some(DegradationLevel::Minimal),
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a reported error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Normal,
    High,
    Critical,
}

impl Severity {
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.5,
            Severity::Normal => 1.0,
            Severity::High => 2.0,
            Severity::Critical => 5.0,
        }
    }
}

// ── Circuit state reporting ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitMode {
    /// Normal operation – all calls pass through.
    Closed,
    /// Too many failures – calls are rejected immediately.
    Open,
    /// Testing recovery – limited probe calls are allowed through.
    HalfOpen,
}

/// Point-in-time view of one breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub class: OperationClass,
    pub mode: CircuitMode,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

// ── Progress channel ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressSubtype {
    Start,
    Progress,
    End,
    Error,
}

/// Typed envelope pushed to live clients of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: ProgressSubtype,
    #[serde(rename = "executionId")]
    pub execution_id: ExecutionId,
    #[serde(rename = "stepNumber")]
    pub step_number: u64,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEnvelope {
    pub fn new(
        kind: impl Into<String>,
        subtype: ProgressSubtype,
        execution_id: ExecutionId,
        step_number: u64,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            kind: kind.into(),
            subtype,
            execution_id,
            step_number,
            status,
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// End and error envelopes are never throttled or suppressed.
    pub fn is_urgent(&self) -> bool {
        matches!(self.subtype, ProgressSubtype::End | ProgressSubtype::Error)
    }
}

// ── In-process events ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SystemEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        session_id: SessionId,
        condition: Condition,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        session_id: SessionId,
        status: ExecutionStatus,
    },
    DegradationChanged {
        from: DegradationLevel,
        to: DegradationLevel,
    },
    CircuitChanged {
        class: OperationClass,
        mode: CircuitMode,
    },
    ChatReceived {
        session_id: SessionId,
        message: serde_json::Value,
    },
    TrackingReceived {
        session_id: SessionId,
        event: serde_json::Value,
    },
}
