use strata_core::types::{GraphEdge, GraphNode, OperationClass, WorkflowGraph};

use crate::mock_tool::MockTool;

/// Tool names used by [`four_node_graph`].
pub const ENTRY_TOOL: &str = "entry";
pub const MIDDLE_A_TOOL: &str = "middle_a";
pub const MIDDLE_B_TOOL: &str = "middle_b";
pub const TERMINAL_TOOL: &str = "terminal";

/// Linear graph `entry → middle_a → middle_b → terminal`, node ids n1..n4.
pub fn four_node_graph() -> WorkflowGraph {
    WorkflowGraph::linear(&[
        ("n1", ENTRY_TOOL),
        ("n2", MIDDLE_A_TOOL),
        ("n3", MIDDLE_B_TOOL),
        ("n4", TERMINAL_TOOL),
    ])
}

/// Mock tools matching [`four_node_graph`], in node order.
pub fn four_node_tools() -> Vec<MockTool> {
    vec![
        MockTool::entry(ENTRY_TOOL),
        MockTool::new(MIDDLE_A_TOOL, OperationClass::Analysis),
        MockTool::new(MIDDLE_B_TOOL, OperationClass::Generation),
        MockTool::terminal(TERMINAL_TOOL),
    ]
}

/// Diamond with a conditional split:
/// `n1 → cond`, `cond -true→ yes`, `cond -false→ no`, `yes → n4`, `no → n4`.
pub fn branching_graph(cond_tool: &str, yes_tool: &str, no_tool: &str) -> WorkflowGraph {
    WorkflowGraph::new()
        .node(GraphNode::new("n1", ENTRY_TOOL))
        .node(GraphNode::new("cond", cond_tool))
        .node(GraphNode::new("yes", yes_tool))
        .node(GraphNode::new("no", no_tool))
        .node(GraphNode::new("n4", TERMINAL_TOOL))
        .edge(GraphEdge::new("n1", "cond"))
        .edge(GraphEdge::branch("cond", "yes", "true"))
        .edge(GraphEdge::branch("cond", "no", "false"))
        .edge(GraphEdge::new("yes", "n4"))
        .edge(GraphEdge::new("no", "n4"))
}

/// Builtin-tool pipeline used by end-to-end tests.
pub fn builtin_pipeline() -> WorkflowGraph {
    WorkflowGraph::linear(&[
        ("load", "load_input"),
        ("profile", "profile_data"),
        ("summary", "summarize"),
        ("show", "show_results"),
    ])
}

/// Minimal TOML config with every section defaulted.
pub fn minimal_config_toml() -> &'static str {
    "[gateway]\nbind = \"127.0.0.1:0\"\n"
}

/// Write a TOML config into a fresh temp dir; returns (dir guard, path).
pub fn temp_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strata.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}
