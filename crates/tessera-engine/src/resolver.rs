//! Dependency resolution: packaging upstream results into the input
//! bundle a node receives at execution time.
//!
//! Bundles are deliberately schema-free: each dependency entry carries
//! the *entire* upstream result (stdout, stderr, exit code, success flag,
//! output files, duration) under a stable human-readable label, and the
//! downstream program applies its own defensive parsing. Nothing here
//! validates shapes across the graph.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};

use crate::error::EngineResult;
use crate::execution::{NodeStatus, WorkflowExecution};
use crate::graph::{EdgeId, EdgeKind, NodeId, WorkflowGraph};

/// Everything `prepare_inputs` reads: the graph, the persisted execution
/// state, pre-resolved program names, and per-edge payload overrides
/// (edge transforms and `UseDefault` substitutions).
///
/// Preparation is a pure function of this context: the same context
/// always yields a byte-identical bundle.
pub struct ResolverContext<'a> {
    /// The runtime graph.
    pub graph: &'a WorkflowGraph,
    /// Persisted execution state.
    pub execution: &'a WorkflowExecution,
    /// Program names resolved ahead of time, keyed by node.
    pub program_names: &'a BTreeMap<NodeId, String>,
    /// Payloads that replace an edge's upstream entry.
    pub edge_payloads: &'a BTreeMap<EdgeId, Value>,
}

/// The packaged inputs handed to a node at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBundle {
    values: BTreeMap<String, Value>,
    dependency_labels: BTreeSet<String>,
}

impl InputBundle {
    /// Returns the bundle as a JSON object with deterministic key order.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Serializes the bundle; identical state yields identical bytes.
    pub fn to_json_string(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    /// Returns the value bound to a name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Returns the labels of dependency entries (as opposed to static or
    /// mapped inputs).
    pub fn dependency_labels(&self) -> impl Iterator<Item = &str> {
        self.dependency_labels.iter().map(String::as_str)
    }

    /// Generates the convenience-accessor manifest: for each dependency
    /// label, the fields a program can read from that entry. Shipped to
    /// the sandbox alongside the bundle so generated helper shims can
    /// expose typed getters.
    pub fn accessor_manifest(&self) -> Value {
        Value::Object(
            self.dependency_labels
                .iter()
                .map(|label| {
                    (
                        label.clone(),
                        json!({
                            "entry": label,
                            "fields": ["stdout", "stderr", "exit_code", "success",
                                       "output_files", "duration_ms", "skipped"],
                        }),
                    )
                })
                .collect(),
        )
    }

    /// Merges a resolved interaction payload into the bundle under
    /// `interaction`.
    pub fn with_interaction_payload(mut self, payload: Value) -> Self {
        self.values.insert("interaction".to_string(), payload);
        self
    }
}

/// Resolves a stable label for every node in the graph.
///
/// The label is the referenced program's name sanitized into an
/// identifier; collisions are disambiguated with `_2`, `_3`, ... in
/// ascending node-id order; missing or empty names fall back to the node
/// id. The map is total and stable for a given graph + name set.
pub fn resolve_labels(
    graph: &WorkflowGraph,
    program_names: &BTreeMap<NodeId, String>,
) -> BTreeMap<NodeId, String> {
    let mut labels = BTreeMap::new();
    let mut taken: BTreeSet<String> = BTreeSet::new();

    let mut ids: Vec<NodeId> = graph.node_ids().collect();
    ids.sort();

    for id in ids {
        let base = program_names
            .get(&id)
            .map(|name| sanitize(name))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| sanitize(&id.to_string()));

        let mut label = base.clone();
        let mut suffix = 2;
        while taken.contains(&label) {
            label = format!("{base}_{suffix}");
            suffix += 1;
        }
        taken.insert(label.clone());
        labels.insert(id, label);
    }

    labels
}

/// Sanitizes a program name into an identifier: alphanumerics pass
/// through, everything else becomes `_`, leading digits get a `_` prefix.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    out = out.trim_matches('_').to_string();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Packages the inputs for a node from already-persisted execution state.
///
/// Pure: no side effects, deterministic for a given context. Merge
/// precedence, lowest to highest: dependency bundle, static inputs,
/// user-supplied inputs, explicit input mappings.
pub fn prepare_inputs(ctx: &ResolverContext<'_>, node_id: NodeId) -> EngineResult<InputBundle> {
    let labels = resolve_labels(ctx.graph, ctx.program_names);
    let mut values: BTreeMap<String, Value> = BTreeMap::new();
    let mut dependency_labels = BTreeSet::new();

    // Dependency entries, one per non-disabled inbound data edge.
    for edge in ctx.graph.incoming_edges(node_id) {
        if edge.disabled || edge.kind != EdgeKind::Data {
            continue;
        }
        let label = labels
            .get(&edge.source)
            .cloned()
            .unwrap_or_else(|| edge.source.to_string());

        let entry = if let Some(payload) = ctx.edge_payloads.get(&edge.id) {
            payload.clone()
        } else {
            node_entry(ctx.execution, edge.source)
        };
        dependency_labels.insert(label.clone());
        values.insert(label, entry);
    }

    let node = ctx.graph.node(node_id);

    // Static inputs, then user inputs, overlay the bundle.
    if let Some(node) = node {
        for (key, value) in &node.inputs.static_inputs {
            values.insert(key.clone(), value.clone());
        }
        for (key, value) in &node.inputs.user_inputs {
            values.insert(key.clone(), value.clone());
        }

        // Explicit mappings have the highest precedence. They read the
        // raw upstream record, not the merged map, so a static input
        // shadowing a label cannot corrupt an extraction.
        for mapping in &node.inputs.mappings {
            let entry = node_entry(ctx.execution, mapping.source_node);
            let extracted = lookup_path(&entry, &mapping.expression)
                .cloned()
                .unwrap_or(Value::Null);
            values.insert(mapping.target.clone(), extracted);
        }
    }

    Ok(InputBundle {
        values,
        dependency_labels,
    })
}

/// Builds the full-context entry for one node's persisted result.
///
/// A node that never executed (disabled or skipped) still gets an entry,
/// marked `skipped: true` with an empty payload; downstream programs must
/// handle that case explicitly. The scheduler reuses this shape when
/// evaluating edge conditions and transforms.
pub fn node_entry(execution: &WorkflowExecution, source: NodeId) -> Value {
    let Some(record) = execution.node(source) else {
        return json!({ "skipped": true });
    };
    match record.status {
        NodeStatus::Succeeded | NodeStatus::Failed => json!({
            "stdout": record.stdout,
            "stderr": record.stderr,
            "exit_code": record.exit_code,
            "success": record.is_success(),
            "output_files": record.output_files,
            "duration_ms": record
                .duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            "skipped": false,
        }),
        _ => json!({ "skipped": true }),
    }
}

/// Looks up a dot-path (`stdout`, `output_files.0`, `result.items.2.id`)
/// inside a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::execution::TriggerContext;
    use crate::graph::{ProgramId, UserId, Workflow, WorkflowNode};

    fn deterministic_node(n: u128) -> WorkflowNode {
        WorkflowNode::program(ProgramId::new()).with_id(NodeId::from_uuid(Uuid::from_u128(n)))
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Data Extract v2"), "Data_Extract_v2");
        assert_eq!(sanitize("---"), "");
        assert_eq!(sanitize("3scale"), "_3scale");
    }

    #[test]
    fn test_labels_disambiguate_collisions() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();

        let names: BTreeMap<NodeId, String> = [
            (a, "extract".to_string()),
            (b, "extract".to_string()),
        ]
        .into();
        let labels = resolve_labels(&graph, &names);
        assert_eq!(labels[&a], "extract");
        assert_eq!(labels[&b], "extract_2");
    }

    #[test]
    fn test_label_falls_back_to_node_id() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();

        let labels = resolve_labels(&graph, &BTreeMap::new());
        assert_eq!(labels[&a], sanitize(&a.to_string()));
    }

    fn completed_execution(workflow: &Workflow, node: NodeId, stdout: &str) -> WorkflowExecution {
        let mut execution =
            WorkflowExecution::pending(workflow, &TriggerContext::manual(UserId::new()));
        let record = execution.nodes.get_mut(&node).unwrap();
        record.status = NodeStatus::Succeeded;
        record.stdout = stdout.to_string();
        record.exit_code = Some(0);
        record.duration = Some(std::time::Duration::from_millis(10));
        execution
    }

    #[test]
    fn test_bundle_carries_full_upstream_result() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        workflow.connect(a, b);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution = completed_execution(&workflow, a, "ok");
        let names: BTreeMap<NodeId, String> = [(a, "extract".to_string())].into();
        let ctx = ResolverContext {
            graph: &graph,
            execution: &execution,
            program_names: &names,
            edge_payloads: &BTreeMap::new(),
        };

        let bundle = prepare_inputs(&ctx, b).unwrap();
        let entry = bundle.get("extract").unwrap();
        assert_eq!(entry["stdout"], "ok");
        assert_eq!(entry["exit_code"], 0);
        assert_eq!(entry["success"], true);
        assert_eq!(entry["skipped"], false);
    }

    #[test]
    fn test_skipped_upstream_present_with_marker() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        workflow.connect(a, b);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let mut execution =
            WorkflowExecution::pending(&workflow, &TriggerContext::manual(UserId::new()));
        execution.nodes.get_mut(&a).unwrap().status = NodeStatus::Skipped;

        let names: BTreeMap<NodeId, String> = [(a, "extract".to_string())].into();
        let ctx = ResolverContext {
            graph: &graph,
            execution: &execution,
            program_names: &names,
            edge_payloads: &BTreeMap::new(),
        };

        let bundle = prepare_inputs(&ctx, b).unwrap();
        assert_eq!(bundle.get("extract").unwrap()["skipped"], true);
    }

    #[test]
    fn test_precedence_mappings_over_static_over_bundle() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let mut downstream = deterministic_node(2);
        downstream
            .inputs
            .static_inputs
            .insert("extract".to_string(), json!("static-wins"));
        downstream.inputs.mappings.push(crate::graph::InputMapping {
            target: "mapped".to_string(),
            source_node: a,
            expression: "stdout".to_string(),
        });
        let b = workflow.add_node(downstream);
        workflow.connect(a, b);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution = completed_execution(&workflow, a, "ok");
        let names: BTreeMap<NodeId, String> = [(a, "extract".to_string())].into();
        let ctx = ResolverContext {
            graph: &graph,
            execution: &execution,
            program_names: &names,
            edge_payloads: &BTreeMap::new(),
        };

        let bundle = prepare_inputs(&ctx, b).unwrap();
        // Static input shadows the dependency entry under the same name.
        assert_eq!(bundle.get("extract").unwrap(), &json!("static-wins"));
        // The mapping still reads from the original upstream record.
        assert_eq!(bundle.get("mapped").unwrap(), &json!("ok"));
    }

    #[test]
    fn test_preparation_is_deterministic() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        workflow.connect(a, b);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution = completed_execution(&workflow, a, "ok");
        let names: BTreeMap<NodeId, String> = [(a, "extract".to_string())].into();
        let ctx = ResolverContext {
            graph: &graph,
            execution: &execution,
            program_names: &names,
            edge_payloads: &BTreeMap::new(),
        };

        let first = prepare_inputs(&ctx, b).unwrap().to_json_string().unwrap();
        let second = prepare_inputs(&ctx, b).unwrap().to_json_string().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({"a": {"b": [10, 20]}});
        assert_eq!(lookup_path(&value, "a.b.1"), Some(&json!(20)));
        assert_eq!(lookup_path(&value, "a.missing"), None);
        assert_eq!(lookup_path(&value, "a.b.x"), None);
    }
}
