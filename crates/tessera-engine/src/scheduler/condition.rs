//! Condition and transform evaluation over aggregate execution state.
//!
//! The expression language is intentionally small: a dot-path, optionally
//! negated or compared against a JSON literal. `source.success`,
//! `!source.success`, `source.exit_code == 0`, `nodes.extract.stdout !=
//! "skip"` all work. Anything the grammar cannot resolve evaluates
//! false, never panics.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::TRACING_TARGET;
use crate::execution::WorkflowExecution;
use crate::graph::{EdgeTransform, NodeId, TransformLanguage, WorkflowGraph};
use crate::resolver::{self, lookup_path};

/// Builds the aggregate evaluation context: every node's result entry
/// under its resolved label, beneath a `nodes` root.
pub fn aggregate_context(
    graph: &WorkflowGraph,
    execution: &WorkflowExecution,
    program_names: &BTreeMap<NodeId, String>,
) -> Value {
    let labels = resolver::resolve_labels(graph, program_names);
    let entries: serde_json::Map<String, Value> = labels
        .iter()
        .map(|(id, label)| (label.clone(), resolver::node_entry(execution, *id)))
        .collect();
    json!({ "nodes": entries })
}

/// Extends an aggregate context with the upstream entry of one edge under
/// `source`, the name edge conditions address it by.
pub fn edge_context(aggregate: &Value, source_entry: Value) -> Value {
    let mut ctx = aggregate.clone();
    if let Value::Object(map) = &mut ctx {
        map.insert("source".to_string(), source_entry);
    }
    ctx
}

/// Evaluates an expression against a context, returning its truth value.
pub fn evaluate(expression: &str, ctx: &Value) -> bool {
    let expression = expression.trim();
    if expression.is_empty() {
        return true;
    }
    if let Some(rest) = expression.strip_prefix('!') {
        return !evaluate(rest, ctx);
    }
    if let Some((lhs, rhs)) = expression.split_once("==") {
        return resolve_operand(lhs, ctx) == Some(parse_literal(rhs));
    }
    if let Some((lhs, rhs)) = expression.split_once("!=") {
        return resolve_operand(lhs, ctx) != Some(parse_literal(rhs));
    }
    match lookup_path(ctx, expression) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

fn resolve_operand(raw: &str, ctx: &Value) -> Option<Value> {
    lookup_path(ctx, raw.trim()).cloned()
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.trim_matches('"').to_string()))
}

/// Applies an edge transform to an upstream result entry.
///
/// Returns `None` when a validating transform produced null or nothing;
/// the caller keeps the untransformed entry in that case.
pub fn apply_transform(transform: &EdgeTransform, entry: &Value) -> Option<Value> {
    let transformed = match transform.language {
        TransformLanguage::Path => lookup_path(entry, &transform.expression)
            .cloned()
            .unwrap_or(Value::Null),
        TransformLanguage::Template => {
            let mut map = serde_json::Map::new();
            map.insert(transform.expression.clone(), entry.clone());
            Value::Object(map)
        }
    };
    if transform.validate && transformed.is_null() {
        tracing::warn!(
            target: TRACING_TARGET,
            expression = %transform.expression,
            "Edge transform produced null under validation, keeping original entry"
        );
        return None;
    }
    Some(transformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Value {
        json!({
            "source": { "success": true, "exit_code": 0, "stdout": "ok" },
            "nodes": { "extract": { "success": false } },
        })
    }

    #[test]
    fn test_truthy_path() {
        assert!(evaluate("source.success", &ctx()));
        assert!(!evaluate("nodes.extract.success", &ctx()));
        assert!(!evaluate("nodes.missing.success", &ctx()));
    }

    #[test]
    fn test_negation() {
        assert!(evaluate("!nodes.extract.success", &ctx()));
        assert!(!evaluate("!source.success", &ctx()));
    }

    #[test]
    fn test_comparison() {
        assert!(evaluate("source.exit_code == 0", &ctx()));
        assert!(evaluate("source.stdout == \"ok\"", &ctx()));
        assert!(evaluate("source.exit_code != 1", &ctx()));
        assert!(!evaluate("source.exit_code == 1", &ctx()));
    }

    #[test]
    fn test_empty_expression_holds() {
        assert!(evaluate("  ", &ctx()));
    }

    #[test]
    fn test_path_transform() {
        let transform = EdgeTransform {
            language: TransformLanguage::Path,
            expression: "stdout".to_string(),
            validate: false,
        };
        let entry = json!({ "stdout": "ok" });
        assert_eq!(apply_transform(&transform, &entry), Some(json!("ok")));
    }

    #[test]
    fn test_validating_transform_rejects_null() {
        let transform = EdgeTransform {
            language: TransformLanguage::Path,
            expression: "missing".to_string(),
            validate: true,
        };
        assert_eq!(apply_transform(&transform, &json!({})), None);
    }

    #[test]
    fn test_template_transform_wraps() {
        let transform = EdgeTransform {
            language: TransformLanguage::Template,
            expression: "upstream".to_string(),
            validate: false,
        };
        let entry = json!({ "stdout": "ok" });
        assert_eq!(
            apply_transform(&transform, &entry),
            Some(json!({ "upstream": { "stdout": "ok" } }))
        );
    }
}
