//! The execution scheduler: drives one workflow execution from Pending
//! to a terminal status.
//!
//! One scheduler task owns one execution. It walks the validated plan
//! phase by phase, gates each node on edge conditions and its own
//! conditional-execution rule, dispatches the runnable subset bounded by
//! the workflow's concurrency limit, and derives the terminal status
//! from what the nodes did. All state transitions go through the
//! execution store; the store is the source of truth, the scheduler only
//! orchestrates.

mod condition;

pub use condition::{aggregate_context, apply_transform, edge_context, evaluate};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, FailureKind};
use crate::exec::{AttemptSummary, NodeExecutor, RetryPolicy, run_with_retry};
use crate::execution::{
    ExecutionErrorDetail, ExecutionStatus, NodeErrorDetail, NodeResult, NodeStatus,
    WorkflowExecution,
};
use crate::graph::{
    self, ConditionFailureAction, EdgeId, EdgeKind, ExecutionId, ExecutionPlan, InteractionRequest,
    NodeId, NodeKind, Workflow, WorkflowGraph, WorkflowNode, WorkflowSettings,
};
use crate::interact::{InteractionStatus, InteractionStore, UiInteraction, await_resolution};
use crate::program::ProgramLookup;
use crate::resolver::{self, InputBundle, ResolverContext};
use crate::store::{ExecutionStore, NodeUpdate};
use crate::stream::{EventStreamer, ExecutionEvent, OutputChannel};

/// Drives workflow executions against the injected collaborators.
#[derive(Clone)]
pub struct Scheduler {
    config: EngineConfig,
    executor: NodeExecutor,
    programs: Arc<dyn ProgramLookup>,
    store: Arc<dyn ExecutionStore>,
    interactions: Arc<dyn InteractionStore>,
    streamer: Arc<EventStreamer>,
}

/// Gate decision for one node at dispatch time.
#[derive(Debug)]
enum GateDecision {
    /// Dispatch the node, with per-edge payload substitutions.
    Run { overrides: BTreeMap<EdgeId, Value> },
    /// Mark the node skipped without executing it.
    Skip { reason: String },
    /// Propagate a failure to the whole execution; the node never runs.
    Fail { detail: ExecutionErrorDetail },
}

/// What `drive` concluded after walking every phase.
struct DriveOutcome {
    status: ExecutionStatus,
    error: Option<ExecutionErrorDetail>,
    results: BTreeMap<String, Value>,
}

/// What one node task reports back to the phase loop.
struct NodeTaskOutcome {
    /// Transformed payloads for the node's outbound data edges.
    transforms: Vec<(EdgeId, Value)>,
}

impl Scheduler {
    /// Creates a scheduler over the given collaborators.
    pub fn new(
        config: EngineConfig,
        executor: NodeExecutor,
        programs: Arc<dyn ProgramLookup>,
        store: Arc<dyn ExecutionStore>,
        interactions: Arc<dyn InteractionStore>,
        streamer: Arc<EventStreamer>,
    ) -> Self {
        Self {
            config,
            executor,
            programs,
            store,
            interactions,
            streamer,
        }
    }

    /// Runs one execution to a terminal status.
    ///
    /// The execution record must already exist in the store (Pending).
    /// Cancelling the token aborts in-flight sandbox runs, records the
    /// interrupted nodes, and finalizes the execution as Cancelled. The
    /// workflow's global timeout finalizes it as Failed the same way.
    pub async fn run(
        &self,
        workflow: Workflow,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> EngineResult<ExecutionStatus> {
        let settings = workflow.settings.clone();
        let graph = match WorkflowGraph::from_workflow(&workflow) {
            Ok(graph) => Arc::new(graph),
            Err(err) => return self.abort_structural(execution_id, err).await,
        };
        let plan = match graph::plan(&graph) {
            Ok(plan) => plan,
            Err(err) => return self.abort_structural(execution_id, err).await,
        };

        let names = Arc::new(self.resolve_program_names(&graph).await);

        let started = self
            .persist(|| {
                self.store.transition(
                    execution_id,
                    &[ExecutionStatus::Pending],
                    ExecutionStatus::Running,
                )
            })
            .await?;
        if !started {
            // Cancelled or already picked up; nothing to drive.
            let current = self.store.get(execution_id).await?;
            return Ok(current.status);
        }
        self.streamer.publish(ExecutionEvent::Started {
            execution_id,
            timestamp: Timestamp::now(),
        });
        tracing::info!(
            target: TRACING_TARGET,
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            phases = plan.phase_count(),
            nodes = plan.node_count(),
            "Execution started"
        );

        // A zero workflow timeout defers to the engine-wide default.
        let global_timeout = if settings.global_timeout.is_zero() {
            self.config.global_timeout
        } else {
            settings.global_timeout
        };

        let drive = self.drive(
            Arc::clone(&graph),
            &plan,
            &settings,
            execution_id,
            Arc::clone(&names),
            cancel.clone(),
        );
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            driven = tokio::time::timeout(global_timeout, drive) => match driven {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(EngineError::Cancelled)) => None,
                // A store failure that survived its retries still
                // finalizes the record rather than leaving it Running.
                Ok(Err(err)) => Some(DriveOutcome {
                    status: ExecutionStatus::Failed,
                    error: Some(ExecutionErrorDetail {
                        node_id: None,
                        kind: None,
                        message: err.to_string(),
                    }),
                    results: BTreeMap::new(),
                }),
                Err(_) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        execution_id = %execution_id,
                        timeout = ?global_timeout,
                        "Execution exceeded its global timeout"
                    );
                    Some(DriveOutcome {
                        status: ExecutionStatus::Failed,
                        error: Some(ExecutionErrorDetail {
                            node_id: None,
                            kind: Some(FailureKind::Timeout),
                            message: format!(
                                "execution exceeded the global timeout of {global_timeout:?}"
                            ),
                        }),
                        results: BTreeMap::new(),
                    })
                }
            },
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => DriveOutcome {
                status: ExecutionStatus::Cancelled,
                error: None,
                results: BTreeMap::new(),
            },
        };

        if outcome.status != ExecutionStatus::Completed {
            self.settle_interrupted_nodes(execution_id, outcome.status)
                .await?;
        }
        self.persist(|| {
            self.store.finish(
                execution_id,
                outcome.status,
                outcome.error.clone(),
                outcome.results.clone(),
            )
        })
        .await?;

        let final_state = self.store.get(execution_id).await?;
        self.streamer.publish(ExecutionEvent::ProgressUpdate {
            execution_id,
            percent: final_state.progress.percent,
            phase: final_state.progress.current_phase,
        });
        self.streamer.publish(ExecutionEvent::Completed {
            execution_id,
            status: outcome.status,
            timestamp: Timestamp::now(),
        });
        tracing::info!(
            target: TRACING_TARGET,
            execution_id = %execution_id,
            status = %outcome.status,
            "Execution finished"
        );
        Ok(outcome.status)
    }

    /// Walks the plan phase by phase, returning the derived terminal
    /// status and aggregated results.
    async fn drive(
        &self,
        graph: Arc<WorkflowGraph>,
        plan: &ExecutionPlan,
        settings: &WorkflowSettings,
        execution_id: ExecutionId,
        names: Arc<BTreeMap<NodeId, String>>,
        cancel: CancellationToken,
    ) -> EngineResult<DriveOutcome> {
        let max_concurrent = if settings.max_concurrent_nodes == 0 {
            self.config.max_concurrent_nodes.max(1)
        } else {
            settings.max_concurrent_nodes
        };
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut edge_payloads: BTreeMap<EdgeId, Value> = BTreeMap::new();
        let mut first_failure: Option<ExecutionErrorDetail> = None;

        'phases: for (phase_index, phase) in plan.phases().iter().enumerate() {
            self.persist(|| self.store.advance_phase(execution_id, phase_index))
                .await?;
            let snapshot = self.store.get(execution_id).await?;
            self.streamer.publish(ExecutionEvent::ProgressUpdate {
                execution_id,
                percent: snapshot.progress.percent,
                phase: phase_index,
            });
            let aggregate = condition::aggregate_context(&graph, &snapshot, &names);

            let mut runnable: Vec<NodeTask> = Vec::new();
            for node_id in phase {
                let Some(node) = graph.node(*node_id) else {
                    continue;
                };
                match decide_gate(&graph, &snapshot, &aggregate, &edge_payloads, node) {
                    GateDecision::Run { overrides } => {
                        runnable.push(NodeTask {
                            execution_id,
                            phase_index,
                            node: node.clone(),
                            overrides,
                            graph: Arc::clone(&graph),
                            names: Arc::clone(&names),
                            executor: self.executor.clone(),
                            programs: Arc::clone(&self.programs),
                            store: Arc::clone(&self.store),
                            interactions: Arc::clone(&self.interactions),
                            streamer: Arc::clone(&self.streamer),
                            semaphore: Arc::clone(&semaphore),
                            config: self.config.clone(),
                            cancel: cancel.clone(),
                        });
                    }
                    GateDecision::Skip { reason } => {
                        tracing::debug!(
                            target: TRACING_TARGET,
                            execution_id = %execution_id,
                            node_id = %node_id,
                            reason,
                            "Node skipped"
                        );
                        self.persist(|| {
                            self.store.update_node(
                                execution_id,
                                *node_id,
                                NodeUpdate::status(NodeStatus::Skipped),
                            )
                        })
                        .await?;
                        self.streamer.publish(ExecutionEvent::NodeStatusChanged {
                            execution_id,
                            node_id: *node_id,
                            status: NodeStatus::Skipped,
                            timestamp: Timestamp::now(),
                        });
                    }
                    GateDecision::Fail { detail } => {
                        tracing::warn!(
                            target: TRACING_TARGET,
                            execution_id = %execution_id,
                            node_id = %node_id,
                            message = %detail.message,
                            "Failure propagated through an edge failure action"
                        );
                        self.persist(|| {
                            self.store.update_node(
                                execution_id,
                                *node_id,
                                NodeUpdate::status(NodeStatus::Skipped),
                            )
                        })
                        .await?;
                        first_failure.get_or_insert(detail);
                        // The execution is doomed; nothing else in this
                        // phase dispatches.
                        break;
                    }
                }
            }

            if first_failure.is_some() {
                break 'phases;
            }

            // Serial nodes run one at a time before the parallel batch
            // starts, so a node that opted out of concurrency never
            // overlaps a phase sibling.
            let (parallel, serial): (Vec<_>, Vec<_>) = runnable
                .into_iter()
                .partition(|task| task.node.execution.parallel_eligible);
            for task in serial {
                let outcome = task.run().await?;
                for (edge_id, payload) in outcome.transforms {
                    edge_payloads.insert(edge_id, payload);
                }
            }

            let mut join_set: JoinSet<EngineResult<NodeTaskOutcome>> = JoinSet::new();
            for task in parallel {
                join_set.spawn(task.run());
            }
            while let Some(joined) = join_set.join_next().await {
                let outcome = joined
                    .map_err(|err| EngineError::Internal(format!("node task failed: {err}")))??;
                for (edge_id, payload) in outcome.transforms {
                    edge_payloads.insert(edge_id, payload);
                }
            }
        }

        let final_state = self.store.get(execution_id).await?;
        if first_failure.is_none() {
            first_failure = unabsorbed_failure(&graph, plan, &final_state);
        }
        let status = if first_failure.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        let results = aggregate_results(&graph, &final_state, &names, &edge_payloads);
        Ok(DriveOutcome {
            status,
            error: first_failure,
            results,
        })
    }

    /// Structural validation failed after the record was created; the
    /// execution goes straight to Failed without ever entering Running.
    async fn abort_structural(
        &self,
        execution_id: ExecutionId,
        err: EngineError,
    ) -> EngineResult<ExecutionStatus> {
        tracing::error!(
            target: TRACING_TARGET,
            execution_id = %execution_id,
            error = %err,
            "Workflow failed structural validation"
        );
        self.persist(|| {
            self.store.finish(
                execution_id,
                ExecutionStatus::Failed,
                Some(ExecutionErrorDetail {
                    node_id: None,
                    kind: None,
                    message: err.to_string(),
                }),
                BTreeMap::new(),
            )
        })
        .await?;
        Err(err)
    }

    /// Resolves program display names once per execution; a failed or
    /// empty lookup falls back to the node id inside the resolver.
    async fn resolve_program_names(&self, graph: &WorkflowGraph) -> BTreeMap<NodeId, String> {
        let mut names = BTreeMap::new();
        for node in graph.nodes() {
            match self.programs.program_name(node.program_id).await {
                Ok(Some(name)) => {
                    names.insert(node.id, name);
                }
                Ok(None) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        node_id = %node.id,
                        program_id = %node.program_id,
                        "Program name unresolved, falling back to node id"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        node_id = %node.id,
                        error = %err,
                        "Program name lookup failed, falling back to node id"
                    );
                }
            }
        }
        names
    }

    /// Records terminal markers on nodes interrupted by cancellation or
    /// a global timeout: Running / WaitingForInput become Failed with a
    /// Cancelled detail, untouched Pending nodes become Skipped.
    async fn settle_interrupted_nodes(
        &self,
        execution_id: ExecutionId,
        terminal: ExecutionStatus,
    ) -> EngineResult<()> {
        let snapshot = self.store.get(execution_id).await?;
        for (node_id, record) in &snapshot.nodes {
            let update = match record.status {
                NodeStatus::Running | NodeStatus::WaitingForInput => {
                    NodeUpdate::status(NodeStatus::Failed).with_error(NodeErrorDetail {
                        kind: FailureKind::Cancelled,
                        message: format!("interrupted: execution {terminal}"),
                    })
                }
                NodeStatus::Pending => NodeUpdate::status(NodeStatus::Skipped),
                _ => continue,
            };
            self.persist(|| self.store.update_node(execution_id, *node_id, update.clone()))
                .await?;
        }
        // Gates parked in await_resolution never observe the interruption
        // (their tasks are dropped with the drive future), so their
        // interaction records are closed out here.
        let cancelled = self.interactions.cancel_pending(execution_id).await?;
        if cancelled > 0 {
            tracing::debug!(
                target: TRACING_TARGET,
                execution_id = %execution_id,
                cancelled,
                "Cancelled pending interactions of interrupted execution"
            );
        }
        Ok(())
    }

    /// Store writes the execution cannot proceed without are retried a
    /// bounded number of times; in-flight results are held across the
    /// attempts rather than discarded.
    async fn persist<T, F, Fut>(&self, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.config.persistence_attempts {
                        return Err(EngineError::Persistence(err.to_string()));
                    }
                    tracing::warn!(
                        target: TRACING_TARGET,
                        attempt,
                        error = %err,
                        "Store write failed, retrying"
                    );
                    tokio::time::sleep(self.config.persistence_retry_delay).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Decides whether a node runs, is skipped, or propagates a failure,
/// from the persisted state of its (already terminal) dependencies.
fn decide_gate(
    graph: &WorkflowGraph,
    execution: &WorkflowExecution,
    aggregate: &Value,
    edge_payloads: &BTreeMap<EdgeId, Value>,
    node: &WorkflowNode,
) -> GateDecision {
    if node.disabled {
        return GateDecision::Skip {
            reason: "node disabled".to_string(),
        };
    }

    let mut overrides: BTreeMap<EdgeId, Value> = BTreeMap::new();
    for edge in graph.incoming_edges(node.id) {
        if edge.disabled {
            continue;
        }
        if let Some(payload) = edge_payloads.get(&edge.id) {
            overrides.insert(edge.id, payload.clone());
        }
        let upstream_failed = execution
            .node(edge.source)
            .is_some_and(|record| record.status == NodeStatus::Failed);

        match &edge.condition {
            Some(cond) => {
                let source_entry = resolver::node_entry(execution, edge.source);
                let ctx = condition::edge_context(aggregate, source_entry);
                let satisfied = !upstream_failed && condition::evaluate(&cond.expression, &ctx);
                if satisfied {
                    continue;
                }
                match &cond.on_failure {
                    ConditionFailureAction::Skip => {
                        return GateDecision::Skip {
                            reason: format!("edge condition '{}' not satisfied", cond.expression),
                        };
                    }
                    ConditionFailureAction::Fail => {
                        let upstream = execution.node(edge.source);
                        return GateDecision::Fail {
                            detail: ExecutionErrorDetail {
                                node_id: Some(edge.source),
                                kind: upstream.and_then(|r| r.error.as_ref()).map(|e| e.kind),
                                message: upstream
                                    .and_then(|r| r.error.as_ref())
                                    .map(|e| e.message.clone())
                                    .unwrap_or_else(|| {
                                        format!(
                                            "edge condition '{}' not satisfied",
                                            cond.expression
                                        )
                                    }),
                            },
                        };
                    }
                    ConditionFailureAction::UseDefault { default } => {
                        overrides.insert(edge.id, default.clone());
                    }
                }
            }
            // An unconditioned edge never blocks the node: a failed or
            // skipped upstream flows through as a bundle entry with
            // success: false or skipped: true, and the downstream
            // program decides what that means.
            None => {}
        }
    }

    if let Some(cond) = &node.condition {
        if !condition::evaluate(&cond.expression, aggregate) {
            if cond.skip_if_false {
                return GateDecision::Skip {
                    reason: format!("node condition '{}' not satisfied", cond.expression),
                };
            }
            return GateDecision::Fail {
                detail: ExecutionErrorDetail {
                    node_id: Some(node.id),
                    kind: Some(FailureKind::ApplicationExit),
                    message: format!("node condition '{}' not satisfied", cond.expression),
                },
            };
        }
    }

    GateDecision::Run { overrides }
}

/// Finds the first failed node, in plan order, whose failure was not
/// absorbed by its outbound edges.
///
/// A failure is absorbed when the node has outbound edges and every
/// non-disabled one carries a condition whose failure action is Skip or
/// UseDefault; such a workflow models the failure as a legitimate branch
/// and the execution can still complete.
fn unabsorbed_failure(
    graph: &WorkflowGraph,
    plan: &ExecutionPlan,
    execution: &WorkflowExecution,
) -> Option<ExecutionErrorDetail> {
    for node_id in plan.node_ids() {
        let Some(record) = execution.node(node_id) else {
            continue;
        };
        if record.status != NodeStatus::Failed {
            continue;
        }
        let mut outbound = graph
            .outgoing_edges(node_id)
            .filter(|edge| !edge.disabled)
            .peekable();
        let absorbed = outbound.peek().is_some()
            && outbound.all(|edge| {
                edge.condition.as_ref().is_some_and(|cond| {
                    !matches!(cond.on_failure, ConditionFailureAction::Fail)
                })
            });
        if !absorbed {
            return Some(ExecutionErrorDetail {
                node_id: Some(node_id),
                kind: record.error.as_ref().map(|e| e.kind),
                message: record
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "node failed".to_string()),
            });
        }
    }
    None
}

/// Aggregates execution results: one entry per succeeded Output node
/// keyed by its resolved label, with the node's output mappings applied
/// when configured. Workflows without Output nodes fall back to their
/// sink nodes so an execution always surfaces something.
fn aggregate_results(
    graph: &WorkflowGraph,
    execution: &WorkflowExecution,
    names: &BTreeMap<NodeId, String>,
    edge_payloads: &BTreeMap<EdgeId, Value>,
) -> BTreeMap<String, Value> {
    let labels = resolver::resolve_labels(graph, names);
    let outputs: Vec<&WorkflowNode> = {
        let declared: Vec<&WorkflowNode> = graph
            .nodes()
            .filter(|node| node.kind == NodeKind::Output)
            .collect();
        if declared.is_empty() {
            graph
                .nodes()
                .filter(|node| {
                    graph
                        .outgoing_edges(node.id)
                        .all(|edge| edge.disabled || edge.kind != EdgeKind::Data)
                })
                .collect()
        } else {
            declared
        }
    };

    let mut results = BTreeMap::new();
    for node in outputs {
        let succeeded = execution
            .node(node.id)
            .is_some_and(|record| record.status == NodeStatus::Succeeded);
        if !succeeded {
            continue;
        }
        let label = labels
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| node.id.to_string());
        let value = if node.kind == NodeKind::Output {
            let ctx = ResolverContext {
                graph,
                execution,
                program_names: names,
                edge_payloads,
            };
            match resolver::prepare_inputs(&ctx, node.id) {
                Ok(bundle) => {
                    let json = bundle.to_json();
                    if node.outputs.mappings.is_empty() {
                        json
                    } else {
                        Value::Object(
                            node.outputs
                                .mappings
                                .iter()
                                .map(|(name, path)| {
                                    (
                                        name.clone(),
                                        resolver::lookup_path(&json, path)
                                            .cloned()
                                            .unwrap_or(Value::Null),
                                    )
                                })
                                .collect(),
                        )
                    }
                }
                Err(_) => Value::Null,
            }
        } else {
            resolver::node_entry(execution, node.id)
        };
        results.insert(label, value);
    }
    results
}

/// One dispatched node: interaction gate, concurrency permit, input
/// preparation, execution under retry, terminal persistence, events,
/// outbound transforms.
struct NodeTask {
    execution_id: ExecutionId,
    phase_index: usize,
    node: WorkflowNode,
    overrides: BTreeMap<EdgeId, Value>,
    graph: Arc<WorkflowGraph>,
    names: Arc<BTreeMap<NodeId, String>>,
    executor: NodeExecutor,
    programs: Arc<dyn ProgramLookup>,
    store: Arc<dyn ExecutionStore>,
    interactions: Arc<dyn InteractionStore>,
    streamer: Arc<EventStreamer>,
    semaphore: Arc<Semaphore>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl NodeTask {
    async fn run(self) -> EngineResult<NodeTaskOutcome> {
        let node_id = self.node.id;

        // The human gate sits before the concurrency permit: a paused
        // branch must not hold a dispatch slot for hours.
        let mut interaction_payload = None;
        if let Some(request) = self.node.execution.interaction.clone() {
            match self.gate_interaction(&request).await? {
                Ok(payload) => interaction_payload = payload,
                Err(detail) => {
                    self.record_terminal(
                        AttemptSummary {
                            attempts: 0,
                            result: None,
                            error: Some(detail),
                        },
                    )
                    .await?;
                    return Ok(NodeTaskOutcome {
                        transforms: Vec::new(),
                    });
                }
            }
        }

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Internal("dispatch semaphore closed".to_string()))?;
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let snapshot = self.store.get(self.execution_id).await?;
        let ctx = ResolverContext {
            graph: &self.graph,
            execution: &snapshot,
            program_names: &self.names,
            edge_payloads: &self.overrides,
        };
        let mut bundle = resolver::prepare_inputs(&ctx, node_id)?;
        if let Some(payload) = interaction_payload {
            bundle = bundle.with_interaction_payload(payload);
        }

        self.update_node(NodeUpdate::status(NodeStatus::Running))
            .await?;
        self.publish_status(NodeStatus::Running);

        let summary = match self.node.kind {
            NodeKind::Program => self.run_program(&bundle).await,
            NodeKind::Input | NodeKind::Output => self.run_passthrough(&bundle),
            NodeKind::Condition => self.run_condition(&snapshot),
        };
        self.record_terminal(summary).await?;

        // Outbound transforms read the just-persisted result entry.
        let snapshot = self.store.get(self.execution_id).await?;
        let entry = resolver::node_entry(&snapshot, node_id);
        let mut transforms = Vec::new();
        for edge in self.graph.outgoing_edges(node_id) {
            if edge.disabled || edge.kind != EdgeKind::Data {
                continue;
            }
            if let Some(transform) = &edge.transform {
                if let Some(payload) = condition::apply_transform(transform, &entry) {
                    transforms.push((edge.id, payload));
                }
            }
        }
        Ok(NodeTaskOutcome { transforms })
    }

    /// Runs the node's program in the sandbox under its retry policy.
    async fn run_program(&self, bundle: &InputBundle) -> AttemptSummary {
        let spec = match self
            .programs
            .executable_spec(self.node.program_id, self.node.version_id)
            .await
        {
            Ok(spec) => spec,
            Err(err) => {
                return AttemptSummary {
                    attempts: 0,
                    result: None,
                    error: Some(NodeErrorDetail {
                        kind: FailureKind::LaunchFailure,
                        message: format!("program lookup failed: {err}"),
                    }),
                };
            }
        };

        // Nodes that configure no retries of their own inherit the
        // engine-wide default policy.
        let policy = if self.node.execution.max_retries == 0 {
            self.config.default_retry.clone()
        } else {
            RetryPolicy::from_settings(&self.node.execution)
        };
        run_with_retry(&policy, &self.cancel, |attempt| {
            let request =
                self.executor
                    .build_request(self.execution_id, &self.node, spec.clone(), bundle);
            async move {
                if attempt > 1 {
                    if let Err(err) = self
                        .store
                        .update_node(
                            self.execution_id,
                            self.node.id,
                            NodeUpdate::default().with_attempts(attempt),
                        )
                        .await
                    {
                        tracing::warn!(
                            target: TRACING_TARGET,
                            node_id = %self.node.id,
                            error = %err,
                            "Failed to persist attempt count"
                        );
                    }
                }
                let request = request?;
                self.executor.execute(request, &self.cancel).await
            }
        })
        .await
    }

    /// Input and Output nodes run no program; they succeed immediately
    /// with their prepared bundle as stdout, so downstream consumers and
    /// the results aggregation see a uniform entry shape.
    fn run_passthrough(&self, bundle: &InputBundle) -> AttemptSummary {
        let stdout = bundle.to_json().to_string();
        AttemptSummary {
            attempts: 1,
            result: Some(synthesized_result(Some(0), stdout)),
            error: None,
        }
    }

    /// Condition nodes evaluate their expression against the aggregate
    /// state instead of running a program. An unsatisfied condition is an
    /// ordinary node failure, so edge failure actions can branch on it.
    fn run_condition(&self, execution: &WorkflowExecution) -> AttemptSummary {
        let aggregate = condition::aggregate_context(&self.graph, execution, &self.names);
        let (expression, satisfied) = match &self.node.condition {
            Some(cond) => (
                cond.expression.as_str(),
                condition::evaluate(&cond.expression, &aggregate),
            ),
            None => ("", true),
        };
        let (exit_code, stdout) = if satisfied {
            (Some(0), "true".to_string())
        } else {
            (Some(1), "false".to_string())
        };
        AttemptSummary {
            attempts: 1,
            result: Some(synthesized_result(exit_code, stdout)),
            error: (!satisfied).then(|| NodeErrorDetail {
                kind: FailureKind::ApplicationExit,
                message: format!("condition '{expression}' evaluated false"),
            }),
        }
    }

    /// Creates the interaction, parks the node and execution, and waits
    /// for resolution.
    async fn gate_interaction(
        &self,
        request: &InteractionRequest,
    ) -> EngineResult<Result<Option<Value>, NodeErrorDetail>> {
        let interaction = UiInteraction::pending(self.execution_id, self.node.id, request);
        let interaction_id = interaction.id;
        self.interactions.create(interaction).await?;
        self.update_node(NodeUpdate::status(NodeStatus::WaitingForInput))
            .await?;
        self.publish_status(NodeStatus::WaitingForInput);
        self.store
            .transition(
                self.execution_id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Paused,
            )
            .await?;
        tracing::info!(
            target: TRACING_TARGET,
            execution_id = %self.execution_id,
            node_id = %self.node.id,
            interaction_id = %interaction_id,
            kind = %request.kind,
            "Execution paused awaiting human input"
        );

        let resolved = await_resolution(
            self.interactions.as_ref(),
            interaction_id,
            self.config.interaction_poll_interval,
            &self.cancel,
        )
        .await?;

        self.store
            .transition(
                self.execution_id,
                &[ExecutionStatus::Paused],
                ExecutionStatus::Running,
            )
            .await?;

        match resolved.status {
            InteractionStatus::Completed => Ok(Ok(resolved.payload)),
            InteractionStatus::TimedOut => Ok(Err(NodeErrorDetail {
                kind: FailureKind::Interaction,
                message: format!("interaction {interaction_id} timed out"),
            })),
            InteractionStatus::Cancelled => Ok(Err(NodeErrorDetail {
                kind: FailureKind::Interaction,
                message: format!("interaction {interaction_id} was cancelled"),
            })),
            InteractionStatus::Pending => Err(EngineError::Internal(format!(
                "interaction {interaction_id} resolved while still pending"
            ))),
        }
    }

    /// Persists the terminal node state and emits the trailing events.
    async fn record_terminal(&self, summary: AttemptSummary) -> EngineResult<()> {
        let status = if summary.is_success() {
            NodeStatus::Succeeded
        } else {
            NodeStatus::Failed
        };
        let mut update = NodeUpdate::status(status);
        if summary.attempts > 0 {
            update = update.with_attempts(summary.attempts);
        }
        if let Some(result) = summary.result.clone() {
            update = update.with_result(result);
        }
        if let Some(error) = summary.error.clone() {
            tracing::warn!(
                target: TRACING_TARGET,
                execution_id = %self.execution_id,
                node_id = %self.node.id,
                kind = %error.kind,
                message = %error.message,
                attempts = summary.attempts,
                "Node failed"
            );
            update = update.with_error(error);
        }
        self.update_node(update).await?;

        if let Some(result) = &summary.result {
            if !result.stdout.is_empty() {
                self.streamer.publish(ExecutionEvent::OutputChunk {
                    execution_id: self.execution_id,
                    node_id: self.node.id,
                    channel: OutputChannel::Stdout,
                    chunk: result.stdout.clone(),
                });
            }
            if !result.stderr.is_empty() {
                self.streamer.publish(ExecutionEvent::OutputChunk {
                    execution_id: self.execution_id,
                    node_id: self.node.id,
                    channel: OutputChannel::Stderr,
                    chunk: result.stderr.clone(),
                });
            }
            self.streamer.publish(ExecutionEvent::ResourceUsageSample {
                execution_id: self.execution_id,
                node_id: self.node.id,
                usage: result.resource_usage,
            });
        }
        self.publish_status(status);

        let snapshot = self.store.get(self.execution_id).await?;
        self.streamer.publish(ExecutionEvent::ProgressUpdate {
            execution_id: self.execution_id,
            percent: snapshot.progress.percent,
            phase: self.phase_index,
        });
        Ok(())
    }

    /// Node-level store write with the same bounded retry the scheduler
    /// applies.
    async fn update_node(&self, update: NodeUpdate) -> EngineResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .store
                .update_node(self.execution_id, self.node.id, update.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt >= self.config.persistence_attempts {
                        return Err(EngineError::Persistence(err.to_string()));
                    }
                    tracing::warn!(
                        target: TRACING_TARGET,
                        node_id = %self.node.id,
                        attempt,
                        error = %err,
                        "Node store write failed, retrying"
                    );
                    tokio::time::sleep(self.config.persistence_retry_delay).await;
                }
            }
        }
    }

    fn publish_status(&self, status: NodeStatus) {
        self.streamer.publish(ExecutionEvent::NodeStatusChanged {
            execution_id: self.execution_id,
            node_id: self.node.id,
            status,
            timestamp: Timestamp::now(),
        });
    }
}

fn synthesized_result(exit_code: Option<i32>, stdout: String) -> NodeResult {
    NodeResult {
        exit_code,
        stdout,
        stderr: String::new(),
        output_files: Vec::new(),
        duration: Duration::ZERO,
        resource_usage: Default::default(),
        timed_out: false,
        resource_exceeded: false,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tessera_sandbox::SandboxRunner;
    use uuid::Uuid;

    use super::*;
    use crate::execution::TriggerContext;
    use crate::graph::{
        EdgeCondition, ProgramId, UserId, WorkflowEdge,
    };

    fn deterministic_node(n: u128) -> WorkflowNode {
        WorkflowNode::program(ProgramId::new()).with_id(NodeId::from_uuid(Uuid::from_u128(n)))
    }

    fn failed_execution(workflow: &Workflow, failed: NodeId) -> WorkflowExecution {
        let mut execution =
            WorkflowExecution::pending(workflow, &TriggerContext::manual(UserId::new()));
        let record = execution.nodes.get_mut(&failed).unwrap();
        record.status = NodeStatus::Failed;
        record.exit_code = Some(1);
        record.error = Some(NodeErrorDetail {
            kind: FailureKind::ApplicationExit,
            message: "program exited with code 1".to_string(),
        });
        execution
    }

    fn conditioned(workflow: &mut Workflow, a: NodeId, b: NodeId, action: ConditionFailureAction) {
        workflow.add_edge(WorkflowEdge::data(a, b).with_condition(EdgeCondition {
            expression: "source.success".to_string(),
            on_failure: action,
        }));
    }

    #[test]
    fn test_gate_skip_on_failed_upstream() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        conditioned(&mut workflow, a, b, ConditionFailureAction::Skip);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution = failed_execution(&workflow, a);
        let aggregate = condition::aggregate_context(&graph, &execution, &BTreeMap::new());

        let decision = decide_gate(
            &graph,
            &execution,
            &aggregate,
            &BTreeMap::new(),
            graph.node(b).unwrap(),
        );
        assert!(matches!(decision, GateDecision::Skip { .. }));
    }

    #[test]
    fn test_gate_fail_references_upstream() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        conditioned(&mut workflow, a, b, ConditionFailureAction::Fail);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution = failed_execution(&workflow, a);
        let aggregate = condition::aggregate_context(&graph, &execution, &BTreeMap::new());

        let decision = decide_gate(
            &graph,
            &execution,
            &aggregate,
            &BTreeMap::new(),
            graph.node(b).unwrap(),
        );
        match decision {
            GateDecision::Fail { detail } => {
                assert_eq!(detail.node_id, Some(a));
                assert_eq!(detail.kind, Some(FailureKind::ApplicationExit));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_gate_use_default_substitutes_payload() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        conditioned(
            &mut workflow,
            a,
            b,
            ConditionFailureAction::UseDefault {
                default: json!({"fallback": true}),
            },
        );
        let edge_id = workflow.edges[0].id;

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution = failed_execution(&workflow, a);
        let aggregate = condition::aggregate_context(&graph, &execution, &BTreeMap::new());

        let decision = decide_gate(
            &graph,
            &execution,
            &aggregate,
            &BTreeMap::new(),
            graph.node(b).unwrap(),
        );
        match decision {
            GateDecision::Run { overrides } => {
                assert_eq!(overrides.get(&edge_id), Some(&json!({"fallback": true})));
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn test_gate_unconditioned_edge_flows_failure_through() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        workflow.connect(a, b);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution = failed_execution(&workflow, a);
        let aggregate = condition::aggregate_context(&graph, &execution, &BTreeMap::new());

        let decision = decide_gate(
            &graph,
            &execution,
            &aggregate,
            &BTreeMap::new(),
            graph.node(b).unwrap(),
        );
        assert!(matches!(decision, GateDecision::Run { .. }));
    }

    #[test]
    fn test_disabled_node_is_skipped() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1).disabled());

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let execution =
            WorkflowExecution::pending(&workflow, &TriggerContext::manual(UserId::new()));
        let aggregate = condition::aggregate_context(&graph, &execution, &BTreeMap::new());

        let decision = decide_gate(
            &graph,
            &execution,
            &aggregate,
            &BTreeMap::new(),
            graph.node(a).unwrap(),
        );
        assert!(matches!(decision, GateDecision::Skip { .. }));
    }

    #[test]
    fn test_absorbed_failure_is_not_fatal() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));
        let b = workflow.add_node(deterministic_node(2));
        conditioned(&mut workflow, a, b, ConditionFailureAction::Skip);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let plan = graph::plan(&graph).unwrap();
        let mut execution = failed_execution(&workflow, a);
        execution.nodes.get_mut(&b).unwrap().status = NodeStatus::Skipped;

        assert!(unabsorbed_failure(&graph, &plan, &execution).is_none());
    }

    #[test]
    fn test_leaf_failure_is_fatal() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(deterministic_node(1));

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        let plan = graph::plan(&graph).unwrap();
        let execution = failed_execution(&workflow, a);

        let detail = unabsorbed_failure(&graph, &plan, &execution).unwrap();
        assert_eq!(detail.node_id, Some(a));
    }

    #[tokio::test]
    async fn test_persist_surfaces_persistence_after_bounded_attempts() {
        struct NoSandbox;

        #[async_trait]
        impl SandboxRunner for NoSandbox {
            async fn run(
                &self,
                _request: tessera_sandbox::RunRequest,
                _cancel: CancellationToken,
            ) -> tessera_sandbox::SandboxResult<tessera_sandbox::RunOutcome> {
                Err(tessera_sandbox::SandboxError::Launch("unused".to_string()))
            }
        }

        let config = EngineConfig {
            persistence_attempts: 3,
            persistence_retry_delay: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let scheduler = Scheduler::new(
            config,
            NodeExecutor::new(Arc::new(NoSandbox)),
            Arc::new(crate::program::MemoryProgramCatalog::new()),
            Arc::new(crate::store::MemoryExecutionStore::new()),
            Arc::new(crate::interact::MemoryInteractionStore::new()),
            Arc::new(EventStreamer::default()),
        );

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let err = scheduler
            .persist(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err::<(), _>(EngineError::Internal("store offline".to_string())) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(matches!(err, EngineError::Persistence(_)));
    }
}
