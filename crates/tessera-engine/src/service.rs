//! The workflow service: the engine's produced interface.
//!
//! Owns the collaborators, validates and launches executions on
//! background tasks, and exposes cancellation, status queries, event
//! subscription, interaction resolution, and age-based cleanup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jiff::Timestamp;
use serde_json::Value;
use tessera_sandbox::{ProcessSandbox, SandboxRunner};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::exec::NodeExecutor;
use crate::execution::{ExecutionStatus, TriggerContext, WorkflowExecution};
use crate::graph::{self, ExecutionId, InteractionId, NodeId, NodeKind, Workflow};
use crate::interact::{InteractionStatus, InteractionStore, MemoryInteractionStore};
use crate::program::{MemoryProgramCatalog, ProgramLookup};
use crate::scheduler::Scheduler;
use crate::store::{ExecutionStore, MemoryExecutionStore};
use crate::stream::{EventStreamer, ExecutionEvent};

/// Entry point for triggering and observing workflow executions.
///
/// Each started execution runs on its own background task; the service
/// tracks a cancellation token per in-flight execution.
pub struct WorkflowService {
    scheduler: Scheduler,
    store: Arc<dyn ExecutionStore>,
    interactions: Arc<dyn InteractionStore>,
    streamer: Arc<EventStreamer>,
    active: Arc<Mutex<HashMap<ExecutionId, CancellationToken>>>,
}

impl WorkflowService {
    /// Returns a builder with in-memory collaborators as defaults.
    pub fn builder() -> WorkflowServiceBuilder {
        WorkflowServiceBuilder::default()
    }

    /// Validates the workflow and starts an execution on a background
    /// task.
    ///
    /// Structural errors (cycle, dangling edge, duplicate node) surface
    /// here and no execution record is created. Trigger-supplied inputs
    /// are merged into the workflow's input nodes before scheduling.
    pub async fn start_execution(
        &self,
        mut workflow: Workflow,
        trigger: TriggerContext,
    ) -> EngineResult<ExecutionId> {
        graph::validate(&workflow)?;
        merge_trigger_inputs(&mut workflow, &trigger.inputs);

        let execution = WorkflowExecution::pending(&workflow, &trigger);
        let execution_id = execution.id;
        self.store.create(execution).await?;

        let token = CancellationToken::new();
        self.lock_active().insert(execution_id, token.clone());

        let scheduler = self.scheduler.clone();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            if let Err(err) = scheduler.run(workflow, execution_id, token).await {
                tracing::error!(
                    target: TRACING_TARGET,
                    execution_id = %execution_id,
                    error = %err,
                    "Execution task ended with an error"
                );
            }
            let mut guard = match active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.remove(&execution_id);
        });

        Ok(execution_id)
    }

    /// Requests cancellation of a running execution.
    ///
    /// Idempotent: cancelling a terminal or unknown-to-this-process
    /// execution that the store still knows is a no-op.
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> EngineResult<()> {
        if let Some(token) = self.lock_active().get(&execution_id) {
            token.cancel();
            return Ok(());
        }
        // Not in flight here: a Pending record that never got a task
        // still moves to Cancelled.
        let execution = self.store.get(execution_id).await?;
        if !execution.status.is_terminal() {
            self.store
                .transition(
                    execution_id,
                    &[ExecutionStatus::Pending],
                    ExecutionStatus::Cancelled,
                )
                .await?;
        }
        Ok(())
    }

    /// Returns the current execution aggregate.
    pub async fn get_execution_status(
        &self,
        execution_id: ExecutionId,
    ) -> EngineResult<WorkflowExecution> {
        self.store.get(execution_id).await
    }

    /// Subscribes to an execution's event stream: recent history first,
    /// then a live receiver.
    pub fn subscribe(
        &self,
        execution_id: ExecutionId,
    ) -> (Vec<ExecutionEvent>, broadcast::Receiver<ExecutionEvent>) {
        self.streamer.subscribe(execution_id)
    }

    /// Resolves a pending human interaction with a payload; the parked
    /// node resumes with it. Returns `false` when the interaction already
    /// reached a terminal status.
    pub async fn resolve_interaction(
        &self,
        interaction_id: InteractionId,
        payload: Value,
    ) -> EngineResult<bool> {
        self.interactions
            .resolve(interaction_id, InteractionStatus::Completed, Some(payload))
            .await
    }

    /// Deletes terminal executions and interactions older than `age`,
    /// along with the purged executions' event channels and history.
    /// Returns how many records were removed.
    pub async fn purge_older_than(&self, age: Duration) -> EngineResult<usize> {
        let cutoff = Timestamp::now() - age;
        let executions = self.store.purge_created_before(cutoff).await?;
        for execution_id in &executions {
            self.streamer.forget(*execution_id);
        }
        let interactions = self.interactions.purge_created_before(cutoff).await?;
        if !executions.is_empty() || interactions > 0 {
            tracing::info!(
                target: TRACING_TARGET,
                executions = executions.len(),
                interactions,
                "Purged aged execution history"
            );
        }
        Ok(executions.len() + interactions)
    }

    fn lock_active(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, CancellationToken>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowService").finish_non_exhaustive()
    }
}

/// Merges trigger-supplied inputs into the workflow's Input-kind nodes,
/// or into its root nodes when the workflow declares none.
fn merge_trigger_inputs(workflow: &mut Workflow, inputs: &BTreeMap<String, Value>) {
    if inputs.is_empty() {
        return;
    }
    let mut targets: HashSet<NodeId> = workflow
        .nodes
        .iter()
        .filter(|node| node.kind == NodeKind::Input)
        .map(|node| node.id)
        .collect();
    if targets.is_empty() {
        let with_inbound: HashSet<NodeId> = workflow
            .edges
            .iter()
            .filter(|edge| !edge.disabled)
            .map(|edge| edge.target)
            .collect();
        targets = workflow
            .nodes
            .iter()
            .filter(|node| !with_inbound.contains(&node.id))
            .map(|node| node.id)
            .collect();
    }
    for node in &mut workflow.nodes {
        if targets.contains(&node.id) {
            for (key, value) in inputs {
                node.inputs.user_inputs.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Builder for [`WorkflowService`].
///
/// Every collaborator has an in-memory default so tests and embedded use
/// need only a sandbox; production callers inject their own stores.
pub struct WorkflowServiceBuilder {
    sandbox: Option<Arc<dyn SandboxRunner>>,
    programs: Option<Arc<dyn ProgramLookup>>,
    store: Option<Arc<dyn ExecutionStore>>,
    interactions: Option<Arc<dyn InteractionStore>>,
    config: EngineConfig,
}

impl Default for WorkflowServiceBuilder {
    fn default() -> Self {
        Self {
            sandbox: None,
            programs: None,
            store: None,
            interactions: None,
            config: EngineConfig::default(),
        }
    }
}

impl WorkflowServiceBuilder {
    /// Sets the sandbox backend nodes execute in.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Sets the program catalog.
    pub fn with_programs(mut self, programs: Arc<dyn ProgramLookup>) -> Self {
        self.programs = Some(programs);
        self
    }

    /// Sets the execution store.
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the interaction store.
    pub fn with_interactions(mut self, interactions: Arc<dyn InteractionStore>) -> Self {
        self.interactions = Some(interactions);
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the service.
    pub fn build(self) -> WorkflowService {
        let sandbox = self
            .sandbox
            .unwrap_or_else(|| Arc::new(ProcessSandbox::new()));
        let programs = self
            .programs
            .unwrap_or_else(|| Arc::new(MemoryProgramCatalog::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryExecutionStore::new()));
        let interactions = self
            .interactions
            .unwrap_or_else(|| Arc::new(MemoryInteractionStore::new()));
        let streamer = Arc::new(EventStreamer::with_capacities(
            self.config.event_channel_capacity,
            self.config.event_history_capacity,
        ));

        let scheduler = Scheduler::new(
            self.config,
            NodeExecutor::new(sandbox),
            Arc::clone(&programs),
            Arc::clone(&store),
            Arc::clone(&interactions),
            Arc::clone(&streamer),
        );
        WorkflowService {
            scheduler,
            store,
            interactions,
            streamer,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl std::fmt::Debug for WorkflowServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowServiceBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
