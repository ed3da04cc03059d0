//! DAG scheduler
//!
//! Drives one execution: maintains remaining-parent counts, the ready set
//! (ordered by node id for reproducible dispatch), and the per-node output
//! map. Dispatches up to `max_in_flight` nodes concurrently; a parent's
//! output is fully recorded before any child's input is assembled.

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::events::EventBus;
use crate::executor::{NodeExecutor, NodeOutcome};
use crate::model::{
    BlockType, ErrorInfo, Node, NodeExecution, NodeExecutionStatus, NodeId, Workflow,
    DEFAULT_HANDLE,
};
use crate::state::SharedGateway;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Terminal outcome of one scheduler run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every reachable node finished; result maps terminal node ids to their
    /// outputs
    Completed { result: Value },
    /// First fatal node error (ties broken by completion time)
    Failed { error: ErrorInfo },
    /// Cooperative cancellation drained the run
    Cancelled,
    /// Pause records parked every live branch
    Paused,
}

/// Per-execution DAG runner.
pub struct Scheduler {
    executor: Arc<NodeExecutor>,
    gateway: SharedGateway,
    bus: EventBus,
    max_in_flight: usize,
}

impl Scheduler {
    pub fn new(
        executor: Arc<NodeExecutor>,
        gateway: SharedGateway,
        bus: EventBus,
        max_in_flight: usize,
    ) -> Self {
        Self {
            executor,
            gateway,
            bus,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Run the workflow to a terminal outcome. Never returns early while
    /// node tasks are still in flight.
    pub async fn run(&self, workflow: &Workflow, ctx: &ExecutionContext) -> EngineResult<RunOutcome> {
        let cap = workflow.max_in_flight().unwrap_or(self.max_in_flight);
        let mut state = DagState::new(workflow, ctx.execution_id, ctx.variables.as_ref().clone());
        let mut tasks: JoinSet<(NodeId, NodeOutcome)> = JoinSet::new();
        let mut in_flight: usize = 0;
        let mut fatal: Option<EngineError> = None;
        let mut cancelled = ctx.cancel.is_cancelled();
        let mut paused_nodes: HashSet<NodeId> = HashSet::new();

        loop {
            // Execution-wide pause parks the whole ready set
            let execution_paused = self
                .gateway
                .get_pause(ctx.execution_id, None)
                .await?
                .is_some();

            // Dispatch while there is room and nothing fatal happened
            while !cancelled
                && fatal.is_none()
                && !execution_paused
                && in_flight < cap
            {
                let Some(node_id) = state.ready.iter().next().cloned() else {
                    break;
                };
                state.ready.remove(&node_id);
                let node = workflow
                    .node(&node_id)
                    .ok_or_else(|| EngineError::Internal(format!("node {} vanished", node_id)))?
                    .clone();
                let input = state.assemble_input(workflow, &node_id);
                let executor = self.executor.clone();
                let ctx = ctx.clone();
                in_flight += 1;
                tasks.spawn(async move {
                    let outcome = executor.execute_node(&node, &ctx, input).await;
                    (node.id, outcome)
                });
            }

            if in_flight == 0 {
                break;
            }

            // Wait for one completion; observe cancellation while waiting
            let joined = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    continue;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            in_flight -= 1;
            let (node_id, outcome) = joined
                .map_err(|e| EngineError::Internal(format!("node task panicked: {}", e)))?;

            match outcome {
                NodeOutcome::Succeeded(output) => {
                    self.propagate(workflow, &mut state, &node_id, output).await?;
                }
                NodeOutcome::Paused => {
                    paused_nodes.insert(node_id);
                    // children stay parked: their parent never completes
                }
                NodeOutcome::Failed(err) => {
                    // A cancelled node is fatal unless the whole execution is
                    // already terminating
                    if err.kind() == ErrorKind::Cancelled && ctx.cancel.is_cancelled() {
                        cancelled = true;
                    } else if fatal.is_none() {
                        // first fatal error wins
                        fatal = Some(err);
                    }
                }
            }
        }

        // Drain anything still running (cancellation or fatal stop)
        while let Some(joined) = tasks.join_next().await {
            if let Ok((node_id, outcome)) = joined {
                if let NodeOutcome::Succeeded(output) = outcome {
                    self.propagate(workflow, &mut state, &node_id, output).await?;
                }
            }
        }

        if cancelled && fatal.is_none() {
            return Ok(RunOutcome::Cancelled);
        }
        if let Some(err) = fatal {
            return Ok(RunOutcome::Failed {
                error: ErrorInfo::from_error(&err),
            });
        }
        if !paused_nodes.is_empty()
            || self
                .gateway
                .get_pause(ctx.execution_id, None)
                .await?
                .is_some()
        {
            return Ok(RunOutcome::Paused);
        }

        // Result: outputs of terminal nodes that actually ran
        let mut result = Map::new();
        for node in &workflow.nodes {
            if workflow.outgoing(&node.id).next().is_none() {
                if let Some(output) = state.outputs.get(&node.id) {
                    result.insert(node.id.clone(), output.clone());
                }
            }
        }
        Ok(RunOutcome::Completed {
            result: Value::Object(result),
        })
    }

    /// Record a node's output and advance its children: fire or kill each
    /// outgoing edge, enqueue children whose parents are all settled, and
    /// mark children skipped when every incoming edge died.
    async fn propagate(
        &self,
        workflow: &Workflow,
        state: &mut DagState,
        node_id: &str,
        output: Value,
    ) -> EngineResult<()> {
        state.outputs.insert(node_id.to_string(), output);
        let route = state
            .outputs
            .get(node_id)
            .and_then(|o| o.get("route"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let is_condition = workflow
            .node(node_id)
            .map(|n| n.block_type == BlockType::Condition)
            .unwrap_or(false);

        let mut newly_skipped: Vec<NodeId> = Vec::new();
        for edge in workflow.outgoing(node_id) {
            let fires = if is_condition
                && matches!(edge.source_handle(), "true" | "false")
            {
                route.as_deref() == Some(edge.source_handle())
            } else {
                true
            };
            if fires {
                state.fired.insert(edge.id.clone());
            }
            state.settle_edge(&edge.target, fires, &mut newly_skipped);
        }

        // A skipped node kills all of its outgoing edges in turn
        while let Some(skipped_id) = newly_skipped.pop() {
            self.persist_skip(state.execution_id, &skipped_id).await?;
            let mut next: Vec<NodeId> = Vec::new();
            for edge in workflow.outgoing(&skipped_id) {
                state.settle_edge(&edge.target, false, &mut next);
            }
            newly_skipped.extend(next);
        }
        Ok(())
    }

    async fn persist_skip(
        &self,
        execution_id: crate::model::ExecutionId,
        node_id: &str,
    ) -> EngineResult<()> {
        if self
            .gateway
            .get_node_execution(execution_id, node_id)
            .await?
            .is_none()
        {
            let row = NodeExecution::new(execution_id, node_id.to_string(), Value::Null);
            self.gateway.create_node_execution(&row).await?;
            self.gateway
                .update_node_execution_status(row.id, NodeExecutionStatus::Skipped, 0, None)
                .await?;
            self.bus
                .publish_node(execution_id, node_id.to_string(), NodeExecutionStatus::Skipped, 0);
        }
        Ok(())
    }
}

/// Mutable scheduling state for one run.
struct DagState {
    execution_id: crate::model::ExecutionId,
    remaining_parents: HashMap<NodeId, usize>,
    fired_count: HashMap<NodeId, usize>,
    outputs: HashMap<NodeId, Value>,
    fired: HashSet<String>,
    ready: BTreeSet<NodeId>,
    trigger: Value,
}

impl DagState {
    fn new(workflow: &Workflow, execution_id: crate::model::ExecutionId, trigger: Value) -> Self {
        let mut remaining_parents: HashMap<NodeId, usize> = workflow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), 0))
            .collect();
        for edge in &workflow.edges {
            if let Some(count) = remaining_parents.get_mut(&edge.target) {
                *count += 1;
            }
        }
        let ready: BTreeSet<NodeId> = remaining_parents
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(id, _)| id.clone())
            .collect();
        Self {
            execution_id,
            remaining_parents,
            fired_count: HashMap::new(),
            outputs: HashMap::new(),
            fired: HashSet::new(),
            ready,
            trigger,
        }
    }

    /// One incoming edge of `target` settled (fired or died). When all its
    /// parents settled: ready if anything fired, skipped otherwise.
    fn settle_edge(&mut self, target: &str, fired: bool, skipped: &mut Vec<NodeId>) {
        if fired {
            *self.fired_count.entry(target.to_string()).or_insert(0) += 1;
        }
        let Some(count) = self.remaining_parents.get_mut(target) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            if self.fired_count.get(target).copied().unwrap_or(0) > 0 {
                self.ready.insert(target.to_string());
            } else {
                skipped.push(target.to_string());
            }
        }
    }

    /// Compose a node's input from its fired incoming edges. The entry node
    /// receives the trigger payload.
    fn assemble_input(&self, workflow: &Workflow, node_id: &str) -> Value {
        let incoming: Vec<_> = workflow.incoming(node_id).collect();
        if incoming.is_empty() {
            return self.trigger.clone();
        }
        let mut input = Map::new();
        for edge in incoming {
            if !self.fired.contains(&edge.id) {
                continue;
            }
            let Some(source_output) = self.outputs.get(&edge.source) else {
                continue;
            };
            let contribution = if edge.source_handle() == DEFAULT_HANDLE {
                source_output.clone()
            } else if let Some(named) = source_output.get(edge.source_handle()) {
                named.clone()
            } else {
                // routing handles (condition true/false) carry the whole map
                source_output.clone()
            };
            match edge.target_handle() {
                DEFAULT_HANDLE => match contribution {
                    Value::Object(map) => {
                        for (k, v) in map {
                            input.insert(k, v);
                        }
                    }
                    other => {
                        input.insert(edge.source_handle().to_string(), other);
                    }
                },
                named => {
                    input.insert(named.to_string(), contribution);
                }
            }
        }
        Value::Object(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(value: Value) -> Workflow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn entry_gets_trigger_payload() {
        let wf = workflow(json!({
            "name": "t",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*"}},
                {"id": "b", "blockType": "EMAIL", "config": {"to": "x", "subject": "s"}},
            ],
            "edges": [{"id": "e1", "source": "a", "target": "b"}],
        }));
        let state = DagState::new(&wf, crate::model::ExecutionId::new(), json!({"n": 2}));
        assert_eq!(state.assemble_input(&wf, "a"), json!({"n": 2}));
        assert!(state.ready.contains("a"));
        assert_eq!(state.remaining_parents["b"], 1);
    }

    #[test]
    fn child_input_composes_parent_outputs() {
        let wf = workflow(json!({
            "name": "t",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*"}},
                {"id": "b", "blockType": "HTTP", "config": {"url": "http://x"}},
                {"id": "c", "blockType": "EMAIL", "config": {"to": "x", "subject": "s"}},
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "c"},
                {"id": "e2", "source": "b", "target": "c", "sourceHandle": "status", "targetHandle": "httpStatus"},
            ],
        }));
        let mut state = DagState::new(&wf, crate::model::ExecutionId::new(), json!({}));
        state.outputs.insert("a".to_string(), json!({"firedAt": "now"}));
        state.outputs.insert("b".to_string(), json!({"status": 200, "body": {}}));
        state.fired.insert("e1".to_string());
        state.fired.insert("e2".to_string());
        let input = state.assemble_input(&wf, "c");
        assert_eq!(input, json!({"firedAt": "now", "httpStatus": 200}));
    }

    #[test]
    fn skipped_branch_counts_parents_down() {
        let wf = workflow(json!({
            "name": "t",
            "nodes": [
                {"id": "cond", "blockType": "CONDITION", "config": {"expression": "x > 1"}},
                {"id": "yes", "blockType": "EMAIL", "config": {"to": "x", "subject": "s"}},
                {"id": "no", "blockType": "EMAIL", "config": {"to": "x", "subject": "s"}},
            ],
            "edges": [
                {"id": "e1", "source": "cond", "target": "yes", "sourceHandle": "true"},
                {"id": "e2", "source": "cond", "target": "no", "sourceHandle": "false"},
            ],
        }));
        let mut state = DagState::new(&wf, crate::model::ExecutionId::new(), json!({}));
        let mut skipped = Vec::new();
        // the "true" edge fires, the "false" edge dies
        state.fired.insert("e1".to_string());
        state.settle_edge("yes", true, &mut skipped);
        state.settle_edge("no", false, &mut skipped);
        assert!(state.ready.contains("yes"));
        assert_eq!(skipped, vec!["no".to_string()]);
    }
}
