//! Shared test harness: an engine over a throwaway store with scripted
//! handlers for the block types whose externalities tests need to control.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_workflow_engine::context::ExecutionContext;
use strand_workflow_engine::engine::Engine;
use strand_workflow_engine::error::{EngineError, EngineResult};
use strand_workflow_engine::events::EventBus;
use strand_workflow_engine::handlers::{self, ChainRpc, EmailSender};
use strand_workflow_engine::model::{
    BlockType, Execution, ExecutionId, Node, Workflow,
};
use strand_workflow_engine::registry::{BlockHandler, HandlerRegistry};
use strand_workflow_engine::state::{SharedGateway, SledGateway};
use strand_workflow_engine::EngineConfig;

/// Mailer that records deliveries for assertions.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: parking_lot::Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> EngineResult<String> {
        self.sent
            .lock()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(format!("test-{}", self.sent.lock().len()))
    }
}

/// Chain RPC with a controllable health flag and a call counter.
#[derive(Default)]
pub struct ScriptedChainRpc {
    pub calls: AtomicU32,
    pub healthy: AtomicBool,
    pub error: parking_lot::Mutex<String>,
}

impl ScriptedChainRpc {
    pub fn new(healthy: bool, error: &str) -> Self {
        let rpc = Self::default();
        rpc.healthy.store(healthy, Ordering::SeqCst);
        *rpc.error.lock() = error.to_string();
        rpc
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainRpc for ScriptedChainRpc {
    async fn call(&self, _chain_id: u64, _method: &str, _params: Value) -> EngineResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(json!("0x90aabbccdd"))
        } else {
            Err(EngineError::Execution(self.error.lock().clone()))
        }
    }
}

/// Entry handler: a schedule block that emits its configured `emit` object
/// downstream, standing in for the trigger payload shape a test wants.
pub struct EmitHandler;

#[async_trait]
impl BlockHandler for EmitHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Schedule
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<Value> {
        Ok(node
            .config
            .get("emit")
            .cloned()
            .unwrap_or_else(|| input.clone()))
    }
}

/// HTTP stand-in that fails `failTimes` times with `failMessage`, then
/// succeeds. Counters are per node id.
#[derive(Default)]
pub struct FlakyHandler {
    attempts: DashMap<String, u32>,
}

#[async_trait]
impl BlockHandler for FlakyHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Http
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let fail_times = node
            .config
            .get("failTimes")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let message = node
            .config
            .get("failMessage")
            .and_then(Value::as_str)
            .unwrap_or("network error")
            .to_string();
        let mut seen = self.attempts.entry(node.id.clone()).or_insert(0);
        *seen += 1;
        if u64::from(*seen) <= fail_times {
            return Err(EngineError::Execution(message));
        }
        Ok(json!({"status": 200, "body": {"ok": true}, "headers": {}}))
    }
}

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub gateway: SharedGateway,
    pub mailer: Arc<RecordingMailer>,
    pub chain: Arc<ScriptedChainRpc>,
}

impl TestHarness {
    /// Engine with scripted externalities and workers running.
    pub async fn start(config: EngineConfig) -> Self {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let bus = EventBus::default();
        let mailer = Arc::new(RecordingMailer::default());
        let chain = Arc::new(ScriptedChainRpc::new(true, "network error"));

        let mut registry = HandlerRegistry::new(gateway.clone());
        registry.register(Arc::new(EmitHandler));
        registry.register(Arc::new(FlakyHandler::default()));
        registry.register(Arc::new(handlers::flow::CalculatorHandler));
        registry.register(Arc::new(handlers::flow::ConditionHandler));
        registry.register(Arc::new(handlers::flow::TransformHandler));
        registry.register(Arc::new(handlers::flow::DelayHandler));
        registry.register(Arc::new(handlers::messaging::EmailHandler::new(
            mailer.clone(),
        )));
        registry.register(Arc::new(handlers::messaging::NotificationHandler::new(
            Arc::new(handlers::messaging::LogNotifier),
        )));
        registry.register(Arc::new(
            handlers::chain::BlockchainTransactionHandler::new(chain.clone()),
        ));
        registry.register(Arc::new(handlers::chain::BlockchainReadHandler::new(
            chain.clone(),
        )));
        registry.register(Arc::new(handlers::custom::CustomHandler::new(
            &config.sandbox,
        )));

        let engine = Arc::new(Engine::with_registry(
            config,
            gateway.clone(),
            Arc::new(registry),
            bus,
        ));
        engine.start_workers().await.unwrap();

        Self {
            engine,
            gateway,
            mailer,
            chain,
        }
    }

    pub async fn default_start() -> Self {
        Self::start(EngineConfig::default()).await
    }

    /// Persist a workflow built from JSON and return it.
    pub async fn save_workflow(&self, value: Value) -> Workflow {
        let workflow: Workflow = serde_json::from_value(value).unwrap();
        self.engine.save_workflow(&workflow).await.unwrap();
        workflow
    }

    /// Enqueue an execution with an empty payload.
    pub async fn execute(&self, workflow: &Workflow) -> ExecutionId {
        self.execute_with(workflow, json!({})).await
    }

    pub async fn execute_with(&self, workflow: &Workflow, payload: Value) -> ExecutionId {
        self.engine
            .execute_workflow(
                workflow.id,
                strand_workflow_engine::model::TriggerSource::Api,
                "tests".to_string(),
                payload,
            )
            .await
            .unwrap()
            .expect("workflow should validate")
    }

    /// Poll until the execution reaches a terminal (or paused) status.
    pub async fn wait_settled(&self, id: ExecutionId, budget: Duration) -> Execution {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let execution = self.engine.get_execution(id).await.unwrap();
            if execution.status.is_terminal()
                || execution.status == strand_workflow_engine::model::ExecutionStatus::Paused
            {
                return execution;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "execution {} still {:?} after {:?}",
                id,
                execution.status,
                budget
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
