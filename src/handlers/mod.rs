//! Block handlers
//!
//! One handler per block type. External collaborators (mail relay, database,
//! LLM provider, chain RPC, price feed) sit behind port traits so the core
//! stays testable; handlers built directly on HTTP use reqwest. Every handler
//! honors the context's cancellation signal on blocking I/O and surfaces raw
//! provider error text for the retry classifier.

pub mod chain;
pub mod custom;
pub mod database;
pub mod discord;
pub mod flow;
pub mod http;
pub mod llm;
pub mod messaging;
pub mod price;

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::model::Node;
use crate::registry::HandlerRegistry;
use crate::state::SharedGateway;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

// ---- outbound ports ----

/// JSON-RPC access to a chain. Implementations must surface provider error
/// strings verbatim (`nonce too low`, `already known`, ...) so the
/// classifier can pattern-match them, and must not retry internally.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn call(&self, chain_id: u64, method: &str, params: Value) -> EngineResult<Value>;
}

/// Email delivery channel.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Returns a provider message id.
    async fn send(&self, to: &str, subject: &str, body: &str) -> EngineResult<String>;
}

/// In-app / push notification channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str, channel: &str) -> EngineResult<()>;
}

/// Parameterized query execution against the user's database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Returns the result rows as a JSON array.
    async fn query(&self, statement: &str, parameters: &[Value]) -> EngineResult<Value>;
}

/// LLM completion provider.
#[async_trait]
pub trait PromptClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: Option<u64>,
    ) -> EngineResult<String>;
}

/// Asset price source.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn price(&self, asset: &str, currency: &str) -> EngineResult<f64>;
}

/// Bundle of outbound ports injected into the registry.
#[derive(Clone)]
pub struct HandlerPorts {
    pub chain: Arc<dyn ChainRpc>,
    pub mailer: Arc<dyn EmailSender>,
    pub notifier: Arc<dyn NotificationSink>,
    pub database: Arc<dyn QueryExecutor>,
    pub llm: Arc<dyn PromptClient>,
    pub prices: Arc<dyn PriceFeed>,
}

impl HandlerPorts {
    /// Development wiring: deliveries are logged and succeed, chain/database/
    /// LLM access fails until a real implementation is injected, prices come
    /// from the public feed.
    pub fn development() -> Self {
        Self {
            chain: Arc::new(chain::JsonRpcChainClient::from_env()),
            mailer: Arc::new(messaging::LogMailer),
            notifier: Arc::new(messaging::LogNotifier),
            database: Arc::new(database::DisconnectedDatabase),
            llm: Arc::new(llm::DisconnectedPromptClient),
            prices: Arc::new(price::HttpPriceFeed::default()),
        }
    }
}

/// Build the full registry: every block type, metered.
pub fn default_registry(
    config: &EngineConfig,
    gateway: SharedGateway,
    ports: HandlerPorts,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new(gateway);
    let client = reqwest::Client::new();

    registry.register(Arc::new(http::HttpHandler::new(client.clone())));
    registry.register(Arc::new(http::WebhookHandler::new(client.clone())));
    registry.register(Arc::new(discord::DiscordHandler::new(client)));
    registry.register(Arc::new(messaging::EmailHandler::new(ports.mailer.clone())));
    registry.register(Arc::new(messaging::NotificationHandler::new(
        ports.notifier.clone(),
    )));
    registry.register(Arc::new(database::DatabaseHandler::new(
        ports.database.clone(),
    )));
    registry.register(Arc::new(flow::ScheduleHandler));
    registry.register(Arc::new(flow::DelayHandler));
    registry.register(Arc::new(flow::ConditionHandler));
    registry.register(Arc::new(flow::TransformHandler));
    registry.register(Arc::new(flow::CalculatorHandler));
    registry.register(Arc::new(llm::LlmPromptHandler::new(ports.llm.clone())));
    registry.register(Arc::new(price::PriceMonitorHandler::new(
        ports.prices.clone(),
    )));
    registry.register(Arc::new(chain::BlockchainReadHandler::new(
        ports.chain.clone(),
    )));
    registry.register(Arc::new(chain::BlockchainTransactionHandler::new(
        ports.chain,
    )));
    registry.register(Arc::new(custom::CustomHandler::new(&config.sandbox)));

    registry
}

// ---- shared helpers ----

/// Race a handler future against the cancellation signal.
pub async fn with_cancel<T, F>(ctx: &ExecutionContext, fut: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled),
        result = fut => result,
    }
}

/// Required string config field (post template resolution).
pub fn require_str(node: &Node, key: &str) -> EngineResult<String> {
    match node.config.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) if !other.is_null() => Ok(crate::template::stringify(other)),
        _ => Err(EngineError::Config(format!(
            "node {} missing required config field {:?}",
            node.id, key
        ))),
    }
}

/// Optional string config field.
pub fn opt_str(node: &Node, key: &str) -> Option<String> {
    node.config.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(crate::template::stringify(other)),
    })
}

/// Declared numeric coercion: accepts numbers, numeric strings, and booleans.
pub fn coerce_f64(value: &Value, what: &str) -> EngineResult<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EngineError::Config(format!("{} is not a finite number", what))),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
            EngineError::Config(format!("{} is not numeric: {:?}", what, s))
        }),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(EngineError::Config(format!(
            "{} is not numeric: {}",
            what, other
        ))),
    }
}

/// Required numeric config field with coercion.
pub fn require_f64(node: &Node, key: &str) -> EngineResult<f64> {
    let value = node.config.get(key).ok_or_else(|| {
        EngineError::Config(format!(
            "node {} missing required config field {:?}",
            node.id, key
        ))
    })?;
    coerce_f64(value, &format!("node {} field {:?}", node.id, key))
}

/// Boolean config field with a default; accepts bools and `"true"`/`"false"`.
pub fn bool_config(node: &Node, key: &str, default: bool) -> bool {
    match node.config.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => default,
    }
}
