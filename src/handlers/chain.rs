//! Blockchain read and transaction blocks
//!
//! Both go through the [`ChainRpc`] port. The transaction handler opts into
//! the circuit breaker: its scope pairs the chain id with the sending
//! account, so one hot wallet tripping the breaker does not block others.

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::{bool_config, opt_str, require_f64, require_str, with_cancel, ChainRpc};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use crate::resilience::BreakerKey;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Read-only chain call (no breaker: reads are idempotent and cheap).
pub struct BlockchainReadHandler {
    rpc: Arc<dyn ChainRpc>,
}

impl BlockchainReadHandler {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl BlockHandler for BlockchainReadHandler {
    fn block_type(&self) -> BlockType {
        BlockType::BlockchainRead
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let chain_id = require_f64(node, "chainId")? as u64;
        let method = require_str(node, "method")?;
        let params = node
            .config
            .get("params")
            .cloned()
            .unwrap_or_else(|| json!([]));

        let result = with_cancel(ctx, self.rpc.call(chain_id, &method, params)).await?;
        Ok(json!({ "result": result }))
    }
}

/// State-changing chain transaction.
pub struct BlockchainTransactionHandler {
    rpc: Arc<dyn ChainRpc>,
}

impl BlockchainTransactionHandler {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl BlockHandler for BlockchainTransactionHandler {
    fn block_type(&self) -> BlockType {
        BlockType::BlockchainTransaction
    }

    fn breaker_key(&self, node: &Node) -> Option<BreakerKey> {
        if !bool_config(node, "useCircuitBreaker", true) {
            return None;
        }
        let scope = opt_str(node, "scope").unwrap_or_else(|| {
            let chain = opt_str(node, "chainId").unwrap_or_else(|| "0".to_string());
            let from = opt_str(node, "from").unwrap_or_default();
            format!("{}:{}", chain, from)
        });
        Some(BreakerKey::new(scope, "transaction"))
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let chain_id = require_f64(node, "chainId")? as u64;
        let from = require_str(node, "from")?;
        let to = require_str(node, "to")?;
        let value = opt_str(node, "value").unwrap_or_else(|| "0x0".to_string());
        let data = opt_str(node, "data");

        let mut tx = json!({
            "from": from,
            "to": to,
            "value": value,
        });
        if let Some(data) = data {
            tx["data"] = Value::String(data);
        }

        debug!(node = %node.id, chain_id, "submitting transaction");
        let result = with_cancel(
            ctx,
            self.rpc.call(chain_id, "eth_sendTransaction", json!([tx])),
        )
        .await?;

        let tx_hash = result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                EngineError::Execution(format!("unexpected transaction response: {}", result))
            })?;

        Ok(json!({
            "txHash": tx_hash,
            "status": "submitted",
        }))
    }
}

/// JSON-RPC client over reqwest, one endpoint per chain id. Single-shot per
/// call: the node executor owns all retrying.
pub struct JsonRpcChainClient {
    client: reqwest::Client,
    endpoints: HashMap<u64, String>,
}

impl JsonRpcChainClient {
    pub fn new(endpoints: HashMap<u64, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Endpoints from `STRAND_CHAIN_RPCS`, formatted
    /// `1=https://rpc-a,1328=https://rpc-b`.
    pub fn from_env() -> Self {
        let mut endpoints = HashMap::new();
        if let Ok(raw) = std::env::var("STRAND_CHAIN_RPCS") {
            for entry in raw.split(',') {
                if let Some((chain, url)) = entry.split_once('=') {
                    if let Ok(chain_id) = chain.trim().parse::<u64>() {
                        endpoints.insert(chain_id, url.trim().to_string());
                    }
                }
            }
        }
        Self::new(endpoints)
    }
}

#[async_trait]
impl ChainRpc for JsonRpcChainClient {
    async fn call(&self, chain_id: u64, method: &str, params: Value) -> EngineResult<Value> {
        let endpoint = self.endpoints.get(&chain_id).ok_or_else(|| {
            EngineError::Config(format!("no RPC endpoint configured for chain {}", chain_id))
        })?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Execution(format!("rpc timeout: {}", e))
                } else {
                    EngineError::Execution(format!("network error: {}", e))
                }
            })?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Execution(format!("malformed rpc response: {}", e)))?;

        if let Some(error) = body.get("error") {
            // Provider message verbatim: the classifier matches on it
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error");
            return Err(EngineError::Execution(message.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}
