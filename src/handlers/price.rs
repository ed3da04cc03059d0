//! Price monitor block

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::{opt_str, require_str, with_cancel, PriceFeed};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_CURRENCY: &str = "usd";

/// Reads the current price of an asset from the injected feed.
pub struct PriceMonitorHandler {
    feed: Arc<dyn PriceFeed>,
}

impl PriceMonitorHandler {
    pub fn new(feed: Arc<dyn PriceFeed>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl BlockHandler for PriceMonitorHandler {
    fn block_type(&self) -> BlockType {
        BlockType::PriceMonitor
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let asset = require_str(node, "asset")?;
        let currency = opt_str(node, "currency").unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let price = with_cancel(ctx, self.feed.price(&asset, &currency)).await?;

        Ok(json!({
            "price": price,
            "asset": asset,
        }))
    }
}

/// Public spot-price feed over HTTP (coingecko-compatible shape:
/// `{ "<asset>": { "<currency>": <price> } }`).
pub struct HttpPriceFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceFeed {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for HttpPriceFeed {
    fn default() -> Self {
        Self::new("https://api.coingecko.com/api/v3")
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn price(&self, asset: &str, currency: &str) -> EngineResult<f64> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies={}",
            self.base_url, asset, currency
        );
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Execution(format!("price feed timeout: {}", e))
            } else {
                EngineError::Execution(format!("network error: {}", e))
            }
        })?;

        if response.status().as_u16() == 429 {
            return Err(EngineError::Execution(
                "rate limit: price feed returned 429".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(EngineError::Execution(format!(
                "price feed returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Execution(format!("malformed price response: {}", e)))?;
        body.get(asset)
            .and_then(|a| a.get(currency))
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                EngineError::Execution(format!("price not found for {}/{}", asset, currency))
            })
    }
}
