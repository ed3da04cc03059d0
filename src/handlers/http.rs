//! HTTP and webhook blocks

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::{opt_str, require_str, with_cancel};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use tracing::debug;

fn parse_method(raw: &str) -> EngineResult<Method> {
    raw.to_uppercase()
        .parse::<Method>()
        .map_err(|_| EngineError::Config(format!("invalid HTTP method {:?}", raw)))
}

fn header_map(node: &Node) -> Vec<(String, String)> {
    node.config
        .get("headers")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), crate::template::stringify(v)))
                .collect()
        })
        .unwrap_or_default()
}

async fn send_request(
    client: &Client,
    ctx: &ExecutionContext,
    node: &Node,
    url_field: &str,
    body_field: &str,
) -> EngineResult<Value> {
    let url = require_str(node, url_field)?;
    let method = parse_method(&opt_str(node, "method").unwrap_or_else(|| "GET".to_string()))?;

    let mut builder = client.request(method.clone(), &url);
    for (key, value) in header_map(node) {
        builder = builder.header(key, value);
    }
    if let Some(body) = node.config.get(body_field) {
        if !body.is_null() {
            builder = builder.json(body);
        }
    }

    debug!(node = %node.id, %method, %url, "sending HTTP request");

    let response = with_cancel(ctx, async {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Execution(format!("request timeout: {}", e))
            } else if e.is_connect() {
                EngineError::Execution(format!("connection refused: {}", e))
            } else {
                EngineError::Execution(format!("network error: {}", e))
            }
        })
    })
    .await?;

    let status = response.status().as_u16();
    let mut headers = Map::new();
    for (key, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(key.to_string(), Value::String(v.to_string()));
        }
    }

    let text = with_cancel(ctx, async {
        response
            .text()
            .await
            .map_err(|e| EngineError::Execution(format!("network error: {}", e)))
    })
    .await?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

    if status == 429 {
        return Err(EngineError::Execution(format!(
            "rate limit: HTTP 429 from {}",
            url
        )));
    }
    if status == 504 {
        return Err(EngineError::Execution(format!(
            "gateway timeout: HTTP 504 from {}",
            url
        )));
    }
    if status >= 400 {
        return Err(EngineError::Execution(format!(
            "HTTP {} from {}: {}",
            status,
            url,
            crate::template::stringify(&body)
        )));
    }

    Ok(json!({
        "status": status,
        "headers": headers,
        "body": body,
    }))
}

/// Generic HTTP call block.
pub struct HttpHandler {
    client: Client,
}

impl HttpHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockHandler for HttpHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Http
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        send_request(&self.client, ctx, node, "url", "body").await
    }
}

/// Outbound webhook block. POST by default; the payload defaults to the
/// node's assembled input when none is configured.
pub struct WebhookHandler {
    client: Client,
}

impl WebhookHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockHandler for WebhookHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Webhook
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<Value> {
        let mut node = node.clone();
        if !node.config.contains_key("method") {
            node.config
                .insert("method".to_string(), Value::String("POST".to_string()));
        }
        if !node.config.contains_key("payload") {
            node.config.insert("payload".to_string(), input.clone());
        }
        let result = send_request(&self.client, ctx, &node, "url", "payload").await?;
        Ok(json!({
            "status": result["status"],
            "body": result["body"],
        }))
    }
}
