//! Database query block

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::{require_str, with_cancel, QueryExecutor};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Runs a parameterized query through the injected executor and returns the
/// rows.
pub struct DatabaseHandler {
    executor: Arc<dyn QueryExecutor>,
}

impl DatabaseHandler {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl BlockHandler for DatabaseHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Database
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let statement = require_str(node, "query")?;
        let parameters: Vec<Value> = node
            .config
            .get("parameters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let rows = with_cancel(ctx, self.executor.query(&statement, &parameters)).await?;
        let count = rows.as_array().map(|r| r.len()).unwrap_or(0);

        Ok(json!({
            "rows": rows,
            "rowCount": count,
        }))
    }
}

/// Placeholder executor until a deployment injects a real one.
pub struct DisconnectedDatabase;

#[async_trait]
impl QueryExecutor for DisconnectedDatabase {
    async fn query(&self, _statement: &str, _parameters: &[Value]) -> EngineResult<Value> {
        Err(EngineError::Execution(
            "no database connection configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancelSignal, ExecutionLogger};
    use crate::events::EventBus;
    use crate::model::ExecutionId;
    use crate::state::{SharedGateway, SledGateway};

    struct FixtureDb;

    #[async_trait]
    impl QueryExecutor for FixtureDb {
        async fn query(&self, statement: &str, parameters: &[Value]) -> EngineResult<Value> {
            assert!(statement.contains("select"));
            assert_eq!(parameters.len(), 1);
            Ok(json!([{"id": 1}, {"id": 2}]))
        }
    }

    fn ctx() -> ExecutionContext {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let execution_id = ExecutionId::new();
        let logger = ExecutionLogger::new(gateway, EventBus::default(), execution_id);
        ExecutionContext::new(
            execution_id,
            crate::model::WorkflowId::new(),
            CancelSignal::inert(),
            logger,
            json!({}),
        )
    }

    #[tokio::test]
    async fn returns_rows_and_count() {
        let node: Node = serde_json::from_value(json!({
            "id": "db",
            "blockType": "DATABASE",
            "config": {"query": "select * from orders where id = $1", "parameters": [7]},
        }))
        .unwrap();
        let out = DatabaseHandler::new(Arc::new(FixtureDb))
            .execute(&node, &ctx(), &json!({}))
            .await
            .unwrap();
        assert_eq!(out["rowCount"], json!(2));
    }
}
