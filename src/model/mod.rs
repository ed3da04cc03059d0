//! Engine data model: block types and schemas, workflow graphs, execution rows

pub mod block;
pub mod execution;
pub mod workflow;

pub use block::{BlockSchema, BlockType, FieldSpec, ValueType};
pub use execution::{
    ErrorInfo, Execution, ExecutionId, ExecutionStatus, LogEvent, LogLevel, NodeExecution,
    NodeExecutionId, NodeExecutionStatus, TriggerSource,
};
pub use workflow::{Edge, Node, NodeId, Workflow, WorkflowId, DEFAULT_HANDLE};
