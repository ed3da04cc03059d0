//! Block types and their declared schemas

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed enumeration of block types.
///
/// Serialized names match the wire format the authoring UI produces
/// (`LLM_PROMPT`, `BLOCKCHAIN_READ`, ...). Unrecognized names deserialize to
/// [`BlockType::Unknown`], whose handler fails with a config error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    Http,
    Email,
    Database,
    Webhook,
    Notification,
    Discord,
    Schedule,
    Delay,
    Condition,
    Transform,
    LlmPrompt,
    PriceMonitor,
    BlockchainRead,
    BlockchainTransaction,
    Calculator,
    Custom,
    #[serde(other)]
    Unknown,
}

impl BlockType {
    /// Block types permitted as terminal (out-degree zero) nodes.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            BlockType::Email
                | BlockType::Notification
                | BlockType::Database
                | BlockType::Discord
                | BlockType::Webhook
                | BlockType::BlockchainTransaction
        )
    }

    /// Declared schema for this block type.
    pub fn schema(&self) -> BlockSchema {
        match self {
            BlockType::Http => BlockSchema::new()
                .config_required("url", ValueType::String)
                .config("method", ValueType::String)
                .config("headers", ValueType::Object)
                .config("body", ValueType::Any)
                .output("status", ValueType::Number)
                .output("body", ValueType::Any)
                .output("headers", ValueType::Object),
            BlockType::Email => BlockSchema::new()
                .config_required("to", ValueType::String)
                .config_required("subject", ValueType::String)
                .config("body", ValueType::String)
                .output("delivered", ValueType::Boolean)
                .output("messageId", ValueType::String),
            BlockType::Database => BlockSchema::new()
                .config_required("query", ValueType::String)
                .config("parameters", ValueType::Array)
                .output("rows", ValueType::Array)
                .output("rowCount", ValueType::Number),
            BlockType::Webhook => BlockSchema::new()
                .config_required("url", ValueType::String)
                .config("method", ValueType::String)
                .config("headers", ValueType::Object)
                .config("payload", ValueType::Any)
                .output("status", ValueType::Number)
                .output("body", ValueType::Any),
            BlockType::Notification => BlockSchema::new()
                .config_required("title", ValueType::String)
                .config("message", ValueType::String)
                .config("channel", ValueType::String)
                .output("delivered", ValueType::Boolean),
            BlockType::Discord => BlockSchema::new()
                .config_required("webhookUrl", ValueType::String)
                .config_required("content", ValueType::String)
                .config("username", ValueType::String)
                .output("delivered", ValueType::Boolean),
            BlockType::Schedule => BlockSchema::new()
                .config_required("cron", ValueType::String)
                .output("firedAt", ValueType::String),
            BlockType::Delay => BlockSchema::new()
                .config_required("durationMs", ValueType::Number)
                .output("waitedMs", ValueType::Number),
            BlockType::Condition => BlockSchema::new()
                .config_required("expression", ValueType::String)
                .output("result", ValueType::Boolean)
                .output("route", ValueType::String),
            BlockType::Transform => BlockSchema::new()
                .config_required("template", ValueType::Any)
                .output("value", ValueType::Any),
            BlockType::LlmPrompt => BlockSchema::new()
                .config_required("prompt", ValueType::String)
                .config("model", ValueType::String)
                .config("maxTokens", ValueType::Number)
                .output("completion", ValueType::String)
                .output("model", ValueType::String),
            BlockType::PriceMonitor => BlockSchema::new()
                .config_required("asset", ValueType::String)
                .config("currency", ValueType::String)
                .output("price", ValueType::Number)
                .output("asset", ValueType::String),
            BlockType::BlockchainRead => BlockSchema::new()
                .config_required("chainId", ValueType::Number)
                .config_required("method", ValueType::String)
                .config("params", ValueType::Array)
                .output("result", ValueType::Any),
            BlockType::BlockchainTransaction => BlockSchema::new()
                .config_required("chainId", ValueType::Number)
                .config_required("from", ValueType::String)
                .config_required("to", ValueType::String)
                .config("value", ValueType::String)
                .config("data", ValueType::String)
                .output("txHash", ValueType::String)
                .output("status", ValueType::String),
            BlockType::Calculator => BlockSchema::new()
                .config_required("operation", ValueType::String)
                .config_required("inputs", ValueType::Object)
                .output("result", ValueType::Number),
            BlockType::Custom => BlockSchema::new()
                .config_required("kind", ValueType::String)
                .config_required("code", ValueType::String)
                .config("inputs", ValueType::Array)
                .config("outputs", ValueType::Array),
            BlockType::Unknown => BlockSchema::new(),
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde wire name
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Field value types understood by schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    String,
    Boolean,
    Object,
    Array,
    Any,
}

impl ValueType {
    /// Whether a JSON value satisfies this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Number => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
            ValueType::Any => true,
        }
    }
}

/// One declared input, output, or configuration field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub required: bool,
}

/// Declared inputs, outputs, and configuration options of a block type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockSchema {
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
    pub config: Vec<FieldSpec>,
}

impl BlockSchema {
    pub fn new() -> Self {
        Self::default()
    }

    fn field(name: &str, ty: ValueType, required: bool) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            ty,
            required,
        }
    }

    pub fn input(mut self, name: &str, ty: ValueType) -> Self {
        self.inputs.push(Self::field(name, ty, false));
        self
    }

    pub fn input_required(mut self, name: &str, ty: ValueType) -> Self {
        self.inputs.push(Self::field(name, ty, true));
        self
    }

    pub fn output(mut self, name: &str, ty: ValueType) -> Self {
        self.outputs.push(Self::field(name, ty, false));
        self
    }

    pub fn config(mut self, name: &str, ty: ValueType) -> Self {
        self.config.push(Self::field(name, ty, false));
        self
    }

    pub fn config_required(mut self, name: &str, ty: ValueType) -> Self {
        self.config.push(Self::field(name, ty, true));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_authoring_format() {
        assert_eq!(
            serde_json::to_string(&BlockType::LlmPrompt).unwrap(),
            "\"LLM_PROMPT\""
        );
        assert_eq!(
            serde_json::to_string(&BlockType::BlockchainTransaction).unwrap(),
            "\"BLOCKCHAIN_TRANSACTION\""
        );
    }

    #[test]
    fn unrecognized_type_becomes_unknown() {
        let ty: BlockType = serde_json::from_str("\"TELEPORT\"").unwrap();
        assert_eq!(ty, BlockType::Unknown);
    }

    #[test]
    fn action_set_matches_terminal_rule() {
        assert!(BlockType::Email.is_action());
        assert!(BlockType::BlockchainTransaction.is_action());
        assert!(!BlockType::Http.is_action());
        assert!(!BlockType::Calculator.is_action());
    }

    #[test]
    fn value_types_accept_matching_json() {
        assert!(ValueType::Number.accepts(&serde_json::json!(4)));
        assert!(!ValueType::Number.accepts(&serde_json::json!("4")));
        assert!(ValueType::Any.accepts(&serde_json::json!(null)));
    }
}
