//! Sandboxed evaluation for CUSTOM blocks
//!
//! User-supplied logic runs in a closed AST interpreter: arithmetic, strings,
//! `Math`/`JSON`/`Date` helpers, and logging routed to the execution logger.
//! No filesystem, network, environment, or dynamic code paths exist in the
//! evaluator, so user programs cannot escape the capability set. Evaluation
//! runs on a blocking thread under a hard wall-clock limit.

pub mod expr;

use crate::config::SandboxConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::LogLevel;
use crate::template;
use expr::{parse_expression, parse_script, truthy, Evaluator};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::time::Duration;

/// Declared kind of a custom block's program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomKind {
    Expression,
    Script,
    Template,
    Condition,
}

impl CustomKind {
    pub fn parse(s: &str) -> EngineResult<Self> {
        serde_json::from_value(Value::String(s.to_lowercase()))
            .map_err(|_| EngineError::Config(format!("unknown custom block kind {:?}", s)))
    }
}

/// Result of one sandbox evaluation: the output map plus any log lines the
/// program emitted, replayed onto the execution logger by the caller.
#[derive(Debug)]
pub struct SandboxOutcome {
    pub output: Value,
    pub logs: Vec<(LogLevel, String)>,
}

/// Sandbox entry point.
#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.timeout,
        }
    }

    /// Evaluate a program of the given kind against its inputs. `declared`
    /// is the block's declared-input name set; expression programs may only
    /// reference those.
    pub async fn evaluate(
        &self,
        kind: CustomKind,
        code: &str,
        inputs: &Map<String, Value>,
        declared: &HashSet<String>,
    ) -> EngineResult<SandboxOutcome> {
        let code = code.to_string();
        let inputs = inputs.clone();
        let declared = declared.clone();
        let budget = self.timeout;

        let task = tokio::task::spawn_blocking(move || {
            evaluate_blocking(kind, &code, &inputs, &declared)
        });
        match tokio::time::timeout(budget, task).await {
            Ok(joined) => {
                joined.map_err(|e| EngineError::Internal(format!("sandbox task: {}", e)))?
            }
            Err(_) => Err(EngineError::Timeout(budget)),
        }
    }
}

fn evaluate_blocking(
    kind: CustomKind,
    code: &str,
    inputs: &Map<String, Value>,
    declared: &HashSet<String>,
) -> EngineResult<SandboxOutcome> {
    match kind {
        CustomKind::Expression => {
            let parsed = parse_expression(code)?;
            let mut roots = HashSet::new();
            expr::referenced_roots(&parsed, &mut roots);
            for root in &roots {
                if !declared.contains(root) && !inputs.contains_key(root) {
                    return Err(EngineError::Config(format!(
                        "expression references undeclared input {:?}",
                        root
                    )));
                }
            }
            let mut evaluator = Evaluator::new(inputs);
            let value = evaluator.eval(&parsed)?;
            Ok(SandboxOutcome {
                output: json!({ "result": value }),
                logs: evaluator.logs,
            })
        }
        CustomKind::Script => {
            let statements = parse_script(code)?;
            let mut evaluator = Evaluator::new(inputs);
            let value = evaluator.run_script(&statements)?;
            Ok(SandboxOutcome {
                output: json!({ "result": value }),
                logs: evaluator.logs,
            })
        }
        CustomKind::Condition => {
            let parsed = parse_expression(code)?;
            let mut evaluator = Evaluator::new(inputs);
            let value = evaluator.eval(&parsed)?;
            let Value::Bool(result) = value else {
                return Err(EngineError::Config(format!(
                    "condition must evaluate to a boolean, got {}",
                    value
                )));
            };
            Ok(SandboxOutcome {
                output: json!({
                    "result": result,
                    "route": if result { "true" } else { "false" },
                }),
                logs: evaluator.logs,
            })
        }
        CustomKind::Template => {
            let rendered = render_template(code, inputs)?;
            Ok(SandboxOutcome {
                output: json!({ "result": rendered }),
                logs: Vec::new(),
            })
        }
    }
}

/// Template kind: `{{var}}` substitution plus `{{#if var}}…{{else}}…{{/if}}`
/// conditionals, nested to any depth. Unresolved plain placeholders stay
/// literal, matching the engine-wide template rules.
pub fn render_template(source: &str, inputs: &Map<String, Value>) -> EngineResult<String> {
    let conditionals_applied = apply_conditionals(source, inputs)?;
    let inputs_value = Value::Object(inputs.clone());
    Ok(template::render_str(&conditionals_applied, &inputs_value))
}

fn apply_conditionals(source: &str, inputs: &Map<String, Value>) -> EngineResult<String> {
    const OPEN: &str = "{{#if ";
    const ELSE: &str = "{{else}}";
    const CLOSE: &str = "{{/if}}";

    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let Some(cond_end) = after_open.find("}}") else {
            return Err(EngineError::Config("unterminated {{#if}}".to_string()));
        };
        let condition = after_open[..cond_end].trim();
        let body_start = &after_open[cond_end + 2..];

        // Find the matching {{/if}}, tracking nesting, and a depth-zero {{else}}
        let mut depth = 0usize;
        let mut cursor = 0usize;
        let mut else_at: Option<usize> = None;
        let mut close_at: Option<usize> = None;
        while cursor < body_start.len() {
            if body_start[cursor..].starts_with(OPEN) {
                depth += 1;
                cursor += OPEN.len();
            } else if body_start[cursor..].starts_with(CLOSE) {
                if depth == 0 {
                    close_at = Some(cursor);
                    break;
                }
                depth -= 1;
                cursor += CLOSE.len();
            } else if depth == 0 && body_start[cursor..].starts_with(ELSE) {
                else_at = Some(cursor);
                cursor += ELSE.len();
            } else {
                cursor += 1;
            }
        }
        let Some(close) = close_at else {
            return Err(EngineError::Config("missing {{/if}}".to_string()));
        };

        let (then_branch, else_branch) = match else_at {
            Some(e) => (&body_start[..e], &body_start[e + ELSE.len()..close]),
            None => (&body_start[..close], ""),
        };
        let owner = Value::Object(inputs.clone());
        let taken = template::lookup(&owner, condition)
            .map(truthy)
            .unwrap_or(false);

        let branch = if taken { then_branch } else { else_branch };
        out.push_str(&apply_conditionals(branch, inputs)?);
        rest = &body_start[close + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}
