//! Template rendering over JSON values
//!
//! Replaces `{{dotted.path}}` expressions against an input map. Strings get
//! every placeholder substituted with the stringified lookup; arrays and
//! objects recurse; other scalars pass through untouched. Unresolved paths
//! stay literal so a downstream consumer can see what was missing. The engine
//! is pure: rendering twice with the same inputs is a fixpoint.

use serde_json::{Map, Value};

/// Render a value against an input map.
pub fn render(value: &Value, inputs: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, inputs)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, inputs)).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(v, inputs));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Render every `{{path}}` occurrence in one string.
pub fn render_str(template: &str, inputs: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(end_rel) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + end_rel;
        let path = rest[start + 2..end].trim();
        out.push_str(&rest[..start]);
        match lookup(inputs, path) {
            Some(value) => out.push_str(&stringify(value)),
            // Unresolved paths remain literal
            None => out.push_str(&rest[start..end + 2]),
        }
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Dotted-path lookup into a JSON value. Array segments accept numeric
/// indices (`items.0.name`).
pub fn lookup<'a>(inputs: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = inputs;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Stringify a looked-up value for substitution into a string template.
/// Strings embed bare; everything else uses its compact JSON form.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
