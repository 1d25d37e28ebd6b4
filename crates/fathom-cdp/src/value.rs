//! Printable rendering of CDP remote objects.
//!
//! A remote object arrives as `{type, subtype?, value?, description?,
//! objectId?, preview?}`. Rendering rules, in order: undefined; quoted
//! strings; canonical numbers and booleans; null; the runtime's own
//! `description`; a synthesized preview; the bare type name.

use serde_json::Value;

pub fn render(remote: &Value) -> String {
    let type_name = remote.get("type").and_then(Value::as_str).unwrap_or("");

    match type_name {
        "undefined" => return "undefined".to_string(),
        "string" => {
            if let Some(s) = remote.get("value").and_then(Value::as_str) {
                return serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""));
            }
        }
        "number" | "boolean" => {
            if let Some(value) = remote.get("value") {
                if !value.is_null() {
                    return value.to_string();
                }
            }
        }
        _ => {}
    }

    if remote.get("subtype").and_then(Value::as_str) == Some("null") {
        return "null".to_string();
    }
    if let Some(description) = remote.get("description").and_then(Value::as_str) {
        return description.to_string();
    }
    if let Some(preview) = remote.get("preview") {
        return render_preview(preview);
    }
    type_name.to_string()
}

/// Whether the remote object is worth expanding: it has an `objectId` and is
/// an object or array.
pub fn is_expandable(remote: &Value) -> bool {
    remote.get("objectId").is_some()
        && (remote.get("type").and_then(Value::as_str) == Some("object")
            || remote.get("subtype").and_then(Value::as_str) == Some("array"))
}

fn render_preview(preview: &Value) -> String {
    if let Some(properties) = preview.get("properties").and_then(Value::as_array) {
        let is_array = preview.get("subtype").and_then(Value::as_str) == Some("array");
        let overflow = preview
            .get("overflow")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut parts: Vec<String> = properties
            .iter()
            .map(|property| {
                let value = property
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or("…");
                if is_array {
                    value.to_string()
                } else {
                    let name = property
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("?");
                    format!("{name}: {value}")
                }
            })
            .collect();
        if overflow {
            parts.push("…".to_string());
        }

        return if is_array {
            format!("[{}]", parts.join(", "))
        } else {
            format!("{{{}}}", parts.join(", "))
        };
    }

    preview
        .get("description")
        .and_then(Value::as_str)
        .or_else(|| preview.get("type").and_then(Value::as_str))
        .unwrap_or("object")
        .to_string()
}
