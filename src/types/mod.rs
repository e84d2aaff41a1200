// src/types/mod.rs

pub mod common;
pub mod date;

pub use common::{ParseRelation, Pointer, RelationOp};
pub use date::ParseDate;

use serde_json::{Map, Value};

/// A REST-format object: field name to wire value.
pub type JsonObject = Map<String, Value>;

/// Loose truthiness of a wire value: missing, `null`, `false`, `0` and `""` are false.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Returns `value` as an object, or an empty one for anything else.
pub fn as_object(value: &Value) -> JsonObject {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(is_truthy(Some(&json!({}))));
        assert!(is_truthy(Some(&json!("x"))));
    }
}
