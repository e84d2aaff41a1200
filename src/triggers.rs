// src/triggers.rs
//
// Cloud code hooks. Handlers are registered on a `TriggerRegistry` at startup and
// handed to the engines through `Config`; the engines only invoke them.

use crate::error::ParseError;
use crate::types::JsonObject;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerType {
    BeforeSave,
    AfterSave,
    AfterFind,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerType::BeforeSave => "beforeSave",
            TriggerType::AfterSave => "afterSave",
            TriggerType::AfterFind => "afterFind",
        })
    }
}

/// What a trigger gets to see.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequest {
    pub trigger_type: TriggerType,
    pub class_name: String,
    /// The object as it will be (beforeSave) or was (afterSave) saved.
    pub object: Option<JsonObject>,
    /// The stored object before this write; `None` on create.
    pub original: Option<JsonObject>,
    /// afterFind results.
    pub objects: Vec<JsonObject>,
    pub master: bool,
    pub user: Option<JsonObject>,
    pub installation_id: Option<String>,
}

impl TriggerRequest {
    pub fn new(trigger_type: TriggerType, class_name: impl Into<String>) -> Self {
        TriggerRequest {
            trigger_type,
            class_name: class_name.into(),
            object: None,
            original: None,
            objects: Vec::new(),
            master: false,
            user: None,
            installation_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerResult {
    /// Keep the object(s) as they were handed in.
    Unchanged,
    /// beforeSave: the object to save instead.
    Object(JsonObject),
    /// afterFind: the results to return instead.
    Objects(Vec<JsonObject>),
}

#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn run(&self, request: TriggerRequest) -> Result<TriggerResult, ParseError>;
}

#[async_trait]
impl<F, Fut> TriggerHandler for F
where
    F: Fn(TriggerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TriggerResult, ParseError>> + Send + 'static,
{
    async fn run(&self, request: TriggerRequest) -> Result<TriggerResult, ParseError> {
        (self)(request).await
    }
}

/// Handlers by (trigger type, class name).
#[derive(Default)]
pub struct TriggerRegistry {
    handlers: RwLock<HashMap<(TriggerType, String), Arc<dyn TriggerHandler>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, replacing any previous one for the same trigger and class.
    pub fn register(
        &self,
        trigger_type: TriggerType,
        class_name: impl Into<String>,
        handler: impl TriggerHandler + 'static,
    ) {
        self.handlers
            .write()
            .insert((trigger_type, class_name.into()), Arc::new(handler));
    }

    pub fn remove(&self, trigger_type: TriggerType, class_name: &str) {
        self.handlers
            .write()
            .remove(&(trigger_type, class_name.to_string()));
    }

    pub fn exists(&self, trigger_type: TriggerType, class_name: &str) -> bool {
        self.handlers
            .read()
            .contains_key(&(trigger_type, class_name.to_string()))
    }

    /// Runs the handler for the request's trigger and class, if any.
    pub async fn run(&self, request: TriggerRequest) -> Result<TriggerResult, ParseError> {
        let handler = self
            .handlers
            .read()
            .get(&(request.trigger_type, request.class_name.clone()))
            .cloned();
        match handler {
            Some(handler) => {
                log::debug!("Running {} trigger for {}", request.trigger_type, request.class_name);
                handler.run(request).await
            }
            None => Ok(TriggerResult::Unchanged),
        }
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .handlers
            .read()
            .keys()
            .map(|(t, c)| format!("{}:{}", t, c))
            .collect();
        f.debug_struct("TriggerRegistry").field("handlers", &keys).finish()
    }
}

/// Receives saved objects for live query subscribers.
#[async_trait]
pub trait LiveQueryNotifier: Send + Sync {
    fn has_live_query(&self, class_name: &str) -> bool;

    async fn on_after_save(
        &self,
        class_name: &str,
        object: &JsonObject,
        original: Option<&JsonObject>,
    );
}

/// Applies the REST `data` of a write on top of `original`, the way a client-side
/// object would look after `set`ting it. Operators are evaluated locally.
pub fn inflate(original: &JsonObject, data: &JsonObject) -> JsonObject {
    let mut object = original.clone();
    for (key, value) in data {
        let current = lookup(&object, key).cloned();
        match apply_op(current, value) {
            Some(next) => set_path(&mut object, key, next),
            None => remove_path(&mut object, key),
        }
    }
    object
}

fn apply_op(current: Option<Value>, value: &Value) -> Option<Value> {
    let Some(op) = value.get("__op").and_then(Value::as_str) else {
        return Some(value.clone());
    };
    let objects = || -> Vec<Value> {
        value
            .get("objects")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let items = || match &current {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    match op {
        "Delete" => None,
        "Increment" => {
            let base = current.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
            let amount = value.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
            let sum = base + amount;
            Some(if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
                json!(sum as i64)
            } else {
                json!(sum)
            })
        }
        "Add" => {
            let mut items = items();
            items.extend(objects());
            Some(Value::Array(items))
        }
        "AddUnique" => {
            let mut items = items();
            for candidate in objects() {
                if !items.contains(&candidate) {
                    items.push(candidate);
                }
            }
            Some(Value::Array(items))
        }
        "Remove" => {
            let removed = objects();
            Some(Value::Array(
                items().into_iter().filter(|i| !removed.contains(i)).collect(),
            ))
        }
        "AddRelation" | "RemoveRelation" => {
            let target = value
                .get("objects")
                .and_then(Value::as_array)
                .and_then(|o| o.first())
                .and_then(|p| p.get("className"))
                .cloned()
                .unwrap_or(Value::Null);
            Some(json!({ "__type": "Relation", "className": target }))
        }
        "Batch" => {
            let mut result = current;
            for sub in value.get("ops").and_then(Value::as_array).into_iter().flatten() {
                result = apply_op(result, sub);
            }
            result
        }
        _ => Some(value.clone()),
    }
}

fn lookup<'a>(object: &'a JsonObject, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = object.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_path(object: &mut JsonObject, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else { return };
    let mut current = object;
    for part in parts {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else { return };
        current = next;
    }
    current.insert(last.to_string(), value);
}

fn remove_path(object: &mut JsonObject, path: &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else { return };
    let mut current = object;
    for part in parts {
        match current.get_mut(part) {
            Some(Value::Object(next)) => current = next,
            _ => return,
        }
    }
    current.remove(last);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_inflate_applies_ops() {
        let original = obj(json!({"score": 1, "tags": ["a"], "gone": true, "meta": {"x": 1}}));
        let data = obj(json!({
            "score": {"__op": "Increment", "amount": 2},
            "tags": {"__op": "AddUnique", "objects": ["a", "b"]},
            "gone": {"__op": "Delete"},
            "meta.y": 2
        }));
        assert_eq!(
            inflate(&original, &data),
            obj(json!({"score": 3, "tags": ["a", "b"], "meta": {"x": 1, "y": 2}}))
        );
    }

    #[tokio::test]
    async fn test_registry_runs_closures() {
        let registry = TriggerRegistry::new();
        assert!(!registry.exists(TriggerType::BeforeSave, "Post"));
        registry.register(TriggerType::BeforeSave, "Post", |req: TriggerRequest| async move {
            let mut object = req.object.unwrap_or_default();
            object.insert("touched".to_string(), json!(true));
            Ok::<_, ParseError>(TriggerResult::Object(object))
        });
        assert!(registry.exists(TriggerType::BeforeSave, "Post"));

        let mut request = TriggerRequest::new(TriggerType::BeforeSave, "Post");
        request.object = Some(obj(json!({"title": "a"})));
        let result = registry.run(request).await.unwrap();
        assert_eq!(
            result,
            TriggerResult::Object(obj(json!({"title": "a", "touched": true})))
        );

        let untouched = registry
            .run(TriggerRequest::new(TriggerType::AfterSave, "Post"))
            .await
            .unwrap();
        assert_eq!(untouched, TriggerResult::Unchanged);
    }
}
