// src/adapter/memory.rs
use super::{QueryOptions, SortOrder, StorageAdapter};
use crate::error::ParseError;
use crate::schema::{
    ClassLevelPermissions, FieldSchema, FieldType, IndexFieldType, Indexes, ParseSchema,
    SchemaFields,
};
use crate::types::JsonObject;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct Tables {
    schemas: BTreeMap<String, ParseSchema>,
    objects: HashMap<String, Vec<JsonObject>>,
}

/// A storage adapter keeping every class in process memory.
///
/// Supports the query operators `$eq $ne $in $nin $exists $gt $gte $lt $lte $all
/// $regex $or $and $nor`, dotted keys, the update operators `Delete Increment Add
/// AddUnique Remove`, and unique `username`/`email` on `_User`.
#[derive(Debug, Default)]
pub struct InMemoryStorageAdapter {
    tables: RwLock<Tables>,
    deleted_classes: Mutex<Vec<String>>,
}

const UNIQUE_USER_FIELDS: &[&str] = &["username", "email"];

impl InMemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every class dropped through `delete_class`, in call order.
    pub fn deleted_classes(&self) -> Vec<String> {
        self.deleted_classes.lock().clone()
    }

    fn filter_rows(
        &self,
        class_name: &str,
        query: &JsonObject,
    ) -> Result<Vec<JsonObject>, ParseError> {
        let tables = self.tables.read();
        let mut rows = Vec::new();
        for row in tables.objects.get(class_name).into_iter().flatten() {
            if matches_query(row, query)? {
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }
}

fn duplicate(field: &str) -> ParseError {
    ParseError::DuplicateValue {
        message: "A duplicate value for a field with unique values was provided".to_string(),
        duplicated_field: Some(field.to_string()),
    }
}

/// Checks `candidate` against every other row of the class.
fn check_unique(
    class_name: &str,
    rows: &[JsonObject],
    candidate: &JsonObject,
    skip_index: Option<usize>,
) -> Result<(), ParseError> {
    let mut unique_fields = vec!["objectId"];
    if class_name == "_User" {
        unique_fields.extend_from_slice(UNIQUE_USER_FIELDS);
    }
    for field in unique_fields {
        let Some(value) = candidate.get(field).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = rows
            .iter()
            .enumerate()
            .any(|(i, row)| Some(i) != skip_index && row.get(field) == Some(value));
        if clash {
            return Err(duplicate(field));
        }
    }
    Ok(())
}

#[async_trait]
impl StorageAdapter for InMemoryStorageAdapter {
    async fn get_class(&self, class_name: &str) -> Result<Option<ParseSchema>, ParseError> {
        Ok(self.tables.read().schemas.get(class_name).cloned())
    }

    async fn get_all_classes(&self) -> Result<Vec<ParseSchema>, ParseError> {
        Ok(self.tables.read().schemas.values().cloned().collect())
    }

    async fn create_class(
        &self,
        class_name: &str,
        schema: &ParseSchema,
    ) -> Result<ParseSchema, ParseError> {
        let mut tables = self.tables.write();
        if tables.schemas.contains_key(class_name) {
            return Err(ParseError::DuplicateValue {
                message: "Class already exists.".to_string(),
                duplicated_field: None,
            });
        }
        let mut stored = schema.clone();
        stored.class_name = class_name.to_string();
        tables.schemas.insert(class_name.to_string(), stored.clone());
        log::debug!("in-memory adapter created class {}", class_name);
        Ok(stored)
    }

    async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field: &FieldSchema,
    ) -> Result<(), ParseError> {
        let mut tables = self.tables.write();
        let schema = tables
            .schemas
            .entry(class_name.to_string())
            .or_insert_with(|| ParseSchema::new(class_name));
        match schema.fields.get(field_name) {
            Some(existing) if existing.type_matches(field) => Ok(()),
            Some(existing) => Err(ParseError::IncorrectType(format!(
                "schema mismatch for {}.{}; expected {} but got {}",
                class_name, field_name, existing, field
            ))),
            None => {
                if field.field_type == FieldType::GeoPoint {
                    if let Some((existing, _)) = schema
                        .fields
                        .iter()
                        .find(|(_, f)| f.field_type == FieldType::GeoPoint)
                    {
                        return Err(ParseError::IncorrectType(format!(
                            "currently, only one GeoPoint field may exist in an object. Adding {} when {} already exists.",
                            field_name, existing
                        )));
                    }
                }
                schema.fields.insert(field_name.to_string(), field.clone());
                Ok(())
            }
        }
    }

    async fn delete_fields(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        field_names: &[String],
    ) -> Result<(), ParseError> {
        let mut tables = self.tables.write();
        if let Some(schema) = tables.schemas.get_mut(class_name) {
            for name in field_names {
                schema.fields.remove(name);
            }
        }
        if let Some(rows) = tables.objects.get_mut(class_name) {
            for row in rows.iter_mut() {
                for name in field_names {
                    row.remove(name);
                }
            }
        }
        Ok(())
    }

    async fn delete_class(&self, class_name: &str) -> Result<(), ParseError> {
        {
            let mut tables = self.tables.write();
            tables.schemas.remove(class_name);
            tables.objects.remove(class_name);
        }
        self.deleted_classes.lock().push(class_name.to_string());
        log::debug!("in-memory adapter dropped class {}", class_name);
        Ok(())
    }

    async fn set_class_level_permissions(
        &self,
        class_name: &str,
        clp: &ClassLevelPermissions,
    ) -> Result<(), ParseError> {
        let mut tables = self.tables.write();
        let schema = tables.schemas.get_mut(class_name).ok_or_else(|| {
            ParseError::ObjectNotFound(format!("Class {} does not exist.", class_name))
        })?;
        schema.class_level_permissions = clp.clone();
        Ok(())
    }

    async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        submitted: &Indexes,
        existing: &Indexes,
        fields: &SchemaFields,
    ) -> Result<(), ParseError> {
        let mut indexes = existing.clone();
        if indexes.is_empty() {
            indexes.insert(
                "_id_".to_string(),
                [("_id".to_string(), IndexFieldType::SortOrder(1))]
                    .into_iter()
                    .collect(),
            );
        }
        for (name, index) in submitted {
            let is_delete = index.get("__op") == Some(&IndexFieldType::Text("Delete".to_string()));
            if indexes.contains_key(name) && !is_delete {
                return Err(ParseError::InvalidQuery(format!(
                    "Index {} exists, cannot update.",
                    name
                )));
            }
            if !indexes.contains_key(name) && is_delete {
                return Err(ParseError::InvalidQuery(format!(
                    "Index {} does not exist, cannot delete.",
                    name
                )));
            }
            if is_delete {
                indexes.remove(name);
                continue;
            }
            if let Some(missing) = index.keys().find(|key| !fields.contains_key(*key)) {
                return Err(ParseError::InvalidQuery(format!(
                    "Field {} does not exist, cannot add index.",
                    missing
                )));
            }
            indexes.insert(name.clone(), index.clone());
        }
        let mut tables = self.tables.write();
        let schema = tables
            .schemas
            .entry(class_name.to_string())
            .or_insert_with(|| ParseSchema::new(class_name));
        schema.indexes = Some(indexes);
        Ok(())
    }

    async fn create_object(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        object: JsonObject,
    ) -> Result<JsonObject, ParseError> {
        let mut tables = self.tables.write();
        let rows = tables.objects.entry(class_name.to_string()).or_default();
        check_unique(class_name, rows, &object, None)?;
        rows.push(object.clone());
        Ok(object)
    }

    async fn find(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        query: &JsonObject,
        options: &QueryOptions,
    ) -> Result<Vec<JsonObject>, ParseError> {
        let mut rows = self.filter_rows(class_name, query)?;
        if !options.sort.is_empty() {
            rows.sort_by(|a, b| {
                for (key, order) in &options.sort {
                    let ordering = match order {
                        SortOrder::Ascending => sort_cmp(lookup(a, key), lookup(b, key)),
                        SortOrder::Descending => sort_cmp(lookup(b, key), lookup(a, key)),
                        SortOrder::TextScore => Ordering::Equal,
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }
        let skip = options.skip.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        let rows = rows.into_iter().skip(skip).take(limit);
        Ok(match &options.keys {
            Some(keys) => rows.map(|row| project(row, keys)).collect(),
            None => rows.collect(),
        })
    }

    async fn count(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        query: &JsonObject,
    ) -> Result<u64, ParseError> {
        Ok(self.filter_rows(class_name, query)?.len() as u64)
    }

    async fn distinct(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        query: &JsonObject,
        field_name: &str,
    ) -> Result<Vec<Value>, ParseError> {
        let mut values: Vec<Value> = Vec::new();
        for row in self.filter_rows(class_name, query)? {
            let found = match lookup(&row, field_name) {
                Some(Value::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };
            for value in found {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }

    async fn aggregate(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, ParseError> {
        let mut rows = self.filter_rows(class_name, &Map::new())?;
        for stage in pipeline {
            let (name, arg) = stage
                .as_object()
                .filter(|s| s.len() == 1)
                .and_then(|s| s.iter().next())
                .ok_or_else(|| {
                    ParseError::InvalidQuery(format!("Invalid pipeline stage: {}", stage))
                })?;
            rows = match name.as_str() {
                "$match" => {
                    let query = arg.as_object().ok_or_else(|| {
                        ParseError::InvalidQuery("$match expects an object".to_string())
                    })?;
                    let mut kept = Vec::new();
                    for row in rows {
                        if matches_query(&row, query)? {
                            kept.push(row);
                        }
                    }
                    kept
                }
                "$sort" => {
                    let sort_keys: Vec<(String, bool)> = arg
                        .as_object()
                        .into_iter()
                        .flatten()
                        .map(|(k, v)| (k.clone(), v.as_i64() != Some(-1)))
                        .collect();
                    rows.sort_by(|a, b| {
                        for (key, ascending) in &sort_keys {
                            let ordering = sort_cmp(lookup(a, key), lookup(b, key));
                            let ordering = if *ascending { ordering } else { ordering.reverse() };
                            if ordering != Ordering::Equal {
                                return ordering;
                            }
                        }
                        Ordering::Equal
                    });
                    rows
                }
                "$skip" => rows
                    .into_iter()
                    .skip(arg.as_u64().unwrap_or(0) as usize)
                    .collect(),
                "$limit" => rows
                    .into_iter()
                    .take(arg.as_u64().unwrap_or(u64::MAX) as usize)
                    .collect(),
                "$project" => {
                    let keys: Vec<String> = arg
                        .as_object()
                        .into_iter()
                        .flatten()
                        .filter(|(_, v)| v.as_i64() == Some(1) || v.as_bool() == Some(true))
                        .map(|(k, _)| k.clone())
                        .collect();
                    rows.into_iter().map(|row| project(row, &keys)).collect()
                }
                "$count" => {
                    let name = arg.as_str().unwrap_or("count");
                    let mut counted = Map::new();
                    counted.insert(name.to_string(), Value::from(rows.len() as u64));
                    vec![counted]
                }
                other => {
                    return Err(ParseError::InvalidQuery(format!(
                        "Unsupported pipeline stage: {}",
                        other
                    )))
                }
            };
        }
        Ok(rows.into_iter().map(Value::Object).collect())
    }

    async fn find_one_and_update(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        query: &JsonObject,
        update: &JsonObject,
    ) -> Result<Option<JsonObject>, ParseError> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.objects.get_mut(class_name) else {
            return Ok(None);
        };
        let mut position = None;
        for (i, row) in rows.iter().enumerate() {
            if matches_query(row, query)? {
                position = Some(i);
                break;
            }
        }
        let Some(index) = position else {
            return Ok(None);
        };
        let mut updated = rows[index].clone();
        apply_update(&mut updated, update)?;
        check_unique(class_name, rows, &updated, Some(index))?;
        rows[index] = updated.clone();
        Ok(Some(updated))
    }

    async fn update_objects_by_query(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        query: &JsonObject,
        update: &JsonObject,
    ) -> Result<u64, ParseError> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.objects.get_mut(class_name) else {
            return Ok(0);
        };
        let mut touched = 0;
        for index in 0..rows.len() {
            if !matches_query(&rows[index], query)? {
                continue;
            }
            let mut updated = rows[index].clone();
            apply_update(&mut updated, update)?;
            check_unique(class_name, rows, &updated, Some(index))?;
            rows[index] = updated;
            touched += 1;
        }
        Ok(touched)
    }

    async fn upsert_one_object(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
        update: &JsonObject,
    ) -> Result<(), ParseError> {
        if self
            .find_one_and_update(class_name, schema, query, update)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut object: JsonObject = query
            .iter()
            .filter(|(k, v)| !k.starts_with('$') && !is_operator_object(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        apply_update(&mut object, update)?;
        let mut tables = self.tables.write();
        let rows = tables.objects.entry(class_name.to_string()).or_default();
        check_unique(class_name, rows, &object, None)?;
        rows.push(object);
        Ok(())
    }

    async fn delete_objects_by_query(
        &self,
        class_name: &str,
        _schema: &ParseSchema,
        query: &JsonObject,
    ) -> Result<u64, ParseError> {
        let mut tables = self.tables.write();
        let rows = tables.objects.entry(class_name.to_string()).or_default();
        let mut doomed = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            doomed.push(matches_query(row, query)?);
        }
        let removed = doomed.iter().filter(|d| **d).count() as u64;
        let mut doomed = doomed.into_iter();
        rows.retain(|_| !doomed.next().unwrap_or(false));
        if removed == 0 {
            return Err(ParseError::ObjectNotFound("Object not found.".to_string()));
        }
        Ok(removed)
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

fn project(row: JsonObject, keys: &[String]) -> JsonObject {
    let wants_acl = keys.iter().any(|k| k == "ACL");
    row.into_iter()
        .filter(|(key, _)| {
            key == "objectId"
                || keys.iter().any(|k| k == key)
                || (wants_acl && (key == "_rperm" || key == "_wperm"))
        })
        .collect()
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.keys().any(|k| k.starts_with('$')))
}

/// Collapses encoded dates and pointers to comparable scalars, and numbers to f64.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(obj) => match obj.get("__type").and_then(Value::as_str) {
            Some("Date") => obj.get("iso").cloned().unwrap_or(Value::Null),
            Some("Pointer") => Value::String(format!(
                "{}${}",
                obj.get("className").and_then(Value::as_str).unwrap_or_default(),
                obj.get("objectId").and_then(Value::as_str).unwrap_or_default()
            )),
            _ => value.clone(),
        },
        Value::Number(n) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn equals(value: Option<&Value>, target: &Value) -> bool {
    if target.is_null() {
        return value.map_or(true, Value::is_null);
    }
    let Some(value) = value else {
        return false;
    };
    let target = normalize(target);
    if let Value::Array(items) = value {
        if !target.is_array() {
            return items.iter().any(|item| normalize(item) == target);
        }
    }
    normalize(value) == target
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (normalize(a), normalize(b)) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(&y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(&y)),
        _ => None,
    }
}

fn sort_rank(value: Option<&Value>) -> u8 {
    match value.map(normalize) {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    sort_rank(a).cmp(&sort_rank(b)).then_with(|| match (a, b) {
        (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    })
}

fn sub_queries<'a>(op: &str, value: &'a Value) -> Result<Vec<&'a JsonObject>, ParseError> {
    value
        .as_array()
        .ok_or_else(|| ParseError::InvalidQuery(format!("Bad {} format - use an array value.", op)))?
        .iter()
        .map(|q| {
            q.as_object().ok_or_else(|| {
                ParseError::InvalidQuery(format!("Bad {} format - use an array of objects.", op))
            })
        })
        .collect()
}

fn matches_query(object: &JsonObject, query: &JsonObject) -> Result<bool, ParseError> {
    for (key, constraint) in query {
        let matched = match key.as_str() {
            "$or" => {
                let mut any = false;
                for sub in sub_queries(key, constraint)? {
                    if matches_query(object, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$and" => {
                let mut all = true;
                for sub in sub_queries(key, constraint)? {
                    if !matches_query(object, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$nor" => {
                let mut none = true;
                for sub in sub_queries(key, constraint)? {
                    if matches_query(object, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            _ => matches_constraint(lookup(object, key), constraint)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operand_array<'a>(op: &str, value: &'a Value) -> Result<&'a Vec<Value>, ParseError> {
    value
        .as_array()
        .ok_or_else(|| ParseError::InvalidQuery(format!("bad {} value", op)))
}

fn matches_constraint(value: Option<&Value>, constraint: &Value) -> Result<bool, ParseError> {
    let Some(ops) = constraint.as_object().filter(|_| is_operator_object(constraint)) else {
        return Ok(equals(value, constraint));
    };
    for (op, arg) in ops {
        let matched = match op.as_str() {
            "$eq" => equals(value, arg),
            "$ne" => !equals(value, arg),
            "$in" => operand_array(op, arg)?.iter().any(|t| equals(value, t)),
            "$nin" => !operand_array(op, arg)?.iter().any(|t| equals(value, t)),
            "$exists" => arg.as_bool().unwrap_or(false) == value.is_some(),
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let ordering = value.and_then(|v| compare(v, arg));
                match (op.as_str(), ordering) {
                    (_, None) => false,
                    ("$gt", Some(o)) => o == Ordering::Greater,
                    ("$gte", Some(o)) => o != Ordering::Less,
                    ("$lt", Some(o)) => o == Ordering::Less,
                    (_, Some(o)) => o != Ordering::Greater,
                }
            }
            "$all" => {
                let wanted = operand_array(op, arg)?;
                match value {
                    Some(Value::Array(items)) => wanted.iter().all(|w| {
                        let w = normalize(w);
                        items.iter().any(|item| normalize(item) == w)
                    }),
                    _ => false,
                }
            }
            "$regex" => {
                let pattern = arg
                    .as_str()
                    .ok_or_else(|| ParseError::InvalidQuery("bad $regex value".to_string()))?;
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(options.contains('i'))
                    .multi_line(options.contains('m'))
                    .dot_matches_new_line(options.contains('s'))
                    .ignore_whitespace(options.contains('x'))
                    .build()
                    .map_err(|e| ParseError::InvalidQuery(format!("bad $regex: {}", e)))?;
                value
                    .and_then(Value::as_str)
                    .is_some_and(|s| regex.is_match(s))
            }
            "$options" => true,
            other => {
                return Err(ParseError::InvalidQuery(format!(
                    "bad constraint: {}",
                    other
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn op_objects<'a>(op: &str, value: &'a Value) -> Result<&'a Vec<Value>, ParseError> {
    value
        .get("objects")
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::InvalidJson(format!("{} requires an objects array", op)))
}

fn apply_update(object: &mut JsonObject, update: &JsonObject) -> Result<(), ParseError> {
    for (key, value) in update {
        let Some(op) = value.get("__op").and_then(Value::as_str) else {
            set_path(object, key, value.clone());
            continue;
        };
        let current_array = || match lookup(object, key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        match op {
            "Delete" => remove_path(object, key),
            "Increment" => {
                let amount = value.get("amount").and_then(Value::as_f64).ok_or_else(|| {
                    ParseError::InvalidJson("Increment requires a numeric amount".to_string())
                })?;
                let current = lookup(object, key).and_then(Value::as_f64).unwrap_or(0.0);
                set_path(object, key, number_value(current + amount));
            }
            "Add" => {
                let mut items = current_array();
                items.extend(op_objects(op, value)?.iter().cloned());
                set_path(object, key, Value::Array(items));
            }
            "AddUnique" => {
                let mut items = current_array();
                for candidate in op_objects(op, value)? {
                    let normalized = normalize(candidate);
                    if !items.iter().any(|i| normalize(i) == normalized) {
                        items.push(candidate.clone());
                    }
                }
                set_path(object, key, Value::Array(items));
            }
            "Remove" => {
                let removed: Vec<Value> = op_objects(op, value)?.iter().map(normalize).collect();
                let items: Vec<Value> = current_array()
                    .into_iter()
                    .filter(|i| !removed.contains(&normalize(i)))
                    .collect();
                set_path(object, key, Value::Array(items));
            }
            other => {
                return Err(ParseError::InvalidJson(format!(
                    "unsupported update operator: {}",
                    other
                )))
            }
        }
    }
    Ok(())
}
