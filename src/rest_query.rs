// src/rest_query.rs
//
// The read pipeline. A `RestQuery` rewrites a REST where clause into something
// storage can answer (sub-queries become `$in`/`$nin` lists), runs the find and
// count, then inlines `include`d pointers and runs the afterFind trigger.

use crate::auth::Auth;
use crate::config::Config;
use crate::database::{root_field_name, FindOptions};
use crate::error::ParseError;
use crate::schema::{is_system_class, ClpOperation, FieldType};
use crate::triggers::{TriggerRequest, TriggerResult, TriggerType};
use crate::types::{is_truthy, JsonObject, Pointer};
use crate::adapter::SortOrder;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Keys every projection keeps. `ACL` rides along with the timestamps so a
/// client narrowing `keys` can still see who may read and write each object.
const ALWAYS_SELECTED_KEYS: &[&str] = &["objectId", "createdAt", "updatedAt", "ACL"];

const KNOWN_OPTIONS: &[&str] = &[
    "keys",
    "count",
    "includeAll",
    "distinct",
    "pipeline",
    "skip",
    "limit",
    "readPreference",
    "order",
    "include",
    "redirectClassNameForKey",
    "includeReadPreference",
    "subqueryReadPreference",
];

/// REST query options, as sent on the wire.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestOptions {
    /// Comma-separated projection; dotted keys project into included objects.
    pub keys: Option<String>,
    #[serde(default)]
    pub count: bool,
    #[serde(default)]
    pub include_all: bool,
    pub distinct: Option<String>,
    /// Aggregation stages, either an array or an object of stages.
    pub pipeline: Option<Value>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub read_preference: Option<String>,
    /// Comma-separated sort keys, `-` for descending, `$score` for text relevance.
    pub order: Option<String>,
    /// Comma-separated pointer paths to inline, `*` for every pointer field.
    pub include: Option<String>,
    pub redirect_class_name_for_key: Option<String>,
    pub include_read_preference: Option<String>,
    pub subquery_read_preference: Option<String>,
}

impl RestOptions {
    /// Parses options from JSON, rejecting unknown ones with `bad option: <name>`.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let Some(object) = value.as_object() else {
            return Err(ParseError::InvalidJson(
                "query options must be an object".to_string(),
            ));
        };
        if let Some(unknown) = object
            .keys()
            .find(|key| !KNOWN_OPTIONS.contains(&key.as_str()))
        {
            return Err(ParseError::InvalidJson(format!("bad option: {}", unknown)));
        }
        let mut object = object.clone();
        for flag in ["count", "includeAll"] {
            if let Some(value) = object.get(flag).cloned() {
                object.insert(flag.to_string(), Value::Bool(is_truthy(Some(&value))));
            }
        }
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

/// The outcome of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub results: Vec<Value>,
    pub count: Option<u64>,
}

impl QueryResponse {
    /// `{"results": [...], "count": n}`
    pub fn to_value(&self) -> Value {
        let mut body = json!({ "results": self.results });
        if let Some(count) = self.count {
            body["count"] = json!(count);
        }
        body
    }
}

type QueryFuture = Pin<Box<dyn Future<Output = Result<(String, QueryResponse), ParseError>> + Send>>;

pub struct RestQuery {
    config: Arc<Config>,
    auth: Auth,
    class_name: String,
    rest_where: JsonObject,
    rest_options: RestOptions,
    find_options: FindOptions,
    keys: Option<Vec<String>>,
    /// Pointer paths to inline, shortest first.
    include: Vec<Vec<String>>,
    include_all: bool,
    do_count: bool,
    redirect_key: Option<String>,
    redirect_class_name: Option<String>,
    response: Option<QueryResponse>,
}

impl RestQuery {
    pub fn new(
        config: Arc<Config>,
        auth: Auth,
        class_name: impl Into<String>,
        rest_where: JsonObject,
        rest_options: RestOptions,
    ) -> Result<Self, ParseError> {
        let class_name = class_name.into();
        let mut rest_where = rest_where;
        if !auth.is_master && class_name == "_Session" {
            // Clients only ever see their own sessions.
            let Some(user_id) = auth.user_id() else {
                return Err(ParseError::InvalidSessionToken(
                    "Invalid session token".to_string(),
                ));
            };
            let mut own = JsonObject::new();
            own.insert("user".to_string(), Pointer::new("_User", user_id).to_value());
            let mut wrapped = JsonObject::new();
            wrapped.insert(
                "$and".to_string(),
                json!([Value::Object(rest_where), Value::Object(own)]),
            );
            rest_where = wrapped;
        }

        let mut rest_options = rest_options;
        // Selecting `a.b` needs `a` included.
        if let Some(keys) = &rest_options.keys {
            let implied: Vec<&str> = keys
                .split(',')
                .filter_map(|key| key.rfind('.').map(|idx| &key[..idx]))
                .collect();
            if !implied.is_empty() {
                let implied = implied.join(",");
                rest_options.include = Some(match rest_options.include.take() {
                    Some(include) if !include.is_empty() => format!("{},{}", include, implied),
                    _ => implied,
                });
            }
        }

        let mut query = RestQuery {
            config,
            auth,
            class_name,
            rest_where,
            rest_options: rest_options.clone(),
            find_options: FindOptions {
                skip: rest_options.skip,
                limit: rest_options.limit,
                read_preference: rest_options.read_preference.clone(),
                ..FindOptions::default()
            },
            keys: None,
            include: Vec::new(),
            include_all: rest_options.include_all,
            do_count: rest_options.count,
            redirect_key: rest_options.redirect_class_name_for_key.clone(),
            redirect_class_name: None,
            response: None,
        };

        if let Some(keys) = &rest_options.keys {
            let mut selected: Vec<String> = Vec::new();
            for key in keys.split(',').chain(ALWAYS_SELECTED_KEYS.iter().copied()) {
                if !selected.iter().any(|k| k == key) {
                    selected.push(key.to_string());
                }
            }
            query.keys = Some(selected);
        }
        if let Some(order) = &rest_options.order {
            query.find_options.sort = parse_order(order);
        }
        if let Some(include) = &rest_options.include {
            let paths: Vec<&str> = include.split(',').collect();
            if paths.contains(&"*") {
                query.include_all = true;
            } else {
                query.include = expand_include_paths(&paths);
            }
        }
        Ok(query)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The where clause as rewritten so far.
    pub fn rest_where(&self) -> &JsonObject {
        &self.rest_where
    }

    pub fn include_paths(&self) -> &[Vec<String>] {
        &self.include
    }

    pub fn execute(self) -> Pin<Box<dyn Future<Output = Result<QueryResponse, ParseError>> + Send>> {
        let run = self.run(None);
        Box::pin(async move { run.await.map(|(_, response)| response) })
    }

    /// Executes checking the given class-level permission instead of inferring it.
    pub fn execute_with_op(
        self,
        op: ClpOperation,
    ) -> Pin<Box<dyn Future<Output = Result<QueryResponse, ParseError>> + Send>> {
        let run = self.run(Some(op));
        Box::pin(async move { run.await.map(|(_, response)| response) })
    }

    /// Runs every stage, returning the class actually queried (it changes on
    /// a relation redirect) along with the response.
    fn run(mut self, op: Option<ClpOperation>) -> QueryFuture {
        Box::pin(async move {
            self.build_rest_where().await?;
            self.handle_include_all().await?;
            self.run_find(op).await?;
            self.run_count().await?;
            self.handle_include().await?;
            self.run_after_find_trigger().await;
            let response = self.response.take().unwrap_or_default();
            Ok((self.class_name, response))
        })
    }

    /// Resolves the ACL group, relation redirects and every sub-query, leaving a
    /// where clause storage can run directly.
    pub async fn build_rest_where(&mut self) -> Result<(), ParseError> {
        self.find_options.acl = self.auth.acl_group(&self.config).await?;
        self.redirect_class_name_for_key().await?;
        self.validate_client_class_creation().await?;
        self.replace_select("$select", "$in").await?;
        self.replace_select("$dontSelect", "$nin").await?;
        self.replace_in_query("$inQuery", "$in").await?;
        self.replace_in_query("$notInQuery", "$nin").await?;
        self.replace_equality();
        Ok(())
    }

    async fn redirect_class_name_for_key(&mut self) -> Result<(), ParseError> {
        let Some(key) = self.redirect_key.clone() else {
            return Ok(());
        };
        let class_name = self
            .config
            .database
            .redirect_class_name_for_key(&self.class_name, &key)
            .await?;
        self.class_name = class_name.clone();
        self.redirect_class_name = Some(class_name);
        Ok(())
    }

    async fn validate_client_class_creation(&self) -> Result<(), ParseError> {
        if self.config.options.allow_client_class_creation
            || self.auth.is_master
            || is_system_class(&self.class_name)
        {
            return Ok(());
        }
        let schema = self.config.database.load_schema(false).await?;
        if !schema.has_class(&self.class_name).await? {
            return Err(ParseError::OperationForbidden(format!(
                "This user is not allowed to access non-existent class: {}",
                self.class_name
            )));
        }
        Ok(())
    }

    fn subquery_options(&self, redirect_key: Option<&Value>) -> RestOptions {
        let mut options = RestOptions {
            redirect_class_name_for_key: redirect_key.and_then(Value::as_str).map(str::to_string),
            ..RestOptions::default()
        };
        if let Some(preference) = &self.rest_options.subquery_read_preference {
            options.read_preference = Some(preference.clone());
            options.subquery_read_preference = Some(preference.clone());
        }
        options
    }

    /// Replaces `{"$inQuery": {"where": .., "className": ..}}` (or `$notInQuery`) with
    /// an `$in` (`$nin`) list of pointers to the matching objects, until none is left.
    async fn replace_in_query(&mut self, operator: &str, target: &str) -> Result<(), ParseError> {
        loop {
            let mut root = Value::Object(std::mem::take(&mut self.rest_where));
            let Some(path) = find_object_with_key(&root, operator) else {
                self.rest_where = into_object(root);
                return Ok(());
            };
            let value = object_at_mut(&mut root, &path)
                .and_then(|object| object.remove(operator))
                .unwrap_or(Value::Null);
            self.rest_where = into_object(root);

            let (Some(sub_where), Some(sub_class)) = (
                value.get("where").and_then(Value::as_object),
                value.get("className").and_then(Value::as_str),
            ) else {
                return Err(ParseError::InvalidQuery(format!(
                    "improper usage of {}",
                    operator
                )));
            };
            let subquery = RestQuery::new(
                self.config.clone(),
                self.auth.clone(),
                sub_class,
                sub_where.clone(),
                self.subquery_options(value.get("redirectClassNameForKey")),
            )?;
            let (class_name, response) = subquery.run(None).await?;
            let pointers: Vec<Value> = response
                .results
                .iter()
                .filter_map(|result| result.get("objectId").and_then(Value::as_str))
                .map(|id| Pointer::new(class_name.as_str(), id).to_value())
                .collect();

            let mut root = Value::Object(std::mem::take(&mut self.rest_where));
            if let Some(object) = object_at_mut(&mut root, &path) {
                append_values(object, target, pointers);
            }
            self.rest_where = into_object(root);
        }
    }

    /// Replaces `{"$select": {"query": {..}, "key": ..}}` (or `$dontSelect`) with an
    /// `$in` (`$nin`) list of the key's values in the sub-query results.
    async fn replace_select(&mut self, operator: &str, target: &str) -> Result<(), ParseError> {
        loop {
            let mut root = Value::Object(std::mem::take(&mut self.rest_where));
            let Some(path) = find_object_with_key(&root, operator) else {
                self.rest_where = into_object(root);
                return Ok(());
            };
            let value = object_at_mut(&mut root, &path)
                .and_then(|object| object.remove(operator))
                .unwrap_or(Value::Null);
            self.rest_where = into_object(root);

            let improper = || ParseError::InvalidQuery(format!("improper usage of {}", operator));
            let select = value.as_object().ok_or_else(improper)?;
            let sub = select
                .get("query")
                .and_then(Value::as_object)
                .ok_or_else(improper)?;
            let key = select
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(improper)?;
            let sub_class = sub
                .get("className")
                .and_then(Value::as_str)
                .ok_or_else(improper)?;
            if select.len() != 2 {
                return Err(improper());
            }
            let sub_where = sub
                .get("where")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let subquery = RestQuery::new(
                self.config.clone(),
                self.auth.clone(),
                sub_class,
                sub_where,
                self.subquery_options(sub.get("redirectClassNameForKey")),
            )?;
            let (_, response) = subquery.run(None).await?;
            let values: Vec<Value> = response
                .results
                .iter()
                .filter_map(|result| {
                    key.split('.')
                        .try_fold(result, |current, part| current.get(part))
                        .cloned()
                })
                .collect();

            let mut root = Value::Object(std::mem::take(&mut self.rest_where));
            if let Some(object) = object_at_mut(&mut root, &path) {
                append_values(object, target, values);
            }
            self.rest_where = into_object(root);
        }
    }

    /// A constraint mixing plain keys with operators gets the plain keys moved under `$eq`.
    fn replace_equality(&mut self) {
        for constraint in self.rest_where.values_mut() {
            let Value::Object(map) = constraint else {
                continue;
            };
            let direct: Vec<String> = map
                .keys()
                .filter(|key| !key.starts_with('$'))
                .cloned()
                .collect();
            if direct.is_empty() || direct.len() == map.len() {
                continue;
            }
            let mut equal_to = JsonObject::new();
            for key in direct {
                if let Some(value) = map.remove(&key) {
                    equal_to.insert(key, value);
                }
            }
            map.insert("$eq".to_string(), Value::Object(equal_to));
        }
    }

    async fn handle_include_all(&mut self) -> Result<(), ParseError> {
        if !self.include_all {
            return Ok(());
        }
        let schema = self
            .config
            .database
            .load_schema(false)
            .await?
            .get_one_schema(&self.class_name, false, false)
            .await?;
        let Some(schema) = schema else {
            return Ok(());
        };
        for (field, field_schema) in &schema.fields {
            if field_schema.field_type != FieldType::Pointer {
                continue;
            }
            let path = vec![field.clone()];
            if !self.include.contains(&path) {
                self.include.push(path);
            }
            if let Some(keys) = &mut self.keys {
                if !keys.contains(field) {
                    keys.push(field.clone());
                }
            }
        }
        Ok(())
    }

    async fn run_find(&mut self, op: Option<ClpOperation>) -> Result<(), ParseError> {
        if self.find_options.limit == Some(0) {
            self.response = Some(QueryResponse::default());
            return Ok(());
        }
        let mut options = self.find_options.clone();
        if let Some(keys) = &self.keys {
            let mut roots: Vec<String> = Vec::new();
            for key in keys {
                let root = root_field_name(key).to_string();
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
            options.keys = Some(roots);
        }
        options.op = op;

        let database = &self.config.database;
        let mut results: Vec<Value> = if let Some(field) = &self.rest_options.distinct {
            database
                .distinct(&self.class_name, self.rest_where.clone(), field, &options)
                .await?
        } else if let Some(pipeline) = &self.rest_options.pipeline {
            database
                .aggregate(&self.class_name, &pipeline_stages(pipeline), &options)
                .await?
        } else {
            database
                .find(&self.class_name, self.rest_where.clone(), &options)
                .await?
                .into_iter()
                .map(|mut object| {
                    if self.class_name == "_User" {
                        clean_user_result(&mut object);
                    }
                    Value::Object(object)
                })
                .collect()
        };
        for result in &mut results {
            self.config.files.expand_files_in_object(result);
            if let (Some(class_name), Value::Object(object)) = (&self.redirect_class_name, result) {
                object.insert("className".to_string(), json!(class_name));
            }
        }
        self.response = Some(QueryResponse {
            results,
            count: None,
        });
        Ok(())
    }

    async fn run_count(&mut self) -> Result<(), ParseError> {
        if !self.do_count {
            return Ok(());
        }
        let mut options = self.find_options.clone();
        options.skip = None;
        options.limit = None;
        let count = self
            .config
            .database
            .count(&self.class_name, self.rest_where.clone(), &options)
            .await?;
        self.response.get_or_insert_with(QueryResponse::default).count = Some(count);
        Ok(())
    }

    /// Inlines included pointers one path at a time, shortest paths first.
    async fn handle_include(&mut self) -> Result<(), ParseError> {
        for path in std::mem::take(&mut self.include) {
            let response = self.response.take().unwrap_or_default();
            let response =
                include_path(&self.config, &self.auth, response, &path, &self.rest_options)
                    .await?;
            self.response = Some(response);
        }
        Ok(())
    }

    /// afterFind may replace the results; if it fails the results are kept as found.
    async fn run_after_find_trigger(&mut self) {
        if !self
            .config
            .triggers
            .exists(TriggerType::AfterFind, &self.class_name)
        {
            return;
        }
        if self.rest_options.pipeline.is_some() || self.rest_options.distinct.is_some() {
            return;
        }
        let Some(response) = &mut self.response else {
            return;
        };
        let mut request = TriggerRequest::new(TriggerType::AfterFind, self.class_name.clone());
        request.objects = response
            .results
            .iter()
            .filter_map(Value::as_object)
            .cloned()
            .collect();
        request.master = self.auth.is_master;
        request.user = self.auth.user.clone();
        request.installation_id = self.auth.installation_id.clone();
        match self.config.triggers.run(request).await {
            Ok(TriggerResult::Objects(objects)) => {
                response.results = objects
                    .into_iter()
                    .map(|mut object| {
                        if let Some(class_name) = &self.redirect_class_name {
                            object.insert("className".to_string(), json!(class_name));
                        }
                        Value::Object(object)
                    })
                    .collect();
            }
            Ok(_) => {}
            Err(err) => log::warn!("afterFind failed for {}: {}", self.class_name, err),
        }
    }
}

fn parse_order(order: &str) -> Vec<(String, SortOrder)> {
    order
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| {
            if field == "$score" {
                ("score".to_string(), SortOrder::TextScore)
            } else if let Some(field) = field.strip_prefix('-') {
                (field.to_string(), SortOrder::Descending)
            } else {
                (field.to_string(), SortOrder::Ascending)
            }
        })
        .collect()
}

/// `a.b.c` expands to `a`, `a.b` and `a.b.c`; the result is ordered by depth.
fn expand_include_paths(paths: &[&str]) -> Vec<Vec<String>> {
    let mut expanded: Vec<Vec<String>> = Vec::new();
    for path in paths {
        let parts: Vec<String> = path.split('.').map(str::to_string).collect();
        for depth in 1..=parts.len() {
            let prefix = parts[..depth].to_vec();
            if !expanded.contains(&prefix) {
                expanded.push(prefix);
            }
        }
    }
    expanded.sort_by_key(Vec::len);
    expanded
}

fn pipeline_stages(pipeline: &Value) -> Vec<Value> {
    match pipeline {
        Value::Array(stages) => stages.clone(),
        Value::Object(stages) => stages
            .iter()
            .map(|(stage, argument)| json!({ stage: argument }))
            .collect(),
        _ => Vec::new(),
    }
}

fn clean_user_result(object: &mut JsonObject) {
    object.remove("password");
    let empty = match object.get_mut("authData") {
        Some(Value::Object(auth_data)) => {
            auth_data.retain(|_, value| !value.is_null());
            auth_data.is_empty()
        }
        _ => false,
    };
    if empty {
        object.remove("authData");
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
}

/// Path to the first object (depth-first) that has `key`.
fn find_object_with_key(root: &Value, key: &str) -> Option<Vec<Step>> {
    match root {
        Value::Array(items) => items.iter().enumerate().find_map(|(idx, item)| {
            let mut path = find_object_with_key(item, key)?;
            path.insert(0, Step::Index(idx));
            Some(path)
        }),
        Value::Object(map) => {
            if map.contains_key(key) {
                return Some(Vec::new());
            }
            map.iter().find_map(|(name, value)| {
                let mut path = find_object_with_key(value, key)?;
                path.insert(0, Step::Key(name.clone()));
                Some(path)
            })
        }
        _ => None,
    }
}

fn object_at_mut<'a>(root: &'a mut Value, path: &[Step]) -> Option<&'a mut JsonObject> {
    let mut current = root;
    for step in path {
        current = match step {
            Step::Key(key) => current.get_mut(key.as_str())?,
            Step::Index(idx) => current.get_mut(*idx)?,
        };
    }
    current.as_object_mut()
}

fn into_object(value: Value) -> JsonObject {
    match value {
        Value::Object(object) => object,
        _ => JsonObject::new(),
    }
}

fn append_values(object: &mut JsonObject, target: &str, values: Vec<Value>) {
    match object.get_mut(target) {
        Some(Value::Array(existing)) => existing.extend(values),
        _ => {
            object.insert(target.to_string(), Value::Array(values));
        }
    }
}

fn include_path<'a>(
    config: &'a Arc<Config>,
    auth: &'a Auth,
    mut response: QueryResponse,
    path: &'a [String],
    rest_options: &'a RestOptions,
) -> Pin<Box<dyn Future<Output = Result<QueryResponse, ParseError>> + Send + 'a>> {
    Box::pin(async move {
        let mut pointers = Vec::new();
        for result in &response.results {
            find_pointers(result, path, &mut pointers);
        }
        if pointers.is_empty() {
            return Ok(response);
        }
        let mut ids_by_class: Vec<(String, Vec<String>)> = Vec::new();
        for pointer in pointers {
            let position = ids_by_class
                .iter()
                .position(|(class_name, _)| *class_name == pointer.class_name);
            let ids = match position {
                Some(idx) => &mut ids_by_class[idx].1,
                None => {
                    ids_by_class.push((pointer.class_name.clone(), Vec::new()));
                    let last = ids_by_class.len() - 1;
                    &mut ids_by_class[last].1
                }
            };
            if !ids.contains(&pointer.object_id) {
                ids.push(pointer.object_id);
            }
        }

        let mut include_options = RestOptions::default();
        if let Some(keys) = &rest_options.keys {
            let mut nested: Vec<String> = Vec::new();
            for key in keys.split(',') {
                let key_path: Vec<&str> = key.split('.').collect();
                if key_path.len() > path.len()
                    && path.iter().zip(&key_path).all(|(a, b)| a == b)
                {
                    let next = key_path[path.len()].to_string();
                    if !nested.contains(&next) {
                        nested.push(next);
                    }
                }
            }
            if !nested.is_empty() {
                include_options.keys = Some(nested.join(","));
            }
        }
        if let Some(preference) = &rest_options.include_read_preference {
            include_options.read_preference = Some(preference.clone());
            include_options.include_read_preference = Some(preference.clone());
        }

        let mut replace: HashMap<(String, String), Value> = HashMap::new();
        for (class_name, ids) in ids_by_class {
            let mut sub_where = JsonObject::new();
            if let [id] = ids.as_slice() {
                sub_where.insert("objectId".to_string(), json!(id));
            } else {
                sub_where.insert("objectId".to_string(), json!({ "$in": ids }));
            }
            let included = RestQuery::new(
                config.clone(),
                auth.clone(),
                class_name.as_str(),
                sub_where,
                include_options.clone(),
            )?
            .execute_with_op(ClpOperation::Get)
            .await?;
            for object in included.results {
                let Value::Object(mut object) = object else {
                    continue;
                };
                let Some(object_id) = object
                    .get("objectId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    continue;
                };
                object.insert("__type".to_string(), json!("Object"));
                object.insert("className".to_string(), json!(class_name));
                if class_name == "_User" && !auth.is_master {
                    object.remove("sessionToken");
                    object.remove("authData");
                }
                replace.insert((class_name.clone(), object_id), Value::Object(object));
            }
        }

        response.results = std::mem::take(&mut response.results)
            .into_iter()
            .filter_map(|result| replace_pointers(result, path, &replace))
            .collect();
        Ok(response)
    })
}

fn find_pointers(object: &Value, path: &[String], out: &mut Vec<Pointer>) {
    match object {
        Value::Array(items) => {
            for item in items {
                find_pointers(item, path, out);
            }
        }
        Value::Object(map) => match path.split_first() {
            None => {
                if let Some(pointer) = Pointer::from_value(object) {
                    out.push(pointer);
                }
            }
            Some((first, rest)) => {
                if let Some(sub) = map.get(first.as_str()) {
                    find_pointers(sub, rest, out);
                }
            }
        },
        _ => {}
    }
}

/// Swaps the pointers at `path` for the fetched objects. Pointers to objects that
/// could not be fetched are dropped.
fn replace_pointers(
    object: Value,
    path: &[String],
    replace: &HashMap<(String, String), Value>,
) -> Option<Value> {
    match object {
        Value::Array(items) => Some(Value::Array(
            items
                .into_iter()
                .filter_map(|item| replace_pointers(item, path, replace))
                .collect(),
        )),
        Value::Object(mut map) => {
            let Some((first, rest)) = path.split_first() else {
                let value = Value::Object(map);
                return match Pointer::from_value(&value) {
                    Some(pointer) => replace
                        .get(&(pointer.class_name, pointer.object_id))
                        .cloned(),
                    None => Some(value),
                };
            };
            if let Some(slot) = map.get_mut(first.as_str()) {
                match replace_pointers(std::mem::take(slot), rest, replace) {
                    Some(value) => *slot = value,
                    None => {
                        map.remove(first.as_str());
                    }
                }
            }
            Some(Value::Object(map))
        }
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryStorageAdapter;
    use crate::types::as_object;
    use pretty_assertions::assert_eq;

    fn config() -> Arc<Config> {
        Config::builder(Arc::new(InMemoryStorageAdapter::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_options_parsing() {
        let options = RestOptions::from_value(&json!({
            "keys": "title,author.name",
            "count": 1,
            "order": "-createdAt,$score,title",
            "limit": 5
        }))
        .unwrap();
        assert!(options.count);
        assert_eq!(options.limit, Some(5));

        let err = RestOptions::from_value(&json!({"bogus": 1})).unwrap_err();
        assert_eq!(err, ParseError::InvalidJson("bad option: bogus".to_string()));

        assert_eq!(
            parse_order("-createdAt, $score,title"),
            vec![
                ("createdAt".to_string(), SortOrder::Descending),
                ("score".to_string(), SortOrder::TextScore),
                ("title".to_string(), SortOrder::Ascending),
            ]
        );
    }

    #[test]
    fn test_keys_imply_includes() {
        let options = RestOptions {
            keys: Some("title,author.name,post.author.name".to_string()),
            include: Some("comments".to_string()),
            ..Default::default()
        };
        let query =
            RestQuery::new(config(), Auth::master(), "Post", JsonObject::new(), options).unwrap();
        let paths: Vec<String> = query.include_paths().iter().map(|p| p.join(".")).collect();
        assert_eq!(paths, vec!["comments", "author", "post", "post.author"]);
    }

    #[test]
    fn test_include_star_means_all() {
        let options = RestOptions {
            include: Some("a,*".to_string()),
            ..Default::default()
        };
        let query =
            RestQuery::new(config(), Auth::master(), "Post", JsonObject::new(), options).unwrap();
        assert!(query.include_all);
        assert!(query.include_paths().is_empty());
    }

    #[test]
    fn test_session_queries_are_scoped() {
        let err = RestQuery::new(
            config(),
            Auth::nobody(),
            "_Session",
            JsonObject::new(),
            RestOptions::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), 209);

        let auth = Auth::for_user(as_object(&json!({"objectId": "u1"})));
        let query = RestQuery::new(
            config(),
            auth,
            "_Session",
            as_object(&json!({"sessionToken": "r:abc"})),
            RestOptions::default(),
        )
        .unwrap();
        assert_eq!(
            Value::Object(query.rest_where().clone()),
            json!({"$and": [
                {"sessionToken": "r:abc"},
                {"user": {"__type": "Pointer", "className": "_User", "objectId": "u1"}}
            ]})
        );
    }

    #[tokio::test]
    async fn test_replace_equality() {
        let mut query = RestQuery::new(
            config(),
            Auth::master(),
            "Post",
            as_object(&json!({"location": {"city": "Paris", "$exists": true}, "title": "x"})),
            RestOptions::default(),
        )
        .unwrap();
        query.build_rest_where().await.unwrap();
        assert_eq!(
            Value::Object(query.rest_where().clone()),
            json!({"location": {"$exists": true, "$eq": {"city": "Paris"}}, "title": "x"})
        );
    }

    #[test]
    fn test_replace_pointers_drops_missing() {
        let mut replace = HashMap::new();
        replace.insert(
            ("_User".to_string(), "u1".to_string()),
            json!({"__type": "Object", "className": "_User", "objectId": "u1", "name": "a"}),
        );
        let path = vec!["owners".to_string()];
        let result = replace_pointers(
            json!({"owners": [
                {"__type": "Pointer", "className": "_User", "objectId": "u1"},
                {"__type": "Pointer", "className": "_User", "objectId": "gone"}
            ]}),
            &path,
            &replace,
        )
        .unwrap();
        assert_eq!(
            result,
            json!({"owners": [
                {"__type": "Object", "className": "_User", "objectId": "u1", "name": "a"}
            ]})
        );
    }

    #[tokio::test]
    async fn test_improper_in_query() {
        let mut query = RestQuery::new(
            config(),
            Auth::master(),
            "Post",
            as_object(&json!({"author": {"$inQuery": {"where": {}}}})),
            RestOptions::default(),
        )
        .unwrap();
        let err = query.build_rest_where().await.unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidQuery("improper usage of $inQuery".to_string())
        );
    }
}
