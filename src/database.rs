// src/database.rs
use crate::acl::ParseACL;
use crate::adapter::{QueryOptions, SortOrder, StorageAdapter};
use crate::cache::SchemaCache;
use crate::error::ParseError;
use crate::permissions;
use crate::schema::{
    class_name_is_valid, field_name_is_valid, join_table_name, ClpOperation, FieldSchema,
    FieldType, ParseSchema,
};
use crate::schema_controller::SchemaController;
use crate::types::{JsonObject, ParseRelation, Pointer};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock};

/// Keys allowed in a where clause besides plain field names.
const SPECIAL_QUERY_KEYS: &[&str] = &[
    "$and",
    "$or",
    "$nor",
    "_rperm",
    "_wperm",
    "_perishable_token",
    "_email_verify_token",
    "_email_verify_token_expires_at",
    "_account_lockout_expires_at",
    "_failed_login_count",
];

/// Internal `_User` columns that may be written even though they fail the field-name rules.
const SPECIAL_UPDATE_KEYS: &[&str] = &[
    "_hashed_password",
    "_perishable_token",
    "_email_verify_token",
    "_email_verify_token_expires_at",
    "_account_lockout_expires_at",
    "_failed_login_count",
    "_perishable_token_expires_at",
    "_password_changed_at",
    "_password_history",
];

/// `_User` columns never shown to anyone but the master key.
const PROTECTED_USER_FIELDS: &[&str] = &[
    "_email_verify_token",
    "_perishable_token",
    "_perishable_token_expires_at",
    "_tombstone",
    "_email_verify_token_expires_at",
    "_failed_login_count",
    "_account_lockout_expires_at",
    "_password_changed_at",
    "_password_history",
];

fn query_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_\.]*$").expect("valid regex"))
}

fn auth_data_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^authData\.([a-zA-Z0-9_]+)\.id$").expect("valid regex"))
}

fn options_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[imxs]+$").expect("valid regex"))
}

pub(crate) fn root_field_name(field_name: &str) -> &str {
    field_name.split('.').next().unwrap_or(field_name)
}

/// Options for a read. `acl: None` means the caller holds the master key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub acl: Option<Vec<String>>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub sort: Vec<(String, SortOrder)>,
    pub keys: Option<Vec<String>>,
    /// Permission to check; inferred as `get` for an objectId-only query, otherwise `find`.
    pub op: Option<ClpOperation>,
    pub read_preference: Option<String>,
}

impl FindOptions {
    pub fn master() -> Self {
        Self::default()
    }

    pub fn with_acl(acl: Vec<String>) -> Self {
        FindOptions {
            acl: Some(acl),
            ..Self::default()
        }
    }
}

/// Options for a write. `acl: None` means the caller holds the master key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    pub acl: Option<Vec<String>>,
    /// Update every matching object rather than the first.
    pub many: bool,
    /// Create the object when nothing matches.
    pub upsert: bool,
}

/// A prepared read: the final storage query and the class schema it runs against.
struct ReadPlan {
    query: JsonObject,
    schema: ParseSchema,
    class_exists: bool,
    is_master: bool,
    acl_group: Vec<String>,
}

/// The persistence façade used by the write and query engines.
///
/// Applies class-level and pointer permissions, object ACL constraints, relation
/// bookkeeping and the wire <-> storage transforms on top of a [`StorageAdapter`].
pub struct DatabaseController {
    adapter: Arc<dyn StorageAdapter>,
    schema: Arc<SchemaController>,
}

impl DatabaseController {
    pub fn new(adapter: Arc<dyn StorageAdapter>, schema_cache: Arc<dyn SchemaCache>) -> Self {
        let schema = Arc::new(SchemaController::new(adapter.clone(), schema_cache));
        DatabaseController { adapter, schema }
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn schema_controller(&self) -> &Arc<SchemaController> {
        &self.schema
    }

    /// Reloads (or reuses an in-flight reload of) the schema and hands out the controller.
    pub async fn load_schema(&self, clear_cache: bool) -> Result<Arc<SchemaController>, ParseError> {
        self.schema.reload_data(clear_cache).await?;
        Ok(self.schema.clone())
    }

    /// Returns the class a relation `key` points to, or `class_name` when `key` is not a relation.
    pub async fn redirect_class_name_for_key(
        &self,
        class_name: &str,
        key: &str,
    ) -> Result<String, ParseError> {
        let schema = self.load_schema(false).await?;
        Ok(match schema.get_expected_type(class_name, key) {
            Some(FieldSchema {
                field_type: FieldType::Relation,
                target_class: Some(target),
                ..
            }) => target,
            _ => class_name.to_string(),
        })
    }

    async fn prepare_read(
        &self,
        class_name: &str,
        mut query: JsonObject,
        options: &FindOptions,
        op: ClpOperation,
    ) -> Result<Option<ReadPlan>, ParseError> {
        let is_master = options.acl.is_none();
        let acl_group = options.acl.clone().unwrap_or_default();
        let schema_controller = self.load_schema(false).await?;
        let schema = schema_controller
            .get_one_schema(class_name, is_master, false)
            .await?;
        let class_exists = schema.is_some();
        let schema = schema.unwrap_or_else(|| ParseSchema::new(class_name));

        for (field_name, _) in &options.sort {
            if auth_data_id_regex().is_match(field_name) {
                return Err(ParseError::InvalidKeyName(format!(
                    "Cannot sort by {}",
                    field_name
                )));
            }
            if !field_name_is_valid(root_field_name(field_name)) {
                return Err(ParseError::InvalidKeyName(format!(
                    "Invalid field name: {}.",
                    field_name
                )));
            }
        }

        if !is_master {
            schema_controller.validate_permission(class_name, &acl_group, op)?;
        }
        self.reduce_relation_keys(class_name, &mut query).await?;
        self.reduce_in_relation(class_name, &mut query, &schema)
            .await?;

        if !is_master {
            let clp = schema_controller.class_level_permissions(class_name);
            match add_pointer_permissions(clp.as_ref(), op, query, &acl_group) {
                Some(restricted) => query = restricted,
                None if op == ClpOperation::Get => {
                    return Err(ParseError::ObjectNotFound("Object not found.".to_string()))
                }
                None => return Ok(None),
            }
            add_acl_constraint(&mut query, "_rperm", &acl_group);
        }
        validate_query(&query)?;
        Ok(Some(ReadPlan {
            query,
            schema,
            class_exists,
            is_master,
            acl_group,
        }))
    }

    /// Finds objects, returning them in wire form (`ACL` instead of `_rperm`/`_wperm`).
    pub async fn find(
        &self,
        class_name: &str,
        query: JsonObject,
        options: &FindOptions,
    ) -> Result<Vec<JsonObject>, ParseError> {
        let op = options.op.unwrap_or_else(|| infer_read_operation(&query));
        let Some(plan) = self.prepare_read(class_name, query, options, op).await? else {
            return Ok(Vec::new());
        };
        if !plan.class_exists {
            return Ok(Vec::new());
        }
        let adapter_options = QueryOptions {
            skip: options.skip,
            limit: options.limit,
            sort: options.sort.clone(),
            keys: options.keys.clone(),
            read_preference: options.read_preference.clone(),
        };
        log::debug!("find on {} with {:?}", class_name, plan.query);
        let rows = self
            .adapter
            .find(class_name, &plan.schema, &plan.query, &adapter_options)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut object = untransform_object_acl(row);
                add_relation_fields(&mut object, &plan.schema);
                filter_sensitive_data(plan.is_master, &plan.acl_group, class_name, object)
            })
            .collect())
    }

    pub async fn count(
        &self,
        class_name: &str,
        query: JsonObject,
        options: &FindOptions,
    ) -> Result<u64, ParseError> {
        let Some(plan) = self
            .prepare_read(class_name, query, options, ClpOperation::Count)
            .await?
        else {
            return Ok(0);
        };
        if !plan.class_exists {
            return Ok(0);
        }
        self.adapter
            .count(class_name, &plan.schema, &plan.query)
            .await
    }

    pub async fn distinct(
        &self,
        class_name: &str,
        query: JsonObject,
        field_name: &str,
        options: &FindOptions,
    ) -> Result<Vec<Value>, ParseError> {
        let Some(plan) = self
            .prepare_read(class_name, query, options, ClpOperation::Find)
            .await?
        else {
            return Ok(Vec::new());
        };
        if !plan.class_exists {
            return Ok(Vec::new());
        }
        self.adapter
            .distinct(class_name, &plan.schema, &plan.query, field_name)
            .await
    }

    /// Runs an aggregation pipeline. The read ACL is prepended as a `$match` stage for
    /// non-master callers.
    pub async fn aggregate(
        &self,
        class_name: &str,
        pipeline: &[Value],
        options: &FindOptions,
    ) -> Result<Vec<Value>, ParseError> {
        let Some(plan) = self
            .prepare_read(class_name, JsonObject::new(), options, ClpOperation::Find)
            .await?
        else {
            return Ok(Vec::new());
        };
        if !plan.class_exists {
            return Ok(Vec::new());
        }
        let mut stages = Vec::with_capacity(pipeline.len() + 1);
        if !plan.query.is_empty() {
            stages.push(json!({ "$match": plan.query }));
        }
        stages.extend(pipeline.iter().cloned());
        self.adapter
            .aggregate(class_name, &plan.schema, &stages)
            .await
    }

    /// Creates an object. The response only echoes the results of array and
    /// increment operators; everything else the caller already knows.
    pub async fn create(
        &self,
        class_name: &str,
        object: JsonObject,
        acl: Option<&[String]>,
    ) -> Result<JsonObject, ParseError> {
        if !class_name_is_valid(class_name) {
            return Err(ParseError::InvalidClassName(format!(
                "invalid className: {}",
                class_name
            )));
        }
        let original = object.clone();
        let mut object = transform_object_acl(object)?;
        let relation_updates = collect_relation_updates(&mut object);

        let schema_controller = self.load_schema(false).await?;
        if let Some(acl_group) = acl {
            schema_controller.validate_permission(class_name, acl_group, ClpOperation::Create)?;
        }
        schema_controller.enforce_class_exists(class_name).await?;
        let schema = schema_controller
            .get_one_schema(class_name, true, false)
            .await?
            .unwrap_or_else(|| ParseSchema::new(class_name));

        transform_auth_data_for_create(class_name, &mut object);
        flatten_update_operators_for_create(&mut object)?;
        let object_id = object
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string);
        log::debug!("create on {}", class_name);
        let result = self
            .adapter
            .create_object(class_name, &schema, object)
            .await?;
        if let Some(object_id) = object_id {
            self.handle_relation_updates(class_name, &object_id, relation_updates)
                .await?;
        }
        Ok(sanitize_database_result(&original, &result))
    }

    /// Updates the object(s) matching `query`.
    ///
    /// Fails with `OBJECT_NOT_FOUND` when a single-object update matches nothing.
    /// With `skip_sanitization` the full stored object is returned instead of only
    /// the operator results.
    pub async fn update(
        &self,
        class_name: &str,
        query: JsonObject,
        update: JsonObject,
        options: &UpdateOptions,
        skip_sanitization: bool,
    ) -> Result<JsonObject, ParseError> {
        let original_update = update.clone();
        let object_id = query
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let is_master = options.acl.is_none();
        let acl_group = options.acl.clone().unwrap_or_default();

        let schema_controller = self.load_schema(false).await?;
        if !is_master {
            schema_controller.validate_permission(class_name, &acl_group, ClpOperation::Update)?;
        }
        let mut update = update;
        let relation_updates = collect_relation_updates(&mut update);

        let mut query = query;
        if !is_master {
            let clp = schema_controller.class_level_permissions(class_name);
            query = add_pointer_permissions(clp.as_ref(), ClpOperation::Update, query, &acl_group)
                .ok_or_else(|| ParseError::ObjectNotFound("Object not found.".to_string()))?;
            add_acl_constraint(&mut query, "_wperm", &acl_group);
        }
        validate_query(&query)?;

        let schema = schema_controller
            .get_one_schema(class_name, true, false)
            .await?
            .unwrap_or_else(|| ParseSchema::new(class_name));
        validate_update_keys(&update)?;
        let mut update = transform_object_acl(update)?;
        transform_auth_data_for_update(class_name, &mut update);

        log::debug!("update on {} where {:?}", class_name, query);
        let result = if options.many {
            self.adapter
                .update_objects_by_query(class_name, &schema, &query, &update)
                .await?;
            Some(JsonObject::new())
        } else if options.upsert {
            self.adapter
                .upsert_one_object(class_name, &schema, &query, &update)
                .await?;
            Some(JsonObject::new())
        } else {
            self.adapter
                .find_one_and_update(class_name, &schema, &query, &update)
                .await?
        };
        let result =
            result.ok_or_else(|| ParseError::ObjectNotFound("Object not found.".to_string()))?;
        if let Some(object_id) = object_id {
            self.handle_relation_updates(class_name, &object_id, relation_updates)
                .await?;
        }
        if skip_sanitization {
            return Ok(untransform_object_acl(result));
        }
        Ok(sanitize_database_result(&original_update, &result))
    }

    /// Deletes the objects matching `query`. A missing `_Session` is not an error.
    pub async fn destroy(
        &self,
        class_name: &str,
        query: JsonObject,
        acl: Option<&[String]>,
    ) -> Result<(), ParseError> {
        let schema_controller = self.load_schema(false).await?;
        let mut query = query;
        if let Some(acl_group) = acl {
            schema_controller.validate_permission(class_name, acl_group, ClpOperation::Delete)?;
            let clp = schema_controller.class_level_permissions(class_name);
            query = add_pointer_permissions(clp.as_ref(), ClpOperation::Delete, query, acl_group)
                .ok_or_else(|| ParseError::ObjectNotFound("Object not found.".to_string()))?;
            add_acl_constraint(&mut query, "_wperm", acl_group);
        }
        validate_query(&query)?;
        let schema = schema_controller
            .get_one_schema(class_name, false, false)
            .await?
            .unwrap_or_else(|| ParseSchema::new(class_name));
        match self
            .adapter
            .delete_objects_by_query(class_name, &schema, &query)
            .await
        {
            Ok(_) => Ok(()),
            Err(ParseError::ObjectNotFound(_)) if class_name == "_Session" => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Checks a write against the schema, auto-adding new fields.
    ///
    /// Non-master writes that introduce a field need the `addField` permission.
    pub async fn validate_object(
        &self,
        class_name: &str,
        object: &JsonObject,
        query: Option<&JsonObject>,
        acl: Option<&[String]>,
    ) -> Result<(), ParseError> {
        let schema_controller = self.load_schema(false).await?;
        if let Some(acl_group) = acl {
            can_add_field(&schema_controller, class_name, object, acl_group)?;
        }
        schema_controller
            .validate_object(class_name, object, query)
            .await
    }

    /// Object ids on the other side of relation `key` of `owning_id`.
    pub async fn related_ids(
        &self,
        class_name: &str,
        key: &str,
        owning_id: &str,
    ) -> Result<Vec<String>, ParseError> {
        let mut query = JsonObject::new();
        query.insert("owningId".to_string(), json!(owning_id));
        self.join_ids(class_name, key, query, "relatedId").await
    }

    /// Object ids of `class_name` whose relation `key` contains any of `related_ids`.
    pub async fn owning_ids(
        &self,
        class_name: &str,
        key: &str,
        related_ids: &[String],
    ) -> Result<Vec<String>, ParseError> {
        let mut query = JsonObject::new();
        query.insert("relatedId".to_string(), json!({ "$in": related_ids }));
        self.join_ids(class_name, key, query, "owningId").await
    }

    async fn join_ids(
        &self,
        class_name: &str,
        key: &str,
        query: JsonObject,
        column: &str,
    ) -> Result<Vec<String>, ParseError> {
        let table = join_table_name(key, class_name);
        let options = QueryOptions {
            keys: Some(vec![column.to_string()]),
            ..QueryOptions::default()
        };
        let rows = self
            .adapter
            .find(&table, &join_table_schema(&table), &query, &options)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(column).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn add_relation(
        &self,
        key: &str,
        from_class: &str,
        from_id: &str,
        to_id: &str,
    ) -> Result<(), ParseError> {
        let table = join_table_name(key, from_class);
        let mut doc = JsonObject::new();
        doc.insert("relatedId".to_string(), json!(to_id));
        doc.insert("owningId".to_string(), json!(from_id));
        self.adapter
            .upsert_one_object(&table, &join_table_schema(&table), &doc, &doc)
            .await
    }

    async fn remove_relation(
        &self,
        key: &str,
        from_class: &str,
        from_id: &str,
        to_id: &str,
    ) -> Result<(), ParseError> {
        let table = join_table_name(key, from_class);
        let mut doc = JsonObject::new();
        doc.insert("relatedId".to_string(), json!(to_id));
        doc.insert("owningId".to_string(), json!(from_id));
        match self
            .adapter
            .delete_objects_by_query(&table, &join_table_schema(&table), &doc)
            .await
        {
            Ok(_) | Err(ParseError::ObjectNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn handle_relation_updates(
        &self,
        class_name: &str,
        object_id: &str,
        updates: Vec<RelationUpdate>,
    ) -> Result<(), ParseError> {
        for update in updates {
            for target in &update.object_ids {
                if update.add {
                    self.add_relation(&update.key, class_name, object_id, target)
                        .await?;
                } else {
                    self.remove_relation(&update.key, class_name, object_id, target)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites `$relatedTo` constraints into `objectId` constraints over the join table.
    fn reduce_relation_keys<'a>(
        &'a self,
        class_name: &'a str,
        query: &'a mut JsonObject,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ParseError>> + Send + 'a>>
    {
        Box::pin(async move {
            if let Some(Value::Array(ors)) = query.get_mut("$or") {
                for sub in ors.iter_mut() {
                    if let Value::Object(sub) = sub {
                        self.reduce_relation_keys(class_name, sub).await?;
                    }
                }
            }
            let Some(related_to) = query.remove("$relatedTo") else {
                return Ok(());
            };
            let owner = related_to.get("object").and_then(Pointer::from_value);
            let key = related_to.get("key").and_then(Value::as_str);
            let (Some(owner), Some(key)) = (owner, key) else {
                return Err(ParseError::InvalidJson(
                    "$relatedTo requires an object pointer and a key".to_string(),
                ));
            };
            let ids = self
                .related_ids(&owner.class_name, key, &owner.object_id)
                .await?;
            add_in_object_ids(ids, query);
            Ok(())
        })
    }

    /// Rewrites pointer constraints on relation fields into `objectId` constraints.
    async fn reduce_in_relation(
        &self,
        class_name: &str,
        query: &mut JsonObject,
        schema: &ParseSchema,
    ) -> Result<(), ParseError> {
        let relation_keys: Vec<String> = query
            .keys()
            .filter(|key| {
                schema
                    .fields
                    .get(*key)
                    .is_some_and(|f| f.field_type == FieldType::Relation)
            })
            .cloned()
            .collect();
        for key in relation_keys {
            let Some(constraint) = query.remove(&key) else {
                continue;
            };
            let (positive, values): (bool, Vec<Value>) = match &constraint {
                Value::Object(obj) if obj.contains_key("__type") => (true, vec![constraint.clone()]),
                Value::Object(obj) => match (obj.get("$in"), obj.get("$nin"), obj.get("$ne")) {
                    (Some(Value::Array(items)), _, _) => (true, items.clone()),
                    (_, Some(Value::Array(items)), _) => (false, items.clone()),
                    (_, _, Some(item)) => (false, vec![item.clone()]),
                    _ => (true, obj.get("$eq").cloned().into_iter().collect()),
                },
                _ => (true, Vec::new()),
            };
            let related: Vec<String> = values
                .iter()
                .filter_map(Pointer::from_value)
                .map(|p| p.object_id)
                .collect();
            let owning = self.owning_ids(class_name, &key, &related).await?;
            if positive {
                add_in_object_ids(owning, query);
            } else {
                add_not_in_object_ids(owning, query);
            }
        }
        Ok(())
    }
}

fn join_table_schema(table: &str) -> ParseSchema {
    let mut schema = ParseSchema::new(table);
    schema
        .fields
        .insert("relatedId".to_string(), FieldSchema::new(FieldType::String));
    schema
        .fields
        .insert("owningId".to_string(), FieldSchema::new(FieldType::String));
    schema
}

fn infer_read_operation(query: &JsonObject) -> ClpOperation {
    if query.len() == 1 && query.get("objectId").is_some_and(Value::is_string) {
        ClpOperation::Get
    } else {
        ClpOperation::Find
    }
}

/// Intersects the query's `objectId` constraint with `ids`.
fn add_in_object_ids(ids: Vec<String>, query: &mut JsonObject) {
    let mut allowed: Vec<Value> = ids.into_iter().map(Value::String).collect();
    match query.get("objectId") {
        Some(Value::String(id)) => {
            let id = Value::String(id.clone());
            allowed.retain(|candidate| candidate == &id);
        }
        Some(Value::Object(existing)) => {
            if let Some(Value::Array(current)) = existing.get("$in") {
                allowed.retain(|candidate| current.contains(candidate));
            }
            if let Some(eq) = existing.get("$eq") {
                allowed.retain(|candidate| candidate == eq);
            }
        }
        _ => {}
    }
    let mut constraint = match query.remove("objectId") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    constraint.remove("$eq");
    constraint.insert("$in".to_string(), Value::Array(allowed));
    query.insert("objectId".to_string(), Value::Object(constraint));
}

fn add_not_in_object_ids(ids: Vec<String>, query: &mut JsonObject) {
    let mut excluded: Vec<Value> = ids.into_iter().map(Value::String).collect();
    let mut constraint = match query.remove("objectId") {
        Some(Value::Object(existing)) => existing,
        Some(Value::String(id)) => {
            let mut eq = Map::new();
            eq.insert("$eq".to_string(), Value::String(id));
            eq
        }
        _ => Map::new(),
    };
    if let Some(Value::Array(current)) = constraint.remove("$nin") {
        for id in current {
            if !excluded.contains(&id) {
                excluded.push(id);
            }
        }
    }
    constraint.insert("$nin".to_string(), Value::Array(excluded));
    query.insert("objectId".to_string(), Value::Object(constraint));
}

/// Restricts `query` to objects whose pointer-permission field points at the caller.
///
/// `None` means nothing can match (the caller is not logged in).
fn add_pointer_permissions(
    clp: Option<&crate::schema::ClassLevelPermissions>,
    operation: ClpOperation,
    query: JsonObject,
    acl_group: &[String],
) -> Option<JsonObject> {
    let Some(fields) = permissions::pointer_permission_fields(clp, acl_group, operation) else {
        return Some(query);
    };
    let user_id = acl_group
        .iter()
        .find(|entry| *entry != "*" && !entry.starts_with("role:"))?;
    let user_pointer = Pointer::new("_User", user_id.as_str()).to_value();
    let mut ors: Vec<Value> = fields
        .iter()
        .map(|field| {
            if query.contains_key(field) {
                json!({ "$and": [{ field.as_str(): user_pointer.clone() }, query.clone()] })
            } else {
                let mut constrained = query.clone();
                constrained.insert(field.clone(), user_pointer.clone());
                Value::Object(constrained)
            }
        })
        .collect();
    if ors.len() == 1 {
        return ors.pop().and_then(|q| q.as_object().cloned());
    }
    let mut combined = JsonObject::new();
    combined.insert("$or".to_string(), Value::Array(ors));
    Some(combined)
}

/// Adds `{column: {$in: [null, "*", ...acl]}}`; `null` admits objects without an ACL.
fn add_acl_constraint(query: &mut JsonObject, column: &str, acl_group: &[String]) {
    let mut allowed = vec![Value::Null, json!("*")];
    allowed.extend(
        acl_group
            .iter()
            .filter(|entry| *entry != "*")
            .map(|entry| json!(entry)),
    );
    query.insert(column.to_string(), json!({ "$in": allowed }));
}

/// Rejects malformed where clauses before they reach the adapter.
pub fn validate_query(query: &JsonObject) -> Result<(), ParseError> {
    if query.contains_key("ACL") {
        return Err(ParseError::InvalidQuery("Cannot query on ACL.".to_string()));
    }
    for op in ["$or", "$and", "$nor"] {
        match query.get(op) {
            None => {}
            Some(Value::Array(subs)) => {
                for sub in subs {
                    if let Value::Object(sub) = sub {
                        validate_query(sub)?;
                    }
                }
            }
            Some(_) => {
                return Err(ParseError::InvalidQuery(format!(
                    "Bad {} format - use an array value.",
                    op
                )))
            }
        }
    }
    for (key, constraint) in query {
        if constraint.get("$regex").is_some() {
            if let Some(Value::String(options)) = constraint.get("$options") {
                if !options_regex().is_match(options) {
                    return Err(ParseError::InvalidQuery(format!(
                        "Bad $options value for query: {}",
                        options
                    )));
                }
            }
        }
        if !SPECIAL_QUERY_KEYS.contains(&key.as_str()) && !query_key_regex().is_match(key) {
            return Err(ParseError::InvalidKeyName(format!(
                "Invalid key name: {}",
                key
            )));
        }
    }
    Ok(())
}

fn validate_update_keys(update: &JsonObject) -> Result<(), ParseError> {
    for (field_name, value) in update {
        let root = root_field_name(field_name);
        if auth_data_id_regex().is_match(field_name)
            || (!field_name_is_valid(root) && !SPECIAL_UPDATE_KEYS.contains(&root))
        {
            return Err(ParseError::InvalidKeyName(format!(
                "Invalid field name for update: {}",
                field_name
            )));
        }
        if let Value::Object(inner) = value {
            if inner.keys().any(|k| k.contains('$') || k.contains('.')) {
                return Err(ParseError::InvalidNestedKey(
                    "Nested keys should not contain the '$' or '.' characters".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn can_add_field(
    schema: &SchemaController,
    class_name: &str,
    object: &JsonObject,
    acl_group: &[String],
) -> Result<(), ParseError> {
    let Some(class_schema) = schema.class_schema(class_name) else {
        return Ok(());
    };
    let adds_field = object.iter().any(|(field, value)| {
        if value.get("__op").and_then(Value::as_str) == Some("Delete") {
            return false;
        }
        !class_schema.fields.contains_key(root_field_name(field))
    });
    if adds_field {
        schema.validate_permission(class_name, acl_group, ClpOperation::AddField)?;
    }
    Ok(())
}

/// `ACL` -> `_rperm`/`_wperm`.
fn transform_object_acl(mut object: JsonObject) -> Result<JsonObject, ParseError> {
    let Some(acl) = object.remove("ACL") else {
        return Ok(object);
    };
    let (rperm, wperm) = ParseACL::from_value(&acl)?.to_permission_arrays();
    object.insert("_rperm".to_string(), json!(rperm));
    object.insert("_wperm".to_string(), json!(wperm));
    Ok(object)
}

/// `_rperm`/`_wperm` -> `ACL`.
pub(crate) fn untransform_object_acl(mut object: JsonObject) -> JsonObject {
    let rperm = object.remove("_rperm");
    let wperm = object.remove("_wperm");
    if rperm.is_none() && wperm.is_none() {
        return object;
    }
    let strings = |value: Option<Value>| -> Vec<String> {
        value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    };
    let acl = ParseACL::from_permission_arrays(&strings(rperm), &strings(wperm));
    object.insert("ACL".to_string(), acl.to_value());
    object
}

fn add_relation_fields(object: &mut JsonObject, schema: &ParseSchema) {
    for (name, field) in &schema.fields {
        if field.field_type == FieldType::Relation {
            object.insert(
                name.clone(),
                ParseRelation::new(field.target_class.clone().unwrap_or_default()).to_value(),
            );
        }
    }
}

/// Hides `_User` internals from callers that should not see them.
fn filter_sensitive_data(
    is_master: bool,
    acl_group: &[String],
    class_name: &str,
    mut object: JsonObject,
) -> JsonObject {
    if class_name != "_User" {
        return object;
    }
    if let Some(hashed) = object.remove("_hashed_password") {
        object.insert("password".to_string(), hashed);
    }
    object.remove("sessionToken");
    if is_master {
        return object;
    }
    for field in PROTECTED_USER_FIELDS {
        object.remove(*field);
    }
    let own_object = object
        .get("objectId")
        .and_then(Value::as_str)
        .is_some_and(|id| acl_group.iter().any(|entry| entry == id));
    if !own_object {
        object.remove("authData");
    }
    object
}

struct RelationUpdate {
    key: String,
    add: bool,
    object_ids: Vec<String>,
}

/// Pulls `AddRelation`/`RemoveRelation` (and `Batch`es of them) out of a write.
fn collect_relation_updates(object: &mut JsonObject) -> Vec<RelationUpdate> {
    let keys: Vec<String> = object
        .iter()
        .filter(|(_, value)| {
            matches!(
                value.get("__op").and_then(Value::as_str),
                Some("AddRelation" | "RemoveRelation" | "Batch")
            )
        })
        .map(|(key, _)| key.clone())
        .collect();
    let mut updates = Vec::new();
    for key in keys {
        if let Some(op) = object.remove(&key) {
            collect_relation_op(&key, &op, &mut updates);
        }
    }
    updates
}

fn collect_relation_op(key: &str, op: &Value, updates: &mut Vec<RelationUpdate>) {
    let object_ids = || -> Vec<String> {
        op.get("objects")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|o| o.get("objectId").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    };
    match op.get("__op").and_then(Value::as_str) {
        Some("AddRelation") => updates.push(RelationUpdate {
            key: key.to_string(),
            add: true,
            object_ids: object_ids(),
        }),
        Some("RemoveRelation") => updates.push(RelationUpdate {
            key: key.to_string(),
            add: false,
            object_ids: object_ids(),
        }),
        Some("Batch") => {
            for sub in op.get("ops").and_then(Value::as_array).into_iter().flatten() {
                collect_relation_op(key, sub, updates);
            }
        }
        _ => {}
    }
}

/// Creates have no prior value, so operators collapse to their result.
fn flatten_update_operators_for_create(object: &mut JsonObject) -> Result<(), ParseError> {
    let keys: Vec<String> = object.keys().cloned().collect();
    for key in keys {
        let Some(op) = object
            .get(&key)
            .and_then(|v| v.get("__op"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            continue;
        };
        let value = object.get(&key).cloned().unwrap_or(Value::Null);
        match op.as_str() {
            "Increment" => {
                let amount = value.get("amount").cloned().unwrap_or(Value::Null);
                if !amount.is_number() {
                    return Err(ParseError::InvalidJson(
                        "objects to add must be an array".to_string(),
                    ));
                }
                object.insert(key, amount);
            }
            "Add" | "AddUnique" => {
                let objects = value.get("objects").cloned().unwrap_or(Value::Null);
                if !objects.is_array() {
                    return Err(ParseError::InvalidJson(
                        "objects to add must be an array".to_string(),
                    ));
                }
                object.insert(key, objects);
            }
            "Remove" => {
                if !value.get("objects").is_some_and(Value::is_array) {
                    return Err(ParseError::InvalidJson(
                        "objects to add must be an array".to_string(),
                    ));
                }
                object.insert(key, json!([]));
            }
            "Delete" => {
                object.remove(&key);
            }
            other => {
                return Err(ParseError::OtherParseError {
                    code: crate::error::ErrorCode::OtherCause.as_i32(),
                    message: format!("The {} operator is not supported yet.", other),
                })
            }
        }
    }
    Ok(())
}

/// Unlinked (`null`) providers are dropped; an empty `authData` is not stored.
fn transform_auth_data_for_create(class_name: &str, object: &mut JsonObject) {
    if class_name != "_User" {
        return;
    }
    let Some(Value::Object(auth_data)) = object.get_mut("authData") else {
        return;
    };
    auth_data.retain(|_, provider| !provider.is_null());
    if auth_data.is_empty() {
        object.remove("authData");
    }
}

/// Provider-level writes, so linking one provider never clobbers another.
fn transform_auth_data_for_update(class_name: &str, update: &mut JsonObject) {
    if class_name != "_User" {
        return;
    }
    let Some(Value::Object(auth_data)) = update.remove("authData") else {
        return;
    };
    for (provider, data) in auth_data {
        let value = if data.is_null() {
            json!({ "__op": "Delete" })
        } else {
            data
        };
        update.insert(format!("authData.{}", provider), value);
    }
}

/// Only the results of `Add`, `AddUnique`, `Remove` and `Increment` are echoed back.
fn sanitize_database_result(original: &JsonObject, result: &JsonObject) -> JsonObject {
    let mut response = JsonObject::new();
    for (key, value) in original {
        let echoed = matches!(
            value.get("__op").and_then(Value::as_str),
            Some("Add" | "AddUnique" | "Remove" | "Increment")
        );
        if !echoed {
            continue;
        }
        let mut current = Some(result);
        let mut found = None;
        let parts: Vec<&str> = key.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            let Some(obj) = current else { break };
            if i + 1 == parts.len() {
                found = obj.get(*part).cloned();
            } else {
                current = obj.get(*part).and_then(Value::as_object);
            }
        }
        if let Some(found) = found {
            response.insert(key.clone(), found);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryStorageAdapter;
    use crate::cache::InMemorySchemaCache;
    use crate::schema::{ClassLevelPermissions, SchemaFields};
    use pretty_assertions::assert_eq;

    fn controller() -> DatabaseController {
        DatabaseController::new(
            Arc::new(InMemoryStorageAdapter::new()),
            Arc::new(InMemorySchemaCache::new()),
        )
    }

    fn obj(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_validate_query() {
        assert_eq!(
            validate_query(&obj(json!({"ACL": "x"}))).unwrap_err().code(),
            102
        );
        assert_eq!(
            validate_query(&obj(json!({"$or": {"a": 1}}))).unwrap_err(),
            ParseError::InvalidQuery("Bad $or format - use an array value.".to_string())
        );
        assert_eq!(
            validate_query(&obj(json!({"$and": [{"1bad": 1}]})))
                .unwrap_err()
                .code(),
            105
        );
        assert!(validate_query(&obj(json!({"name": {"$regex": "a", "$options": "q"}}))).is_err());
        assert!(validate_query(&obj(json!({"a.b": 1, "_rperm": {"$in": ["*"]}}))).is_ok());
    }

    #[test]
    fn test_update_key_validation() {
        let err = validate_update_keys(&obj(json!({"authData.facebook.id": "1"}))).unwrap_err();
        assert_eq!(err.code(), 105);
        let err = validate_update_keys(&obj(json!({"meta": {"$set": 1}}))).unwrap_err();
        assert_eq!(err.code(), 121);
        assert!(validate_update_keys(&obj(json!({"_hashed_password": "x"}))).is_ok());
    }

    #[test]
    fn test_sanitize_only_echoes_operator_results() {
        let original = obj(json!({
            "name": "a",
            "score": {"__op": "Increment", "amount": 2},
            "tags": {"__op": "AddUnique", "objects": ["x"]}
        }));
        let stored = obj(json!({"name": "a", "score": 5, "tags": ["w", "x"]}));
        assert_eq!(
            sanitize_database_result(&original, &stored),
            obj(json!({"score": 5, "tags": ["w", "x"]}))
        );
    }

    #[test]
    fn test_filter_sensitive_user_data() {
        let stored = obj(json!({
            "objectId": "u1",
            "_hashed_password": "h",
            "sessionToken": "r:abc",
            "_email_verify_token": "t",
            "authData": {"anonymous": {"id": "1"}}
        }));
        let other = filter_sensitive_data(false, &["*".to_string()], "_User", stored.clone());
        assert_eq!(other, obj(json!({"objectId": "u1", "password": "h"})));
        let own = filter_sensitive_data(false, &["u1".to_string()], "_User", stored.clone());
        assert!(own.contains_key("authData"));
        let master = filter_sensitive_data(true, &[], "_User", stored);
        assert!(master.contains_key("_email_verify_token"));
        assert!(!master.contains_key("sessionToken"));
    }

    #[tokio::test]
    async fn test_create_and_find_with_acl() {
        let db = controller();
        db.create(
            "Note",
            obj(json!({"objectId": "n1", "text": "private", "ACL": {"u1": {"read": true, "write": true}}})),
            None,
        )
        .await
        .unwrap();
        db.create("Note", obj(json!({"objectId": "n2", "text": "open"})), None)
            .await
            .unwrap();

        let anonymous = db
            .find("Note", JsonObject::new(), &FindOptions::with_acl(vec!["*".to_string()]))
            .await
            .unwrap();
        assert_eq!(anonymous.len(), 1);

        let owner = db
            .find(
                "Note",
                JsonObject::new(),
                &FindOptions::with_acl(vec!["*".to_string(), "u1".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(owner.len(), 2);
        let private = owner
            .iter()
            .find(|o| o.get("objectId") == Some(&json!("n1")))
            .unwrap();
        assert_eq!(
            private.get("ACL"),
            Some(&json!({"u1": {"read": true, "write": true}}))
        );
        assert!(!private.contains_key("_rperm"));
    }

    #[tokio::test]
    async fn test_update_respects_write_acl() {
        let db = controller();
        db.create(
            "Note",
            obj(json!({"objectId": "n1", "ACL": {"*": {"read": true}}})),
            None,
        )
        .await
        .unwrap();
        let err = db
            .update(
                "Note",
                obj(json!({"objectId": "n1"})),
                obj(json!({"text": "x"})),
                &UpdateOptions {
                    acl: Some(vec!["*".to_string()]),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ParseError::ObjectNotFound("Object not found.".to_string()));
    }

    #[tokio::test]
    async fn test_relation_ops_and_related_to() {
        let db = controller();
        db.create(
            "Post",
            obj(json!({
                "objectId": "p1",
                "likes": {"__op": "AddRelation", "objects": [
                    {"__type": "Pointer", "className": "_User", "objectId": "u1"},
                    {"__type": "Pointer", "className": "_User", "objectId": "u2"}
                ]}
            })),
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            db.related_ids("Post", "likes", "p1").await.unwrap(),
            vec!["u1".to_string(), "u2".to_string()]
        );
        db.create("_User", obj(json!({"objectId": "u1", "username": "a"})), None)
            .await
            .unwrap();
        db.create("_User", obj(json!({"objectId": "u3", "username": "c"})), None)
            .await
            .unwrap();
        let liked = db
            .find(
                "_User",
                obj(json!({"$relatedTo": {
                    "object": {"__type": "Pointer", "className": "Post", "objectId": "p1"},
                    "key": "likes"
                }})),
                &FindOptions::master(),
            )
            .await
            .unwrap();
        assert_eq!(liked.len(), 1);
        assert_eq!(liked[0].get("username"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn test_pointer_permissions_restrict_reads() {
        let db = controller();
        let schema = db.load_schema(false).await.unwrap();
        let mut fields = SchemaFields::new();
        fields.insert("owner".to_string(), FieldSchema::pointer("_User"));
        let clp = ClassLevelPermissions {
            read_user_fields: Some(vec!["owner".to_string()]),
            get: Some(Default::default()),
            find: Some(Default::default()),
            ..ClassLevelPermissions::public()
        };
        schema
            .add_class_if_not_exists("Doc", fields, Some(clp), None)
            .await
            .unwrap();
        db.create(
            "Doc",
            obj(json!({"objectId": "d1", "owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"}})),
            None,
        )
        .await
        .unwrap();
        db.create(
            "Doc",
            obj(json!({"objectId": "d2", "owner": {"__type": "Pointer", "className": "_User", "objectId": "u2"}})),
            None,
        )
        .await
        .unwrap();
        let found = db
            .find(
                "Doc",
                JsonObject::new(),
                &FindOptions::with_acl(vec!["*".to_string(), "u1".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("objectId"), Some(&json!("d1")));

        let err = db
            .find(
                "Doc",
                obj(json!({"objectId": "d1"})),
                &FindOptions::with_acl(vec!["*".to_string()]),
            )
            .await
            .unwrap_err();
        // Logged out callers cannot own anything through a pointer permission.
        assert_eq!(err, ParseError::ObjectNotFound("Object not found.".to_string()));
    }

    #[tokio::test]
    async fn test_missing_session_destroy_is_absorbed() {
        let db = controller();
        db.destroy("_Session", obj(json!({"objectId": "nope"})), None)
            .await
            .unwrap();
        let err = db
            .destroy("Note", obj(json!({"objectId": "nope"})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 101);
    }

    #[tokio::test]
    async fn test_add_field_permission() {
        let db = controller();
        let schema = db.load_schema(false).await.unwrap();
        let clp = ClassLevelPermissions {
            add_field: Some(Default::default()),
            ..ClassLevelPermissions::public()
        };
        schema
            .add_class_if_not_exists("Locked", SchemaFields::new(), Some(clp), None)
            .await
            .unwrap();
        db.load_schema(true).await.unwrap();
        let err = db
            .validate_object(
                "Locked",
                &obj(json!({"fresh": 1})),
                None,
                Some(&["*".to_string()]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 119);
        db.validate_object("Locked", &obj(json!({"fresh": 1})), None, None)
            .await
            .unwrap();
    }
}
