// src/schema_controller.rs
use crate::adapter::StorageAdapter;
use crate::cache::SchemaCache;
use crate::error::ParseError;
use crate::permissions;
use crate::schema::{
    base_columns, build_merged_schema_object, class_name_is_valid,
    convert_adapter_schema_to_parse_schema, convert_schema_to_adapter_schema, default_columns,
    field_name_is_valid, field_name_is_valid_for_class, get_type, inject_default_schema,
    invalid_class_name_message, is_volatile_class, join_table_name, required_columns,
    validate_clp, validate_schema_data, volatile_class_schemas, ClassLevelPermissions, ClpOperation, FieldChange,
    FieldSchema, FieldType, Indexes, ParseSchema, SchemaFields,
};
use crate::types::{is_truthy, JsonObject};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The in-memory snapshot a reload produces: every stored class plus the
/// volatile classes, each with its default columns injected.
#[derive(Debug, Clone, Default)]
pub struct SchemaData {
    classes: HashMap<String, ParseSchema>,
}

impl SchemaData {
    fn from_schemas(schemas: Vec<ParseSchema>) -> Self {
        let mut classes: HashMap<String, ParseSchema> = schemas
            .iter()
            .map(|schema| (schema.class_name.clone(), inject_default_schema(schema)))
            .collect();
        for schema in volatile_class_schemas() {
            classes.insert(schema.class_name.clone(), inject_default_schema(&schema));
        }
        SchemaData { classes }
    }

    pub fn get(&self, class_name: &str) -> Option<&ParseSchema> {
        self.classes.get(class_name)
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.classes.contains_key(class_name)
    }
}

/// Owns the class -> field type registry and the class-level permissions, and
/// mediates every schema read and write through the storage adapter and cache.
///
/// One instance is shared by all concurrent requests of a server.
pub struct SchemaController {
    adapter: Arc<dyn StorageAdapter>,
    cache: Arc<dyn SchemaCache>,
    data: RwLock<SchemaData>,
    reload_lock: tokio::sync::Mutex<()>,
    reload_generation: AtomicU64,
    last_reload: Mutex<Result<(), ParseError>>,
}

impl SchemaController {
    pub fn new(adapter: Arc<dyn StorageAdapter>, cache: Arc<dyn SchemaCache>) -> Self {
        SchemaController {
            adapter,
            cache,
            data: RwLock::new(SchemaData::from_schemas(Vec::new())),
            reload_lock: tokio::sync::Mutex::new(()),
            reload_generation: AtomicU64::new(0),
            last_reload: Mutex::new(Ok(())),
        }
    }

    /// Rebuilds the snapshot from the cache or adapter.
    ///
    /// Callers that arrive while a reload is in flight and do not ask for
    /// `clear_cache` wait for it and share its outcome instead of issuing another
    /// read. On failure the snapshot is reset to the volatile classes only and
    /// the error is returned.
    pub async fn reload_data(&self, clear_cache: bool) -> Result<(), ParseError> {
        let observed = self.reload_generation.load(Ordering::SeqCst);
        let _guard = self.reload_lock.lock().await;
        if !clear_cache && self.reload_generation.load(Ordering::SeqCst) != observed {
            return self.last_reload.lock().clone();
        }

        if clear_cache {
            self.cache.clear().await;
        }
        let outcome = match self.get_all_classes(clear_cache).await {
            Ok(schemas) => {
                *self.data.write() = SchemaData::from_schemas(schemas);
                Ok(())
            }
            Err(err) => {
                log::error!("Schema reload failed: {}", err);
                *self.data.write() = SchemaData::from_schemas(Vec::new());
                Err(err)
            }
        };
        *self.last_reload.lock() = outcome.clone();
        self.reload_generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// The snapshot entry for `class_name`, in storage form with default columns.
    pub fn class_schema(&self, class_name: &str) -> Option<ParseSchema> {
        self.data.read().get(class_name).cloned()
    }

    pub fn class_level_permissions(&self, class_name: &str) -> Option<ClassLevelPermissions> {
        self.data
            .read()
            .get(class_name)
            .map(|schema| schema.class_level_permissions.clone())
    }

    pub async fn get_all_classes(&self, clear_cache: bool) -> Result<Vec<ParseSchema>, ParseError> {
        if !clear_cache {
            if let Some(schemas) = self.cache.get_all_classes().await {
                if !schemas.is_empty() {
                    return Ok(schemas);
                }
            }
        }
        self.set_all_classes().await
    }

    async fn set_all_classes(&self) -> Result<Vec<ParseSchema>, ParseError> {
        log::debug!("Loading all classes from the storage adapter");
        let schemas: Vec<ParseSchema> = self
            .adapter
            .get_all_classes()
            .await?
            .iter()
            .map(inject_default_schema)
            .collect();
        self.cache.set_all_classes(schemas.clone()).await;
        Ok(schemas)
    }

    /// Looks up one class, cache first. Volatile classes are served from the
    /// snapshot when `allow_volatile` is set. `Ok(None)` means the class does not exist.
    pub async fn get_one_schema(
        &self,
        class_name: &str,
        allow_volatile: bool,
        clear_cache: bool,
    ) -> Result<Option<ParseSchema>, ParseError> {
        if clear_cache {
            self.cache.clear().await;
        }
        if allow_volatile && is_volatile_class(class_name) {
            return Ok(self.class_schema(class_name));
        }
        if !clear_cache {
            if let Some(cached) = self.cache.get_one_schema(class_name).await {
                return Ok(Some(cached));
            }
        }
        let schemas = self.set_all_classes().await?;
        Ok(schemas
            .into_iter()
            .find(|schema| schema.class_name == class_name))
    }

    pub async fn has_class(&self, class_name: &str) -> Result<bool, ParseError> {
        self.reload_data(false).await?;
        Ok(self.data.read().contains(class_name))
    }

    fn validate_new_class(
        &self,
        class_name: &str,
        fields: &SchemaFields,
        clp: Option<&ClassLevelPermissions>,
    ) -> Result<(), ParseError> {
        if self.data.read().contains(class_name) {
            return Err(ParseError::InvalidClassName(format!(
                "Class {} already exists.",
                class_name
            )));
        }
        if !class_name_is_valid(class_name) {
            return Err(ParseError::InvalidClassName(invalid_class_name_message(
                class_name,
            )));
        }
        validate_schema_data(class_name, fields, clp, &[])
    }

    /// Creates a class. Fails with `INVALID_CLASS_NAME` when the class exists,
    /// including when a concurrent writer created it first.
    ///
    /// Without permissions the class is public; supplied permissions close every
    /// operation they do not mention.
    pub async fn add_class_if_not_exists(
        &self,
        class_name: &str,
        fields: SchemaFields,
        clp: Option<ClassLevelPermissions>,
        indexes: Option<Indexes>,
    ) -> Result<ParseSchema, ParseError> {
        self.validate_new_class(class_name, &fields, clp.as_ref())?;
        let schema = ParseSchema {
            class_name: class_name.to_string(),
            fields,
            class_level_permissions: clp
                .map(ClassLevelPermissions::close_unset_operations)
                .unwrap_or_else(ClassLevelPermissions::public),
            indexes,
        };
        match self
            .adapter
            .create_class(class_name, &convert_schema_to_adapter_schema(&schema))
            .await
        {
            Ok(created) => {
                self.cache.clear().await;
                log::debug!("Created class {}", class_name);
                Ok(convert_adapter_schema_to_parse_schema(&created))
            }
            Err(ParseError::DuplicateValue { .. }) => Err(ParseError::InvalidClassName(format!(
                "Class {} already exists.",
                class_name
            ))),
            Err(err) => Err(err),
        }
    }

    /// Applies field additions/deletions, permissions and indexes to an existing class.
    ///
    /// Deletions complete (and the snapshot is reloaded) before any addition starts.
    /// Returns the reloaded class in wire form.
    pub async fn update_class(
        &self,
        class_name: &str,
        submitted_fields: BTreeMap<String, FieldChange>,
        clp: Option<ClassLevelPermissions>,
        indexes: Option<Indexes>,
    ) -> Result<ParseSchema, ParseError> {
        let schema = self
            .get_one_schema(class_name, false, false)
            .await?
            .ok_or_else(|| {
                ParseError::InvalidClassName(format!("Class {} does not exist.", class_name))
            })?;

        let mut existing_fields = schema.fields.clone();
        for (name, change) in &submitted_fields {
            let exists = existing_fields.contains_key(name);
            if exists && !change.is_delete() {
                return Err(ParseError::FieldStateConflict(format!(
                    "Field {} exists, cannot update.",
                    name
                )));
            }
            if !exists && change.is_delete() {
                return Err(ParseError::FieldStateConflict(format!(
                    "Field {} does not exist, cannot delete.",
                    name
                )));
            }
        }
        existing_fields.remove("_rperm");
        existing_fields.remove("_wperm");

        let new_schema = build_merged_schema_object(class_name, &existing_fields, &submitted_fields);
        let mut full_new_schema = new_schema.clone();
        let defaults = default_columns(class_name);
        full_new_schema.extend(if defaults.is_empty() {
            base_columns()
        } else {
            defaults
        });
        let existing_names: Vec<String> = existing_fields.keys().cloned().collect();
        validate_schema_data(class_name, &new_schema, clp.as_ref(), &existing_names)?;

        let mut deleted = Vec::new();
        let mut inserted = Vec::new();
        for (name, change) in submitted_fields {
            match change {
                FieldChange::Delete => deleted.push(name),
                FieldChange::Set(field) => inserted.push((name, field)),
            }
        }
        if !deleted.is_empty() {
            self.delete_fields(&deleted, class_name).await?;
        }
        self.reload_data(true).await?;
        for (name, field) in inserted {
            self.enforce_field_exists(class_name, &name, Some(field))
                .await?;
        }
        self.set_permissions(class_name, clp, &full_new_schema)
            .await?;
        if let Some(indexes) = &indexes {
            self.adapter
                .set_indexes_with_schema_format(
                    class_name,
                    indexes,
                    &schema.indexes.clone().unwrap_or_default(),
                    &full_new_schema,
                )
                .await?;
        }
        self.reload_data(true).await?;

        let reloaded = self.class_schema(class_name).ok_or_else(|| {
            ParseError::InvalidClassName(format!("Class {} does not exist.", class_name))
        })?;
        Ok(convert_adapter_schema_to_parse_schema(&reloaded))
    }

    /// Validates and stores new class-level permissions. `None` leaves them untouched.
    pub async fn set_permissions(
        &self,
        class_name: &str,
        perms: Option<ClassLevelPermissions>,
        new_schema: &SchemaFields,
    ) -> Result<(), ParseError> {
        let Some(perms) = perms else {
            return Ok(());
        };
        validate_clp(&perms, new_schema)?;
        self.adapter
            .set_class_level_permissions(class_name, &perms.close_unset_operations())
            .await?;
        self.reload_data(true).await
    }

    /// Makes sure `class_name` exists, creating it when this is its first write.
    /// A concurrent creation of the same class is tolerated.
    pub async fn enforce_class_exists(&self, class_name: &str) -> Result<(), ParseError> {
        if self.data.read().contains(class_name) {
            return Ok(());
        }
        if !class_name_is_valid(class_name) {
            return Err(ParseError::InvalidClassName(invalid_class_name_message(
                class_name,
            )));
        }
        if let Err(err) = self
            .add_class_if_not_exists(class_name, SchemaFields::new(), None, None)
            .await
        {
            log::debug!("Class {} was not created here: {}", class_name, err);
        }
        self.reload_data(true).await.map_err(|_| {
            ParseError::InvalidJson("schema class name does not revalidate".to_string())
        })?;
        if self.data.read().contains(class_name) {
            Ok(())
        } else {
            Err(ParseError::InvalidJson(format!("Failed to add {}", class_name)))
        }
    }

    /// Makes sure `field_name` exists on the class with the given type.
    ///
    /// Dotted names (`a.b`) enforce an `Object` field `a`. An existing field must
    /// match the type exactly. A concurrent writer adding the same field is
    /// absorbed; a conflicting type surfaces `INCORRECT_TYPE`.
    pub async fn enforce_field_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field: Option<FieldSchema>,
    ) -> Result<(), ParseError> {
        let (field_name, field) = match field_name.split_once('.') {
            Some((root, _)) if !root.is_empty() => {
                (root, Some(FieldSchema::new(FieldType::Object)))
            }
            _ => (field_name, field),
        };
        if !field_name_is_valid(field_name) {
            return Err(ParseError::InvalidKeyName(format!(
                "Invalid field name: {}.",
                field_name
            )));
        }
        let Some(field) = field else {
            return Ok(());
        };

        self.reload_data(false).await?;
        if let Some(expected) = self.get_expected_type(class_name, field_name) {
            if !expected.type_matches(&field) {
                return Err(ParseError::IncorrectType(format!(
                    "schema mismatch for {}.{}; expected {} but got {}",
                    class_name, field_name, expected, field
                )));
            }
            return Ok(());
        }
        if field.field_type == FieldType::GeoPoint {
            if let Some(existing) = self.class_schema(class_name).and_then(|schema| {
                schema
                    .fields
                    .iter()
                    .find(|(_, f)| f.field_type == FieldType::GeoPoint)
                    .map(|(name, _)| name.clone())
            }) {
                return Err(ParseError::IncorrectType(format!(
                    "currently, only one GeoPoint field may exist in an object. Adding {} when {} already exists.",
                    field_name, existing
                )));
            }
        }

        match self
            .adapter
            .add_field_if_not_exists(class_name, field_name, &field)
            .await
        {
            Ok(()) => {}
            Err(err @ ParseError::IncorrectType(_)) => return Err(err),
            Err(err) => log::debug!(
                "Adding {}.{} raced with another writer: {}",
                class_name,
                field_name,
                err
            ),
        }
        self.reload_data(true).await?;
        match self.get_expected_type(class_name, field_name) {
            Some(expected) if expected.type_matches(&field) => {
                self.cache.clear().await;
                Ok(())
            }
            _ => Err(ParseError::InvalidJson(format!(
                "Could not add field {}",
                field_name
            ))),
        }
    }

    pub async fn delete_field(&self, field_name: &str, class_name: &str) -> Result<(), ParseError> {
        self.delete_fields(&[field_name.to_string()], class_name)
            .await
    }

    /// Removes fields from a class. Relation fields also drop their `_Join` table.
    pub async fn delete_fields(
        &self,
        field_names: &[String],
        class_name: &str,
    ) -> Result<(), ParseError> {
        if !class_name_is_valid(class_name) {
            return Err(ParseError::InvalidClassName(invalid_class_name_message(
                class_name,
            )));
        }
        for name in field_names {
            if !field_name_is_valid(name) {
                return Err(ParseError::InvalidKeyName(format!(
                    "invalid field name: {}",
                    name
                )));
            }
            if !field_name_is_valid_for_class(name, class_name) {
                return Err(ParseError::ChangedImmutableField(format!(
                    "field {} cannot be changed",
                    name
                )));
            }
        }

        let schema = self
            .get_one_schema(class_name, false, true)
            .await?
            .ok_or_else(|| {
                ParseError::InvalidClassName(format!("Class {} does not exist.", class_name))
            })?;
        if let Some(missing) = field_names
            .iter()
            .find(|name| !schema.fields.contains_key(*name))
        {
            return Err(ParseError::FieldStateConflict(format!(
                "Field {} does not exist, cannot delete.",
                missing
            )));
        }

        self.adapter
            .delete_fields(class_name, &schema, field_names)
            .await?;
        for name in field_names {
            let is_relation = schema
                .fields
                .get(name)
                .is_some_and(|field| field.field_type == FieldType::Relation);
            if is_relation {
                self.adapter
                    .delete_class(&join_table_name(name, class_name))
                    .await?;
            }
        }
        self.cache.clear().await;
        Ok(())
    }

    /// Validates a REST object against the class, adding any field seen for the first time.
    ///
    /// Every field is checked before a second GeoPoint is reported, so one
    /// error carries the complete diagnosis.
    pub async fn validate_object(
        &self,
        class_name: &str,
        object: &JsonObject,
        query: Option<&JsonObject>,
    ) -> Result<(), ParseError> {
        self.enforce_class_exists(class_name).await?;

        let mut geo_points = 0;
        let mut geo_error = None;
        for (field_name, value) in object {
            let expected = get_type(value)?;
            if expected
                .as_ref()
                .is_some_and(|t| t.field_type == FieldType::GeoPoint)
            {
                geo_points += 1;
                if geo_points > 1 {
                    geo_error.get_or_insert_with(|| {
                        ParseError::IncorrectType(
                            "there can only be one geopoint field in a class".to_string(),
                        )
                    });
                    continue;
                }
            }
            let Some(expected) = expected else { continue };
            if field_name == "ACL" {
                continue;
            }
            self.enforce_field_exists(class_name, field_name, Some(expected))
                .await?;
        }
        if let Some(err) = geo_error {
            return Err(err);
        }
        self.validate_required_columns(class_name, object, query)
    }

    /// Creates must carry every required column; updates may not delete one.
    pub fn validate_required_columns(
        &self,
        class_name: &str,
        object: &JsonObject,
        query: Option<&JsonObject>,
    ) -> Result<(), ParseError> {
        let is_update = query.is_some_and(|q| is_truthy(q.get("objectId")));
        let missing = required_columns(class_name).iter().find(|column| {
            let value = object.get(**column);
            if is_update {
                value.is_some_and(|v| {
                    v.get("__op").and_then(Value::as_str) == Some("Delete")
                })
            } else {
                !is_truthy(value)
            }
        });
        match missing {
            Some(column) => Err(ParseError::IncorrectType(format!("{} is required.", column))),
            None => Ok(()),
        }
    }

    pub fn test_base_clp(
        &self,
        class_name: &str,
        acl_group: &[String],
        operation: ClpOperation,
    ) -> bool {
        let data = self.data.read();
        permissions::test_base_clp(
            data.get(class_name).map(|s| &s.class_level_permissions),
            acl_group,
            operation,
        )
    }

    pub fn validate_permission(
        &self,
        class_name: &str,
        acl_group: &[String],
        operation: ClpOperation,
    ) -> Result<(), ParseError> {
        let data = self.data.read();
        permissions::validate_permission(
            class_name,
            data.get(class_name).map(|s| &s.class_level_permissions),
            acl_group,
            operation,
        )
    }

    /// The registered type of a field, if the class and field exist.
    pub fn get_expected_type(&self, class_name: &str, field_name: &str) -> Option<FieldSchema> {
        self.data
            .read()
            .get(class_name)
            .and_then(|schema| schema.fields.get(field_name))
            .cloned()
    }
}
