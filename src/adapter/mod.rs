// src/adapter/mod.rs
//
// The storage contract the core talks to. Objects crossing this boundary are in
// storage form: `_rperm`/`_wperm` instead of `ACL`, `_hashed_password` instead of
// `password`, and `createdAt`/`updatedAt` as plain ISO-8601 strings.

mod memory;

pub use memory::InMemoryStorageAdapter;

use crate::error::ParseError;
use crate::schema::{ClassLevelPermissions, FieldSchema, Indexes, ParseSchema, SchemaFields};
use crate::types::JsonObject;
use async_trait::async_trait;
use serde_json::Value;

/// Sort direction for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
    /// Full-text relevance (`$score`); adapters without text search ignore it.
    TextScore,
}

/// Paging, ordering and projection for an adapter `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub sort: Vec<(String, SortOrder)>,
    pub keys: Option<Vec<String>>,
    pub read_preference: Option<String>,
}

/// A document store conforming to the find/create/update/destroy + schema contract.
///
/// Errors surface as [`ParseError`]s; `DuplicateValue` and `ObjectNotFound` are
/// interpreted by the core.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Returns the stored schema of `class_name`, or `None` when the class does not exist.
    async fn get_class(&self, class_name: &str) -> Result<Option<ParseSchema>, ParseError>;

    async fn get_all_classes(&self) -> Result<Vec<ParseSchema>, ParseError>;

    /// Fails with `DuplicateValue` when the class already exists.
    async fn create_class(
        &self,
        class_name: &str,
        schema: &ParseSchema,
    ) -> Result<ParseSchema, ParseError>;

    /// Idempotent for an identical type; fails with `IncorrectType` when the
    /// field exists with another type.
    async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field: &FieldSchema,
    ) -> Result<(), ParseError>;

    /// Removes the fields from the schema and from every stored object.
    async fn delete_fields(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        field_names: &[String],
    ) -> Result<(), ParseError>;

    /// Drops the class and all its objects. Missing classes are not an error.
    async fn delete_class(&self, class_name: &str) -> Result<(), ParseError>;

    async fn set_class_level_permissions(
        &self,
        class_name: &str,
        clp: &ClassLevelPermissions,
    ) -> Result<(), ParseError>;

    /// Applies index additions and `{"__op": "Delete"}` removals against the existing set.
    async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        submitted: &Indexes,
        existing: &Indexes,
        fields: &SchemaFields,
    ) -> Result<(), ParseError>;

    async fn create_object(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        object: JsonObject,
    ) -> Result<JsonObject, ParseError>;

    async fn find(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
        options: &QueryOptions,
    ) -> Result<Vec<JsonObject>, ParseError>;

    async fn count(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
    ) -> Result<u64, ParseError>;

    async fn distinct(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
        field_name: &str,
    ) -> Result<Vec<Value>, ParseError>;

    async fn aggregate(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, ParseError>;

    /// Updates the first match and returns it after the update, or `None` if nothing matched.
    async fn find_one_and_update(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
        update: &JsonObject,
    ) -> Result<Option<JsonObject>, ParseError>;

    /// Updates every match and returns how many were touched.
    async fn update_objects_by_query(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
        update: &JsonObject,
    ) -> Result<u64, ParseError>;

    /// Updates the first match, or creates `query` merged with `update` when nothing matches.
    async fn upsert_one_object(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
        update: &JsonObject,
    ) -> Result<(), ParseError>;

    /// Fails with `ObjectNotFound` when nothing matched.
    async fn delete_objects_by_query(
        &self,
        class_name: &str,
        schema: &ParseSchema,
        query: &JsonObject,
    ) -> Result<u64, ParseError>;
}
