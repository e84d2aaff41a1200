// src/schema.rs
//
// Schema wire types plus the pure validation and conversion rules that the
// schema controller applies. Nothing in here touches storage.

use crate::error::ParseError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Represents the possible data types for a field in a Parse class schema.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object, // Generic JSON object
    Array,
    Pointer,
    Relation,
    File,
    GeoPoint,
    ACL,
    Bytes,
    Polygon,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Number => "Number",
            FieldType::Boolean => "Boolean",
            FieldType::Date => "Date",
            FieldType::Object => "Object",
            FieldType::Array => "Array",
            FieldType::Pointer => "Pointer",
            FieldType::Relation => "Relation",
            FieldType::File => "File",
            FieldType::GeoPoint => "GeoPoint",
            FieldType::ACL => "ACL",
            FieldType::Bytes => "Bytes",
            FieldType::Polygon => "Polygon",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }

    pub fn is_relational(&self) -> bool {
        matches!(self, FieldType::Pointer | FieldType::Relation)
    }
}

/// Represents the schema definition for a single field within a Parse class.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FieldSchema {
    /// The data type of the field.
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// For `Pointer` and `Relation` types, this specifies the target class name.
    #[serde(rename = "targetClass", skip_serializing_if = "Option::is_none")]
    pub target_class: Option<String>,

    /// Indicates if the field is required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    /// The default value for the field.
    #[serde(rename = "defaultValue", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl FieldSchema {
    pub fn new(field_type: FieldType) -> Self {
        FieldSchema {
            field_type,
            target_class: None,
            required: None,
            default_value: None,
        }
    }

    pub fn pointer(target_class: impl Into<String>) -> Self {
        FieldSchema {
            target_class: Some(target_class.into()),
            ..FieldSchema::new(FieldType::Pointer)
        }
    }

    pub fn relation(target_class: impl Into<String>) -> Self {
        FieldSchema {
            target_class: Some(target_class.into()),
            ..FieldSchema::new(FieldType::Relation)
        }
    }

    /// Parses a raw field definition (`{"type": "Pointer", "targetClass": "_User"}`).
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseError::InvalidJson("invalid JSON".to_string()))?;
        let type_name = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::InvalidJson("invalid JSON".to_string()))?;
        let field_type = FieldType::parse(type_name).ok_or_else(|| {
            ParseError::IncorrectType(format!("invalid field type: {}", type_name))
        })?;
        let target_class = match obj.get("targetClass") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(ParseError::InvalidJson("invalid JSON".to_string())),
        };
        Ok(FieldSchema {
            field_type,
            target_class,
            required: obj.get("required").and_then(Value::as_bool),
            default_value: obj.get("defaultValue").cloned(),
        })
    }

    /// Type and target class must both agree; `required`/`defaultValue` are ignored.
    pub fn type_matches(&self, other: &FieldSchema) -> bool {
        self.field_type == other.field_type && self.target_class == other.target_class
    }
}

impl fmt::Display for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target_class {
            Some(target) => write!(f, "{}<{}>", self.field_type.as_str(), target),
            None => write!(f, "{}", self.field_type.as_str()),
        }
    }
}

pub type SchemaFields = BTreeMap<String, FieldSchema>;

/// Operations a class-level permission can govern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClpOperation {
    Find,
    Count,
    Get,
    Create,
    Update,
    Delete,
    AddField,
}

impl ClpOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClpOperation::Find => "find",
            ClpOperation::Count => "count",
            ClpOperation::Get => "get",
            ClpOperation::Create => "create",
            ClpOperation::Update => "update",
            ClpOperation::Delete => "delete",
            ClpOperation::AddField => "addField",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            ClpOperation::Get | ClpOperation::Find | ClpOperation::Count
        )
    }
}

impl fmt::Display for ClpOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CLP_VALID_KEYS: &[&str] = &[
    "find",
    "count",
    "get",
    "create",
    "update",
    "delete",
    "addField",
    "readUserFields",
    "writeUserFields",
];

/// Represents the Class Level Permissions (CLP) for a Parse class schema.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClassLevelPermissions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub find: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_field: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_user_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_user_fields: Option<Vec<String>>,
}

impl ClassLevelPermissions {
    /// Public access for every operation; what a class gets when created without CLPs.
    pub fn public() -> Self {
        let public: BTreeMap<String, bool> = [("*".to_string(), true)].into_iter().collect();
        ClassLevelPermissions {
            get: Some(public.clone()),
            find: Some(public.clone()),
            count: Some(public.clone()),
            create: Some(public.clone()),
            update: Some(public.clone()),
            delete: Some(public.clone()),
            add_field: Some(public),
            read_user_fields: None,
            write_user_fields: None,
        }
    }

    /// Explicitly supplied permissions close every operation they leave out.
    pub fn close_unset_operations(mut self) -> Self {
        for slot in [
            &mut self.get,
            &mut self.find,
            &mut self.count,
            &mut self.create,
            &mut self.update,
            &mut self.delete,
            &mut self.add_field,
        ] {
            slot.get_or_insert_with(BTreeMap::new);
        }
        self
    }

    pub fn operation(&self, operation: ClpOperation) -> Option<&BTreeMap<String, bool>> {
        match operation {
            ClpOperation::Find => self.find.as_ref(),
            ClpOperation::Count => self.count.as_ref(),
            ClpOperation::Get => self.get.as_ref(),
            ClpOperation::Create => self.create.as_ref(),
            ClpOperation::Update => self.update.as_ref(),
            ClpOperation::Delete => self.delete.as_ref(),
            ClpOperation::AddField => self.add_field.as_ref(),
        }
    }

    /// `readUserFields` for reads, `writeUserFields` for everything else.
    pub fn pointer_fields(&self, operation: ClpOperation) -> Option<&Vec<String>> {
        if operation.is_read() {
            self.read_user_fields.as_ref()
        } else {
            self.write_user_fields.as_ref()
        }
    }

    /// Parses raw CLP JSON, rejecting operations that do not exist.
    /// Key and value checks happen in [`validate_clp`], once the fields are known.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let obj = value.as_object().ok_or_else(|| {
            ParseError::InvalidJson(format!(
                "'{}' is not a valid value for class level permissions",
                value
            ))
        })?;
        for (operation, perms) in obj {
            if !CLP_VALID_KEYS.contains(&operation.as_str()) {
                return Err(ParseError::InvalidJson(format!(
                    "{} is not a valid operation for class level permissions",
                    operation
                )));
            }
            if operation == "readUserFields" || operation == "writeUserFields" {
                if !perms.is_array() {
                    return Err(ParseError::InvalidJson(format!(
                        "'{}' is not a valid value for class level permissions {}",
                        perms, operation
                    )));
                }
                continue;
            }
            if let Some(entries) = perms.as_object() {
                for (key, perm) in entries {
                    verify_permission_key(key)?;
                    if perm != &Value::Bool(true) {
                        return Err(ParseError::InvalidJson(format!(
                            "'{}' is not a valid value for class level permissions {}:{}:{}",
                            perm, operation, key, perm
                        )));
                    }
                }
            }
        }
        serde_json::from_value(value.clone()).map_err(|e| ParseError::InvalidJson(e.to_string()))
    }

    fn operation_maps(&self) -> [(ClpOperation, Option<&BTreeMap<String, bool>>); 7] {
        [
            (ClpOperation::Find, self.find.as_ref()),
            (ClpOperation::Count, self.count.as_ref()),
            (ClpOperation::Get, self.get.as_ref()),
            (ClpOperation::Create, self.create.as_ref()),
            (ClpOperation::Update, self.update.as_ref()),
            (ClpOperation::Delete, self.delete.as_ref()),
            (ClpOperation::AddField, self.add_field.as_ref()),
        ]
    }
}

/// Index definitions keyed by index name, each a field -> sort-order/kind map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum IndexFieldType {
    SortOrder(i32),
    Text(String),
    Other(Value),
}

pub type Indexes = BTreeMap<String, BTreeMap<String, IndexFieldType>>;

/// Represents the schema for a Parse class, including its fields, CLP, and indexes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParseSchema {
    pub class_name: String,
    #[serde(default)]
    pub fields: SchemaFields,
    #[serde(default)]
    pub class_level_permissions: ClassLevelPermissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Indexes>,
}

impl ParseSchema {
    pub fn new(class_name: impl Into<String>) -> Self {
        ParseSchema {
            class_name: class_name.into(),
            fields: SchemaFields::new(),
            class_level_permissions: ClassLevelPermissions::default(),
            indexes: None,
        }
    }
}

/// A field entry submitted to `update_class`: either a new definition or a delete.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Set(FieldSchema),
    Delete,
}

impl FieldChange {
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        if value.get("__op").and_then(Value::as_str) == Some("Delete") {
            return Ok(FieldChange::Delete);
        }
        FieldSchema::from_value(value).map(FieldChange::Set)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, FieldChange::Delete)
    }
}

pub const SYSTEM_CLASSES: &[&str] = &[
    "_User",
    "_Installation",
    "_Role",
    "_Session",
    "_Product",
    "_PushStatus",
    "_JobStatus",
    "_JobSchedule",
    "_Audience",
    "_ExportProgress",
];

/// Classes that live only in memory: their schema is never read from or written to storage.
pub const VOLATILE_CLASSES: &[&str] = &[
    "_JobStatus",
    "_PushStatus",
    "_Hooks",
    "_GlobalConfig",
    "_JobSchedule",
    "_Audience",
    "_ExportProgress",
];

pub fn is_system_class(class_name: &str) -> bool {
    SYSTEM_CLASSES.contains(&class_name)
}

pub fn is_volatile_class(class_name: &str) -> bool {
    VOLATILE_CLASSES.contains(&class_name)
}

fn field(field_type: FieldType) -> FieldSchema {
    FieldSchema::new(field_type)
}

fn columns(entries: &[(&str, FieldSchema)]) -> SchemaFields {
    entries
        .iter()
        .map(|(name, schema)| (name.to_string(), schema.clone()))
        .collect()
}

/// Columns every class carries.
pub fn base_columns() -> SchemaFields {
    columns(&[
        ("objectId", field(FieldType::String)),
        ("createdAt", field(FieldType::Date)),
        ("updatedAt", field(FieldType::Date)),
        ("ACL", field(FieldType::ACL)),
    ])
}

/// Mandatory extra columns for system and volatile classes. Empty for user classes.
pub fn default_columns(class_name: &str) -> SchemaFields {
    use FieldType::*;
    match class_name {
        "_User" => columns(&[
            ("username", field(String)),
            ("password", field(String)),
            ("email", field(String)),
            ("emailVerified", field(Boolean)),
            ("authData", field(Object)),
        ]),
        "_Installation" => columns(&[
            ("installationId", field(String)),
            ("deviceToken", field(String)),
            ("channels", field(Array)),
            ("deviceType", field(String)),
            ("pushType", field(String)),
            ("GCMSenderId", field(String)),
            ("timeZone", field(String)),
            ("localeIdentifier", field(String)),
            ("badge", field(Number)),
            ("appVersion", field(String)),
            ("appName", field(String)),
            ("appIdentifier", field(String)),
            ("parseVersion", field(String)),
        ]),
        "_Role" => columns(&[
            ("name", field(String)),
            ("users", FieldSchema::relation("_User")),
            ("roles", FieldSchema::relation("_Role")),
        ]),
        "_Session" => columns(&[
            ("restricted", field(Boolean)),
            ("user", FieldSchema::pointer("_User")),
            ("installationId", field(String)),
            ("sessionToken", field(String)),
            ("expiresAt", field(Date)),
            ("createdWith", field(Object)),
        ]),
        "_Product" => columns(&[
            ("productIdentifier", field(String)),
            ("download", field(File)),
            ("downloadName", field(String)),
            ("icon", field(File)),
            ("order", field(Number)),
            ("title", field(String)),
            ("subtitle", field(String)),
        ]),
        "_PushStatus" => columns(&[
            ("pushTime", field(String)),
            ("source", field(String)),
            ("query", field(String)),
            ("payload", field(String)),
            ("title", field(String)),
            ("expiry", field(Number)),
            ("expiration_interval", field(Number)),
            ("status", field(String)),
            ("numSent", field(Number)),
            ("numFailed", field(Number)),
            ("pushHash", field(String)),
            ("errorMessage", field(Object)),
            ("sentPerType", field(Object)),
            ("failedPerType", field(Object)),
            ("sentPerUTCOffset", field(Object)),
            ("failedPerUTCOffset", field(Object)),
            ("count", field(Number)),
        ]),
        "_JobStatus" => columns(&[
            ("jobName", field(String)),
            ("source", field(String)),
            ("status", field(String)),
            ("message", field(String)),
            ("params", field(Object)),
            ("finishedAt", field(Date)),
        ]),
        "_JobSchedule" => columns(&[
            ("jobName", field(String)),
            ("description", field(String)),
            ("params", field(String)),
            ("startAfter", field(String)),
            ("daysOfWeek", field(Array)),
            ("timeOfDay", field(String)),
            ("lastRun", field(Number)),
            ("repeatMinutes", field(Number)),
        ]),
        "_Hooks" => columns(&[
            ("functionName", field(String)),
            ("className", field(String)),
            ("triggerName", field(String)),
            ("url", field(String)),
        ]),
        "_GlobalConfig" => columns(&[
            ("objectId", field(String)),
            ("params", field(Object)),
        ]),
        "_Audience" => columns(&[
            ("objectId", field(String)),
            ("name", field(String)),
            ("query", field(String)),
            ("lastUsed", field(Date)),
            ("timesUsed", field(Number)),
        ]),
        "_ExportProgress" => columns(&[
            ("objectId", field(String)),
            ("id", field(String)),
            ("masterKey", field(String)),
            ("applicationId", field(String)),
        ]),
        _ => SchemaFields::new(),
    }
}

/// Columns a create must provide (and an update may not delete).
pub fn required_columns(class_name: &str) -> &'static [&'static str] {
    match class_name {
        "_Product" => &["productIdentifier", "icon", "order", "title", "subtitle"],
        "_Role" => &["name", "ACL"],
        _ => &[],
    }
}

fn class_and_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid regex"))
}

fn join_class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^_Join:[A-Za-z0-9_]+:[A-Za-z0-9_]+").expect("valid regex"))
}

fn permission_key_regexes() -> &'static [Regex; 4] {
    static RE: OnceLock<[Regex; 4]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"^[a-zA-Z0-9]{10}$").expect("valid regex"),
            Regex::new(r"^role:.*").expect("valid regex"),
            Regex::new(r"^\*$").expect("valid regex"),
            Regex::new(r"^requiresAuthentication$").expect("valid regex"),
        ]
    })
}

pub fn field_name_is_valid(field_name: &str) -> bool {
    class_and_field_regex().is_match(field_name)
}

pub fn class_name_is_valid(class_name: &str) -> bool {
    is_system_class(class_name)
        || join_class_regex().is_match(class_name)
        || field_name_is_valid(class_name)
}

/// False for names that are malformed or that shadow a default column of the class.
pub fn field_name_is_valid_for_class(field_name: &str, class_name: &str) -> bool {
    if !field_name_is_valid(field_name) {
        return false;
    }
    if base_columns().contains_key(field_name) {
        return false;
    }
    !default_columns(class_name).contains_key(field_name)
}

pub fn invalid_class_name_message(class_name: &str) -> String {
    format!(
        "Invalid classname: {}, classnames can only have alphanumeric characters and _, and must start with an alpha character ",
        class_name
    )
}

pub fn join_table_name(field_name: &str, class_name: &str) -> String {
    format!("_Join:{}:{}", field_name, class_name)
}

fn verify_permission_key(key: &str) -> Result<(), ParseError> {
    if permission_key_regexes().iter().any(|re| re.is_match(key)) {
        Ok(())
    } else {
        Err(ParseError::InvalidJson(format!(
            "'{}' is not a valid key for class level permissions",
            key
        )))
    }
}

/// Checks a field definition submitted by a client.
pub fn field_type_is_invalid(schema: &FieldSchema) -> Option<ParseError> {
    if schema.field_type.is_relational() {
        return match &schema.target_class {
            None => Some(ParseError::MissingRequiredField(format!(
                "type {} needs a class name",
                schema.field_type.as_str()
            ))),
            Some(target) if !class_name_is_valid(target) => Some(ParseError::InvalidClassName(
                invalid_class_name_message(target),
            )),
            Some(_) => None,
        };
    }
    if schema.field_type == FieldType::ACL {
        return Some(ParseError::IncorrectType(
            "invalid field type: ACL".to_string(),
        ));
    }
    None
}

/// Validates permission keys, values and pointer-permission columns against `fields`.
pub fn validate_clp(perms: &ClassLevelPermissions, fields: &SchemaFields) -> Result<(), ParseError> {
    for (operation, map) in perms.operation_maps() {
        let Some(map) = map else { continue };
        for (key, allowed) in map {
            verify_permission_key(key)?;
            if !allowed {
                return Err(ParseError::InvalidJson(format!(
                    "'{}' is not a valid value for class level permissions {}:{}:{}",
                    allowed, operation, key, allowed
                )));
            }
        }
    }
    for (operation, pointer_fields) in [
        ("readUserFields", perms.read_user_fields.as_ref()),
        ("writeUserFields", perms.write_user_fields.as_ref()),
    ] {
        let Some(pointer_fields) = pointer_fields else { continue };
        for key in pointer_fields {
            let valid = fields.get(key).is_some_and(|f| {
                f.field_type == FieldType::Pointer && f.target_class.as_deref() == Some("_User")
            });
            if !valid {
                return Err(ParseError::InvalidJson(format!(
                    "'{}' is not a valid column for class level pointer permissions {}",
                    key, operation
                )));
            }
        }
    }
    Ok(())
}

/// Validates new field names and types, the single-GeoPoint rule and the CLP.
///
/// `existing_field_names` are skipped by the name and type checks; they were
/// validated when they were added.
pub fn validate_schema_data(
    class_name: &str,
    fields: &SchemaFields,
    clp: Option<&ClassLevelPermissions>,
    existing_field_names: &[String],
) -> Result<(), ParseError> {
    for (field_name, schema) in fields {
        if existing_field_names.contains(field_name) {
            continue;
        }
        if !field_name_is_valid(field_name) {
            return Err(ParseError::InvalidKeyName(format!(
                "invalid field name: {}",
                field_name
            )));
        }
        if !field_name_is_valid_for_class(field_name, class_name) {
            return Err(ParseError::ChangedImmutableField(format!(
                "field {} cannot be added",
                field_name
            )));
        }
        if let Some(err) = field_type_is_invalid(schema) {
            return Err(err);
        }
    }

    let mut all_fields = fields.clone();
    all_fields.extend(default_columns(class_name));

    // Fields that already existed come first so the message names the newcomer.
    let mut geo_points: Vec<&String> = all_fields
        .iter()
        .filter(|(_, f)| f.field_type == FieldType::GeoPoint)
        .map(|(name, _)| name)
        .collect();
    geo_points.sort_by_key(|name| !existing_field_names.contains(name));
    if geo_points.len() > 1 {
        return Err(ParseError::IncorrectType(format!(
            "currently, only one GeoPoint field may exist in an object. Adding {} when {} already exists.",
            geo_points[1], geo_points[0]
        )));
    }

    if let Some(clp) = clp {
        validate_clp(clp, &all_fields)?;
    }
    Ok(())
}

/// Adds the base and class default columns on top of a schema's own fields.
pub fn inject_default_schema(schema: &ParseSchema) -> ParseSchema {
    let mut fields = base_columns();
    fields.extend(default_columns(&schema.class_name));
    fields.extend(schema.fields.clone());
    ParseSchema {
        class_name: schema.class_name.clone(),
        fields,
        class_level_permissions: schema.class_level_permissions.clone(),
        indexes: schema.indexes.clone().filter(|i| !i.is_empty()),
    }
}

/// Wire schema -> storage schema: `ACL` becomes `_rperm`/`_wperm`, `_User.password`
/// becomes `_hashed_password`.
pub fn convert_schema_to_adapter_schema(schema: &ParseSchema) -> ParseSchema {
    let mut schema = inject_default_schema(schema);
    schema.fields.remove("ACL");
    schema
        .fields
        .insert("_rperm".to_string(), FieldSchema::new(FieldType::Array));
    schema
        .fields
        .insert("_wperm".to_string(), FieldSchema::new(FieldType::Array));
    if schema.class_name == "_User" {
        schema.fields.remove("password");
        schema.fields.insert(
            "_hashed_password".to_string(),
            FieldSchema::new(FieldType::String),
        );
    }
    schema
}

/// Storage schema -> wire schema; the inverse of [`convert_schema_to_adapter_schema`].
pub fn convert_adapter_schema_to_parse_schema(schema: &ParseSchema) -> ParseSchema {
    let mut schema = schema.clone();
    schema.fields.remove("_rperm");
    schema.fields.remove("_wperm");
    schema
        .fields
        .insert("ACL".to_string(), FieldSchema::new(FieldType::ACL));
    if schema.class_name == "_User" {
        schema.fields.remove("_hashed_password");
        schema
            .fields
            .insert("password".to_string(), FieldSchema::new(FieldType::String));
    }
    if schema.indexes.as_ref().is_some_and(|i| i.is_empty()) {
        schema.indexes = None;
    }
    schema
}

/// Merges a class's existing fields with an `update_class` request. Default
/// columns are left out; the result is what gets validated.
pub fn build_merged_schema_object(
    class_name: &str,
    existing_fields: &SchemaFields,
    submitted: &BTreeMap<String, FieldChange>,
) -> SchemaFields {
    let system_fields = default_columns(class_name);
    let mut merged = SchemaFields::new();
    for (name, schema) in existing_fields {
        if matches!(
            name.as_str(),
            "_id" | "ACL" | "updatedAt" | "createdAt" | "objectId"
        ) || system_fields.contains_key(name)
        {
            continue;
        }
        let deleted = submitted.get(name).is_some_and(FieldChange::is_delete);
        if !deleted {
            merged.insert(name.clone(), schema.clone());
        }
    }
    for (name, change) in submitted {
        if name == "objectId" || system_fields.contains_key(name) {
            continue;
        }
        if let FieldChange::Set(schema) = change {
            merged.insert(name.clone(), schema.clone());
        }
    }
    merged
}

/// Infers the schema type of a REST value. `Ok(None)` means "no type to enforce"
/// (null values and `Delete` ops).
pub fn get_type(value: &Value) -> Result<Option<FieldSchema>, ParseError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(_) => Ok(Some(FieldSchema::new(FieldType::Boolean))),
        Value::String(_) => Ok(Some(FieldSchema::new(FieldType::String))),
        Value::Number(_) => Ok(Some(FieldSchema::new(FieldType::Number))),
        Value::Array(_) => Ok(Some(FieldSchema::new(FieldType::Array))),
        Value::Object(obj) => get_object_type(obj),
    }
}

fn get_object_type(obj: &Map<String, Value>) -> Result<Option<FieldSchema>, ParseError> {
    if let Some(type_name) = obj.get("__type").and_then(Value::as_str) {
        let has = |key: &str| obj.get(key).is_some_and(|v| !v.is_null());
        let class_name = obj.get("className").and_then(Value::as_str);
        let inferred = match type_name {
            "Pointer" => class_name.map(FieldSchema::pointer),
            "Relation" => class_name.map(FieldSchema::relation),
            "File" if has("name") => Some(FieldSchema::new(FieldType::File)),
            "Date" if has("iso") => Some(FieldSchema::new(FieldType::Date)),
            "GeoPoint" if has("latitude") && has("longitude") => {
                Some(FieldSchema::new(FieldType::GeoPoint))
            }
            "Bytes" if has("base64") => Some(FieldSchema::new(FieldType::Bytes)),
            "Polygon" if has("coordinates") => Some(FieldSchema::new(FieldType::Polygon)),
            _ => None,
        };
        return match inferred {
            Some(schema) => Ok(Some(schema)),
            None => Err(ParseError::IncorrectType(format!(
                "This is not a valid {}",
                type_name
            ))),
        };
    }
    if let Some(ne) = obj.get("$ne").filter(|v| !v.is_null()) {
        return get_type(ne);
    }
    if let Some(op) = obj.get("__op").and_then(Value::as_str) {
        return match op {
            "Increment" => Ok(Some(FieldSchema::new(FieldType::Number))),
            "Delete" => Ok(None),
            "Add" | "AddUnique" | "Remove" => Ok(Some(FieldSchema::new(FieldType::Array))),
            "AddRelation" | "RemoveRelation" => {
                let target = obj
                    .get("objects")
                    .and_then(Value::as_array)
                    .and_then(|objects| objects.first())
                    .and_then(|first| first.get("className"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ParseError::InvalidJson(format!("{} requires pointer objects", op))
                    })?;
                Ok(Some(FieldSchema::relation(target)))
            }
            "Batch" => match obj
                .get("ops")
                .and_then(Value::as_array)
                .and_then(|ops| ops.first())
            {
                Some(first) => get_type(first),
                None => Err(ParseError::InvalidJson("Batch requires ops".to_string())),
            },
            other => Err(ParseError::InvalidJson(format!("unexpected op: {}", other))),
        };
    }
    Ok(Some(FieldSchema::new(FieldType::Object)))
}

/// The schemas injected for volatile classes on every reload.
pub fn volatile_class_schemas() -> Vec<ParseSchema> {
    VOLATILE_CLASSES
        .iter()
        .map(|class_name| convert_schema_to_adapter_schema(&ParseSchema::new(*class_name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(entries: &[(&str, FieldSchema)]) -> SchemaFields {
        columns(entries)
    }

    #[test]
    fn test_class_name_validation() {
        assert!(class_name_is_valid("GameScore"));
        assert!(class_name_is_valid("_User"));
        assert!(class_name_is_valid("_Join:users:_Role"));
        assert!(!class_name_is_valid("_Custom"));
        assert!(!class_name_is_valid("1Class"));
        assert!(!class_name_is_valid("Bad-Name"));
    }

    #[test]
    fn test_default_fields_are_never_valid_for_any_system_class() {
        for class_name in SYSTEM_CLASSES.iter().chain(VOLATILE_CLASSES.iter()) {
            for default in base_columns().keys() {
                assert!(!field_name_is_valid_for_class(default, class_name));
            }
            for default in default_columns(class_name).keys() {
                assert!(!field_name_is_valid_for_class(default, class_name));
            }
        }
        assert!(!field_name_is_valid_for_class("createdAt", "_User"));
        assert!(field_name_is_valid_for_class("nickname", "_User"));
    }

    #[test]
    fn test_second_geopoint_is_named() {
        let submitted = fields(&[
            ("home", FieldSchema::new(FieldType::GeoPoint)),
            ("work", FieldSchema::new(FieldType::GeoPoint)),
        ]);
        let err = validate_schema_data("Place", &submitted, None, &[]).unwrap_err();
        assert_eq!(err.code(), 111);
        assert!(err.message().contains("Adding work when home already exists"));

        // The existing field is reported as the incumbent even when it sorts later.
        let err =
            validate_schema_data("Place", &submitted, None, &["work".to_string()]).unwrap_err();
        assert!(err.message().contains("Adding home when work already exists"));
    }

    #[test]
    fn test_clp_rejects_bad_keys() {
        let mut clp = ClassLevelPermissions::default();
        clp.find = Some([("not-a-user".to_string(), true)].into_iter().collect());
        let err = validate_clp(&clp, &SchemaFields::new()).unwrap_err();
        assert_eq!(err.code(), 107);

        for good in ["abcdefghij", "role:Admin", "*", "requiresAuthentication"] {
            let mut clp = ClassLevelPermissions::default();
            clp.get = Some([(good.to_string(), true)].into_iter().collect());
            assert!(validate_clp(&clp, &SchemaFields::new()).is_ok(), "{}", good);
        }
    }

    #[test]
    fn test_clp_pointer_fields_must_point_at_users() {
        let class_fields = fields(&[
            ("owner", FieldSchema::pointer("_User")),
            ("post", FieldSchema::pointer("Post")),
        ]);
        let mut clp = ClassLevelPermissions::default();
        clp.read_user_fields = Some(vec!["owner".to_string()]);
        assert!(validate_clp(&clp, &class_fields).is_ok());

        clp.write_user_fields = Some(vec!["post".to_string()]);
        let err = validate_clp(&clp, &class_fields).unwrap_err();
        assert!(err.message().contains("'post' is not a valid column"));
    }

    #[test]
    fn test_clp_from_value_rejects_unknown_operation() {
        let err = ClassLevelPermissions::from_value(&json!({"destroy": {"*": true}})).unwrap_err();
        assert_eq!(
            err.message(),
            "destroy is not a valid operation for class level permissions"
        );
        let err = ClassLevelPermissions::from_value(&json!({"find": {"*": false}})).unwrap_err();
        assert_eq!(err.code(), 107);
        let err =
            ClassLevelPermissions::from_value(&json!({"readUserFields": "owner"})).unwrap_err();
        assert_eq!(err.code(), 107);
    }

    #[test]
    fn test_adapter_schema_round_trip() {
        let mut schema = ParseSchema::new("_User");
        schema
            .fields
            .insert("nickname".to_string(), FieldSchema::new(FieldType::String));
        let wire = inject_default_schema(&schema);

        let adapter = convert_schema_to_adapter_schema(&wire);
        assert!(adapter.fields.contains_key("_rperm"));
        assert!(adapter.fields.contains_key("_hashed_password"));
        assert!(!adapter.fields.contains_key("ACL"));
        assert!(!adapter.fields.contains_key("password"));

        let restored = convert_adapter_schema_to_parse_schema(&adapter);
        assert_eq!(restored.fields, wire.fields);
    }

    #[test]
    fn test_get_type_inference() {
        assert_eq!(get_type(&json!(null)).unwrap(), None);
        assert_eq!(
            get_type(&json!(5)).unwrap(),
            Some(FieldSchema::new(FieldType::Number))
        );
        assert_eq!(
            get_type(&json!({"__type": "Pointer", "className": "Post", "objectId": "x"})).unwrap(),
            Some(FieldSchema::pointer("Post"))
        );
        assert_eq!(
            get_type(&json!({"$ne": {"__type": "Date", "iso": "2024-01-01T00:00:00.000Z"}}))
                .unwrap(),
            Some(FieldSchema::new(FieldType::Date))
        );
        assert_eq!(get_type(&json!({"__op": "Delete"})).unwrap(), None);
        assert_eq!(
            get_type(&json!({"__op": "AddRelation", "objects": [{"__type": "Pointer", "className": "_User", "objectId": "u"}]}))
                .unwrap(),
            Some(FieldSchema::relation("_User"))
        );
        assert_eq!(get_type(&json!({"__type": "File"})).unwrap_err().code(), 111);
        assert_eq!(get_type(&json!({"__op": "Explode"})).unwrap_err().code(), 107);
    }

    #[test]
    fn test_field_schema_display() {
        assert_eq!(FieldSchema::pointer("_User").to_string(), "Pointer<_User>");
        assert_eq!(FieldSchema::new(FieldType::Number).to_string(), "Number");
    }

    #[test]
    fn test_merged_schema_drops_deleted_and_system_fields() {
        let existing = fields(&[
            ("objectId", FieldSchema::new(FieldType::String)),
            ("name", FieldSchema::new(FieldType::String)),
            ("old", FieldSchema::new(FieldType::Number)),
        ]);
        let mut submitted = BTreeMap::new();
        submitted.insert("old".to_string(), FieldChange::Delete);
        submitted.insert(
            "fresh".to_string(),
            FieldChange::Set(FieldSchema::new(FieldType::Boolean)),
        );
        let merged = build_merged_schema_object("_Role", &existing, &submitted);
        assert_eq!(
            merged.keys().cloned().collect::<Vec<_>>(),
            vec!["fresh".to_string()]
        );
    }
}
