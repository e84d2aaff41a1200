// src/rest_write/mod.rs
//
// The write pipeline. A `RestWrite` takes one REST create or update through the
// class-specific rules, the beforeSave trigger, schema validation, storage and the
// follow-up work (sessions, verification email, afterSave) in a fixed order.

mod installation;
mod session;
mod user;

use crate::auth::Auth;
use crate::config::Config;
use crate::crypto;
use crate::database::UpdateOptions;
use crate::error::ParseError;
use crate::schema::is_system_class;
use crate::triggers::{inflate, TriggerRequest, TriggerResult, TriggerType};
use crate::types::{JsonObject, ParseDate, Pointer};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Keys a beforeSave trigger cannot change.
const MANAGED_KEYS: &[&str] = &["objectId", "createdAt", "updatedAt", "className"];

/// The outcome of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    /// 201 for a create, 200 otherwise.
    pub status: u16,
    pub response: JsonObject,
    /// URL of a created object.
    pub location: Option<String>,
}

/// Work the stages leave for later stages.
#[derive(Debug, Default)]
struct WriteStorage {
    clear_sessions: bool,
    generate_new_session: bool,
    send_verification_email: bool,
    /// Comma-joined providers of an authData signup or login.
    auth_provider: Option<String>,
    fields_changed_by_trigger: Vec<String>,
}

pub struct RestWrite {
    config: Arc<Config>,
    auth: Auth,
    class_name: String,
    /// `None` for a create.
    query: Option<JsonObject>,
    data: JsonObject,
    /// The stored object an update starts from, if the caller loaded it.
    original_data: Option<JsonObject>,
    storage: WriteStorage,
    /// `None` runs as master.
    acl: Option<Vec<String>>,
    many: bool,
    response: Option<WriteResponse>,
    updated_at: String,
}

impl RestWrite {
    pub fn new(
        config: Arc<Config>,
        auth: Auth,
        class_name: impl Into<String>,
        query: Option<JsonObject>,
        data: JsonObject,
        original_data: Option<JsonObject>,
    ) -> Result<Self, ParseError> {
        if auth.is_read_only {
            return Err(ParseError::OperationForbidden(
                "Cannot perform a write operation when using readOnlyMasterKey".to_string(),
            ));
        }
        if query.is_none() && data.contains_key("objectId") {
            return Err(ParseError::InvalidKeyName(
                "objectId is an invalid field name.".to_string(),
            ));
        }
        Ok(RestWrite {
            config,
            auth,
            class_name: class_name.into(),
            query,
            data,
            original_data,
            storage: WriteStorage::default(),
            acl: None,
            many: false,
            response: None,
            updated_at: ParseDate::now().iso,
        })
    }

    /// Apply the update to every object matching the query instead of one.
    pub fn many(mut self, many: bool) -> Self {
        self.many = many;
        self
    }

    /// Runs every stage in order and returns the response.
    pub fn execute(
        mut self,
    ) -> Pin<Box<dyn Future<Output = Result<WriteResponse, ParseError>> + Send>> {
        Box::pin(async move {
            log::debug!(
                "{} on {}",
                if self.query.is_some() { "update" } else { "create" },
                self.class_name
            );
            self.get_user_and_role_acl().await?;
            self.validate_client_class_creation().await?;
            self.handle_installation().await?;
            self.handle_session().await?;
            self.validate_auth_data().await?;
            self.run_before_trigger().await?;
            self.validate_schema().await?;
            self.set_required_fields_if_needed();
            self.transform_user().await?;
            self.expand_files_for_existing_objects();
            self.destroy_duplicated_sessions();
            self.run_database_operation().await?;
            self.create_session_token_if_needed().await?;
            self.handle_followup().await?;
            self.run_after_trigger().await;
            self.clean_user_auth_data();
            self.response.take().ok_or_else(|| {
                ParseError::InternalServerError("write finished without a response".to_string())
            })
        })
    }

    async fn get_user_and_role_acl(&mut self) -> Result<(), ParseError> {
        self.acl = self.auth.acl_group(&self.config).await?;
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

    async fn run_before_trigger(&mut self) -> Result<(), ParseError> {
        if self.response.is_some()
            || !self
                .config
                .triggers
                .exists(TriggerType::BeforeSave, &self.class_name)
        {
            return Ok(());
        }
        let original = self.original_object();
        let inflated = inflate(&self.base_object(), &self.sanitized_data());
        let mut request = self.trigger_request(TriggerType::BeforeSave);
        request.object = Some(inflated.clone());
        request.original = original;
        if let TriggerResult::Object(returned) = self.config.triggers.run(request).await? {
            self.apply_trigger_changes(&inflated, returned);
        }
        Ok(())
    }

    /// Folds the object a beforeSave trigger returned back into the write data.
    ///
    /// Keys the trigger left equal to what it was handed keep their original
    /// operation; changed keys take the returned value; keys it dropped are deleted.
    fn apply_trigger_changes(&mut self, inflated: &JsonObject, returned: JsonObject) {
        let mut data = JsonObject::new();
        for (key, value) in &returned {
            if MANAGED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if inflated.get(key) == Some(value) {
                let prefix = format!("{}.", key);
                for (original_key, op) in &self.data {
                    if original_key == key || original_key.starts_with(&prefix) {
                        data.insert(original_key.clone(), op.clone());
                    }
                }
            } else {
                data.insert(key.clone(), value.clone());
            }
        }
        for key in inflated.keys() {
            if !MANAGED_KEYS.contains(&key.as_str()) && !returned.contains_key(key) {
                data.insert(key.clone(), json!({ "__op": "Delete" }));
            }
        }
        for (key, value) in &self.data {
            if key.starts_with('_') && !data.contains_key(key) {
                data.insert(key.clone(), value.clone());
            }
        }
        self.storage.fields_changed_by_trigger = data
            .iter()
            .filter(|(key, value)| self.data.get(*key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect();
        self.data = data;
    }

    async fn validate_schema(&self) -> Result<(), ParseError> {
        self.config
            .database
            .validate_object(
                &self.class_name,
                &self.data,
                self.query.as_ref(),
                self.acl.as_deref(),
            )
            .await
    }

    fn set_required_fields_if_needed(&mut self) {
        self.data
            .insert("updatedAt".to_string(), json!(self.updated_at));
        if self.query.is_none() {
            self.data
                .insert("createdAt".to_string(), json!(self.updated_at));
            if !self.data.contains_key("objectId") {
                self.data.insert(
                    "objectId".to_string(),
                    json!(crypto::new_object_id(self.config.options.object_id_size)),
                );
            }
        }
    }

    /// Adds file urls to a response that was produced without touching storage.
    fn expand_files_for_existing_objects(&mut self) {
        let Some(response) = &mut self.response else {
            return;
        };
        let mut object = Value::Object(std::mem::take(&mut response.response));
        self.config.files.expand_files_in_object(&mut object);
        if let Value::Object(object) = object {
            response.response = object;
        }
    }

    async fn run_database_operation(&mut self) -> Result<(), ParseError> {
        if self.response.is_some() {
            return Ok(());
        }
        if self.class_name == "_Role" {
            self.config.role_cache.clear();
        }
        if self.class_name == "_User" {
            if let Some(query) = &self.query {
                let user_id = query
                    .get("objectId")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !self.auth.could_update_user_id(user_id) {
                    return Err(ParseError::SessionMissing(format!(
                        "Cannot modify user {}.",
                        user_id
                    )));
                }
            }
        }
        if self
            .data
            .get("ACL")
            .is_some_and(|acl| acl.get("*unresolved").is_some())
        {
            return Err(ParseError::InvalidAcl("Invalid ACL.".to_string()));
        }

        match self.query.clone() {
            Some(query) => self.run_update(query).await,
            None => self.run_create().await,
        }
    }

    async fn run_update(&mut self, query: JsonObject) -> Result<(), ParseError> {
        if self.class_name == "_User" {
            // A user can never lock themselves out of their own record.
            if let (Some(Value::Object(acl)), Some(user_id)) = (
                self.data.get_mut("ACL"),
                query.get("objectId").and_then(Value::as_str),
            ) {
                acl.insert(user_id.to_string(), json!({ "read": true, "write": true }));
            }
            if self.data.contains_key("_hashed_password") {
                let policy = self.config.options.password_policy.clone();
                if policy.as_ref().is_some_and(|p| p.max_password_age.is_some()) {
                    self.data.insert(
                        "_password_changed_at".to_string(),
                        ParseDate::now().to_value(),
                    );
                }
                if policy.as_ref().is_some_and(|p| p.keeps_history()) {
                    self.record_password_history().await?;
                }
            }
        }
        self.data.remove("createdAt");

        let options = UpdateOptions {
            acl: self.acl.clone(),
            many: self.many,
            upsert: false,
        };
        let mut response = self
            .config
            .database
            .update(&self.class_name, query, self.data.clone(), &options, false)
            .await?;
        response.insert("updatedAt".to_string(), json!(self.updated_at));
        self.update_response_with_data(&mut response);
        self.response = Some(WriteResponse {
            status: 200,
            response,
            location: None,
        });
        Ok(())
    }

    async fn run_create(&mut self) -> Result<(), ParseError> {
        if self.class_name == "_User" {
            let user_id = self.object_id().unwrap_or_default();
            let mut acl = match self.data.remove("ACL") {
                Some(Value::Object(acl)) => acl,
                _ => {
                    let mut acl = JsonObject::new();
                    acl.insert("*".to_string(), json!({ "read": true, "write": false }));
                    acl
                }
            };
            acl.insert(user_id, json!({ "read": true, "write": true }));
            self.data.insert("ACL".to_string(), Value::Object(acl));
            if self
                .config
                .options
                .password_policy
                .as_ref()
                .is_some_and(|p| p.max_password_age.is_some())
            {
                self.data.insert(
                    "_password_changed_at".to_string(),
                    ParseDate::now().to_value(),
                );
            }
        }

        let result = self
            .config
            .database
            .create(&self.class_name, self.data.clone(), self.acl.as_deref())
            .await;
        let mut response = match result {
            Ok(response) => response,
            Err(err) => return Err(self.translate_duplicate_error(err).await),
        };
        for key in ["objectId", "createdAt"] {
            if let Some(value) = self.data.get(key) {
                response.insert(key.to_string(), value.clone());
            }
        }
        if self.class_name == "_User" {
            if let Some(username) = self.data.get("username") {
                response.insert("username".to_string(), username.clone());
            }
        }
        self.update_response_with_data(&mut response);
        self.response = Some(WriteResponse {
            status: 201,
            response,
            location: Some(self.location()?),
        });
        Ok(())
    }

    /// Echoes the fields a beforeSave trigger changed, minus raw operations.
    fn update_response_with_data(&self, response: &mut JsonObject) {
        for field in &self.storage.fields_changed_by_trigger {
            if !response.contains_key(field) {
                if let Some(value) = self.data.get(field) {
                    response.insert(field.clone(), value.clone());
                }
            }
            if response.get(field).is_some_and(|v| v.get("__op").is_some()) {
                response.remove(field);
            }
        }
    }

    /// Drains the follow-up flags the earlier stages raised.
    async fn handle_followup(&mut self) -> Result<(), ParseError> {
        loop {
            if self.storage.clear_sessions && self.config.options.revoke_session_on_password_reset
            {
                self.storage.clear_sessions = false;
                let mut query = JsonObject::new();
                query.insert(
                    "user".to_string(),
                    Pointer::new("_User", self.object_id().unwrap_or_default()).to_value(),
                );
                self.config
                    .database
                    .destroy("_Session", query, None)
                    .await?;
                continue;
            }
            if self.storage.generate_new_session {
                self.storage.generate_new_session = false;
                self.create_session_token().await?;
                continue;
            }
            if self.storage.send_verification_email {
                self.storage.send_verification_email = false;
                self.send_verification_email();
            }
            return Ok(());
        }
    }

    /// Notifies live query and runs afterSave. Failures here never fail the write.
    async fn run_after_trigger(&self) {
        let Some(response) = &self.response else {
            return;
        };
        let has_hook = self
            .config
            .triggers
            .exists(TriggerType::AfterSave, &self.class_name);
        let live_query = self
            .config
            .live_query
            .clone()
            .filter(|notifier| notifier.has_live_query(&self.class_name));
        if !has_hook && live_query.is_none() {
            return;
        }

        let original = self.original_object();
        let mut updated = inflate(&self.base_object(), &self.sanitized_data());
        updated.insert("className".to_string(), json!(self.class_name));
        for (key, value) in &response.response {
            updated.insert(key.clone(), value.clone());
        }
        if let Some(object_id) = self.object_id() {
            updated.insert("objectId".to_string(), json!(object_id));
        }

        if let Some(notifier) = live_query {
            notifier
                .on_after_save(&self.class_name, &updated, original.as_ref())
                .await;
        }
        if has_hook {
            let mut request = self.trigger_request(TriggerType::AfterSave);
            request.object = Some(updated);
            request.original = original;
            if let Err(err) = self.config.triggers.run(request).await {
                log::warn!("afterSave caught an error: {}", err);
            }
        }
    }

    fn clean_user_auth_data(&mut self) {
        if self.class_name != "_User" {
            return;
        }
        let Some(response) = &mut self.response else {
            return;
        };
        let empty = match response.response.get_mut("authData") {
            Some(Value::Object(auth_data)) => {
                auth_data.retain(|_, value| !value.is_null());
                auth_data.is_empty()
            }
            _ => false,
        };
        if empty {
            response.response.remove("authData");
        }
    }

    fn trigger_request(&self, trigger_type: TriggerType) -> TriggerRequest {
        let mut request = TriggerRequest::new(trigger_type, self.class_name.clone());
        request.master = self.auth.is_master;
        request.user = self.auth.user.clone();
        request.installation_id = self.auth.installation_id.clone();
        request
    }

    /// The stored object plus its class and id, for updates.
    fn original_object(&self) -> Option<JsonObject> {
        self.query_object_id()?;
        Some(self.base_object())
    }

    fn base_object(&self) -> JsonObject {
        let mut object = self.original_data.clone().unwrap_or_default();
        object.insert("className".to_string(), json!(self.class_name));
        if let Some(object_id) = self.query_object_id() {
            object.insert("objectId".to_string(), json!(object_id));
        }
        object
    }

    /// The write data without internal (`_`-prefixed) columns.
    fn sanitized_data(&self) -> JsonObject {
        self.data
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn query_object_id(&self) -> Option<String> {
        self.query
            .as_ref()?
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn object_id(&self) -> Option<String> {
        self.data
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.query_object_id())
    }

    fn location(&self) -> Result<String, ParseError> {
        let object_id = self.object_id().unwrap_or_default();
        let segments: Vec<&str> = match self.class_name.as_str() {
            "_User" => vec!["users", object_id.as_str()],
            "_Session" => vec!["sessions", object_id.as_str()],
            "_Installation" => vec!["installations", object_id.as_str()],
            "_Role" => vec!["roles", object_id.as_str()],
            class_name => vec!["classes", class_name, object_id.as_str()],
        };
        self.config.mount_url(&segments)
    }
}
