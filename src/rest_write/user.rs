// src/rest_write/user.rs
use super::{RestWrite, WriteResponse};
use crate::auth::create_session;
use crate::config::Config;
use crate::crypto;
use crate::database::{FindOptions, UpdateOptions};
use crate::error::ParseError;
use crate::password;
use crate::types::{is_truthy, JsonObject, Pointer};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^.+@.+$").expect("valid regex"))
}

fn username_taken() -> ParseError {
    ParseError::UsernameTaken("Account already exists for this username.".to_string())
}

fn email_taken() -> ParseError {
    ParseError::EmailTaken("Account already exists for this email address.".to_string())
}

fn already_linked() -> ParseError {
    ParseError::AccountAlreadyLinked("this auth is already used".to_string())
}

fn unsupported_service() -> ParseError {
    ParseError::UnsupportedService("This authentication method is unsupported.".to_string())
}

impl RestWrite {
    /// Signup requirements and third-party (`authData`) signup/login.
    pub(super) async fn validate_auth_data(&mut self) -> Result<(), ParseError> {
        if self.class_name != "_User" {
            return Ok(());
        }
        if self.query.is_none() && !self.data.contains_key("authData") {
            if !self
                .data
                .get("username")
                .and_then(Value::as_str)
                .is_some_and(|u| !u.is_empty())
            {
                return Err(ParseError::UsernameMissing(
                    "bad or missing username".to_string(),
                ));
            }
            if !self
                .data
                .get("password")
                .and_then(Value::as_str)
                .is_some_and(|p| !p.is_empty())
            {
                return Err(ParseError::PasswordMissing(
                    "password is required".to_string(),
                ));
            }
        }

        let Some(auth_data) = self
            .data
            .get("authData")
            .and_then(Value::as_object)
            .filter(|a| !a.is_empty())
            .cloned()
        else {
            return Ok(());
        };
        let can_handle = auth_data
            .values()
            .all(|provider| provider.is_null() || is_truthy(provider.get("id")));
        if !can_handle {
            return Err(unsupported_service());
        }
        self.handle_auth_data(auth_data).await
    }

    async fn handle_auth_data(&mut self, auth_data: JsonObject) -> Result<(), ParseError> {
        let results = self.find_users_with_auth_data(&auth_data).await?;
        let mut results = self.filtered_objects_by_acl(results);
        if results.len() > 1 {
            return Err(already_linked());
        }
        self.storage.auth_provider = Some(
            auth_data
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        );

        let Some(mut user_result) = results.pop() else {
            return self.validate_providers(&auth_data).await;
        };
        let stored = user_result
            .get("authData")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mutated: JsonObject = auth_data
            .iter()
            .filter(|(provider, data)| stored.get(*provider) != Some(*data))
            .map(|(provider, data)| (provider.clone(), data.clone()))
            .collect();
        let result_id = user_result
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        let caller_id = self
            .query_object_id()
            .or_else(|| self.auth.user_id().map(str::to_string));

        if caller_id.as_ref().is_some_and(|id| *id != result_id) {
            return Err(already_linked());
        }

        // Login (or the linked user updating themselves).
        user_result.remove("password");
        if self.query_object_id().is_none() {
            self.data
                .insert("objectId".to_string(), json!(result_id));
            self.response = Some(WriteResponse {
                status: 200,
                response: user_result,
                location: Some(self.location()?),
            });
        }
        if mutated.is_empty() {
            return Ok(());
        }
        self.validate_providers(&mutated).await?;
        if let Some(response) = &mut self.response {
            // A login skips the database stage, so refreshed provider tokens are written here.
            let mut merged = response
                .response
                .get("authData")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            merged.extend(mutated.clone());
            response
                .response
                .insert("authData".to_string(), Value::Object(merged));

            let mut query = JsonObject::new();
            query.insert("objectId".to_string(), json!(result_id));
            let mut update = JsonObject::new();
            update.insert("authData".to_string(), Value::Object(mutated));
            self.config
                .database
                .update("_User", query, update, &UpdateOptions::default(), false)
                .await?;
        }
        Ok(())
    }

    async fn find_users_with_auth_data(
        &self,
        auth_data: &JsonObject,
    ) -> Result<Vec<JsonObject>, ParseError> {
        let or_queries: Vec<Value> = auth_data
            .iter()
            .filter_map(|(provider, data)| {
                let id = data.get("id")?;
                let mut query = JsonObject::new();
                query.insert(format!("authData.{}.id", provider), id.clone());
                Some(Value::Object(query))
            })
            .collect();
        if or_queries.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = JsonObject::new();
        query.insert("$or".to_string(), Value::Array(or_queries));
        self.config
            .database
            .find("_User", query, &FindOptions::master())
            .await
    }

    /// Users locked out with an empty ACL cannot be logged into by clients.
    fn filtered_objects_by_acl(&self, objects: Vec<JsonObject>) -> Vec<JsonObject> {
        if self.auth.is_master {
            return objects;
        }
        objects
            .into_iter()
            .filter(|object| match object.get("ACL") {
                None => true,
                Some(Value::Object(acl)) => !acl.is_empty(),
                Some(_) => false,
            })
            .collect()
    }

    async fn validate_providers(&self, auth_data: &JsonObject) -> Result<(), ParseError> {
        for (provider, data) in auth_data {
            if data.is_null() {
                continue;
            }
            let validator = self
                .config
                .auth_data_validator(provider)
                .ok_or_else(unsupported_service)?;
            validator.validate_auth_data(data).await?;
        }
        Ok(())
    }

    /// Password hashing and policy, username/email uniqueness and the email
    /// verification token.
    pub(super) async fn transform_user(&mut self) -> Result<(), ParseError> {
        if self.class_name != "_User" {
            return Ok(());
        }
        if !self.auth.is_master && self.data.contains_key("emailVerified") {
            return Err(ParseError::OperationForbidden(
                "Clients aren't allowed to manually update email verification.".to_string(),
            ));
        }
        if self.query.is_some() {
            if let Some(user_id) = self.object_id() {
                self.evict_cached_sessions(&user_id).await?;
            }
        }

        if let Some(password) = self.data.get("password").cloned() {
            let Value::String(password) = password else {
                return Err(ParseError::InvalidJson(
                    "password must be a string".to_string(),
                ));
            };
            if self.query.is_some() {
                self.storage.clear_sessions = true;
                if !self.auth.is_master {
                    self.storage.generate_new_session = true;
                }
            }
            self.validate_password_policy(&password).await?;
            let hashed = password::hash(&password)?;
            self.data
                .insert("_hashed_password".to_string(), json!(hashed));
            self.data.remove("password");
        }
        self.validate_user_name().await?;
        self.validate_email().await
    }

    /// Drops the cached users of every session the user holds.
    async fn evict_cached_sessions(&self, user_id: &str) -> Result<(), ParseError> {
        let mut query = JsonObject::new();
        query.insert(
            "user".to_string(),
            Pointer::new("_User", user_id).to_value(),
        );
        let sessions = self
            .config
            .database
            .find("_Session", query, &FindOptions::master())
            .await?;
        for session in sessions {
            if let Some(token) = session.get("sessionToken").and_then(Value::as_str) {
                self.config.user_cache.del(token);
            }
        }
        Ok(())
    }

    async fn validate_password_policy(&self, password: &str) -> Result<(), ParseError> {
        let Some(policy) = self.config.options.password_policy.clone() else {
            return Ok(());
        };
        let mut username = self
            .data
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string);
        if username.is_none() && policy.do_not_allow_username && self.query.is_some() {
            username = self
                .load_user_fields(&["username"])
                .await?
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        policy.validate(password, username.as_deref())?;

        if self.query.is_some() && policy.keeps_history() {
            let user = self
                .load_user_fields(&["_password_history", "_hashed_password"])
                .await?;
            let max = policy.max_password_history.unwrap_or_default();
            let mut previous: Vec<String> = user
                .get("_password_history")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .take(max.saturating_sub(1))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if let Some(current) = user.get("password").and_then(Value::as_str) {
                previous.push(current.to_string());
            }
            if previous.iter().any(|hash| password::compare(password, hash)) {
                return Err(policy.history_error());
            }
        }
        Ok(())
    }

    /// Moves the current hash into `_password_history` before an update replaces it.
    pub(super) async fn record_password_history(&mut self) -> Result<(), ParseError> {
        let max = self
            .config
            .options
            .password_policy
            .as_ref()
            .and_then(|p| p.max_password_history)
            .unwrap_or_default();
        let user = self
            .load_user_fields(&["_password_history", "_hashed_password"])
            .await?;
        let mut history: Vec<Value> = user
            .get("_password_history")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .take(max)
            .cloned()
            .collect();
        // The new hash is the current password, so history keeps max - 1 old ones.
        while history.len() + 2 > max && !history.is_empty() {
            history.remove(0);
        }
        if let Some(current) = user.get("password") {
            history.push(current.clone());
        }
        self.data
            .insert("_password_history".to_string(), Value::Array(history));
        Ok(())
    }

    async fn load_user_fields(&self, keys: &[&str]) -> Result<JsonObject, ParseError> {
        let mut query = JsonObject::new();
        query.insert("objectId".to_string(), json!(self.object_id()));
        let options = FindOptions {
            keys: Some(keys.iter().map(|k| k.to_string()).collect()),
            ..FindOptions::master()
        };
        self.config
            .database
            .find("_User", query, &options)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ParseError::ObjectNotFound("Object not found.".to_string()))
    }

    async fn validate_user_name(&mut self) -> Result<(), ParseError> {
        let username = match self.data.get("username") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(value) => Some(value.clone()),
        };
        let Some(username) = username else {
            if self.query.is_none() {
                self.data
                    .insert("username".to_string(), json!(crypto::random_string(25)));
            }
            return Ok(());
        };
        if self.other_user_has("username", &username).await? {
            return Err(username_taken());
        }
        Ok(())
    }

    async fn validate_email(&mut self) -> Result<(), ParseError> {
        let Some(email) = self.data.get("email").cloned() else {
            return Ok(());
        };
        if email.is_null()
            || email.as_str() == Some("")
            || email.get("__op").and_then(Value::as_str) == Some("Delete")
        {
            return Ok(());
        }
        if !email.as_str().is_some_and(|e| email_regex().is_match(e)) {
            return Err(ParseError::InvalidEmailAddress(
                "Email address format is invalid.".to_string(),
            ));
        }
        if self.other_user_has("email", &email).await? {
            return Err(email_taken());
        }
        let only_anonymous = match self.data.get("authData").and_then(Value::as_object) {
            None => true,
            Some(auth_data) => {
                auth_data.is_empty()
                    || (auth_data.len() == 1 && auth_data.contains_key("anonymous"))
            }
        };
        if only_anonymous {
            self.storage.send_verification_email = true;
            self.set_email_verify_token();
        }
        Ok(())
    }

    fn set_email_verify_token(&mut self) {
        if !self.config.should_verify_emails() {
            return;
        }
        self.data.insert(
            "_email_verify_token".to_string(),
            json!(crypto::random_string(25)),
        );
        self.data
            .insert("emailVerified".to_string(), json!(false));
        if let Some(expires_at) = self.config.generate_email_verify_token_expires_at() {
            self.data.insert(
                "_email_verify_token_expires_at".to_string(),
                expires_at.to_value(),
            );
        }
    }

    /// Whether a user other than this one already has `field == value`.
    async fn other_user_has(&self, field: &str, value: &Value) -> Result<bool, ParseError> {
        let mut query = JsonObject::new();
        query.insert(field.to_string(), value.clone());
        query.insert(
            "objectId".to_string(),
            json!({ "$ne": self.object_id() }),
        );
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::master()
        };
        Ok(!self
            .config
            .database
            .find("_User", query, &options)
            .await?
            .is_empty())
    }

    /// Turns a storage uniqueness failure on `_User` into the matching
    /// username or email error.
    pub(super) async fn translate_duplicate_error(&self, err: ParseError) -> ParseError {
        if self.class_name != "_User" {
            return err;
        }
        let ParseError::DuplicateValue {
            duplicated_field, ..
        } = &err
        else {
            return err;
        };
        match duplicated_field.as_deref() {
            Some("username") => return username_taken(),
            Some("email") => return email_taken(),
            _ => {}
        }
        for (field, taken) in [
            ("username", username_taken as fn() -> ParseError),
            ("email", email_taken),
        ] {
            let Some(value) = self.data.get(field) else {
                continue;
            };
            match self.other_user_has(field, value).await {
                Ok(true) => return taken(),
                Ok(false) => {}
                Err(lookup_err) => return lookup_err,
            }
        }
        ParseError::DuplicateValue {
            message: "A duplicate value for a field with unique values was provided".to_string(),
            duplicated_field: None,
        }
    }

    pub(super) async fn create_session_token_if_needed(&mut self) -> Result<(), ParseError> {
        if self.class_name != "_User" || self.query.is_some() {
            return Ok(());
        }
        let options = &self.config.options;
        if self.storage.auth_provider.is_none()
            && options.prevent_login_with_unverified_email
            && options.verify_user_emails
        {
            return Ok(());
        }
        self.create_session_token().await
    }

    /// Creates a session for the written user and hands its token back in the response.
    pub(super) async fn create_session_token(&mut self) -> Result<(), ParseError> {
        // Cloud code writes never get sessions.
        if self.auth.installation_id.as_deref() == Some("cloud") {
            return Ok(());
        }
        let Some(user_id) = self.object_id() else {
            return Ok(());
        };
        let created_with = json!({
            "action": if self.storage.auth_provider.is_some() { "login" } else { "signup" },
            "authProvider": self.storage.auth_provider.as_deref().unwrap_or("password"),
        });
        let pending = create_session(
            self.config.clone(),
            &user_id,
            created_with,
            self.auth.installation_id.as_deref(),
            JsonObject::new(),
        );
        if let (Some(response), Some(token)) = (&mut self.response, pending.session_token()) {
            response
                .response
                .insert("sessionToken".to_string(), json!(token));
        }
        pending.persist().await?;
        Ok(())
    }

    /// Fire and forget: the write does not wait for the email.
    pub(super) fn send_verification_email(&self) {
        if !self.config.should_verify_emails() {
            return;
        }
        let Some(adapter) = self.config.email_adapter.clone() else {
            return;
        };
        let config = self.config.clone();
        let user = self.data.clone();
        tokio::spawn(async move {
            let result = async {
                let token = user
                    .get("_email_verify_token")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let user = fetch_user_if_needed(&config, user).await?;
                let username = user
                    .get("username")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let link = config.verify_email_link(&token, username)?;
                adapter.send_verification_email(&user, &link).await
            }
            .await;
            if let Err(err) = result {
                log::warn!("failed to send verification email: {}", err);
            }
        });
    }
}

/// The write data may lack the username or email (an update that only changed
/// one of them); load the stored user in that case.
async fn fetch_user_if_needed(
    config: &Arc<Config>,
    user: JsonObject,
) -> Result<JsonObject, ParseError> {
    if user.contains_key("username") && user.contains_key("email") {
        return Ok(user);
    }
    let mut query = JsonObject::new();
    for key in ["username", "email"] {
        if let Some(value) = user.get(key) {
            query.insert(key.to_string(), value.clone());
        }
    }
    if query.is_empty() {
        if let Some(object_id) = user.get("objectId") {
            query.insert("objectId".to_string(), object_id.clone());
        }
    }
    let mut results = config
        .database
        .find("_User", query, &FindOptions::master())
        .await?;
    if results.len() != 1 {
        return Err(ParseError::ObjectNotFound("Object not found.".to_string()));
    }
    Ok(results.remove(0))
}
