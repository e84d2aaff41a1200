// src/auth.rs
use crate::config::Config;
use crate::crypto;
use crate::database::FindOptions;
use crate::error::ParseError;
use crate::rest_write::{RestWrite, WriteResponse};
use crate::types::{JsonObject, ParseDate, Pointer};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Validates the provider payload of an `authData` entry (`{"id": .., ...}`).
#[async_trait]
pub trait AuthDataValidator: Send + Sync {
    async fn validate_auth_data(&self, auth_data: &Value) -> Result<(), ParseError>;
}

/// Anonymous users carry a client-generated id and nothing to verify.
pub struct AnonymousAuth;

#[async_trait]
impl AuthDataValidator for AnonymousAuth {
    async fn validate_auth_data(&self, _auth_data: &Value) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Who is making a request.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub is_master: bool,
    /// Master key that may only read.
    pub is_read_only: bool,
    pub user: Option<JsonObject>,
    pub installation_id: Option<String>,
    user_roles: Arc<Mutex<Option<Vec<String>>>>,
}

impl PartialEq for Auth {
    fn eq(&self, other: &Self) -> bool {
        self.is_master == other.is_master
            && self.is_read_only == other.is_read_only
            && self.user == other.user
            && self.installation_id == other.installation_id
    }
}

impl Auth {
    pub fn master() -> Self {
        Auth {
            is_master: true,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Auth {
            is_master: true,
            is_read_only: true,
            ..Self::default()
        }
    }

    /// An unauthenticated client.
    pub fn nobody() -> Self {
        Self::default()
    }

    pub fn for_user(user: JsonObject) -> Self {
        Auth {
            user: Some(user),
            ..Self::default()
        }
    }

    pub fn with_installation_id(mut self, installation_id: impl Into<String>) -> Self {
        self.installation_id = Some(installation_id.into());
        self
    }

    pub fn is_unauthenticated(&self) -> bool {
        !self.is_master && self.user.is_none()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|user| user.get("objectId"))
            .and_then(Value::as_str)
    }

    /// Master may update anyone; a user only themselves.
    pub fn could_update_user_id(&self, user_id: &str) -> bool {
        self.is_master || self.user_id() == Some(user_id)
    }

    /// The ACL group used to evaluate permissions: `"*"`, the user's roles
    /// (`role:<name>`) and the user id. `None` for the master key.
    pub async fn acl_group(&self, config: &Config) -> Result<Option<Vec<String>>, ParseError> {
        if self.is_master {
            return Ok(None);
        }
        let mut acl = vec!["*".to_string()];
        if let Some(user_id) = self.user_id() {
            acl.extend(self.get_user_roles(config).await?);
            acl.push(user_id.to_string());
        }
        Ok(Some(acl))
    }

    /// Names (`role:<name>`) of every role the user belongs to, directly or through
    /// parent roles.
    pub async fn get_user_roles(&self, config: &Config) -> Result<Vec<String>, ParseError> {
        if self.is_master {
            return Ok(Vec::new());
        }
        let Some(user_id) = self.user_id().map(str::to_string) else {
            return Ok(Vec::new());
        };
        if let Some(roles) = self.user_roles.lock().clone() {
            return Ok(roles);
        }
        if let Some(roles) = config.role_cache.get(&user_id) {
            *self.user_roles.lock() = Some(roles.clone());
            return Ok(roles);
        }
        let roles = load_roles(config, &user_id).await?;
        config.role_cache.put(user_id, roles.clone());
        *self.user_roles.lock() = Some(roles.clone());
        Ok(roles)
    }

    /// Resolves a session token into the authenticated user.
    ///
    /// Users are cached by token; an expired or unknown session fails with
    /// `INVALID_SESSION_TOKEN`.
    pub async fn for_session_token(
        config: &Config,
        session_token: &str,
        installation_id: Option<&str>,
    ) -> Result<Auth, ParseError> {
        if let Some(user) = config.user_cache.get(session_token) {
            let mut auth = Auth::for_user(user);
            auth.installation_id = installation_id.map(str::to_string);
            return Ok(auth);
        }

        let mut query = JsonObject::new();
        query.insert("sessionToken".to_string(), json!(session_token));
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::master()
        };
        let sessions = config.database.find("_Session", query, &options).await?;
        let session = match sessions.as_slice() {
            [session] => session,
            _ => return Err(invalid_session_token()),
        };
        let Some(user_id) = session
            .get("user")
            .and_then(Pointer::from_value)
            .map(|p| p.object_id)
        else {
            return Err(invalid_session_token());
        };
        let expires_at = session
            .get("expiresAt")
            .and_then(ParseDate::from_value)
            .and_then(|date| date.to_datetime());
        if expires_at.is_some_and(|expires_at| expires_at < Utc::now()) {
            return Err(ParseError::InvalidSessionToken(
                "Session token is expired.".to_string(),
            ));
        }

        let mut query = JsonObject::new();
        query.insert("objectId".to_string(), json!(user_id));
        let users = config
            .database
            .find("_User", query, &FindOptions::master())
            .await?;
        let Some(mut user) = users.into_iter().next() else {
            return Err(invalid_session_token());
        };
        user.remove("password");
        user.insert("className".to_string(), json!("_User"));
        user.insert("sessionToken".to_string(), json!(session_token));
        config.user_cache.put(session_token, user.clone());

        let mut auth = Auth::for_user(user);
        auth.installation_id = installation_id.map(str::to_string);
        Ok(auth)
    }
}

fn invalid_session_token() -> ParseError {
    ParseError::InvalidSessionToken("Invalid session token".to_string())
}

async fn load_roles(config: &Config, user_id: &str) -> Result<Vec<String>, ParseError> {
    let mut query = JsonObject::new();
    query.insert(
        "users".to_string(),
        Pointer::new("_User", user_id).to_value(),
    );
    let direct = config
        .database
        .find("_Role", query, &FindOptions::master())
        .await?;
    let mut names = Vec::new();
    let mut queried = HashSet::new();
    let mut frontier = Vec::new();
    for role in &direct {
        collect_role(role, &mut names, &mut frontier);
    }

    // Walk up through parent roles: a role whose `roles` relation contains one of
    // ours grants its name too.
    loop {
        let ids: Vec<String> = frontier
            .drain(..)
            .filter(|id: &String| queried.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            break;
        }
        let pointers: Vec<Value> = ids
            .iter()
            .map(|id| Pointer::new("_Role", id.as_str()).to_value())
            .collect();
        let mut query = JsonObject::new();
        query.insert("roles".to_string(), json!({ "$in": pointers }));
        let parents = config
            .database
            .find("_Role", query, &FindOptions::master())
            .await?;
        for role in &parents {
            collect_role(role, &mut names, &mut frontier);
        }
    }

    let mut seen = HashSet::new();
    names.retain(|name| seen.insert(name.clone()));
    log::debug!("user {} has roles {:?}", user_id, names);
    Ok(names.into_iter().map(|name| format!("role:{}", name)).collect())
}

fn collect_role(role: &JsonObject, names: &mut Vec<String>, frontier: &mut Vec<String>) {
    if let Some(name) = role.get("name").and_then(Value::as_str) {
        names.push(name.to_string());
    }
    if let Some(id) = role.get("objectId").and_then(Value::as_str) {
        frontier.push(id.to_string());
    }
}

/// A session built but not yet saved.
pub struct PendingSession {
    pub session_data: JsonObject,
    config: Arc<Config>,
}

impl PendingSession {
    pub fn session_token(&self) -> Option<&str> {
        self.session_data.get("sessionToken").and_then(Value::as_str)
    }

    /// Saves the session through the write pipeline as master.
    pub async fn persist(self) -> Result<WriteResponse, ParseError> {
        RestWrite::new(
            self.config,
            Auth::master(),
            "_Session",
            None,
            self.session_data,
            None,
        )?
        .execute()
        .await
    }
}

/// Builds a session for `user_id`. `additional` entries are copied over the generated fields.
pub fn create_session(
    config: Arc<Config>,
    user_id: &str,
    created_with: Value,
    installation_id: Option<&str>,
    additional: JsonObject,
) -> PendingSession {
    let mut session_data = JsonObject::new();
    session_data.insert("sessionToken".to_string(), json!(crypto::new_token()));
    session_data.insert(
        "user".to_string(),
        Pointer::new("_User", user_id).to_value(),
    );
    session_data.insert("createdWith".to_string(), created_with);
    session_data.insert("restricted".to_string(), json!(false));
    session_data.insert(
        "expiresAt".to_string(),
        config.generate_session_expires_at().to_value(),
    );
    if let Some(installation_id) = installation_id {
        session_data.insert("installationId".to_string(), json!(installation_id));
    }
    session_data.extend(additional);
    PendingSession {
        session_data,
        config,
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

    fn user(id: &str) -> JsonObject {
        as_object(&json!({"objectId": id, "username": id}))
    }

    #[tokio::test]
    async fn test_acl_group() {
        let config = config();
        assert_eq!(Auth::master().acl_group(&config).await.unwrap(), None);
        assert_eq!(
            Auth::nobody().acl_group(&config).await.unwrap(),
            Some(vec!["*".to_string()])
        );
        assert_eq!(
            Auth::for_user(user("u1")).acl_group(&config).await.unwrap(),
            Some(vec!["*".to_string(), "u1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_roles_walk_parents() {
        let config = config();
        let db = &config.database;
        db.create(
            "_Role",
            as_object(&json!({
                "objectId": "admins",
                "name": "Admins",
                "ACL": {"*": {"read": true}}
            })),
            None,
        )
        .await
        .unwrap();
        db.create(
            "_Role",
            as_object(&json!({
                "objectId": "mods",
                "name": "Moderators",
                "ACL": {"*": {"read": true}},
                "users": {"__op": "AddRelation", "objects": [
                    {"__type": "Pointer", "className": "_User", "objectId": "u1"}
                ]}
            })),
            None,
        )
        .await
        .unwrap();
        db.update(
            "_Role",
            as_object(&json!({"objectId": "admins"})),
            as_object(&json!({"roles": {"__op": "AddRelation", "objects": [
                {"__type": "Pointer", "className": "_Role", "objectId": "mods"}
            ]}})),
            &Default::default(),
            false,
        )
        .await
        .unwrap();

        let auth = Auth::for_user(user("u1"));
        let mut roles = auth.get_user_roles(&config).await.unwrap();
        roles.sort();
        assert_eq!(roles, vec!["role:Admins", "role:Moderators"]);
        assert!(config.role_cache.get("u1").is_some());
    }

    #[tokio::test]
    async fn test_session_token_lookup() {
        let config = config();
        config
            .database
            .create("_User", as_object(&json!({"objectId": "u1", "username": "bob"})), None)
            .await
            .unwrap();

        let pending = create_session(
            config.clone(),
            "u1",
            json!({"action": "login"}),
            None,
            JsonObject::new(),
        );
        let token = pending.session_token().unwrap().to_string();
        let response = pending.persist().await.unwrap();
        assert_eq!(response.status, 201);

        let auth = Auth::for_session_token(&config, &token, Some("device"))
            .await
            .unwrap();
        assert_eq!(auth.user_id(), Some("u1"));
        assert_eq!(auth.installation_id.as_deref(), Some("device"));
        assert!(config.user_cache.get(&token).is_some());

        let err = Auth::for_session_token(&config, "r:nope", None)
            .await
            .unwrap_err();
        assert_eq!(err, invalid_session_token());
    }

    #[tokio::test]
    async fn test_expired_session() {
        let config = config();
        config
            .database
            .create(
                "_Session",
                as_object(&json!({
                    "objectId": "s1",
                    "sessionToken": "r:old",
                    "user": {"__type": "Pointer", "className": "_User", "objectId": "u1"},
                    "expiresAt": {"__type": "Date", "iso": "2001-01-01T00:00:00.000Z"}
                })),
                None,
            )
            .await
            .unwrap();
        let err = Auth::for_session_token(&config, "r:old", None)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Session token is expired.");
    }
}
