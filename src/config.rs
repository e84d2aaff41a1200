// src/config.rs
use crate::adapter::StorageAdapter;
use crate::auth::{AnonymousAuth, AuthDataValidator};
use crate::cache::{InMemorySchemaCache, KeyValueCache, SchemaCache};
use crate::database::DatabaseController;
use crate::error::ParseError;
use crate::files::FilesController;
use crate::password::PasswordPolicy;
use crate::push::PushQueue;
use crate::triggers::{LiveQueryNotifier, TriggerRegistry};
use crate::types::{JsonObject, ParseDate};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

fn default_true() -> bool {
    true
}

fn default_server_url() -> String {
    "http://localhost:1337/parse".to_string()
}

fn default_session_length() -> u64 {
    31_536_000
}

fn default_object_id_size() -> usize {
    10
}

/// Server options, loadable from JSON with the usual camelCase keys.
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    pub app_id: String,
    #[serde(rename = "serverURL")]
    pub server_url: String,
    /// Also used for links sent to users, like the email verification link.
    #[serde(rename = "publicServerURL")]
    pub public_server_url: Option<String>,
    #[serde(default = "default_true")]
    pub allow_client_class_creation: bool,
    pub verify_user_emails: bool,
    pub prevent_login_with_unverified_email: bool,
    /// Seconds an email verification token stays valid; forever when unset.
    pub email_verify_token_validity_duration: Option<u64>,
    #[serde(default = "default_true")]
    pub revoke_session_on_password_reset: bool,
    /// Session lifetime in seconds.
    #[serde(default = "default_session_length")]
    pub session_length: u64,
    #[serde(default = "default_true")]
    pub expire_inactive_sessions: bool,
    #[serde(default = "default_object_id_size")]
    pub object_id_size: usize,
    pub password_policy: Option<PasswordPolicy>,
    /// Schema cache time-to-live in milliseconds.
    #[serde(rename = "schemaCacheTTL")]
    pub schema_cache_ttl: Option<u64>,
    pub has_push_scheduled_support: bool,
    /// Key for files stored on the hosted Parse file store.
    pub file_key: Option<String>,
    /// Free-form application parameters.
    pub params: HashMap<String, Value>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            app_id: String::new(),
            server_url: default_server_url(),
            public_server_url: None,
            allow_client_class_creation: true,
            verify_user_emails: false,
            prevent_login_with_unverified_email: false,
            email_verify_token_validity_duration: None,
            revoke_session_on_password_reset: true,
            session_length: default_session_length(),
            expire_inactive_sessions: true,
            object_id_size: default_object_id_size(),
            password_policy: None,
            schema_cache_ttl: None,
            has_push_scheduled_support: false,
            file_key: None,
            params: HashMap::new(),
        }
    }
}

impl ServerOptions {
    pub fn new(app_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        ServerOptions {
            app_id: app_id.into(),
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Loads options from a JSON value.
    pub fn from_json(value: &Value) -> Result<Self, ParseError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Retrieves a custom parameter by name and attempts to deserialize it into the requested type.
    ///
    /// # Arguments
    /// * `key`: The name of the parameter to retrieve.
    ///
    /// # Returns
    /// An `Option<T>` containing the deserialized value if the key exists and deserialization is successful,
    /// otherwise `None`.
    pub fn get_param<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.params
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn public_url(&self) -> &str {
        self.public_server_url
            .as_deref()
            .unwrap_or(&self.server_url)
    }
}

/// Sends the emails the write pipeline asks for.
#[async_trait]
pub trait EmailAdapter: Send + Sync {
    async fn send_verification_email(&self, user: &JsonObject, link: &str)
        -> Result<(), ParseError>;
}

/// The runtime bundle every engine is built with: options plus the injected collaborators.
pub struct Config {
    pub options: ServerOptions,
    pub database: Arc<DatabaseController>,
    pub files: FilesController,
    /// Session token -> user.
    pub user_cache: KeyValueCache<JsonObject>,
    /// User id -> `role:` names.
    pub role_cache: KeyValueCache<Vec<String>>,
    pub triggers: Arc<TriggerRegistry>,
    pub live_query: Option<Arc<dyn LiveQueryNotifier>>,
    pub email_adapter: Option<Arc<dyn EmailAdapter>>,
    pub auth_data_validators: HashMap<String, Arc<dyn AuthDataValidator>>,
    pub push_queue: Option<Arc<dyn PushQueue>>,
}

impl Config {
    pub fn builder(adapter: Arc<dyn StorageAdapter>) -> ConfigBuilder {
        ConfigBuilder::new(adapter)
    }

    pub fn generate_session_expires_at(&self) -> ParseDate {
        let length = i64::try_from(self.options.session_length).unwrap_or(i64::MAX);
        ParseDate::from_datetime(Utc::now() + Duration::seconds(length))
    }

    /// `None` when verification tokens do not expire.
    pub fn generate_email_verify_token_expires_at(&self) -> Option<ParseDate> {
        let validity = self.options.email_verify_token_validity_duration?;
        let validity = i64::try_from(validity).ok()?;
        Some(ParseDate::from_datetime(Utc::now() + Duration::seconds(validity)))
    }

    pub fn should_verify_emails(&self) -> bool {
        self.options.verify_user_emails
    }

    /// `<serverURL>/<segments...>`.
    pub fn mount_url(&self, segments: &[&str]) -> Result<String, ParseError> {
        let mut url = Url::parse(&self.options.server_url)?;
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        Ok(url.to_string())
    }

    /// `<publicServerURL>/apps/<appId>/verify_email?token=..&username=..`.
    pub fn verify_email_link(&self, token: &str, username: &str) -> Result<String, ParseError> {
        let mut url = Url::parse(self.options.public_url())?;
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["apps", self.options.app_id.as_str(), "verify_email"]);
        }
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("username", username);
        Ok(url.to_string())
    }

    pub fn auth_data_validator(&self, provider: &str) -> Option<Arc<dyn AuthDataValidator>> {
        self.auth_data_validators.get(provider).cloned()
    }
}

pub struct ConfigBuilder {
    adapter: Arc<dyn StorageAdapter>,
    options: ServerOptions,
    schema_cache: Option<Arc<dyn SchemaCache>>,
    triggers: Arc<TriggerRegistry>,
    live_query: Option<Arc<dyn LiveQueryNotifier>>,
    email_adapter: Option<Arc<dyn EmailAdapter>>,
    auth_data_validators: HashMap<String, Arc<dyn AuthDataValidator>>,
    push_queue: Option<Arc<dyn PushQueue>>,
}

impl ConfigBuilder {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        let mut auth_data_validators: HashMap<String, Arc<dyn AuthDataValidator>> =
            HashMap::new();
        auth_data_validators.insert("anonymous".to_string(), Arc::new(AnonymousAuth));
        ConfigBuilder {
            adapter,
            options: ServerOptions::default(),
            schema_cache: None,
            triggers: Arc::new(TriggerRegistry::new()),
            live_query: None,
            email_adapter: None,
            auth_data_validators,
            push_queue: None,
        }
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn schema_cache(mut self, cache: Arc<dyn SchemaCache>) -> Self {
        self.schema_cache = Some(cache);
        self
    }

    pub fn triggers(mut self, triggers: Arc<TriggerRegistry>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn live_query(mut self, notifier: Arc<dyn LiveQueryNotifier>) -> Self {
        self.live_query = Some(notifier);
        self
    }

    pub fn email_adapter(mut self, adapter: Arc<dyn EmailAdapter>) -> Self {
        self.email_adapter = Some(adapter);
        self
    }

    pub fn auth_data_validator(
        mut self,
        provider: impl Into<String>,
        validator: Arc<dyn AuthDataValidator>,
    ) -> Self {
        self.auth_data_validators.insert(provider.into(), validator);
        self
    }

    pub fn push_queue(mut self, queue: Arc<dyn PushQueue>) -> Self {
        self.push_queue = Some(queue);
        self
    }

    pub fn build(self) -> Result<Arc<Config>, ParseError> {
        let schema_cache = self.schema_cache.unwrap_or_else(|| {
            let cache = match self.options.schema_cache_ttl {
                Some(ttl) => InMemorySchemaCache::with_ttl(std::time::Duration::from_millis(ttl)),
                None => InMemorySchemaCache::new(),
            };
            Arc::new(cache)
        });
        let mut files = FilesController::new(&self.options.server_url, &self.options.app_id)?;
        if let Some(key) = &self.options.file_key {
            files = files.with_file_key(key.clone());
        }
        log::debug!("Building config for app {}", self.options.app_id);
        Ok(Arc::new(Config {
            database: Arc::new(DatabaseController::new(self.adapter, schema_cache)),
            files,
            user_cache: KeyValueCache::default(),
            role_cache: KeyValueCache::default(),
            triggers: self.triggers,
            live_query: self.live_query,
            email_adapter: self.email_adapter,
            auth_data_validators: self.auth_data_validators,
            push_queue: self.push_queue,
            options: self.options,
        }))
    }
}
