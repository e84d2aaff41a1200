pub mod acl;
pub mod adapter;
pub mod auth;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod files;
pub mod password;
pub mod permissions;
pub mod push;
pub mod rest;
pub mod rest_query;
pub mod rest_write;
pub mod schema;
pub mod schema_controller;
pub mod triggers;
pub mod types;

pub use acl::ParseACL;
pub use adapter::{InMemoryStorageAdapter, StorageAdapter};
pub use auth::Auth;
pub use config::{Config, ConfigBuilder, ServerOptions};
pub use database::DatabaseController;
pub use error::ParseError;
pub use push::{PushController, PushQueue};
pub use rest_query::{QueryResponse, RestOptions, RestQuery};
pub use rest_write::{RestWrite, WriteResponse};
pub use schema_controller::SchemaController;
pub use triggers::{TriggerRegistry, TriggerRequest, TriggerResult, TriggerType};

// Re-export key types from the types module if needed directly
pub use types::{JsonObject, ParseDate, Pointer};
