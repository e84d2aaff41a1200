// src/rest.rs
//
// Entry points for the REST operations. Each one checks which classes the caller
// may touch at all, then hands off to `RestQuery` or `RestWrite`.

use crate::auth::Auth;
use crate::config::Config;
use crate::error::ParseError;
use crate::rest_query::{QueryResponse, RestOptions, RestQuery};
use crate::rest_write::{RestWrite, WriteResponse};
use crate::schema::ClpOperation;
use crate::triggers::TriggerType;
use crate::types::JsonObject;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Classes only the master key may read or write.
const MASTER_ONLY_CLASSES: &[&str] = &[
    "_JobStatus",
    "_PushStatus",
    "_Hooks",
    "_GlobalConfig",
    "_JobSchedule",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestMethod {
    Find,
    Get,
    Create,
    Update,
    Delete,
}

impl fmt::Display for RestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestMethod::Find => "find",
            RestMethod::Get => "get",
            RestMethod::Create => "create",
            RestMethod::Update => "update",
            RestMethod::Delete => "delete",
        })
    }
}

/// Rejects operations the caller's key can never perform on `class_name`.
pub fn enforce_role_security(
    method: RestMethod,
    class_name: &str,
    auth: &Auth,
) -> Result<(), ParseError> {
    if class_name == "_Installation"
        && !auth.is_master
        && matches!(method, RestMethod::Delete | RestMethod::Find)
    {
        return Err(ParseError::OperationForbidden(format!(
            "Clients aren't allowed to perform the {} operation on the installation collection.",
            method
        )));
    }
    if MASTER_ONLY_CLASSES.contains(&class_name) && !auth.is_master {
        return Err(ParseError::OperationForbidden(format!(
            "Clients aren't allowed to perform the {} operation on the {} collection.",
            method, class_name
        )));
    }
    if auth.is_read_only
        && matches!(
            method,
            RestMethod::Delete | RestMethod::Create | RestMethod::Update
        )
    {
        return Err(ParseError::OperationForbidden(format!(
            "read-only masterKey isn't allowed to perform the {} operation.",
            method
        )));
    }
    Ok(())
}

pub async fn find(
    config: &Arc<Config>,
    auth: &Auth,
    class_name: &str,
    rest_where: JsonObject,
    rest_options: RestOptions,
) -> Result<QueryResponse, ParseError> {
    enforce_role_security(RestMethod::Find, class_name, auth)?;
    RestQuery::new(config.clone(), auth.clone(), class_name, rest_where, rest_options)?
        .execute()
        .await
}

pub async fn get(
    config: &Arc<Config>,
    auth: &Auth,
    class_name: &str,
    object_id: &str,
    rest_options: RestOptions,
) -> Result<QueryResponse, ParseError> {
    enforce_role_security(RestMethod::Get, class_name, auth)?;
    let mut rest_where = JsonObject::new();
    rest_where.insert("objectId".to_string(), json!(object_id));
    RestQuery::new(config.clone(), auth.clone(), class_name, rest_where, rest_options)?
        .execute()
        .await
}

pub async fn create(
    config: &Arc<Config>,
    auth: &Auth,
    class_name: &str,
    data: JsonObject,
) -> Result<WriteResponse, ParseError> {
    enforce_role_security(RestMethod::Create, class_name, auth)?;
    RestWrite::new(config.clone(), auth.clone(), class_name, None, data, None)?
        .execute()
        .await
}

/// Updates the objects matching `rest_where`. When save hooks or live queries
/// watch the class, the stored object is loaded first so they see the original.
pub async fn update(
    config: &Arc<Config>,
    auth: &Auth,
    class_name: &str,
    rest_where: JsonObject,
    data: JsonObject,
) -> Result<WriteResponse, ParseError> {
    enforce_role_security(RestMethod::Update, class_name, auth)?;
    let original = if is_watched(config, class_name) {
        RestQuery::new(
            config.clone(),
            auth.clone(),
            class_name,
            rest_where.clone(),
            RestOptions::default(),
        )?
        .execute_with_op(ClpOperation::Update)
        .await?
        .results
        .into_iter()
        .next()
        .and_then(|result| match result {
            Value::Object(object) => Some(object),
            _ => None,
        })
    } else {
        None
    };
    RestWrite::new(
        config.clone(),
        auth.clone(),
        class_name,
        Some(rest_where),
        data,
        original,
    )?
    .execute()
    .await
}

/// Deletes one object.
pub async fn del(
    config: &Arc<Config>,
    auth: &Auth,
    class_name: &str,
    object_id: &str,
) -> Result<(), ParseError> {
    if class_name == "_User" && auth.is_unauthenticated() {
        return Err(ParseError::SessionMissing(
            "Insufficient auth to delete user".to_string(),
        ));
    }
    enforce_role_security(RestMethod::Delete, class_name, auth)?;

    let mut rest_where = JsonObject::new();
    rest_where.insert("objectId".to_string(), json!(object_id));

    if class_name == "_Session" || is_watched(config, class_name) {
        let response = RestQuery::new(
            config.clone(),
            auth.clone(),
            class_name,
            rest_where.clone(),
            RestOptions::default(),
        )?
        .execute_with_op(ClpOperation::Delete)
        .await?;
        let Some(existing) = response.results.first() else {
            return Err(ParseError::ObjectNotFound(
                "Object not found for delete.".to_string(),
            ));
        };
        if class_name == "_Session" && !auth.is_master {
            let owner = existing
                .get("user")
                .and_then(|user| user.get("objectId"))
                .and_then(Value::as_str);
            if owner.is_none() || owner != auth.user_id() {
                return Err(ParseError::InvalidSessionToken(
                    "Invalid session token".to_string(),
                ));
            }
        }
        if let Some(token) = existing.get("sessionToken").and_then(Value::as_str) {
            config.user_cache.del(token);
        }
    }

    let acl = auth.acl_group(config).await?;
    config
        .database
        .destroy(class_name, rest_where, acl.as_deref())
        .await
}

fn is_watched(config: &Config, class_name: &str) -> bool {
    config.triggers.exists(TriggerType::BeforeSave, class_name)
        || config.triggers.exists(TriggerType::AfterSave, class_name)
        || config
            .live_query
            .as_ref()
            .is_some_and(|notifier| notifier.has_live_query(class_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::as_object;

    #[test]
    fn test_role_security() {
        let nobody = Auth::nobody();
        let err = enforce_role_security(RestMethod::Find, "_Installation", &nobody).unwrap_err();
        assert_eq!(
            err.message(),
            "Clients aren't allowed to perform the find operation on the installation collection."
        );
        assert!(enforce_role_security(RestMethod::Create, "_Installation", &nobody).is_ok());

        let err = enforce_role_security(RestMethod::Get, "_PushStatus", &nobody).unwrap_err();
        assert_eq!(
            err.message(),
            "Clients aren't allowed to perform the get operation on the _PushStatus collection."
        );
        assert!(enforce_role_security(RestMethod::Get, "_PushStatus", &Auth::master()).is_ok());

        let err =
            enforce_role_security(RestMethod::Delete, "Post", &Auth::read_only()).unwrap_err();
        assert_eq!(err.code(), 119);
        assert!(enforce_role_security(RestMethod::Find, "Post", &Auth::read_only()).is_ok());

        let user = Auth::for_user(as_object(&json!({"objectId": "u1"})));
        assert!(enforce_role_security(RestMethod::Update, "Post", &user).is_ok());
    }
}
