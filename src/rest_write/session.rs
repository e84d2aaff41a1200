// src/rest_write/session.rs
use super::{RestWrite, WriteResponse};
use crate::auth::create_session;
use crate::error::ParseError;
use crate::types::JsonObject;
use serde_json::{json, Value};

impl RestWrite {
    /// `_Session` rules. A client creating a session gets a fresh token for itself;
    /// the fields that identify a session cannot be rewritten.
    pub(super) async fn handle_session(&mut self) -> Result<(), ParseError> {
        if self.response.is_some() || self.class_name != "_Session" {
            return Ok(());
        }
        if self.auth.user.is_none() && !self.auth.is_master {
            return Err(ParseError::InvalidSessionToken(
                "Session token required.".to_string(),
            ));
        }
        if self.data.contains_key("ACL") {
            return Err(ParseError::InvalidKeyName(
                "Cannot set ACL on a Session.".to_string(),
            ));
        }

        if self.query.is_some() {
            let user_changed = self.data.get("user").is_some_and(|user| {
                !self.auth.is_master
                    && user.get("objectId").and_then(Value::as_str) != self.auth.user_id()
            });
            if user_changed {
                return Err(ParseError::InvalidKeyName(
                    "Cannot change the user of a Session.".to_string(),
                ));
            }
            for key in ["installationId", "sessionToken"] {
                if self.data.contains_key(key) {
                    return Err(ParseError::InvalidKeyName(format!(
                        "Cannot change the {} of a Session.",
                        key
                    )));
                }
            }
        }

        if self.query.is_none() && !self.auth.is_master {
            let Some(user_id) = self.auth.user_id().map(str::to_string) else {
                return Err(ParseError::InvalidSessionToken(
                    "Session token required.".to_string(),
                ));
            };
            let additional: JsonObject = self
                .data
                .iter()
                .filter(|(key, _)| *key != "objectId" && *key != "user")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let pending = create_session(
                self.config.clone(),
                &user_id,
                json!({ "action": "create" }),
                None,
                additional,
            );
            let mut session_data = pending.session_data.clone();
            let created = pending.persist().await?;
            let object_id = created.response.get("objectId").cloned().ok_or_else(|| {
                ParseError::InternalServerError("Error creating session.".to_string())
            })?;
            session_data.insert("objectId".to_string(), object_id);
            self.response = Some(WriteResponse {
                status: 201,
                response: session_data,
                location: created.location,
            });
        }
        Ok(())
    }

    /// Removes the user's other sessions on the same installation, in the background.
    pub(super) fn destroy_duplicated_sessions(&self) {
        if self.class_name != "_Session" || self.query.is_some() {
            return;
        }
        let (Some(user), Some(installation_id)) =
            (self.data.get("user"), self.data.get("installationId"))
        else {
            return;
        };
        if user.get("objectId").is_none() {
            return;
        }
        let mut query = JsonObject::new();
        query.insert("user".to_string(), user.clone());
        query.insert("installationId".to_string(), installation_id.clone());
        query.insert(
            "sessionToken".to_string(),
            json!({ "$ne": self.data.get("sessionToken") }),
        );
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Err(err) = config.database.destroy("_Session", query, None).await {
                log::warn!("failed to remove duplicated sessions: {}", err);
            }
        });
    }
}
