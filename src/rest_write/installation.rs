// src/rest_write/installation.rs
use super::RestWrite;
use crate::database::FindOptions;
use crate::error::ParseError;
use crate::types::JsonObject;
use serde_json::{json, Value};

fn string_field(object: &JsonObject, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

impl RestWrite {
    /// Resolves which `_Installation` a write refers to, by objectId, installationId
    /// or deviceToken, and folds duplicates so a device has one installation.
    ///
    /// May turn a create into an update of an existing installation.
    pub(super) async fn handle_installation(&mut self) -> Result<(), ParseError> {
        if self.response.is_some() || self.class_name != "_Installation" {
            return Ok(());
        }
        if self.query.is_none()
            && !self.data.contains_key("deviceToken")
            && !self.data.contains_key("installationId")
            && self.auth.installation_id.is_none()
        {
            return Err(ParseError::MissingRequiredField(
                "at least one ID field (deviceToken, installationId) must be specified in this operation"
                    .to_string(),
            ));
        }

        // iOS tokens are 64 hex characters and case-insensitive.
        if let Some(token) = string_field(&self.data, "deviceToken") {
            if token.len() == 64 {
                self.data
                    .insert("deviceToken".to_string(), json!(token.to_lowercase()));
            }
        }
        if let Some(id) = string_field(&self.data, "installationId") {
            self.data
                .insert("installationId".to_string(), json!(id.to_lowercase()));
        }

        let device_token = string_field(&self.data, "deviceToken");
        let mut installation_id = string_field(&self.data, "installationId");
        if installation_id.is_none() && !self.auth.is_master {
            installation_id = self.auth.installation_id.clone();
        }
        let installation_id = installation_id.map(|id| id.to_lowercase());

        if self.query.is_some()
            && device_token.is_none()
            && installation_id.is_none()
            && !self.data.contains_key("deviceType")
        {
            return Ok(());
        }

        let query_object_id = self.query_object_id();
        let mut or_queries = Vec::new();
        if let Some(object_id) = &query_object_id {
            or_queries.push(json!({ "objectId": object_id }));
        }
        if let Some(id) = &installation_id {
            or_queries.push(json!({ "installationId": id }));
        }
        if let Some(token) = &device_token {
            or_queries.push(json!({ "deviceToken": token }));
        }
        if or_queries.is_empty() {
            return Ok(());
        }
        let mut query = JsonObject::new();
        query.insert("$or".to_string(), Value::Array(or_queries));
        let results = self
            .config
            .database
            .find("_Installation", query, &FindOptions::master())
            .await?;

        let mut object_id_match = None;
        let mut installation_id_match = None;
        let mut device_token_matches = Vec::new();
        for result in results {
            let id = string_field(&result, "objectId");
            if query_object_id.is_some() && id == query_object_id {
                object_id_match = Some(result.clone());
            }
            if installation_id.is_some()
                && string_field(&result, "installationId") == installation_id
            {
                installation_id_match = Some(result.clone());
            }
            if device_token.is_some() && string_field(&result, "deviceToken") == device_token {
                device_token_matches.push(result);
            }
        }

        if query_object_id.is_some() {
            let Some(matched) = &object_id_match else {
                return Err(ParseError::ObjectNotFound(
                    "Object not found for update.".to_string(),
                ));
            };
            let stored_installation_id = string_field(matched, "installationId");
            let new_installation_id = string_field(&self.data, "installationId");
            if let (Some(new), Some(stored)) = (&new_installation_id, &stored_installation_id) {
                if new != stored {
                    return Err(ParseError::ChangedImmutableField(
                        "installationId may not be changed in this operation".to_string(),
                    ));
                }
            }
            if let (Some(new), Some(stored)) = (&device_token, string_field(matched, "deviceToken")) {
                if *new != stored
                    && new_installation_id.is_none()
                    && stored_installation_id.is_none()
                {
                    return Err(ParseError::ChangedImmutableField(
                        "deviceToken may not be changed in this operation".to_string(),
                    ));
                }
            }
            if let Some(device_type) = self.data.get("deviceType") {
                if matched.get("deviceType") != Some(device_type) {
                    return Err(ParseError::ChangedImmutableField(
                        "deviceType may not be changed in this operation".to_string(),
                    ));
                }
            }
        }

        let mut id_match = if query_object_id.is_some() {
            object_id_match
        } else {
            None
        };
        if installation_id.is_some() && installation_id_match.is_some() {
            id_match = installation_id_match;
        }
        if self.query.is_none() && !self.data.contains_key("deviceType") && id_match.is_none() {
            return Err(ParseError::MissingRequiredField(
                "deviceType must be specified in this operation".to_string(),
            ));
        }

        let target = match id_match {
            None => {
                self.resolve_device_token_only(&device_token, &installation_id, device_token_matches)
                    .await?
            }
            Some(id_match) => {
                self.resolve_with_id_match(&device_token, id_match, device_token_matches)
                    .await?
            }
        };
        if let Some(object_id) = target {
            log::debug!("installation write merged into {}", object_id);
            let mut query = JsonObject::new();
            query.insert("objectId".to_string(), json!(object_id));
            self.query = Some(query);
            self.data.remove("objectId");
            self.data.remove("createdAt");
        }
        Ok(())
    }

    /// Nothing matched by id: decide from the deviceToken matches alone.
    async fn resolve_device_token_only(
        &self,
        device_token: &Option<String>,
        installation_id: &Option<String>,
        matches: Vec<JsonObject>,
    ) -> Result<Option<String>, ParseError> {
        match matches.as_slice() {
            [] => Ok(None),
            [single]
                if !single.contains_key("installationId") || installation_id.is_none() =>
            {
                Ok(string_field(single, "objectId"))
            }
            _ if !self.data.contains_key("installationId") => {
                Err(ParseError::AmbiguousDeviceToken(
                    "Must specify installationId when deviceToken matches multiple Installation objects"
                        .to_string(),
                ))
            }
            _ => {
                // Clear out the stale installations holding this token; a new one gets created.
                let mut query = JsonObject::new();
                query.insert("deviceToken".to_string(), json!(device_token));
                query.insert(
                    "installationId".to_string(),
                    json!({ "$ne": installation_id }),
                );
                self.copy_app_identifier(&mut query);
                self.destroy_installations(query).await?;
                Ok(None)
            }
        }
    }

    async fn resolve_with_id_match(
        &self,
        device_token: &Option<String>,
        id_match: JsonObject,
        device_token_matches: Vec<JsonObject>,
    ) -> Result<Option<String>, ParseError> {
        let id_match_object_id = string_field(&id_match, "objectId");
        if let [token_match] = device_token_matches.as_slice() {
            if !token_match.contains_key("installationId") {
                // The token-only installation absorbs this one.
                let mut query = JsonObject::new();
                query.insert("objectId".to_string(), json!(id_match_object_id));
                if !self.destroy_installations(query).await? {
                    return Ok(None);
                }
                return Ok(string_field(token_match, "objectId"));
            }
        }

        if let Some(token) = device_token {
            if string_field(&id_match, "deviceToken").as_ref() != Some(token) {
                // The token moved to this installation; drop the others still holding it.
                let mut query = JsonObject::new();
                query.insert("deviceToken".to_string(), json!(token));
                if let Some(installation_id) = string_field(&self.data, "installationId") {
                    query.insert(
                        "installationId".to_string(),
                        json!({ "$ne": installation_id }),
                    );
                } else if id_match_object_id.is_some()
                    && string_field(&self.data, "objectId") == id_match_object_id
                {
                    query.insert(
                        "objectId".to_string(),
                        json!({ "$ne": id_match_object_id }),
                    );
                } else {
                    return Ok(id_match_object_id);
                }
                self.copy_app_identifier(&mut query);
                self.destroy_installations(query).await?;
            }
        }
        Ok(id_match_object_id)
    }

    fn copy_app_identifier(&self, query: &mut JsonObject) {
        if let Some(app_identifier) = self.data.get("appIdentifier") {
            query.insert("appIdentifier".to_string(), app_identifier.clone());
        }
    }

    /// Deletes installations as master. Returns false when nothing matched.
    async fn destroy_installations(&self, query: JsonObject) -> Result<bool, ParseError> {
        match self
            .config
            .database
            .destroy("_Installation", query, None)
            .await
        {
            Ok(()) => Ok(true),
            Err(ParseError::ObjectNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
