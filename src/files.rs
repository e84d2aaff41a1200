// src/files.rs
use crate::error::ParseError;
use serde_json::Value;
use url::Url;

const LEGACY_FILES_HOST: &str = "http://files.parsetfss.com/";

/// Turns stored File values (`{"__type": "File", "name": ..}`) into fetchable ones by adding a `url`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilesController {
    server_url: Url,
    app_id: String,
    file_key: Option<String>,
}

impl FilesController {
    pub fn new(server_url: &str, app_id: impl Into<String>) -> Result<Self, ParseError> {
        let mut server_url = Url::parse(server_url)?;
        if server_url.cannot_be_a_base() {
            return Err(ParseError::InternalServerError(format!(
                "invalid server URL: {}",
                server_url
            )));
        }
        // A trailing slash would otherwise produce an empty path segment.
        if let Ok(mut segments) = server_url.path_segments_mut() {
            segments.pop_if_empty();
        }
        Ok(FilesController {
            server_url,
            app_id: app_id.into(),
            file_key: None,
        })
    }

    /// Key used for files uploaded to the hosted Parse file store (`tfss-` names).
    pub fn with_file_key(mut self, file_key: impl Into<String>) -> Self {
        self.file_key = Some(file_key.into());
        self
    }

    /// `<serverURL>/files/<appId>/<name>`, with `name` percent-encoded.
    pub fn location(&self, file_name: &str) -> String {
        if file_name.starts_with("tfss-") {
            if let Some(key) = &self.file_key {
                if let Ok(mut url) = Url::parse(LEGACY_FILES_HOST) {
                    if let Ok(mut segments) = url.path_segments_mut() {
                        segments.clear().push(key).push(file_name);
                    }
                    return url.to_string();
                }
            }
        }
        let mut url = self.server_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("files").push(&self.app_id).push(file_name);
        }
        url.to_string()
    }

    /// Adds a `url` to every File value found at the top level of `object` or inside
    /// top-level arrays. Values that already carry a url are left alone.
    pub fn expand_files_in_object(&self, object: &mut Value) {
        match object {
            Value::Array(items) => {
                for item in items {
                    self.expand_files_in_object(item);
                }
            }
            Value::Object(fields) => {
                for value in fields.values_mut() {
                    match value {
                        Value::Object(file) => {
                            if file.get("__type").and_then(Value::as_str) != Some("File") {
                                continue;
                            }
                            if file.get("url").is_some_and(|u| !u.is_null()) {
                                continue;
                            }
                            let Some(name) = file.get("name").and_then(Value::as_str) else {
                                continue;
                            };
                            let url = self.location(name);
                            file.insert("url".to_string(), Value::String(url));
                        }
                        Value::Array(_) => self.expand_files_in_object(value),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}
