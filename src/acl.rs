// src/acl.rs
use crate::error::ParseError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Represents a Parse Access Control List (ACL).
///
/// On the wire an ACL is a map from `*`, a user id or `role:<name>` to
/// `{read, write}` flags. In storage it is flattened into the `_rperm` and
/// `_wperm` arrays, which is what query-time ACL constraints match against.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParseACL {
    permissions: BTreeMap<String, AccessLevel>,
}

/// Defines the access level for a user or role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct AccessLevel {
    #[serde(skip_serializing_if = "Option::is_none")]
    read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    write: Option<bool>,
}

impl ParseACL {
    /// Creates a new, empty `ParseACL`.
    /// By default, no one has any permissions.
    pub fn new() -> Self {
        ParseACL {
            permissions: BTreeMap::new(),
        }
    }

    /// Parses a wire ACL value. Any non-object, or an entry whose flags are
    /// not booleans, is rejected with `INVALID_ACL`.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        serde_json::from_value(value.clone())
            .map_err(|_| ParseError::InvalidAcl("Invalid ACL.".to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    fn entry(&mut self, key: &str) -> &mut AccessLevel {
        self.permissions.entry(key.to_string()).or_default()
    }

    pub fn set_public_read_access(&mut self, allowed: bool) {
        self.entry("*").read = Some(allowed);
    }

    /// Sets read access for a user id, role key (`role:Name`) or `*`.
    pub fn set_read_access(&mut self, key: &str, allowed: bool) {
        self.entry(key).read = Some(allowed);
    }

    /// Sets write access for a user id, role key (`role:Name`) or `*`.
    pub fn set_write_access(&mut self, key: &str, allowed: bool) {
        self.entry(key).write = Some(allowed);
    }

    pub fn set_role_write_access(&mut self, role_name: &str, allowed: bool) {
        self.set_write_access(&format!("role:{}", role_name), allowed);
    }

    pub fn get_read_access(&self, key: &str) -> bool {
        self.permissions
            .get(key)
            .and_then(|access| access.read)
            .unwrap_or(false)
    }

    pub fn get_write_access(&self, key: &str) -> bool {
        self.permissions
            .get(key)
            .and_then(|access| access.write)
            .unwrap_or(false)
    }

    pub fn get_public_read_access(&self) -> bool {
        self.get_read_access("*")
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Flattens the ACL into the `(_rperm, _wperm)` storage arrays.
    pub fn to_permission_arrays(&self) -> (Vec<String>, Vec<String>) {
        let mut rperm = Vec::new();
        let mut wperm = Vec::new();
        for (key, access) in &self.permissions {
            if access.read == Some(true) {
                rperm.push(key.clone());
            }
            if access.write == Some(true) {
                wperm.push(key.clone());
            }
        }
        (rperm, wperm)
    }

    /// Rebuilds a wire ACL from the `_rperm`/`_wperm` storage arrays.
    pub fn from_permission_arrays(rperm: &[String], wperm: &[String]) -> Self {
        let mut acl = ParseACL::new();
        for key in rperm {
            acl.set_read_access(key, true);
        }
        for key in wperm {
            acl.set_write_access(key, true);
        }
        acl
    }
}

// Custom serialization for ParseACL to match the Parse Server format
impl Serialize for ParseACL {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.permissions.iter().filter_map(|(k, v)| {
            // Only include if there's at least one explicit permission
            if v.read.is_some() || v.write.is_some() {
                Some((k, v))
            } else {
                None
            }
        }))
    }
}

impl<'de> Deserialize<'de> for ParseACL {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, AccessLevel>::deserialize(deserializer)?;
        Ok(ParseACL { permissions: map })
    }
}
