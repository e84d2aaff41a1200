// src/password.rs
use crate::error::ParseError;
use regex::Regex;
use serde::Deserialize;

/// Work factor for new hashes; matches what existing Parse deployments store.
const BCRYPT_COST: u32 = 10;
const DEFAULT_POLICY_ERROR: &str = "Password does not meet the Password Policy requirements.";

/// Hashes `password` into a salted bcrypt string (`$2b$10$...`).
pub fn hash(password: &str) -> Result<String, ParseError> {
    bcrypt::hash(password, BCRYPT_COST)
        .map_err(|e| ParseError::InternalServerError(format!("password hashing failed: {}", e)))
}

/// Checks `password` against any bcrypt hash (`$2a$`, `$2b$`, `$2y$`). Malformed hashes never match.
pub fn compare(password: &str, hashed: &str) -> bool {
    bcrypt::verify(password, hashed).unwrap_or_else(|e| {
        log::debug!("Unreadable password hash: {}", e);
        false
    })
}

/// Password rules applied whenever a `_User` password is set.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PasswordPolicy {
    /// A regular expression every new password must match.
    pub validator_pattern: Option<String>,
    /// Message used instead of the default policy error.
    pub validation_error: Option<String>,
    /// Reject passwords that contain the username.
    pub do_not_allow_username: bool,
    /// Days after which a password expires; login is refused past it.
    pub max_password_age: Option<u64>,
    /// How many previous passwords (the current one included) cannot be reused.
    pub max_password_history: Option<usize>,
}

impl PasswordPolicy {
    pub fn policy_error(&self) -> ParseError {
        ParseError::ValidationError(
            self.validation_error
                .clone()
                .unwrap_or_else(|| DEFAULT_POLICY_ERROR.to_string()),
        )
    }

    /// Runs the pattern and username checks. History is checked by the caller,
    /// which has to load the stored hashes first.
    pub fn validate(&self, password: &str, username: Option<&str>) -> Result<(), ParseError> {
        if let Some(pattern) = &self.validator_pattern {
            let regex = Regex::new(pattern).map_err(|e| {
                ParseError::InternalServerError(format!("invalid validatorPattern: {}", e))
            })?;
            if !regex.is_match(password) {
                return Err(self.policy_error());
            }
        }
        if self.do_not_allow_username {
            if let Some(username) = username.filter(|u| !u.is_empty()) {
                if password.contains(username) {
                    return Err(ParseError::ValidationError(
                        "Password cannot contain your username.".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn history_error(&self) -> ParseError {
        ParseError::ValidationError(format!(
            "New password should not be the same as last {} passwords.",
            self.max_password_history.unwrap_or_default()
        ))
    }

    pub fn keeps_history(&self) -> bool {
        self.max_password_history.is_some_and(|n| n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_compare() {
        let hashed = hash("secret").unwrap();
        assert!(hashed.starts_with("$2b$10$"));
        assert!(compare("secret", &hashed));
        assert!(!compare("Secret", &hashed));
        assert!(!compare("secret", "plain"));
        assert!(!compare("secret", "$sha256$salt$digest"));
        assert_ne!(hash("secret").unwrap(), hashed);
    }

    #[test]
    fn test_compare_accepts_2a_hashes() {
        let hashed = hash("hunter2").unwrap().replacen("$2b$", "$2a$", 1);
        assert!(compare("hunter2", &hashed));
        assert!(!compare("hunter3", &hashed));
    }

    #[test]
    fn test_policy() {
        let policy = PasswordPolicy {
            validator_pattern: Some("^.{6,}$".to_string()),
            do_not_allow_username: true,
            ..Default::default()
        };
        assert_eq!(
            policy.validate("abc", None).unwrap_err().message(),
            "Password does not meet the Password Policy requirements."
        );
        assert_eq!(
            policy.validate("bob12345", Some("bob")).unwrap_err().message(),
            "Password cannot contain your username."
        );
        assert!(policy.validate("hunter22", Some("bob")).is_ok());
    }

    #[test]
    fn test_policy_from_json() {
        let policy: PasswordPolicy =
            serde_json::from_value(serde_json::json!({"maxPasswordHistory": 3})).unwrap();
        assert!(policy.keeps_history());
        assert_eq!(
            policy.history_error().message(),
            "New password should not be the same as last 3 passwords."
        );
    }
}
