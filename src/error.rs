// src/error.rs
use serde_json::Value;
use thiserror::Error;

/// Numeric error codes shared with Parse clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OtherCause = -1,
    InternalServerError = 1,
    ObjectNotFound = 101,
    InvalidQuery = 102,
    InvalidClassName = 103,
    InvalidKeyName = 105,
    InvalidJson = 107,
    IncorrectType = 111,
    PushMisconfigured = 115,
    OperationForbidden = 119,
    InvalidNestedKey = 121,
    InvalidAcl = 123,
    InvalidEmailAddress = 125,
    AmbiguousDeviceToken = 132,
    MissingRequiredField = 135,
    ChangedImmutableField = 136,
    DuplicateValue = 137,
    ScriptFailed = 141,
    ValidationError = 142,
    UsernameMissing = 200,
    PasswordMissing = 201,
    UsernameTaken = 202,
    EmailTaken = 203,
    SessionMissing = 206,
    AccountAlreadyLinked = 208,
    InvalidSessionToken = 209,
    UnsupportedService = 252,
    FieldStateConflict = 255,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid class name: {0}")]
    InvalidClassName(String),

    #[error("Invalid key name: {0}")]
    InvalidKeyName(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Incorrect type: {0}")]
    IncorrectType(String),

    #[error("Push misconfigured: {0}")]
    PushMisconfigured(String),

    #[error("Operation forbidden: {0}")]
    OperationForbidden(String),

    #[error("Invalid nested key: {0}")]
    InvalidNestedKey(String),

    #[error("Invalid ACL: {0}")]
    InvalidAcl(String),

    #[error("Invalid email address: {0}")]
    InvalidEmailAddress(String),

    #[error("Ambiguous device token: {0}")]
    AmbiguousDeviceToken(String),

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    #[error("Changed immutable field: {0}")]
    ChangedImmutableField(String),

    #[error("Duplicate value: {message}")]
    DuplicateValue {
        message: String,
        duplicated_field: Option<String>,
    },

    #[error("Script failed: {0}")]
    ScriptFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Username missing: {0}")]
    UsernameMissing(String),

    #[error("Password missing: {0}")]
    PasswordMissing(String),

    #[error("Username taken: {0}")]
    UsernameTaken(String),

    #[error("Email taken: {0}")]
    EmailTaken(String),

    #[error("Session missing: {0}")]
    SessionMissing(String),

    #[error("Account already linked: {0}")]
    AccountAlreadyLinked(String),

    #[error("Invalid session token: {0}")]
    InvalidSessionToken(String),

    #[error("Unsupported service: {0}")]
    UnsupportedService(String),

    #[error("Field state conflict: {0}")]
    FieldStateConflict(String),

    #[error("Other Parse error (Code: {code}): {message}")]
    OtherParseError { code: i32, message: String },
}

impl ParseError {
    /// Numeric code carried to clients alongside the message.
    pub fn code(&self) -> i32 {
        use ParseError::*;
        let code = match self {
            InternalServerError(_) => ErrorCode::InternalServerError,
            ObjectNotFound(_) => ErrorCode::ObjectNotFound,
            InvalidQuery(_) => ErrorCode::InvalidQuery,
            InvalidClassName(_) => ErrorCode::InvalidClassName,
            InvalidKeyName(_) => ErrorCode::InvalidKeyName,
            InvalidJson(_) => ErrorCode::InvalidJson,
            IncorrectType(_) => ErrorCode::IncorrectType,
            PushMisconfigured(_) => ErrorCode::PushMisconfigured,
            OperationForbidden(_) => ErrorCode::OperationForbidden,
            InvalidNestedKey(_) => ErrorCode::InvalidNestedKey,
            InvalidAcl(_) => ErrorCode::InvalidAcl,
            InvalidEmailAddress(_) => ErrorCode::InvalidEmailAddress,
            AmbiguousDeviceToken(_) => ErrorCode::AmbiguousDeviceToken,
            MissingRequiredField(_) => ErrorCode::MissingRequiredField,
            ChangedImmutableField(_) => ErrorCode::ChangedImmutableField,
            DuplicateValue { .. } => ErrorCode::DuplicateValue,
            ScriptFailed(_) => ErrorCode::ScriptFailed,
            ValidationError(_) => ErrorCode::ValidationError,
            UsernameMissing(_) => ErrorCode::UsernameMissing,
            PasswordMissing(_) => ErrorCode::PasswordMissing,
            UsernameTaken(_) => ErrorCode::UsernameTaken,
            EmailTaken(_) => ErrorCode::EmailTaken,
            SessionMissing(_) => ErrorCode::SessionMissing,
            AccountAlreadyLinked(_) => ErrorCode::AccountAlreadyLinked,
            InvalidSessionToken(_) => ErrorCode::InvalidSessionToken,
            UnsupportedService(_) => ErrorCode::UnsupportedService,
            FieldStateConflict(_) => ErrorCode::FieldStateConflict,
            OtherParseError { code, .. } => return *code,
        };
        code.as_i32()
    }

    /// The human readable message, without the kind prefix used by `Display`.
    pub fn message(&self) -> &str {
        use ParseError::*;
        match self {
            InternalServerError(m)
            | ObjectNotFound(m)
            | InvalidQuery(m)
            | InvalidClassName(m)
            | InvalidKeyName(m)
            | InvalidJson(m)
            | IncorrectType(m)
            | PushMisconfigured(m)
            | OperationForbidden(m)
            | InvalidNestedKey(m)
            | InvalidAcl(m)
            | InvalidEmailAddress(m)
            | AmbiguousDeviceToken(m)
            | MissingRequiredField(m)
            | ChangedImmutableField(m)
            | ScriptFailed(m)
            | ValidationError(m)
            | UsernameMissing(m)
            | PasswordMissing(m)
            | UsernameTaken(m)
            | EmailTaken(m)
            | SessionMissing(m)
            | AccountAlreadyLinked(m)
            | InvalidSessionToken(m)
            | UnsupportedService(m)
            | FieldStateConflict(m) => m,
            DuplicateValue { message, .. } => message,
            OtherParseError { message, .. } => message,
        }
    }

    /// Creates a `ParseError` from a numeric code and message, the shape storage adapters and
    /// remote collaborators report failures in.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            1 => ParseError::InternalServerError(message),
            101 => ParseError::ObjectNotFound(message),
            102 => ParseError::InvalidQuery(message),
            103 => ParseError::InvalidClassName(message),
            105 => ParseError::InvalidKeyName(message),
            107 => ParseError::InvalidJson(message),
            111 => ParseError::IncorrectType(message),
            115 => ParseError::PushMisconfigured(message),
            119 => ParseError::OperationForbidden(message),
            121 => ParseError::InvalidNestedKey(message),
            123 => ParseError::InvalidAcl(message),
            125 => ParseError::InvalidEmailAddress(message),
            132 => ParseError::AmbiguousDeviceToken(message),
            135 => ParseError::MissingRequiredField(message),
            136 => ParseError::ChangedImmutableField(message),
            137 => ParseError::DuplicateValue {
                message,
                duplicated_field: None,
            },
            141 => ParseError::ScriptFailed(message),
            142 => ParseError::ValidationError(message),
            200 => ParseError::UsernameMissing(message),
            201 => ParseError::PasswordMissing(message),
            202 => ParseError::UsernameTaken(message),
            203 => ParseError::EmailTaken(message),
            206 => ParseError::SessionMissing(message),
            208 => ParseError::AccountAlreadyLinked(message),
            209 => ParseError::InvalidSessionToken(message),
            252 => ParseError::UnsupportedService(message),
            255 => ParseError::FieldStateConflict(message),
            _ => ParseError::OtherParseError { code, message },
        }
    }

    /// Creates a `ParseError` from a JSON error body (`{"code": .., "error": ..}`).
    pub fn from_json(body: &Value) -> Self {
        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error");
        Self::from_code(code, message)
    }

    /// The `{code, error}` body routers hand back to clients.
    pub fn to_json(&self) -> Value {
        serde_json::json!({ "code": self.code(), "error": self.message() })
    }
}

impl From<url::ParseError> for ParseError {
    fn from(err: url::ParseError) -> Self {
        ParseError::InternalServerError(format!("invalid server URL: {}", err))
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::InvalidJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codes_round_trip_through_from_code() {
        let err = ParseError::UsernameTaken("Account already exists for this username.".into());
        assert_eq!(err.code(), 202);
        let rebuilt = ParseError::from_code(err.code(), err.message());
        assert_eq!(rebuilt, err);
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let err = ParseError::from_code(600, "aggregate failed");
        assert_eq!(err.code(), 600);
        assert_eq!(err.message(), "aggregate failed");
    }

    #[test]
    fn test_from_json_body() {
        let err = ParseError::from_json(&json!({"code": 137, "error": "dup"}));
        assert!(matches!(
            err,
            ParseError::DuplicateValue {
                duplicated_field: None,
                ..
            }
        ));
        assert_eq!(err.to_json(), json!({"code": 137, "error": "dup"}));
    }
}
