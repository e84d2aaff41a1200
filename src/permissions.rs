// src/permissions.rs
//
// Class-level permission checks. These work on a CLP snapshot and never touch
// storage; per-object pointer permissions are applied later as query constraints.

use crate::error::ParseError;
use crate::schema::{ClassLevelPermissions, ClpOperation};

/// Fast allow check: a `*` grant, or a direct user id / role membership.
///
/// A class without permissions for `operation` is open.
pub fn test_base_clp(
    clp: Option<&ClassLevelPermissions>,
    acl_group: &[String],
    operation: ClpOperation,
) -> bool {
    let Some(perms) = clp.and_then(|clp| clp.operation(operation)) else {
        return true;
    };
    if perms.get("*").copied().unwrap_or(false) {
        return true;
    }
    acl_group
        .iter()
        .any(|entry| perms.get(entry).copied().unwrap_or(false))
}

/// Full permission check for `operation` on `class_name`.
///
/// Layers, in order: the base CLP, `requiresAuthentication`, then pointer
/// permissions (`readUserFields` for reads, `writeUserFields` otherwise). A
/// non-empty pointer-permission list allows the operation here and defers the
/// decision to the per-object query constraint. `create` can never be satisfied
/// by `writeUserFields`.
pub fn validate_permission(
    class_name: &str,
    clp: Option<&ClassLevelPermissions>,
    acl_group: &[String],
    operation: ClpOperation,
) -> Result<(), ParseError> {
    if test_base_clp(clp, acl_group, operation) {
        return Ok(());
    }
    let denied = || {
        ParseError::OperationForbidden(format!(
            "Permission denied for action {} on class {}.",
            operation, class_name
        ))
    };
    // test_base_clp only fails when the operation has an explicit permission map.
    let Some(clp) = clp else {
        return Err(denied());
    };
    let perms = clp.operation(operation).ok_or_else(denied)?;

    if perms
        .get("requiresAuthentication")
        .copied()
        .unwrap_or(false)
    {
        let anonymous = acl_group.is_empty()
            || (acl_group.len() == 1 && acl_group.iter().any(|entry| entry == "*"));
        if anonymous {
            return Err(ParseError::ObjectNotFound(
                "Permission denied, user needs to be authenticated.".to_string(),
            ));
        }
        return Ok(());
    }

    if operation == ClpOperation::Create {
        return Err(denied());
    }
    match clp.pointer_fields(operation) {
        Some(fields) if !fields.is_empty() => Ok(()),
        _ => Err(denied()),
    }
}

/// Pointer-permission fields that constrain `operation` for a caller the base CLP did not admit.
pub fn pointer_permission_fields<'a>(
    clp: Option<&'a ClassLevelPermissions>,
    acl_group: &[String],
    operation: ClpOperation,
) -> Option<&'a Vec<String>> {
    if test_base_clp(clp, acl_group, operation) {
        return None;
    }
    clp.and_then(|clp| clp.pointer_fields(operation))
        .filter(|fields| !fields.is_empty())
}
