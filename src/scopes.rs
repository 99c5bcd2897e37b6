//! Scope normalization and the scope authorizer.
//!
//! Scopes are case-insensitive and normalized to lowercase both when they are
//! recorded on a connection and at comparison time. A request whose scopes
//! exceed the connection's authorized set is rejected wholesale, never
//! silently narrowed.

use std::collections::HashSet;

use crate::error::IssuanceError;

/// Normalize a scope list to lowercase, preserving order.
pub fn normalize_scopes<I, S>(scopes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    scopes
        .into_iter()
        .map(|scope| scope.as_ref().to_lowercase())
        .collect()
}

/// Compute the effective scopes for a request.
///
/// Returns the requested scopes unchanged when every one of them is covered
/// by the connection's authorized set; otherwise fails with a
/// [`IssuanceError::ScopeViolation`] naming every unauthorized scope.
pub fn authorize(
    requested_scopes: &[String],
    authorized_scopes: &[String],
) -> Result<Vec<String>, IssuanceError> {
    let authorized: HashSet<String> = authorized_scopes
        .iter()
        .map(|scope| scope.to_lowercase())
        .collect();

    let requested = normalize_scopes(requested_scopes);

    let unauthorized: Vec<String> = requested
        .iter()
        .filter(|scope| !authorized.contains(*scope))
        .cloned()
        .collect();

    if !unauthorized.is_empty() {
        return Err(IssuanceError::ScopeViolation {
            scopes: unauthorized,
        });
    }

    Ok(requested)
}
