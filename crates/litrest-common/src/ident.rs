//! SQL identifier rules
//!
//! Every identifier that reaches a SQL statement passes through
//! [`validate_ident`] first; [`quote_ident`] is the only quoting path.

use crate::error::{GatewayError, Result};

/// Maximum accepted identifier length in bytes
pub const MAX_IDENT_LEN: usize = 64;

/// Validate a table or column name against the allow-list.
///
/// Accepted: ASCII letters, digits, and underscore; at most 64 bytes; must
/// not start with a digit.
pub fn validate_ident(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GatewayError::Validation("empty identifier".to_string()));
    }
    if name.len() > MAX_IDENT_LEN {
        return Err(GatewayError::Validation(format!(
            "identifier too long ({} bytes): {}",
            name.len(),
            name
        )));
    }
    let mut chars = name.bytes();
    let first = chars.next().unwrap();
    if first.is_ascii_digit() {
        return Err(GatewayError::Validation(format!(
            "identifier must not start with a digit: {name}"
        )));
    }
    if !(first.is_ascii_alphanumeric() || first == b'_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == b'_')
    {
        return Err(GatewayError::Validation(format!(
            "invalid identifier: {name}"
        )));
    }
    Ok(())
}

/// Quote an identifier with backticks, doubling embedded backticks.
///
/// Callers validate first; quoting alone is not an injection barrier for
/// arbitrary input.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// True for names the gateway reserves for itself or SQLite internals.
///
/// These tables are introspectable by the engine but never routable over
/// HTTP.
pub fn is_internal_table(name: &str) -> bool {
    name.starts_with("sqlite_") || name.starts_with('_')
}
