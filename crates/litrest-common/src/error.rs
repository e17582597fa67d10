//! Error types for the litrest gateway

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error classification, one per stable wire code.
///
/// The wire code and the HTTP status are part of the external contract and
/// must not change without a deliberate API revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing-but-required, invalid, or expired credentials
    Auth,
    /// The verb is disallowed for this principal
    Permission,
    /// Unknown route, database, table, or procedure
    NotFound,
    /// Malformed filter, unknown column/relation/operator, bad body
    Validation,
    /// Unique-constraint violation on write
    Conflict,
    /// Busy timeout, I/O failure, unexpected engine error
    Database,
}

impl ErrorKind {
    /// Stable wire code for the error envelope
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Database => "database",
        }
    }

    /// Fixed HTTP status for this kind
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Auth => 401,
            ErrorKind::Permission => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Validation => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Database => 500,
        }
    }
}

/// Main error type for the gateway
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Token present but failed verification
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Token expired (`exp` at or before now)
    #[error("token expired")]
    TokenExpired,

    /// Token signed with an algorithm outside the allow-list
    #[error("signing algorithm not allowed: {0}")]
    AlgorithmNotAllowed(String),

    /// Verb entirely disallowed for the principal
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown database
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Unknown table
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Unknown route or procedure name
    #[error("not found: {0}")]
    NotFound(String),

    /// Generic request validation failure
    #[error("{0}")]
    Validation(String),

    /// Column referenced but absent from the table's schema
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// Embed target with no foreign-key edge to the base table
    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    /// Operator outside the filter grammar
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    /// UPDATE or DELETE issued without any filter
    #[error("refusing {0} without a WHERE clause")]
    MissingWhere(&'static str),

    /// Unique-constraint violation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Pool acquisition deadline expired
    #[error("database busy: {0}")]
    Busy(String),

    /// Underlying engine failure
    #[error("database error: {0}")]
    Database(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::AuthFailed(_)
            | GatewayError::TokenExpired
            | GatewayError::AlgorithmNotAllowed(_) => ErrorKind::Auth,
            GatewayError::PermissionDenied(_) => ErrorKind::Permission,
            GatewayError::DatabaseNotFound(_)
            | GatewayError::TableNotFound(_)
            | GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::Validation(_)
            | GatewayError::UnknownColumn(_)
            | GatewayError::UnknownRelation(_)
            | GatewayError::UnknownOperator(_)
            | GatewayError::MissingWhere(_) => ErrorKind::Validation,
            GatewayError::Conflict(_) => ErrorKind::Conflict,
            GatewayError::Busy(_) | GatewayError::Database(_) => ErrorKind::Database,
        }
    }

    /// Machine-readable detail tag, where one exists beyond the kind
    pub fn details(&self) -> Option<&'static str> {
        match self {
            GatewayError::TokenExpired => Some("expired"),
            GatewayError::AlgorithmNotAllowed(_) => Some("algorithm_not_allowed"),
            GatewayError::UnknownColumn(_) => Some("unknown_column"),
            GatewayError::UnknownRelation(_) => Some("unknown_relation"),
            GatewayError::UnknownOperator(_) => Some("unknown_operator"),
            GatewayError::MissingWhere(_) => Some("missing_where"),
            GatewayError::Busy(_) => Some("busy"),
            _ => None,
        }
    }

    /// Optional human hint for the envelope
    pub fn hint(&self) -> Option<String> {
        match self {
            GatewayError::MissingWhere(_) => Some(
                "add at least one filter, e.g. ?id=eq.1".to_string(),
            ),
            GatewayError::UnknownOperator(_) => Some(
                "supported operators: eq, neq, gt, gte, lt, lte, like, ilike, in, is".to_string(),
            ),
            _ => None,
        }
    }

    /// Render the fixed error envelope
    pub fn envelope(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "code": self.kind().code(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            body["details"] = serde_json::Value::String(details.to_string());
        }
        if let Some(hint) = self.hint() {
            body["hint"] = serde_json::Value::String(hint);
        }
        body
    }
}
