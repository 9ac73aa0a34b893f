//! Error types for secret lookups.

use thiserror::Error;

/// Result type alias for secret operations.
pub type SecretsResult<T> = Result<T, SecretsError>;

/// Errors raised by a [`SecretStore`](crate::SecretStore) or the credential cache.
///
/// The variants mirror the taxonomy external secret services expose, so
/// callers can tell "this will never work" (`NotFound`, `AccessDenied`,
/// `Malformed`) apart from "try again later" (`Unavailable`).
#[derive(Clone, Debug, Error)]
pub enum SecretsError {
    #[error("secret not found: {name}")]
    NotFound { name: String },

    #[error("access denied to secret '{name}': {message}")]
    AccessDenied { name: String, message: String },

    #[error("secret service unavailable for '{name}': {message}")]
    Unavailable { name: String, message: String },

    #[error("secret '{name}' is malformed: {reason}")]
    Malformed { name: String, reason: String },

    #[error("secret '{name}' has no field '{field}'")]
    MissingField { name: String, field: String },
}

impl SecretsError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn access_denied(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AccessDenied {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same fetch later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Name of the secret the error refers to.
    pub fn secret_name(&self) -> &str {
        match self {
            Self::NotFound { name }
            | Self::AccessDenied { name, .. }
            | Self::Unavailable { name, .. }
            | Self::Malformed { name, .. }
            | Self::MissingField { name, .. } => name,
        }
    }
}
