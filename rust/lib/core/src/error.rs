use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. The UI layer matches on these,
// never on the human-readable message string.

/// Stable error code constants.
pub mod error_code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const MISSING_RELATION: &str = "MISSING_RELATION";
    pub const BACKEND: &str = "BACKEND";
    pub const NETWORK: &str = "NETWORK";
    pub const DECODE: &str = "DECODE";
    pub const UNCONFIGURED: &str = "UNCONFIGURED";
    pub const DISPOSED: &str = "DISPOSED";
}

// ── ClientError ─────────────────────────────────────────────────────

/// Unified error type for the client core.
///
/// Each variant maps to a stable error code (see [`error_code`]).
/// [`ClientError::is_transient`] separates request failures that are
/// recovered by reverting an optimistic change from programming or data
/// errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Entity does not exist on the backend or in owned state.
    #[error("{0}")]
    NotFound(String),

    /// Input rejected before reaching the backend.
    #[error("{0}")]
    Validation(String),

    /// No session, or the session was rejected.
    #[error("{0}")]
    Unauthenticated(String),

    /// A backend row lacks a relation the view model requires.
    #[error("{entity} '{id}' is missing required relation '{relation}'")]
    MissingRelation {
        entity: &'static str,
        id: String,
        relation: &'static str,
    },

    /// The backend rejected a request.
    #[error("backend: {0}")]
    Backend(String),

    /// The request never reached the backend or the response was lost.
    #[error("network: {0}")]
    Network(String),

    /// A response or event payload could not be decoded.
    #[error("decode: {0}")]
    Decode(String),

    /// An optional collaborator is not configured.
    #[error("{0} is not configured")]
    Unconfigured(String),

    /// The owning view or context has been disposed.
    #[error("{0} has been disposed")]
    Disposed(String),
}

impl ClientError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ClientError::NotFound(_) => error_code::NOT_FOUND,
            ClientError::Validation(_) => error_code::VALIDATION_FAILED,
            ClientError::Unauthenticated(_) => error_code::UNAUTHENTICATED,
            ClientError::MissingRelation { .. } => error_code::MISSING_RELATION,
            ClientError::Backend(_) => error_code::BACKEND,
            ClientError::Network(_) => error_code::NETWORK,
            ClientError::Decode(_) => error_code::DECODE,
            ClientError::Unconfigured(_) => error_code::UNCONFIGURED,
            ClientError::Disposed(_) => error_code::DISPOSED,
        }
    }

    /// Request failures that a retry might fix. Optimistic mutations
    /// revert on these and surface a transient message.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Backend(_) | ClientError::Network(_))
    }

    /// Short message suitable for a toast.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Backend(_) | ClientError::Network(_) => {
                "Something went wrong. Please try again.".to_string()
            }
            ClientError::Unauthenticated(_) => "Please sign in again.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e.to_string())
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(ClientError::NotFound("x".into()).error_code(), "NOT_FOUND");
        assert_eq!(ClientError::Validation("x".into()).error_code(), "VALIDATION_FAILED");
        assert_eq!(ClientError::Unauthenticated("x".into()).error_code(), "UNAUTHENTICATED");
        assert_eq!(ClientError::Backend("x".into()).error_code(), "BACKEND");
        assert_eq!(ClientError::Network("x".into()).error_code(), "NETWORK");
        assert_eq!(ClientError::Decode("x".into()).error_code(), "DECODE");
        assert_eq!(ClientError::Unconfigured("x".into()).error_code(), "UNCONFIGURED");
        assert_eq!(ClientError::Disposed("x".into()).error_code(), "DISPOSED");
        let missing = ClientError::MissingRelation {
            entity: "post",
            id: "1".into(),
            relation: "author",
        };
        assert_eq!(missing.error_code(), "MISSING_RELATION");
    }

    #[test]
    fn transient_classification() {
        assert!(ClientError::Backend("503".into()).is_transient());
        assert!(ClientError::Network("reset".into()).is_transient());
        assert!(!ClientError::Validation("empty".into()).is_transient());
        assert!(!ClientError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn missing_relation_display() {
        let err = ClientError::MissingRelation {
            entity: "post",
            id: "42".into(),
            relation: "author",
        };
        assert_eq!(err.to_string(), "post '42' is missing required relation 'author'");
    }

    #[test]
    fn user_message_hides_backend_details() {
        let err = ClientError::Backend("duplicate key value violates unique constraint".into());
        assert!(!err.user_message().contains("duplicate"));
        assert_eq!(
            ClientError::Validation("Comment cannot be empty".into()).user_message(),
            "Comment cannot be empty"
        );
    }
}
