//! Error taxonomy for the connector.
//!
//! Errors fall into two groups. *Fatal* errors ([`Configuration`] and
//! [`Credential`]) stop the whole sync run. Everything else is scoped to the
//! entity type (or single repository) that produced it and never aborts the
//! other entity types in the same run.
//!
//! Malformed or missing optional fields are not represented here at all:
//! those are recovered where they are parsed.
//!
//! [`Configuration`]: ConnectorError::Configuration
//! [`Credential`]: ConnectorError::Credential

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the connector library.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Invalid or incomplete configuration. Raised before any network call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The upstream rejected the credential (401/403) or no credential was available.
    #[error("credential error: {0}")]
    Credential(String),

    /// Timeout, 5xx, or rate-limit response. Retried by the fetcher.
    #[error("transient API error: {message}")]
    Transient {
        message: String,
        /// Server-requested delay before the next attempt, if any.
        retry_after: Option<Duration>,
    },

    /// A transient error persisted through every retry attempt.
    #[error("request to {operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// The requested resource does not exist (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success HTTP status.
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    /// A listing still had pages when the configured page limit was reached.
    #[error("{operation} stopped at the {max_pages}-page limit with more pages pending")]
    PageLimit { operation: String, max_pages: usize },

    /// A repository cannot be read (empty, no branches).
    #[error("repository {repository}: {reason}")]
    RepositoryState { repository: String, reason: String },

    /// Writing documents to the outbound sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// The run was cancelled before this operation started.
    #[error("operation cancelled")]
    Cancelled,
}

impl ConnectorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Fatal errors abort the run; every other error is scoped to one entity type.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Credential(_))
    }

    /// Whether the fetcher should try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Server-requested delay carried by a rate-limit response.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_configuration_and_credential_only() {
        assert!(ConnectorError::configuration("missing organization").is_fatal());
        assert!(ConnectorError::credential("401").is_fatal());
        assert!(!ConnectorError::transient("503").is_fatal());
        assert!(!ConnectorError::NotFound("work item 2".into()).is_fatal());
        assert!(!ConnectorError::RetriesExhausted {
            operation: "wiql".into(),
            attempts: 4,
            last_error: "timeout".into(),
        }
        .is_fatal());
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ConnectorError::transient("timeout").is_retryable());
        assert!(!ConnectorError::credential("403").is_retryable());
        assert!(!ConnectorError::Http {
            status: 400,
            url: "u".into(),
            body: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn retry_after_is_exposed_for_rate_limits() {
        let err = ConnectorError::Transient {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ConnectorError::transient("503").retry_after(), None);
    }

    #[test]
    fn page_limit_is_scoped_and_not_retried() {
        let err = ConnectorError::PageLimit {
            operation: "GET test/runs".into(),
            max_pages: 3,
        };
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3-page limit"));
    }

    #[test]
    fn display_mentions_the_category() {
        let err = ConnectorError::RepositoryState {
            repository: "empty-repo".into(),
            reason: "no branches".into(),
        };
        assert_eq!(err.to_string(), "repository empty-repo: no branches");
        assert!(ConnectorError::credential("bad token")
            .to_string()
            .contains("credential error"));
    }
}
