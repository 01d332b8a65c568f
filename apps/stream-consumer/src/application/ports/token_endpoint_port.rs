//! Token Endpoint Port (Driven Port)
//!
//! Interface for exchanging client credentials for a bearer token.

use async_trait::async_trait;

use crate::domain::auth::{Credentials, TokenGrant};

/// Authentication error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The endpoint refused the credentials.
    #[error("token request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body or error description.
        message: String,
    },

    /// The endpoint could not be reached.
    #[error("token endpoint unreachable: {message}")]
    Network {
        /// Error details.
        message: String,
    },

    /// The response could not be understood.
    #[error("invalid token response: {message}")]
    InvalidResponse {
        /// Error details.
        message: String,
    },

    /// Renewal was requested before any credentials were supplied.
    #[error("no credentials configured")]
    NoCredentials,
}

impl AuthError {
    /// Check whether retrying the same request could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::InvalidResponse { .. } => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::NoCredentials => false,
        }
    }
}

/// Port for the OAuth2 token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange credentials for a token.
    async fn request_token(&self, credentials: &Credentials) -> Result<TokenGrant, AuthError>;
}
