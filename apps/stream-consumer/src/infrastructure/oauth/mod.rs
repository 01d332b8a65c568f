//! OAuth2 Token Endpoint
//!
//! [`TokenEndpoint`] over HTTP: a `client_credentials` form POST to the
//! configured token URL.
//!
//! Some providers send `expires_in` as a JSON string; both forms are
//! accepted. Lifetimes of zero or beyond [`Token::MAX_LIFETIME`] are
//! rejected.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::application::ports::{AuthError, TokenEndpoint};
use crate::domain::auth::{Credentials, Token, TokenGrant};

/// Request timeout for token calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl ExpiresIn {
    fn to_duration(&self) -> Result<Duration, AuthError> {
        let seconds = match self {
            Self::Seconds(secs) => *secs,
            Self::Text(text) => text.trim().parse().map_err(|_| AuthError::InvalidResponse {
                message: format!("expires_in is not a number: {text:?}"),
            })?,
        };

        if seconds == 0 {
            return Err(AuthError::InvalidResponse {
                message: "expires_in is zero".to_string(),
            });
        }
        let lifetime = Duration::from_secs(seconds);
        if lifetime > Token::MAX_LIFETIME {
            return Err(AuthError::InvalidResponse {
                message: format!("expires_in of {seconds}s is out of range"),
            });
        }
        Ok(lifetime)
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// HTTP client for the OAuth2 token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
}

impl HttpTokenEndpoint {
    /// Create an endpoint with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `Network` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Network {
                message: e.to_string(),
            })?;
        Ok(Self::with_client(client))
    }

    /// Create an endpoint sharing an existing HTTP client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request_token(&self, credentials: &Credentials) -> Result<TokenGrant, AuthError> {
        tracing::debug!(
            url = credentials.token_endpoint(),
            client_id = credentials.client_id(),
            "Requesting access token"
        );

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id()),
            ("client_secret", credentials.client_secret()),
        ];
        if let Some(scope) = credentials.scope() {
            form.push(("scope", scope));
        }

        let response = self
            .client
            .post(credentials.token_endpoint())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Network {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AuthError::Network {
            message: e.to_string(),
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<OAuthErrorResponse>(&body).map_or(body, |e| {
                match e.error_description {
                    Some(description) => format!("{}: {description}", e.error),
                    None => e.error,
                }
            });
            tracing::warn!(status = status.as_u16(), message = %message, "Token request rejected");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse {
                message: e.to_string(),
            })?;

        if token.access_token.is_empty() {
            return Err(AuthError::InvalidResponse {
                message: "empty access_token".to_string(),
            });
        }

        Ok(TokenGrant {
            access_token: token.access_token,
            expires_in: token.expires_in.to_duration()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(r#"{"access_token":"a","expires_in":300}"#, 300 ; "numeric")]
    #[test_case(r#"{"access_token":"a","expires_in":"600"}"#, 600 ; "string")]
    #[test_case(
        r#"{"access_token":"a","expires_in":"300","token_type":"Bearer"}"#, 300 ;
        "extra fields"
    )]
    fn parses_expires_in(body: &str, secs: u64) {
        let response: TokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            response.expires_in.to_duration().unwrap(),
            Duration::from_secs(secs)
        );
    }

    #[test_case(ExpiresIn::Seconds(0) ; "zero")]
    #[test_case(ExpiresIn::Text("soon".to_string()) ; "not a number")]
    #[test_case(ExpiresIn::Seconds(u64::MAX) ; "overflowing")]
    #[test_case(ExpiresIn::Text("18446744073709551615".to_string()) ; "overflowing string")]
    #[test_case(ExpiresIn::Seconds(Token::MAX_LIFETIME.as_secs() + 1) ; "over a year")]
    fn rejects_bad_expires_in(expires_in: ExpiresIn) {
        assert!(matches!(
            expires_in.to_duration(),
            Err(AuthError::InvalidResponse { .. })
        ));
    }
}
