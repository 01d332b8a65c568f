//! Credential and Token Types
//!
//! OAuth2 client credentials and the bearer tokens issued against them.
//! Both are immutable values: rotation and renewal replace the whole value
//! rather than mutating it, so a reader holding an `Arc<Token>` always sees a
//! complete token.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Stand-in for "never" when an instant would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `base + offset`, saturating to a far-future instant on overflow.
pub(crate) fn instant_after(base: Instant, offset: Duration) -> Instant {
    base.checked_add(offset)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

// =============================================================================
// Credentials
// =============================================================================

/// OAuth2 client credentials.
///
/// The `Debug` implementation redacts the secret for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
    token_endpoint: String,
    scope: Option<String>,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint: token_endpoint.into(),
            scope: None,
        }
    }

    /// Attach an OAuth2 scope to the token request.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Get the client ID.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Get the token endpoint URL.
    #[must_use]
    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    /// Get the requested scope, if any.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Return a copy with a rotated secret, keeping the rest of the set.
    #[must_use]
    pub fn with_secret(&self, client_secret: impl Into<String>) -> Self {
        Self {
            client_secret: client_secret.into(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_endpoint", &self.token_endpoint)
            .field("scope", &self.scope)
            .finish()
    }
}

// =============================================================================
// Token
// =============================================================================

/// Result of a successful exchange at the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Bearer value.
    pub access_token: String,
    /// Lifetime reported by the endpoint.
    pub expires_in: Duration,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// An issued bearer token.
///
/// Expiry is tracked on the tokio clock so renewal timing can be tested with
/// a paused runtime; the wall-clock expiry is kept for logging.
#[derive(Clone)]
pub struct Token {
    access_token: String,
    issued_at: Instant,
    lifetime: Duration,
    expires_at_utc: DateTime<Utc>,
}

impl Token {
    /// Longest lifetime a token is tracked with; longer grants are capped.
    pub const MAX_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// Create a token issued now from a grant.
    #[must_use]
    pub fn from_grant(grant: TokenGrant) -> Self {
        Self::issued_at(grant.access_token, Instant::now(), grant.expires_in)
    }

    /// Create a token with an explicit issue instant.
    #[must_use]
    pub fn issued_at(
        access_token: impl Into<String>,
        issued_at: Instant,
        lifetime: Duration,
    ) -> Self {
        let lifetime = lifetime.min(Self::MAX_LIFETIME);
        let expires_at_utc = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            access_token: access_token.into(),
            issued_at,
            lifetime,
            expires_at_utc,
        }
    }

    /// Get the bearer value.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// When the token was issued.
    #[must_use]
    pub const fn issued(&self) -> Instant {
        self.issued_at
    }

    /// Total lifetime granted by the endpoint.
    #[must_use]
    pub const fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Instant at which the token stops being valid.
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        instant_after(self.issued_at, self.lifetime)
    }

    /// Wall-clock expiry, for logging.
    #[must_use]
    pub const fn expires_at_utc(&self) -> DateTime<Utc> {
        self.expires_at_utc
    }

    /// Check whether the token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }

    /// Time left before expiry (zero once expired).
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("lifetime", &self.lifetime)
            .field("expires_at", &self.expires_at_utc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_secret() {
        let creds = Credentials::new("my_client", "super_secret", "https://auth.example/token");
        let debug = format!("{creds:?}");
        assert!(debug.contains("my_client"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super_secret"));
    }

    #[test]
    fn credentials_rotation_keeps_identity() {
        let creds = Credentials::new("id", "old", "https://auth.example/token").with_scope("trapi");
        let rotated = creds.with_secret("new");

        assert_eq!(rotated.client_id(), "id");
        assert_eq!(rotated.client_secret(), "new");
        assert_eq!(rotated.scope(), Some("trapi"));
        assert_eq!(creds.client_secret(), "old");
    }

    #[test]
    fn token_debug_redacts_bearer() {
        let token = Token::issued_at("bearer-value", Instant::now(), Duration::from_secs(300));
        assert!(!format!("{token:?}").contains("bearer-value"));
    }

    #[tokio::test(start_paused = true)]
    async fn token_expiry_follows_lifetime() {
        let token = Token::issued_at("t", Instant::now(), Duration::from_secs(10));
        assert!(!token.is_expired());
        assert_eq!(token.remaining(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(token.is_expired());
        assert_eq!(token.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_lifetime_is_capped() {
        let now = Instant::now();
        let token = Token::issued_at("t", now, Duration::from_secs(u64::MAX));

        assert_eq!(token.lifetime(), Token::MAX_LIFETIME);
        assert_eq!(token.expires_at(), now + Token::MAX_LIFETIME);
        assert!(!token.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn instant_after_saturates() {
        let now = Instant::now();

        assert_eq!(instant_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(instant_after(now, Duration::MAX) > now + Token::MAX_LIFETIME);
    }
}
