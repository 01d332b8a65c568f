//! Token Manager
//!
//! Obtains bearer tokens through the [`TokenEndpoint`] port and keeps the
//! active token and credential set as atomically swapped snapshots.
//!
//! # Renewal timing
//!
//! A token issued at `t` with lifetime `L` is due for renewal at
//! `t + min(L * ratio, L - margin)`, which is strictly before expiry for any
//! non-zero lifetime. Tokens shorter than the margin are renewed at half
//! their lifetime.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{AuthError, TokenEndpoint};
use crate::domain::auth::{Credentials, Token, instant_after};

/// When renewal fires relative to a token's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalSchedule {
    /// Fraction of the lifetime after which renewal starts.
    pub ratio: f64,
    /// Minimum time left before expiry when renewal starts.
    pub min_margin: Duration,
}

impl Default for RenewalSchedule {
    fn default() -> Self {
        Self {
            ratio: 0.8,
            min_margin: Duration::from_secs(5),
        }
    }
}

impl RenewalSchedule {
    /// Offset from issue time at which renewal is due.
    #[must_use]
    pub fn offset(&self, lifetime: Duration) -> Duration {
        let ratio = if self.ratio.is_finite() {
            self.ratio.clamp(0.0, 1.0)
        } else {
            Self::default().ratio
        };
        let by_ratio =
            Duration::try_from_secs_f64(lifetime.as_secs_f64() * ratio).unwrap_or(lifetime);
        let by_margin = lifetime.saturating_sub(self.min_margin);

        if by_margin.is_zero() {
            lifetime / 2
        } else {
            by_ratio.min(by_margin)
        }
    }

    /// Instant at which a token is due for renewal.
    #[must_use]
    pub fn due_at(&self, token: &Token) -> Instant {
        instant_after(token.issued(), self.offset(token.lifetime()))
    }
}

/// Cancels a scheduled renewal when cancelled or dropped.
#[derive(Debug)]
pub struct RenewalHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    due_at: Instant,
}

impl RenewalHandle {
    /// When the callback fires.
    #[must_use]
    pub const fn due_at(&self) -> Instant {
        self.due_at
    }

    /// Stop the timer. The callback will not run if it has not already.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check whether the timer task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Issues, renews, and publishes bearer tokens.
pub struct TokenManager {
    endpoint: Arc<dyn TokenEndpoint>,
    credentials: ArcSwapOption<Credentials>,
    token: ArcSwapOption<Token>,
    schedule: RenewalSchedule,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("credentials", &self.credentials.load_full())
            .field("token", &self.token.load_full())
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Create a manager with the default renewal schedule.
    #[must_use]
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self::with_schedule(endpoint, RenewalSchedule::default())
    }

    /// Create a manager with an explicit renewal schedule.
    #[must_use]
    pub fn with_schedule(endpoint: Arc<dyn TokenEndpoint>, schedule: RenewalSchedule) -> Self {
        Self {
            endpoint,
            credentials: ArcSwapOption::empty(),
            token: ArcSwapOption::empty(),
            schedule,
        }
    }

    /// Store credentials and obtain the first token.
    ///
    /// # Errors
    ///
    /// Returns the endpoint's error; the credentials stay stored so a later
    /// [`renew`](Self::renew) can retry.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<Arc<Token>, AuthError> {
        tracing::info!(client_id = credentials.client_id(), "Authenticating");
        self.credentials.store(Some(Arc::new(credentials)));
        self.renew().await
    }

    /// Obtain a new token with the current credential set.
    ///
    /// On failure the previous token stays active.
    ///
    /// # Errors
    ///
    /// Returns `NoCredentials` before [`authenticate`](Self::authenticate),
    /// otherwise the endpoint's error.
    pub async fn renew(&self) -> Result<Arc<Token>, AuthError> {
        let credentials = self.credentials.load_full().ok_or(AuthError::NoCredentials)?;

        let grant = self.endpoint.request_token(&credentials).await?;
        let token = Arc::new(Token::from_grant(grant));
        self.token.store(Some(Arc::clone(&token)));

        tracing::info!(
            expires_at = %token.expires_at_utc(),
            lifetime_secs = token.lifetime().as_secs(),
            "Token issued"
        );
        Ok(token)
    }

    /// Replace the credential set used by subsequent renewals.
    pub fn rotate_credentials(&self, credentials: Credentials) {
        tracing::info!(client_id = credentials.client_id(), "Credentials rotated");
        self.credentials.store(Some(Arc::new(credentials)));
    }

    /// The active token.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Token>> {
        self.token.load_full()
    }

    /// The active credential set.
    #[must_use]
    pub fn credentials(&self) -> Option<Arc<Credentials>> {
        self.credentials.load_full()
    }

    /// Forget the active token.
    pub fn clear(&self) {
        self.token.store(None);
    }

    /// Renewal timing in use.
    #[must_use]
    pub const fn schedule(&self) -> RenewalSchedule {
        self.schedule
    }

    /// Run `on_renewal_due` once, before `token` expires.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_renewal<F>(&self, token: &Token, on_renewal_due: F) -> RenewalHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let due_at = self.schedule.due_at(token);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tracing::debug!(
            due_in_ms = due_at.saturating_duration_since(Instant::now()).as_millis(),
            "Token renewal scheduled"
        );

        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = task_cancel.cancelled() => {}
                () = tokio::time::sleep_until(due_at) => on_renewal_due(),
            }
        });

        RenewalHandle {
            cancel,
            task,
            due_at,
        }
    }
}
