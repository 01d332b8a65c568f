//! Subscription Registry
//!
//! Domain types for tracking item subscriptions on a streaming session.
//!
//! # Design
//!
//! The registry tracks:
//! - One entry per requested item, keyed by a client-assigned [`Handle`]
//! - The stream status reported by the provider for each entry
//! - Which entries must be re-requested after a reconnect
//!
//! Handles are allocated from an atomic counter that never goes backwards,
//! so a handle is never reused within a session even after unsubscribe.
//! Handle `1` belongs to the login stream and is never handed out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::domain::message::{DomainKind, State, StreamState};

// =============================================================================
// Types
// =============================================================================

/// Client-assigned stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Stream id of the session login stream.
    pub const LOGIN: Self = Self(1);

    /// Wrap a raw stream id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw stream id.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Check for the login stream.
    #[must_use]
    pub const fn is_login(self) -> bool {
        self.0 == Self::LOGIN.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// Requested; no refresh or status received yet.
    Pending,
    /// Provider reported an open stream.
    Open,
    /// Closed by the client, or a snapshot-only stream completed.
    Closed,
    /// Provider closed or redirected the stream.
    Errored,
}

impl SubscriptionStatus {
    /// Status implied by a provider stream state.
    #[must_use]
    pub const fn from_stream_state(stream: StreamState) -> Option<Self> {
        match stream {
            StreamState::Open => Some(Self::Open),
            StreamState::NonStreaming => Some(Self::Closed),
            StreamState::Closed | StreamState::ClosedRecover | StreamState::Redirected => {
                Some(Self::Errored)
            }
            StreamState::Unspecified => None,
        }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }

    /// Check whether the entry should be re-requested after a reconnect.
    #[must_use]
    pub const fn is_replayable(self) -> bool {
        matches!(self, Self::Pending | Self::Open)
    }
}

/// What a caller asks for when subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Service publishing the item.
    pub service_name: String,
    /// Item name (e.g. `EUR=`).
    pub item_name: String,
    /// Domain of the stream.
    pub domain: DomainKind,
    /// Restrict delivery to these field ids.
    pub view: Option<Vec<i16>>,
}

impl SubscriptionRequest {
    /// Market price request without a view.
    #[must_use]
    pub fn market_price(service_name: impl Into<String>, item_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            item_name: item_name.into(),
            domain: DomainKind::MarketPrice,
            view: None,
        }
    }

    /// Attach a field view.
    #[must_use]
    pub fn with_view(mut self, field_ids: impl IntoIterator<Item = i16>) -> Self {
        self.view = Some(field_ids.into_iter().collect());
        self
    }
}

/// A registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Assigned handle.
    pub handle: Handle,
    /// Service publishing the item.
    pub service_name: String,
    /// Item name.
    pub item_name: String,
    /// Domain of the stream.
    pub domain: DomainKind,
    /// Requested field view.
    pub view: Option<Vec<i16>>,
    /// Current status.
    pub status: SubscriptionStatus,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No subscription exists for the handle.
    #[error("unknown subscription handle {0}")]
    UnknownHandle(Handle),
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of the session's subscriptions.
///
/// # Example
///
/// ```rust
/// use stream_consumer::domain::subscription::{
///     RegistryError, SubscriptionRegistry, SubscriptionRequest, SubscriptionStatus,
/// };
///
/// let registry = SubscriptionRegistry::new();
///
/// let handle = registry.subscribe(SubscriptionRequest::market_price("ELEKTRON_DD", "EUR="));
/// assert_eq!(registry.lookup(handle).unwrap().status, SubscriptionStatus::Pending);
///
/// registry.unsubscribe(handle);
/// assert_eq!(registry.lookup(handle), Err(RegistryError::UnknownHandle(handle)));
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry {
    next_handle: AtomicU64,
    entries: RwLock<BTreeMap<Handle, Subscription>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(Handle::LOGIN.value() + 1),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a subscription in `Pending` state and return its handle.
    pub fn subscribe(&self, request: SubscriptionRequest) -> Handle {
        let handle = Handle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let subscription = Subscription {
            handle,
            service_name: request.service_name,
            item_name: request.item_name,
            domain: request.domain,
            view: request.view,
            status: SubscriptionStatus::Pending,
        };

        self.entries.write().insert(handle, subscription);
        handle
    }

    /// Get a snapshot of a subscription.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the handle was never issued or was removed.
    pub fn lookup(&self, handle: Handle) -> Result<Subscription, RegistryError> {
        self.entries
            .read()
            .get(&handle)
            .cloned()
            .ok_or(RegistryError::UnknownHandle(handle))
    }

    /// Remove a subscription, returning it marked `Closed`.
    ///
    /// Unknown or already removed handles are a no-op.
    pub fn unsubscribe(&self, handle: Handle) -> Option<Subscription> {
        let mut removed = self.entries.write().remove(&handle)?;
        removed.status = SubscriptionStatus::Closed;
        Some(removed)
    }

    /// Set the status of a subscription.
    ///
    /// Returns the previous status.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if no subscription exists for the handle.
    pub fn update_status(
        &self,
        handle: Handle,
        status: SubscriptionStatus,
    ) -> Result<SubscriptionStatus, RegistryError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;

        Ok(std::mem::replace(&mut entry.status, status))
    }

    /// Apply a provider state to a subscription.
    ///
    /// Returns the new status, or `None` if the state carries no transition.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if no subscription exists for the handle.
    pub fn apply_state(
        &self,
        handle: Handle,
        state: &State,
    ) -> Result<Option<SubscriptionStatus>, RegistryError> {
        match SubscriptionStatus::from_stream_state(state.stream) {
            Some(status) => self.update_status(handle, status).map(|_| Some(status)),
            None => self.lookup(handle).map(|_| None),
        }
    }

    /// Snapshot of every subscription, ordered by handle.
    #[must_use]
    pub fn all(&self) -> Vec<Subscription> {
        self.entries.read().values().cloned().collect()
    }

    /// Subscriptions to re-request after a reconnect.
    ///
    /// Both `Pending` and `Open` entries are returned: a `Pending` stream
    /// was requested but never answered on the lost connection. `Errored`
    /// and `Closed` entries are left out.
    #[must_use]
    pub fn replayable(&self) -> Vec<Subscription> {
        self.entries
            .read()
            .values()
            .filter(|s| s.status.is_replayable())
            .cloned()
            .collect()
    }

    /// Mark every replayable subscription `Pending` again.
    pub fn reset_pending(&self) {
        for entry in self.entries.write().values_mut() {
            if entry.status.is_replayable() {
                entry.status = SubscriptionStatus::Pending;
            }
        }
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Counts per status.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let entries = self.entries.read();
        let mut stats = SubscriptionStats::default();

        for entry in entries.values() {
            match entry.status {
                SubscriptionStatus::Pending => stats.pending += 1,
                SubscriptionStatus::Open => stats.open += 1,
                SubscriptionStatus::Closed => stats.closed += 1,
                SubscriptionStatus::Errored => stats.errored += 1,
            }
        }

        stats
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Awaiting first response.
    pub pending: usize,
    /// Streaming.
    pub open: usize,
    /// Completed snapshots.
    pub closed: usize,
    /// Closed by the provider.
    pub errored: usize,
}

impl SubscriptionStats {
    /// Total number of subscriptions.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.open + self.closed + self.errored
    }
}

// =============================================================================
// Tests
// =============================================================================
