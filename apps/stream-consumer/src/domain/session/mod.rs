//! Connection State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► LoggedIn
//!      ▲               │             │
//!      └───────────────┴─────────────┘  (failure / transport loss)
//!
//! Connecting | LoggedIn | Disconnected ──► LoggingOut ──► Closed
//! Disconnected ──► Closed                                (reconnect exhausted)
//! ```
//!
//! `Closed` is terminal.

use std::fmt;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport up or coming up; login outstanding.
    Connecting,
    /// Login accepted.
    LoggedIn,
    /// Close requested; logout in flight.
    LoggingOut,
    /// Terminal.
    Closed,
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection state transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current state.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Check whether `self -> next` is a permitted transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting | Self::LoggingOut | Self::Closed)
                | (Self::Connecting, Self::LoggedIn | Self::Disconnected | Self::LoggingOut)
                | (Self::LoggedIn, Self::Disconnected | Self::LoggingOut)
                | (Self::LoggingOut, Self::Closed)
        )
    }

    /// Validate a transition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the move is not permitted.
    pub const fn transition(self, next: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Check for the terminal state.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::LoggedIn => "logged_in",
            Self::LoggingOut => "logging_out",
            Self::Closed => "closed",
        }
    }

    /// Numeric value for the state gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::LoggedIn => 2.0,
            Self::LoggingOut => 3.0,
            Self::Closed => 4.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use ConnectionState::{Closed, Connecting, Disconnected, LoggedIn, LoggingOut};

    #[test_case(Disconnected, Connecting ; "connect")]
    #[test_case(Connecting, LoggedIn ; "login accepted")]
    #[test_case(Connecting, Disconnected ; "login failed")]
    #[test_case(LoggedIn, Disconnected ; "transport lost")]
    #[test_case(LoggedIn, LoggingOut ; "close while logged in")]
    #[test_case(Connecting, LoggingOut ; "close while connecting")]
    #[test_case(Disconnected, LoggingOut ; "close while disconnected")]
    #[test_case(LoggingOut, Closed ; "logout done")]
    #[test_case(Disconnected, Closed ; "reconnect exhausted")]
    fn permitted(from: ConnectionState, to: ConnectionState) {
        assert_eq!(from.transition(to), Ok(to));
    }

    #[test_case(Disconnected, LoggedIn ; "skip connecting")]
    #[test_case(LoggedIn, Connecting ; "relogin without loss")]
    #[test_case(Closed, Connecting ; "reopen closed")]
    #[test_case(Closed, Disconnected ; "leave terminal")]
    #[test_case(LoggingOut, LoggedIn ; "login during logout")]
    #[test_case(LoggedIn, LoggedIn ; "self loop")]
    fn rejected(from: ConnectionState, to: ConnectionState) {
        assert_eq!(from.transition(to), Err(InvalidTransition { from, to }));
    }

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), Disconnected);
        assert!(Closed.is_closed());
        assert_eq!(LoggedIn.to_string(), "logged_in");
    }
}
