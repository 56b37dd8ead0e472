//! Connection lifecycle state machine.
//!
//! Each comms instance tracks two independent [`StatusFlag`]s, one for the
//! receive side and one for the transmit side.
//!
//! ```text
//!            ┌──────────┐  loop ready   ┌───────────┐
//!   new ───→ │ Startup  │ ────────────→ │ Connected │
//!            └──────────┘               └───────────┘
//!              ▲    │                        │
//!        retry │    │ any failure            │ any failure
//!              │    ▼                        ▼
//!            ┌──────────┐              ┌────────────┐
//!            │  Error   │ ───────────→ │ Terminated │ (sticky)
//!            └──────────┘  disconnect  └────────────┘
//! ```
//!
//! `Terminated` is reachable from every state and never left. A fresh
//! instance is needed to connect again.

use std::fmt;
use std::sync::atomic::{AtomicI8, Ordering};

/// The lifecycle state of one side of a comms instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ConnectionStatus {
    /// Some error occurred on the connection.
    Error = -1,
    /// The loop is starting up.
    Startup = 0,
    /// The loop is running and the connection is usable.
    Connected = 1,
    /// The loop was shut down.
    Terminated = 2,
}

impl ConnectionStatus {
    fn from_raw(raw: i8) -> Self {
        match raw {
            -1 => Self::Error,
            0 => Self::Startup,
            1 => Self::Connected,
            _ => Self::Terminated,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_startup(self) -> bool {
        matches!(self, Self::Startup)
    }

    /// Returns `true` once the loop has stopped, cleanly or not.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Error | Self::Terminated)
    }

    /// Returns `true` if moving from `self` to `target` is allowed.
    pub fn can_transition_to(self, target: Self) -> bool {
        match (self, target) {
            (Self::Terminated, _) => false,
            (_, Self::Error) | (_, Self::Terminated) => true,
            (Self::Startup, Self::Connected) => true,
            (Self::Error, Self::Startup) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Startup => write!(f, "startup"),
            Self::Connected => write!(f, "connected"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// An atomically updated [`ConnectionStatus`].
///
/// Only the owning loop writes its flag during normal operation; the
/// driver writes it when `connect` fails or `disconnect` completes.
/// Transitions are checked with [`ConnectionStatus::can_transition_to`].
#[derive(Debug)]
pub struct StatusFlag(AtomicI8);

impl StatusFlag {
    pub fn new() -> Self {
        Self(AtomicI8::new(ConnectionStatus::Startup as i8))
    }

    pub fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Moves to `target` if the transition is allowed. Returns whether
    /// the status changed.
    pub fn transition(&self, target: ConnectionStatus) -> bool {
        self.update(|current| current.can_transition_to(target).then_some(target))
    }

    /// Normal loop exit: `Startup`/`Connected` become `Terminated`, an
    /// `Error` is left in place so it stays observable.
    pub fn close(&self) -> bool {
        self.update(|current| match current {
            ConnectionStatus::Startup | ConnectionStatus::Connected => {
                Some(ConnectionStatus::Terminated)
            }
            _ => None,
        })
    }

    fn update(
        &self,
        next: impl Fn(ConnectionStatus) -> Option<ConnectionStatus>,
    ) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                next(ConnectionStatus::from_raw(raw)).map(|s| s as i8)
            })
            .is_ok()
    }
}

impl Default for StatusFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn test_new_flag_starts_in_startup() {
        let flag = StatusFlag::new();
        assert_eq!(flag.get(), Startup);
        assert!(!flag.get().is_connected());
    }

    #[test]
    fn test_normal_lifecycle() {
        let flag = StatusFlag::new();
        assert!(flag.transition(Connected));
        assert!(flag.get().is_connected());
        assert!(flag.close());
        assert_eq!(flag.get(), Terminated);
    }

    #[test]
    fn test_error_reachable_from_any_live_state() {
        for start in [Startup, Connected, Error] {
            assert!(start.can_transition_to(Error), "{start} -> error");
        }
        assert!(!Terminated.can_transition_to(Error));
    }

    #[test]
    fn test_terminated_is_sticky() {
        let flag = StatusFlag::new();
        assert!(flag.transition(Terminated));
        for target in [Error, Startup, Connected, Terminated] {
            assert!(!flag.transition(target));
        }
        assert_eq!(flag.get(), Terminated);
    }

    #[test]
    fn test_error_does_not_become_connected() {
        let flag = StatusFlag::new();
        assert!(flag.transition(Error));
        assert!(!flag.transition(Connected));
        assert_eq!(flag.get(), Error);
    }

    #[test]
    fn test_retry_resets_error_to_startup() {
        let flag = StatusFlag::new();
        flag.transition(Error);
        assert!(flag.transition(Startup));
        assert!(flag.transition(Connected));
    }

    #[test]
    fn test_close_keeps_error() {
        let flag = StatusFlag::new();
        flag.transition(Error);
        assert!(!flag.close());
        assert_eq!(flag.get(), Error);
    }

    #[test]
    fn test_connected_cannot_go_back_to_startup() {
        assert!(!Connected.can_transition_to(Startup));
        assert!(!Connected.can_transition_to(Connected));
    }

    #[test]
    fn test_display() {
        assert_eq!(Connected.to_string(), "connected");
        assert_eq!(Error.to_string(), "error");
    }
}
