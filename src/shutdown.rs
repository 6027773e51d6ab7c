//! Process-wide shutdown signal.
//!
//! Background loops stop when the token is cancelled. A loop that hits an
//! error the process cannot continue past records it with
//! [`Shutdown::fatal`]; `main` turns a recorded reason into a non-zero exit.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
    /// Cancelled as well when this signal records a fatal error.
    escalate: Option<CancellationToken>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that is stopped on its own but reports fatal errors to this
    /// one. Used for tasks that must outlive an orderly stop, such as lease
    /// renewal while jobs drain.
    pub fn linked(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: self.reason.clone(),
            escalate: Some(self.token.clone()),
        }
    }

    /// Request an orderly stop.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Stop because of an unrecoverable error. The first reason wins.
    pub fn fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "Fatal error, shutting down");
        self.reason.lock().get_or_insert(reason);
        self.token.cancel();
        if let Some(parent) = &self.escalate {
            parent.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_not_fatal() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.is_cancelled());
        assert!(shutdown.fatal_reason().is_none());
    }

    #[test]
    fn test_first_fatal_reason_wins() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        clone.fatal("renewal failed");
        shutdown.fatal("later failure");

        assert!(shutdown.is_cancelled());
        assert_eq!(shutdown.fatal_reason().as_deref(), Some("renewal failed"));
    }

    #[test]
    fn test_linked_stops_independently_but_escalates_fatal() {
        let shutdown = Shutdown::new();
        let linked = shutdown.linked();

        shutdown.trigger();
        assert!(!linked.is_cancelled());

        let shutdown = Shutdown::new();
        let linked = shutdown.linked();
        linked.fatal("renewal failed");
        assert!(shutdown.is_cancelled());
        assert_eq!(shutdown.fatal_reason().as_deref(), Some("renewal failed"));
    }
}
