//! Per-scope wake signals for live tailing.
//!
//! A wake signal is a one-shot broadcast: every [`WakeHandle`] obtained from
//! a scope resolves the next time that scope is woken, and a fresh handle
//! must be requested afterwards to keep waiting.
//!
//! Each scope owns a `tokio::sync::watch` sender that is never written to.
//! Waking a scope drops its sender, which releases every receiver at once;
//! the next registration creates a new sender.
//!
//! # Example
//!
//! ```rust
//! use statushub_server::broadcast::WakeRegistry;
//! use statushub_server::types::Scope;
//!
//! # tokio_test::block_on(async {
//! let mut registry = WakeRegistry::new();
//! let mut handle = registry.subscribe(&Scope::service("backup"));
//!
//! registry.wake("backup");
//! handle.notified().await;
//! # });
//! ```

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::trace;

use crate::types::Scope;

/// A one-shot signal that resolves when its scope's data changes.
#[derive(Debug)]
pub struct WakeHandle {
    receiver: watch::Receiver<()>,
}

impl WakeHandle {
    /// Waits until the scope this handle was registered on is woken.
    ///
    /// Returns immediately if the wake already happened. Cancel safe.
    pub async fn notified(&mut self) {
        // The sender is only ever dropped, so `changed` resolves with an
        // error exactly when the scope is woken.
        let _ = self.receiver.changed().await;
    }

    /// Returns `true` if the scope has already been woken.
    pub fn is_notified(&self) -> bool {
        self.receiver.has_changed().is_err()
    }
}

/// Registry of live wake signals, one per service plus one global.
///
/// The registry has no locking of its own; the event store keeps it behind
/// its exclusive lock so that a wake is always ordered after the mutation
/// it announces.
#[derive(Debug, Default)]
pub struct WakeRegistry {
    services: HashMap<String, watch::Sender<()>>,
    global: Option<watch::Sender<()>>,
}

impl WakeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter on `scope`.
    pub fn subscribe(&mut self, scope: &Scope) -> WakeHandle {
        let sender = match scope {
            Scope::Global => self.global.get_or_insert_with(new_sender),
            Scope::Service(name) => self
                .services
                .entry(name.clone())
                .or_insert_with(new_sender),
        };
        WakeHandle {
            receiver: sender.subscribe(),
        }
    }

    /// Wakes the listeners of `service` and every global listener.
    ///
    /// Returns the number of handles released.
    pub fn wake(&mut self, service: &str) -> usize {
        let mut released = 0;
        if let Some(sender) = self.services.remove(service) {
            released += sender.receiver_count();
        }
        if let Some(sender) = self.global.take() {
            released += sender.receiver_count();
        }
        trace!(service, released, "Woke scope listeners");
        released
    }

    /// Wakes only the global listeners.
    pub fn wake_global(&mut self) -> usize {
        self.global
            .take()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Number of handles currently waiting on `scope`.
    #[must_use]
    pub fn listener_count(&self, scope: &Scope) -> usize {
        let sender = match scope {
            Scope::Global => self.global.as_ref(),
            Scope::Service(name) => self.services.get(name),
        };
        sender.map_or(0, watch::Sender::receiver_count)
    }

    /// Total number of handles waiting across all scopes.
    #[must_use]
    pub fn total_listeners(&self) -> usize {
        self.services
            .values()
            .chain(self.global.iter())
            .map(watch::Sender::receiver_count)
            .sum()
    }
}

fn new_sender() -> watch::Sender<()> {
    watch::channel(()).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn handle_is_pending_until_woken() {
        let mut registry = WakeRegistry::new();
        let mut handle = registry.subscribe(&Scope::service("a"));
        let mut waiting = task::spawn(handle.notified());

        assert_pending!(waiting.poll());

        registry.wake("a");
        assert!(waiting.is_woken());
        assert_ready!(waiting.poll());
    }

    #[test]
    fn one_wake_releases_every_waiter() {
        let mut registry = WakeRegistry::new();
        let scope = Scope::service("a");
        let handles: Vec<_> = (0..5).map(|_| registry.subscribe(&scope)).collect();
        assert_eq!(registry.listener_count(&scope), 5);

        let released = registry.wake("a");
        assert_eq!(released, 5);
        assert!(handles.iter().all(WakeHandle::is_notified));
    }

    #[test]
    fn service_wake_also_releases_global_waiters() {
        let mut registry = WakeRegistry::new();
        let global = registry.subscribe(&Scope::Global);
        let other = registry.subscribe(&Scope::service("b"));

        registry.wake("a");

        assert!(global.is_notified());
        assert!(!other.is_notified());
    }

    #[test]
    fn fresh_registration_required_after_wake() {
        let mut registry = WakeRegistry::new();
        let scope = Scope::service("a");
        let first = registry.subscribe(&scope);
        registry.wake("a");
        assert!(first.is_notified());

        let second = registry.subscribe(&scope);
        assert!(!second.is_notified());
        assert_eq!(registry.listener_count(&scope), 1);
    }

    #[test]
    fn dropped_handles_are_not_counted() {
        let mut registry = WakeRegistry::new();
        let handle = registry.subscribe(&Scope::Global);
        assert_eq!(registry.total_listeners(), 1);
        drop(handle);
        assert_eq!(registry.total_listeners(), 0);
    }

    #[test]
    fn global_wake_leaves_services_waiting() {
        let mut registry = WakeRegistry::new();
        let global = registry.subscribe(&Scope::Global);
        let service = registry.subscribe(&Scope::service("a"));

        assert_eq!(registry.wake_global(), 1);
        assert!(global.is_notified());
        assert!(!service.is_notified());
    }

    #[test]
    fn waking_unknown_scope_releases_nothing() {
        let mut registry = WakeRegistry::new();
        assert_eq!(registry.wake("nobody"), 0);
    }
}
