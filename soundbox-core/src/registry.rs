//! Fleet-wide map of online connections, keyed by serial number.
//!
//! A serial maps to at most one live handler. Inserting under an
//! occupied serial atomically swaps in the new handler and then closes
//! the evicted one, so two sockets claiming the same device can never
//! both be reachable through the registry (last-login-wins).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::handler::ConnectionHandler;
use crate::transfer::TransferCompletion;

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<String, Arc<ConnectionHandler>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly logged-in handler under its serial, closing
    /// any incumbent connection for the same device.
    pub fn insert(&self, serial: &str, handler: Arc<ConnectionHandler>) {
        let evicted = self
            .inner
            .lock()
            .unwrap()
            .insert(serial.to_string(), handler);
        if let Some(old) = evicted {
            info!(serial, peer = %old.peer(), "duplicate login, evicting older connection");
            old.close();
        }
    }

    /// Remove `handler` from the registry, but only if it is still the
    /// registered connection for that serial. A handler evicted by a
    /// duplicate login must not tear down its replacement's entry.
    pub fn remove_if(&self, serial: &str, handler: &Arc<ConnectionHandler>) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get(serial) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                map.remove(serial);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, serial: &str) -> Option<Arc<ConnectionHandler>> {
        self.inner.lock().unwrap().get(serial).cloned()
    }

    pub fn is_online(&self, serial: &str) -> bool {
        self.lookup(serial).is_some_and(|h| !h.is_closed())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// All registered handlers at this instant. Used by the supervisor
    /// sweep; taken outside the lock so closing one cannot deadlock
    /// against teardown re-entering the registry.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandler>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Close every registered connection (server shutdown).
    pub fn close_all(&self) {
        for handler in self.snapshot() {
            handler.close();
        }
    }

    /// Queue a file for delivery to an online device. `None` when the
    /// device is offline or its transfer queue rejected the job.
    pub fn enqueue_transfer(&self, serial: &str, content: &[u8]) -> Option<TransferCompletion> {
        let handler = self.lookup(serial)?;
        if handler.is_closed() {
            return None;
        }
        handler.enqueue_transfer(content)
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("online", &self.count())
            .finish()
    }
}
