//! In-process implementations of the engine's boundary traits, plus the
//! fleet facade an administrative surface calls to push files.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use soundbox_core::{
    ConnectionRegistry, DeviceDirectory, FileTokenStore, NotificationSink, TransferCompletion,
    TransferStatus,
};
use tokio::sync::oneshot;
use tracing::info;
use uuid::Uuid;

// ── StaticDirectory ──────────────────────────────────────────────

/// Fleet roster from the config file. An empty roster means open
/// enrollment. Offline timestamps are logged only; durable persistence
/// belongs to whatever database sits behind the admin surface.
pub struct StaticDirectory {
    serials: HashSet<String>,
}

impl StaticDirectory {
    pub fn new(serials: impl IntoIterator<Item = String>) -> Self {
        Self {
            serials: serials.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn is_known(&self, serial: &str) -> bool {
        self.serials.is_empty() || self.serials.contains(serial)
    }

    async fn record_offline(&self, serial: &str) {
        info!(serial, "device last seen now");
    }
}

// ── TracingSink ──────────────────────────────────────────────────

/// Notification sink that forwards every fleet event to the log. A push
/// hub toward operator frontends would implement the same trait.
#[derive(Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn device_online(&self, serial: &str) {
        info!(serial, "online");
    }

    async fn device_offline(&self, serial: &str) {
        info!(serial, "offline");
    }

    async fn download_progress(&self, serial: &str, percent: f32) {
        info!(serial, percent, "transfer progress");
    }

    async fn transfer_complete(&self, serial: &str) {
        info!(serial, "transfer complete");
    }

    async fn transfer_failed(&self, serial: &str) {
        info!(serial, "transfer failed");
    }
}

// ── MemoryTokenStore ─────────────────────────────────────────────

/// In-memory token-to-payload store for self-fetch devices. Tokens are
/// random UUIDs and resolve exactly once.
#[derive(Default)]
pub struct MemoryTokenStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileTokenStore for MemoryTokenStore {
    fn put(&self, content: Vec<u8>) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.inner.lock().unwrap().insert(token.clone(), content);
        token
    }

    fn take(&self, token: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().remove(token)
    }
}

// ── Fleet ────────────────────────────────────────────────────────

/// Facade over the registry for content pushes. Picks the transfer
/// transport by device class: Wi-Fi devices get the chunked push path,
/// self-fetch devices get a token they resolve against the file store.
pub struct Fleet {
    registry: Arc<ConnectionRegistry>,
    files: Arc<MemoryTokenStore>,
}

impl Fleet {
    pub fn new(registry: Arc<ConnectionRegistry>, files: Arc<MemoryTokenStore>) -> Self {
        Self { registry, files }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Push a file to an online device. `None` when the device is
    /// offline or its queue rejected the job. For self-fetch devices
    /// the completion resolves as soon as the device acknowledges the
    /// fetch request; the actual download happens out of band.
    pub async fn push_file(&self, serial: &str, content: &[u8]) -> Option<TransferCompletion> {
        let handler = self.registry.lookup(serial)?;
        if handler.is_closed() {
            return None;
        }
        match handler.device_class() {
            Some(class) if class.is_self_fetch() => {
                let token = self.files.put(content.to_vec());
                let accepted = handler.request_self_fetch(token.as_bytes()).await;
                if !accepted {
                    // The device never acked; reclaim the stashed bytes.
                    self.files.take(&token);
                }
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(if accepted {
                    TransferStatus::Success
                } else {
                    TransferStatus::Failed
                });
                Some(rx)
            }
            _ => handler.enqueue_transfer(content),
        }
    }

    /// Resolve a self-fetch token to its bytes; consumed on success.
    /// The HTTP download endpoint calls this.
    pub fn take_file(&self, token: &str) -> Option<Vec<u8>> {
        self.files.take(token)
    }
}
