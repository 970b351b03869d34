//! Boundary traits for the administrative layer.
//!
//! The engine knows nothing about HTTP, databases, or push channels; it
//! talks to them only through these seams. `soundbox-server` ships the
//! concrete implementations.

use async_trait::async_trait;

/// Authoritative knowledge about the device fleet.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Whether a serial number belongs to a provisioned device. A login
    /// from an unknown serial is fatal to the connection.
    async fn is_known(&self, serial: &str) -> bool;

    /// Persist the "last seen online" timestamp when a device
    /// disconnects.
    async fn record_offline(&self, serial: &str);
}

/// Fan-out channel for user-facing events, keyed by serial number.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn device_online(&self, serial: &str);
    async fn device_offline(&self, serial: &str);
    /// Percentage of packages sent for the in-flight transfer.
    async fn download_progress(&self, serial: &str, percent: f32);
    async fn transfer_complete(&self, serial: &str);
    async fn transfer_failed(&self, serial: &str);
}

/// Store mapping short opaque tokens to file payloads for self-fetch
/// devices. The HTTP surface resolves a token to its bytes exactly
/// once; the engine only hands tokens to devices.
pub trait FileTokenStore: Send + Sync {
    /// Stash a payload and mint its token.
    fn put(&self, content: Vec<u8>) -> String;

    /// Resolve and consume a token.
    fn take(&self, token: &str) -> Option<Vec<u8>>;
}
