//! # soundbox-core
//!
//! Device communication engine for networked sound boxes.
//!
//! This crate contains:
//! - **Frame**: the `[0x7E][cmd][len][payload][0xEF]` envelope and a
//!   resynchronizing `tokio_util` decoder
//! - **Command**: the protocol's command-code and device-class enums
//! - **Auth**: the two-stage keyed-hash login handshake
//! - **Token**: request/reply correlation with forward-only status
//! - **Transfer**: checksummed package slicing for chunked file push
//! - **Handler**: the per-connection task group (receive, dispatch,
//!   send, delivery, watchdogs) and its public command API
//! - **Registry**: the serial-keyed map of online connections
//! - **Server**: the TCP acceptor and the registry supervisor
//! - **External**: boundary traits the administrative layer implements
//! - **Error**: `EngineError` — typed, `thiserror`-based error hierarchy

pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod external;
pub mod frame;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod server;
pub mod token;
pub mod transfer;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use auth::{Authenticator, LoginRequest, derive_token, time_bucket};
pub use command::{Command, DeviceClass};
pub use config::EngineConfig;
pub use error::EngineError;
pub use external::{DeviceDirectory, FileTokenStore, NotificationSink};
pub use frame::{END_BYTE, Frame, FrameDecoder, START_BYTE};
pub use handler::{ConnectionHandler, EngineContext};
pub use registry::ConnectionRegistry;
pub use retry::Retry;
pub use server::{DeviceServer, spawn_supervisor};
pub use token::{PendingRegistry, RequestToken, TokenStatus};
pub use transfer::{PACKAGE_DATA_SIZE, TransferCompletion, TransferJob, TransferStatus};
