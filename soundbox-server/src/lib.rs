//! # soundbox-server
//!
//! Deployable fleet server: configuration loading, the in-process
//! implementations of the engine's boundary traits, and the fleet
//! facade an administrative surface talks to.

pub mod config;
pub mod fleet;

pub use config::ServerConfig;
pub use fleet::{Fleet, MemoryTokenStore, StaticDirectory, TracingSink};
