//! Server configuration file.

use std::path::Path;

use serde::Deserialize;
use soundbox_core::{EngineConfig, EngineError};

/// Top-level TOML config: the engine knobs plus the provisioned fleet.
///
/// ```toml
/// devices = ["DEV00001", "DEV00002"]
///
/// [engine]
/// port = 10808
/// secret_key = "..."
/// api_key = "..."
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serials allowed to log in. Empty means open enrollment: any
    /// serial presenting a valid token is accepted.
    pub devices: Vec<String>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| EngineError::Config(err.to_string()))
    }
}
