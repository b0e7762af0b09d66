//! Compatibility layer configuration.
//!
//! Configuration is read from JSON, e.g.:
//!
//! ```json
//! {
//!   "address_set_name": "claw-mesh-peers",
//!   "private_ip_key": "mesh.clawbernetes.io/private-ip",
//!   "event_buffer": 100,
//!   "cache_sync_timeout_secs": 60,
//!   "strict_list": true
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CompatError, Result};

/// Default name of the kernel address set holding peer private IPs.
pub const DEFAULT_ADDRESS_SET_NAME: &str = "claw-mesh-peers";

/// Default registry metadata key carrying a node's private IP.
pub const DEFAULT_PRIVATE_IP_KEY: &str = "mesh.clawbernetes.io/private-ip";

/// Default capacity of the outbound node event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// Kernel set names are limited to 31 characters.
const MAX_SET_NAME_LEN: usize = 31;

/// Configuration for the compatibility layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompatConfig {
    /// Name of the address set consulted by the exemption rules.
    pub address_set_name: String,
    /// Registry metadata key holding the private IP hint.
    pub private_ip_key: String,
    /// Capacity of the outbound node event channel.
    pub event_buffer: usize,
    /// Upper bound on the initial cache sync. `None` waits for cancellation.
    pub cache_sync_timeout_secs: Option<u64>,
    /// Fail a node listing when a registry node is unknown to the mesh.
    /// When false such nodes are listed with registry data only.
    pub strict_list: bool,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            address_set_name: DEFAULT_ADDRESS_SET_NAME.to_string(),
            private_ip_key: DEFAULT_PRIVATE_IP_KEY.to_string(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            cache_sync_timeout_secs: None,
            strict_list: true,
        }
    }
}

impl CompatConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| CompatError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| CompatError::config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.address_set_name.is_empty() {
            return Err(CompatError::config("address_set_name cannot be empty"));
        }
        if self.address_set_name.len() > MAX_SET_NAME_LEN {
            return Err(CompatError::config(format!(
                "address_set_name cannot exceed {MAX_SET_NAME_LEN} characters"
            )));
        }
        if self.private_ip_key.is_empty() {
            return Err(CompatError::config("private_ip_key cannot be empty"));
        }
        if self.event_buffer == 0 {
            return Err(CompatError::config("event_buffer must be greater than 0"));
        }
        if self.cache_sync_timeout_secs == Some(0) {
            return Err(CompatError::config(
                "cache_sync_timeout_secs must be greater than 0 when set",
            ));
        }
        Ok(())
    }

    /// Returns the initial cache sync timeout, if bounded.
    #[must_use]
    pub fn cache_sync_timeout(&self) -> Option<Duration> {
        self.cache_sync_timeout_secs.map(Duration::from_secs)
    }
}
