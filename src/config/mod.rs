//! # Configuration
//!
//! TOML configuration for meshscope. Every field has a default, so an empty file
//! (or no file at all) is a valid configuration; command line arguments override
//! what the file says.
//!
//! ## Sections
//!
//! - [`DeviceConfig`] - where the device lives and how often to poll it
//! - [`MessagesConfig`] - direct-message limits and delivery timeout
//! - [`PacketsConfig`] - packet log capacity
//! - [`StorageConfig`] - conversation persistence
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Example
//!
//! ```toml
//! [device]
//! address = "meshtastic.local"
//! tls = false
//! poll_interval_ms = 2000
//! request_timeout_ms = 5000
//!
//! [messages]
//! ack_timeout_secs = 30
//! max_text_bytes = 200
//!
//! [storage]
//! data_dir = "./data"
//! persist_messages = true
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::protocol::encoder::DEFAULT_HOP_LIMIT;
use crate::protocol::packet_store::DEFAULT_CAPACITY;
use crate::protocol::ConversationOptions;
use crate::validation::MAX_TEXT_BYTES;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub packets: PacketsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Host name or IP of the device, optionally with scheme and port.
    pub address: String,
    /// Use https when the address has no explicit scheme.
    pub tls: bool,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Poll again immediately after a non-empty frame instead of waiting.
    pub drain_queue: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "meshtastic.local".to_string(),
            tls: false,
            poll_interval_ms: 2000,
            request_timeout_ms: 5000,
            drain_queue: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    /// Pending direct messages older than this are shown as timed out.
    pub ack_timeout_secs: u64,
    pub max_text_bytes: usize,
    /// Channel index used for outgoing direct messages.
    pub channel: u32,
    pub hop_limit: u32,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            max_text_bytes: MAX_TEXT_BYTES,
            channel: 0,
            hop_limit: DEFAULT_HOP_LIMIT,
        }
    }
}

impl MessagesConfig {
    pub fn conversation_options(&self) -> ConversationOptions {
        ConversationOptions {
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            max_text_bytes: self.max_text_bytes,
            channel: self.channel,
            hop_limit: self.hop_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketsConfig {
    pub capacity: usize,
}

impl Default for PacketsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub persist_messages: bool,
    /// Most saves waiting for the background writer. Deletes are never capped.
    pub writer_queue: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            persist_messages: true,
            writer_queue: 256,
        }
    }
}

impl StorageConfig {
    pub fn conversations_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("conversations")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.poll_interval_ms == 0 {
            return Err(anyhow!("device.poll_interval_ms must be greater than 0"));
        }
        if self.device.request_timeout_ms == 0 {
            return Err(anyhow!("device.request_timeout_ms must be greater than 0"));
        }
        if self.packets.capacity == 0 {
            return Err(anyhow!("packets.capacity must be greater than 0"));
        }
        if self.messages.max_text_bytes == 0 || self.messages.max_text_bytes > MAX_TEXT_BYTES {
            return Err(anyhow!(
                "messages.max_text_bytes must be between 1 and {}",
                MAX_TEXT_BYTES
            ));
        }
        if self.storage.writer_queue == 0 {
            return Err(anyhow!("storage.writer_queue must be greater than 0"));
        }
        Ok(())
    }
}
