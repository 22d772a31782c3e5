//! Configuration
//!
//! Settings are plain serde structs with defaults. A JSON file may override
//! any subset of them; the binary applies CLI overrides on top and calls
//! [`AppConfig::validate`] before starting a session.

mod schema;

pub use schema::*;

use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, Result};

impl AppConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.signaling.host.trim().is_empty() {
            return Err(AppError::Config("signaling host is empty".into()));
        }
        if self.signaling.port == 0 {
            return Err(AppError::Config("signaling port must be non-zero".into()));
        }
        if self.signaling.connect_timeout_ms == 0 {
            return Err(AppError::Config(
                "signaling connect timeout must be non-zero".into(),
            ));
        }
        if self.signaling.max_message_bytes < 64 {
            return Err(AppError::Config(format!(
                "max_message_bytes too small: {}",
                self.signaling.max_message_bytes
            )));
        }
        if self.probe.interval_ms == 0 {
            return Err(AppError::Config("probe interval must be non-zero".into()));
        }
        if self.dispatch.analysis_timeout_ms == 0 {
            return Err(AppError::Config("analysis timeout must be non-zero".into()));
        }
        if self.webrtc.probe_label.is_empty() {
            return Err(AppError::Config("probe data channel label is empty".into()));
        }

        let s = &self.synthetic;
        if s.width == 0 || s.height == 0 || s.fps == 0 {
            return Err(AppError::Config(
                "synthetic width, height and fps must be non-zero".into(),
            ));
        }
        if s.radius * 2 >= s.width.min(s.height) {
            return Err(AppError::Config(format!(
                "synthetic radius {} does not fit a {}x{} frame",
                s.radius, s.width, s.height
            )));
        }
        Ok(())
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    /// `host:port` string for binding or connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl DispatchConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }
}
