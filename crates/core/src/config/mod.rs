use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{KineticError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(?path, "loading configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.runtime.group_separator.is_whitespace() {
            return Err(KineticError::Config(
                "runtime.group_separator must not be whitespace".into(),
            ));
        }
        if !(self.session.tick.is_finite() && self.session.tick > 0.0) {
            return Err(KineticError::Config(format!(
                "session.tick must be positive, got {}",
                self.session.tick
            )));
        }
        if !(self.session.duration.is_finite() && self.session.duration >= 0.0) {
            return Err(KineticError::Config(format!(
                "session.duration must be non-negative, got {}",
                self.session.duration
            )));
        }
        Ok(())
    }
}

/// Settings that shape how bindings are started and stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Joins a group name and a member key into the member id (`name.0`).
    pub group_separator: char,
    /// Dispose resources that were overwritten within one batch before they
    /// were ever started.
    pub dispose_collapsed: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            group_separator: '.',
            dispose_collapsed: true,
        }
    }
}

/// Virtual clock settings for the demo session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick: f64,
    pub duration: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick: 10.0,
            duration: 100.0,
        }
    }
}
