//! Per-repository dev server settings schema.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::instance::DevServerConfig;

/// Directory, relative to a repository root, holding worksquad files.
pub const SETTINGS_DIR: &str = ".worksquad";

/// File name of the dev server settings inside [`SETTINGS_DIR`].
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Project-wide dev server defaults, stored in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevServerSettings {
    /// Optional build command.
    #[serde(default)]
    pub build_command: String,
    /// Dev command.
    #[serde(default)]
    pub dev_command: String,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last save time.
    pub updated_at: DateTime<Utc>,
}

impl Default for DevServerSettings {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            build_command: String::new(),
            dev_command: String::new(),
            env: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl DevServerSettings {
    /// Whether a dev command has been configured.
    pub fn is_configured(&self) -> bool {
        !self.dev_command.trim().is_empty()
    }

    /// The runtime configuration these settings describe.
    pub fn to_config(&self) -> DevServerConfig {
        DevServerConfig {
            build_command: self.build_command.clone(),
            dev_command: self.dev_command.clone(),
            env: self.env.clone(),
        }
    }

    /// Parses settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes settings as indented JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
