//! Per-repository application state file.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::instance::InstanceRecord;

/// File name of the state file inside a repository's data directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Everything persisted between runs for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateFile {
    /// Bitmask of help screens the operator has dismissed.
    pub help_screens_seen: u32,
    /// Saved instances, in display order.
    pub instances: Vec<InstanceRecord>,
}

impl StateFile {
    /// Parses a state file from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the state file as indented JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
