//! Serialised plugin descriptors.
//!
//! A descriptor identifies a plugin the way a host's scanned plugin list
//! does, without needing a filesystem path. On the wire it travels
//! base64-encoded inside a `pluginDescription` property, opaque to the
//! transport; only the worker decodes it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub file_or_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            file_or_identifier: String::new(),
            unique_id: None,
            manufacturer: None,
            version: None,
        }
    }

    /// Stable identifier reported in `started`/`result` events for this
    /// descriptor.
    pub fn identifier_string(&self) -> String {
        match self.unique_id {
            Some(uid) => format!("{}-{}-{:x}", self.format, self.name, uid),
            None => format!("{}-{}", self.format, self.name),
        }
    }

    /// Serialises to the base64 wire form. `None` if the descriptor cannot
    /// be serialised.
    pub fn to_base64(&self) -> Option<String> {
        serde_json::to_vec(self).ok().map(|bytes| STANDARD.encode(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, DescriptorError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid descriptor payload: {0}")]
    Payload(#[from] serde_json::Error),
}
