//! Wire protocol types for supervisor-worker communication.
//!
//! One duplex pipe, two directions:
//! - **Requests** (supervisor to worker): a `PLUGINS` batch naming the
//!   plugins to validate and the strictness to apply.
//! - **Events** (worker to supervisor): `connected`, `started`, `log`,
//!   `result`, `complete`.
//!
//! Property names on the wire are fixed; both ends are builds of the same
//! executable, but the canonical form is stable enough for third-party
//! tooling to read.

use serde::{Deserialize, Serialize};

use crate::descriptor::PluginDescriptor;

/// Strictness applied when a batch omits `strictnessLevel`.
pub const DEFAULT_STRICTNESS: i32 = 5;

/// Requests sent from the supervisor to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    /// Validate a batch of plugins, in document order.
    #[serde(rename = "PLUGINS")]
    Plugins {
        #[serde(rename = "strictnessLevel", skip_serializing_if = "Option::is_none")]
        strictness_level: Option<i32>,
        plugins: Vec<PluginEntry>,
    },
}

impl WorkerRequest {
    pub fn batch(strictness_level: i32, plugins: Vec<PluginEntry>) -> Self {
        Self::Plugins {
            strictness_level: Some(strictness_level),
            plugins,
        }
    }

    /// Effective strictness for a batch; an absent level means
    /// [`DEFAULT_STRICTNESS`].
    pub fn strictness(&self) -> i32 {
        match self {
            Self::Plugins {
                strictness_level, ..
            } => strictness_level.unwrap_or(DEFAULT_STRICTNESS),
        }
    }

    /// Human-readable rendering for diagnostic logging. Never sent on the
    /// wire.
    pub fn diagnostic(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// One plugin reference inside a batch.
///
/// Carries exactly one of a locator string or a base64-encoded descriptor
/// blob. The worker skips an entry carrying neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    #[serde(rename = "fileOrID", default, skip_serializing_if = "Option::is_none")]
    pub file_or_id: Option<String>,
    #[serde(
        rename = "pluginDescription",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub plugin_description: Option<String>,
}

impl PluginEntry {
    pub fn locator(file_or_id: impl Into<String>) -> Self {
        Self {
            file_or_id: Some(file_or_id.into()),
            plugin_description: None,
        }
    }

    /// Entry carrying the descriptor serialised to base64. Returns `None`
    /// for a descriptor that cannot be serialised; such plugins are
    /// dropped from the batch.
    pub fn descriptor(descriptor: &PluginDescriptor) -> Option<Self> {
        Some(Self {
            file_or_id: None,
            plugin_description: Some(descriptor.to_base64()?),
        })
    }
}

/// Events streamed from the worker back to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Handshake; the first event a worker ever emits, exactly once.
    Connected,

    /// Validation of one plugin is about to begin.
    Started {
        #[serde(rename = "fileOrID")]
        file_or_id: String,
    },

    /// One or more log lines from the battery, joined by newline.
    Log { text: String },

    /// Validation of one plugin finished.
    Result {
        #[serde(rename = "fileOrID")]
        file_or_id: String,
        #[serde(rename = "numFailures")]
        num_failures: u32,
    },

    /// End of the entire batch.
    Complete,
}

impl WorkerEvent {
    /// Human-readable rendering for diagnostic logging. Never sent on the
    /// wire.
    pub fn diagnostic(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
