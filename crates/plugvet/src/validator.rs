//! The external test battery interface consumed by the worker.
//!
//! The orchestrator does not know what the tests are; it only hands the
//! battery a plugin source, a strictness knob, and a log sink, and sums
//! the failure counts it gets back.

use crate::descriptor::PluginDescriptor;

/// What the worker hands the test battery: a locator string the battery
/// knows how to resolve, or a decoded descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginSource {
    Locator(String),
    Descriptor(PluginDescriptor),
}

impl PluginSource {
    /// Identifier reported in `started`/`result` events for this source.
    pub fn identifier(&self) -> String {
        match self {
            Self::Locator(file_or_id) => file_or_id.clone(),
            Self::Descriptor(descriptor) => descriptor.identifier_string(),
        }
    }
}

/// Outcome of one test case run by the battery.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseResult {
    pub name: String,
    pub failures: u32,
}

impl CaseResult {
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
        }
    }
}

/// Per-plugin test battery.
///
/// Runs synchronously inside the worker's dispatcher; log lines go to the
/// provided sink. Implementations must not panic across this boundary:
/// internal failures are reported as results with nonzero failure counts.
pub trait Validator: Send + Sync + 'static {
    fn validate(
        &self,
        source: PluginSource,
        strictness: i32,
        log: &dyn Fn(&str),
    ) -> Vec<CaseResult>;
}

/// Sum of per-case failure counts for one validation run.
pub fn num_failures(results: &[CaseResult]) -> u32 {
    results.iter().map(|r| r.failures).sum()
}
