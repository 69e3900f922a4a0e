//! Target allow-list

use portgate_proto::PortConfig;
use std::sync::Arc;

/// Immutable snapshot of the targets a session may dial.
///
/// Matching is exact string equality on the `target` field: no DNS
/// resolution, no case folding, no wildcards.
#[derive(Debug, Clone)]
pub struct AccessController {
    entries: Arc<[PortConfig]>,
}

impl AccessController {
    /// Build from the configured allow-list
    pub fn new(entries: Vec<PortConfig>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Check whether `target` may be dialed
    pub fn is_allowed(&self, target: &str) -> bool {
        is_allowed(&self.entries, target)
    }

    /// Allow-list in configured order, as advertised in handshakes
    pub fn entries(&self) -> &[PortConfig] {
        &self.entries
    }
}

impl Default for AccessController {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Whether any entry's target equals `target` byte for byte
pub fn is_allowed(entries: &[PortConfig], target: &str) -> bool {
    entries.iter().any(|entry| entry.target == target)
}
