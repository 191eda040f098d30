use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// On-disk shape of `settings.json`. Feed order is insertion order and is
/// preserved across rewrites; `api_methods` is carried for compatibility but
/// nothing reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default)]
    pub rd_api_key: String,
    #[serde(default)]
    pub api_methods: JsonMap<String, Value>,
}

/// Counters for one polling cycle, returned by the manual refresh endpoint
/// and logged after each scheduled run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PollSummary {
    pub feeds_checked: usize,
    pub feeds_failed: usize,
    pub entries_seen: usize,
    pub submitted: usize,
    pub skipped_seen: usize,
    pub skipped_cached: usize,
    pub failed: usize,
}

impl PollSummary {
    pub fn total_skipped(&self) -> usize {
        self.skipped_seen + self.skipped_cached
    }
}
