//! Core configuration knobs.

/// Configuration options recognised by the storage core.
///
/// The core reads these values; enforcement that spans components (for
/// example the memory quota across all active generations) belongs to the
/// scheduler that owns them.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Upper bound on total arena bytes across active generations.
    /// `None` leaves the quota to the surrounding scheduler.
    pub mem_quota_bytes: Option<usize>,

    /// Number of stacked upserts for one key after which a background
    /// squash is requested.
    pub upsert_squash_threshold: u8,

    /// Whether iterator output should be offered to the external cache.
    /// The core only carries the flag; caching itself lives outside.
    pub cache_pinning: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mem_quota_bytes: None,
            upsert_squash_threshold: 16,
            cache_pinning: false,
        }
    }
}
