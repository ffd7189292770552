//! Overall sync state published by the background worker.

/// Coarse sync state for status indicators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No connectivity, or the last pass was cancelled
    Offline,
    Syncing,
    /// Last pass finished; FAILED mutations are reported per entry
    Synced,
    /// Last pass could not run to completion
    Error,
}

impl SyncState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
