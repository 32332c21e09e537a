//! Merged client history view.

use casebook_api::{ClientSnapshot, StartupInfo};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHistoryEntry {
    Snapshot {
        timestamp: DateTime<Utc>,
        snapshot: ClientSnapshot,
    },
    StartupInfo {
        timestamp: DateTime<Utc>,
        startup_info: StartupInfo,
    },
}

impl ClientHistoryEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ClientHistoryEntry::Snapshot { timestamp, .. }
            | ClientHistoryEntry::StartupInfo { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, ClientHistoryEntry::Snapshot { .. })
    }
}

/// Merges both histories newest first, dropping entries without a timestamp.
/// Equal timestamps keep input order, startup records ahead of snapshots.
pub fn merge_history(
    snapshots: &[ClientSnapshot],
    startup_infos: &[StartupInfo],
) -> Vec<ClientHistoryEntry> {
    let startups = startup_infos.iter().filter_map(|info| {
        info.timestamp.map(|timestamp| ClientHistoryEntry::StartupInfo {
            timestamp,
            startup_info: info.clone(),
        })
    });
    let snaps = snapshots.iter().filter_map(|snapshot| {
        snapshot.timestamp.map(|timestamp| ClientHistoryEntry::Snapshot {
            timestamp,
            snapshot: snapshot.clone(),
        })
    });

    let mut entries: Vec<ClientHistoryEntry> = startups.chain(snaps).collect();
    entries.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
    entries
}
