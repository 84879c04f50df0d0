//! Divergence resolution policy
//!
//! Pure decision functions for the three divergence classes a mapping can
//! land in: local side missing, remote side missing, both sides changed.
//! The engine executes whatever these decide.

use chrono::DateTime;

use crate::config::SyncDirection;
use crate::scanner::RemoteFile;

/// Timestamps at or above this are epoch-milliseconds.
const EPOCH_MS_THRESHOLD: f64 = 1e12;

/// What the engine should do for one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    PullRemote,
    UploadLocal,
    DeleteRemote,
    DeleteLocal,
}

/// Compact fingerprint of a remote file: changes iff modified time or size
/// changes.
pub fn remote_fingerprint(modified_time: &str, size: u64) -> String {
    format!("{}:{}", modified_time, size)
}

pub fn fingerprint_of(remote: &RemoteFile) -> String {
    remote_fingerprint(&remote.modified_time, remote.size)
}

/// Parse a remote timestamp into epoch seconds. All-digit values are epoch
/// milliseconds when large enough, epoch seconds otherwise; everything else
/// is tried as ISO-8601. Unparseable values become 0.
pub fn parse_timestamp(value: &str) -> f64 {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let raw: f64 = trimmed.parse().unwrap_or(0.0);
        if raw >= EPOCH_MS_THRESHOLD {
            return raw / 1000.0;
        }
        return raw;
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or(0.0)
}

/// Mapping exists, local file is gone, remote still present.
pub fn resolve_local_missing(
    direction: SyncDirection,
    mapping_remote_hash: &str,
    remote: &RemoteFile,
) -> SyncAction {
    match direction {
        SyncDirection::RemoteWins => SyncAction::PullRemote,
        SyncDirection::LocalWins => SyncAction::DeleteRemote,
        SyncDirection::Bidirectional => {
            if fingerprint_of(remote) != mapping_remote_hash {
                SyncAction::PullRemote
            } else {
                SyncAction::DeleteRemote
            }
        }
    }
}

/// Mapping exists, remote file is gone, local still present.
pub fn resolve_remote_missing(
    direction: SyncDirection,
    mapping_local_hash: &str,
    local_hash: &str,
) -> SyncAction {
    match direction {
        SyncDirection::RemoteWins => SyncAction::DeleteLocal,
        SyncDirection::LocalWins => SyncAction::UploadLocal,
        SyncDirection::Bidirectional => {
            if local_hash != mapping_local_hash {
                SyncAction::UploadLocal
            } else {
                SyncAction::DeleteLocal
            }
        }
    }
}

/// Both sides changed since the last sync. Bidirectional picks the newer
/// side; a timestamp tie goes to the remote.
pub fn resolve_both_changed(
    direction: SyncDirection,
    local_mtime: f64,
    remote_modified_time: &str,
) -> SyncAction {
    match direction {
        SyncDirection::RemoteWins => SyncAction::PullRemote,
        SyncDirection::LocalWins => SyncAction::UploadLocal,
        SyncDirection::Bidirectional => {
            if local_mtime > parse_timestamp(remote_modified_time) {
                SyncAction::UploadLocal
            } else {
                SyncAction::PullRemote
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(modified_time: &str, size: u64) -> RemoteFile {
        RemoteFile {
            token: "tok".to_string(),
            kind: "file".to_string(),
            name: "f.md".to_string(),
            size,
            modified_time: modified_time.to_string(),
            parent_token: "root".to_string(),
            path: "f.md".to_string(),
        }
    }

    #[test]
    fn parse_timestamp_supports_epoch_ms_and_iso() {
        assert_eq!(parse_timestamp("1700000000000"), 1_700_000_000.0);
        assert_eq!(parse_timestamp("2026-02-22T12:00:00+00:00"), 1_771_761_600.0);
        assert_eq!(parse_timestamp("100"), 100.0);
        assert_eq!(parse_timestamp(""), 0.0);
        assert_eq!(parse_timestamp("garbage"), 0.0);
    }

    #[test]
    fn bidirectional_local_missing_deletes_remote_when_remote_unchanged() {
        let item = remote("100", 10);
        let mapping_hash = fingerprint_of(&item);
        assert_eq!(
            resolve_local_missing(SyncDirection::Bidirectional, &mapping_hash, &item),
            SyncAction::DeleteRemote
        );
    }

    #[test]
    fn bidirectional_local_missing_pulls_when_remote_changed() {
        let item = remote("101", 10);
        assert_eq!(
            resolve_local_missing(SyncDirection::Bidirectional, "old:hash", &item),
            SyncAction::PullRemote
        );
    }

    #[test]
    fn remote_wins_local_missing_always_pulls() {
        let item = remote("100", 10);
        let mapping_hash = fingerprint_of(&item);
        assert_eq!(
            resolve_local_missing(SyncDirection::RemoteWins, &mapping_hash, &item),
            SyncAction::PullRemote
        );
    }

    #[test]
    fn local_wins_local_missing_deletes_remote() {
        let item = remote("101", 10);
        assert_eq!(
            resolve_local_missing(SyncDirection::LocalWins, "old", &item),
            SyncAction::DeleteRemote
        );
    }

    #[test]
    fn bidirectional_remote_missing_deletes_local_when_local_unchanged() {
        assert_eq!(
            resolve_remote_missing(SyncDirection::Bidirectional, "same", "same"),
            SyncAction::DeleteLocal
        );
    }

    #[test]
    fn bidirectional_remote_missing_uploads_when_local_changed() {
        assert_eq!(
            resolve_remote_missing(SyncDirection::Bidirectional, "old", "new"),
            SyncAction::UploadLocal
        );
    }

    #[test]
    fn bidirectional_both_changed_prefers_newer_side() {
        assert_eq!(
            resolve_both_changed(SyncDirection::Bidirectional, 200.0, "100"),
            SyncAction::UploadLocal
        );
        assert_eq!(
            resolve_both_changed(SyncDirection::Bidirectional, 100.0, "200"),
            SyncAction::PullRemote
        );
    }

    #[test]
    fn both_changed_tie_goes_to_remote() {
        assert_eq!(
            resolve_both_changed(SyncDirection::Bidirectional, 100.0, "100"),
            SyncAction::PullRemote
        );
    }

    #[test]
    fn fixed_directions_ignore_timestamps() {
        assert_eq!(
            resolve_both_changed(SyncDirection::RemoteWins, 9999.0, "1"),
            SyncAction::PullRemote
        );
        assert_eq!(
            resolve_both_changed(SyncDirection::LocalWins, 1.0, "9999"),
            SyncAction::UploadLocal
        );
    }

    #[test]
    fn fingerprint_changes_with_either_component() {
        let a = remote_fingerprint("100", 5);
        assert_ne!(a, remote_fingerprint("101", 5));
        assert_ne!(a, remote_fingerprint("100", 6));
        assert_eq!(a, "100:5");
    }
}
