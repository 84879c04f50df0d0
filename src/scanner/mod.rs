//! Snapshot producers
//!
//! The local scanner walks the managed subtree; the remote indexer walks the
//! Drive tree. Both produce plain snapshots the engine reconciles.

pub mod local_scanner;
pub mod remote_tree;

pub use local_scanner::{LocalFile, LocalScanner, LocalSnapshot};
pub use remote_tree::{RemoteFile, RemoteSnapshot, RemoteTreeIndexer};

/// Normalize a relative path to forward slashes without a leading slash.
pub fn safe_rel_path(value: &str) -> String {
    let normalized = value.replace('\\', "/");
    normalized.trim_start_matches('/').to_string()
}
