//! End-to-end reconciliation scenarios against the in-memory drive.

mod common;

use common::mock_drive::ROOT_TOKEN;
use common::{sha256_hex, TestEnv};
use feishu_sync_daemon::config::{InitialSyncStrategy, SyncDirection};
use feishu_sync_daemon::persistency::types::{FileMappingUpsert, MappingStatus};
use feishu_sync_daemon::sync::strategies::remote_fingerprint;

const HASH_A: &str = "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb";

#[tokio::test]
async fn first_run_local_wins_uploads_everything() {
    let env = TestEnv::new().await;
    env.write_local("a.txt", b"a");
    std::fs::create_dir_all(env.local_root.join("d")).unwrap();

    let mut engine = env.engine(env.options());
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.uploaded, 1, "fatal: {}", summary.fatal_error);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.local_total, 1);
    assert_eq!(summary.remote_total, 0);
    assert_eq!(summary.remote_root_token, ROOT_TOKEN);

    // Remote now has the folder skeleton and the file.
    assert_eq!(env.drive.find_by_name(ROOT_TOKEN, "d").len(), 1);
    let uploaded = env.drive.find_by_name(ROOT_TOKEN, "a.txt");
    assert_eq!(uploaded.len(), 1);

    // One active mapping with the content hash.
    let mapping = env
        .store
        .file_mappings()
        .get_by_path("a.txt")
        .await
        .unwrap()
        .expect("mapping for a.txt");
    assert_eq!(mapping.local_hash, HASH_A);
    assert_eq!(mapping.remote_token, uploaded[0]);
    assert_eq!(mapping.status, MappingStatus::Active);
}

#[tokio::test]
async fn first_run_remote_wins_downloads_everything() {
    let env = TestEnv::new().await;
    env.drive.add_file(ROOT_TOKEN, "doc.md", b"remote bytes");
    let sub = env.drive.add_folder(ROOT_TOKEN, "sub");
    env.drive.add_file(&sub, "nested.md", b"nested");

    let mut opts = env.options();
    opts.initial_sync_strategy = InitialSyncStrategy::RemoteWins;
    let mut engine = env.engine(opts);
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.downloaded, 2, "fatal: {}", summary.fatal_error);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.errors, 0);
    assert_eq!(env.read_local("doc.md"), b"remote bytes");
    assert_eq!(env.read_local("sub/nested.md"), b"nested");
}

#[tokio::test]
async fn rename_is_detected_and_propagated() {
    let env = TestEnv::new().await;
    let token = env.drive.add_file(ROOT_TOKEN, "old.md", b"same bytes");
    let remote = env.drive.file(&token).unwrap();
    let hash = sha256_hex(b"same bytes");

    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "old.md".to_string(),
            remote_token: token.clone(),
            remote_type: "file".to_string(),
            local_hash: hash.clone(),
            remote_hash: remote_fingerprint(&remote.modified_time, remote.content.len() as u64),
            local_mtime: 1000.0,
            remote_modified_time: remote.modified_time.clone(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();

    // The local side was renamed; content is identical.
    env.write_local("new.md", b"same bytes");

    let mut engine = env.engine(env.options());
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.renamed, 1, "fatal: {}", summary.fatal_error);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.downloaded, 0);

    let mapping = env
        .store
        .file_mappings()
        .get_by_token(&token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.local_rel_path, "new.md");
    assert_eq!(env.drive.file(&token).unwrap().name, "new.md");
    assert_eq!(env.drive.calls_matching("rename:"), 1);

    // A subsequent run with no further changes performs no operation.
    let mut engine = env.engine(env.options());
    let second = engine.run_once("manual").await;
    assert_eq!(second.renamed, 0);
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.errors, 0);
}

#[tokio::test]
async fn rename_onto_a_previously_deleted_path_succeeds() {
    let env = TestEnv::new().await;

    // A mapping for b.md lived and died earlier; its row stays as history.
    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "b.md".to_string(),
            remote_token: "boxcn-dead".to_string(),
            remote_type: "file".to_string(),
            local_hash: sha256_hex(b"old bytes"),
            remote_hash: "t:9".to_string(),
            local_mtime: 500.0,
            remote_modified_time: "t".to_string(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();
    env.store.file_mappings().mark_deleted("b.md").await.unwrap();

    // Live mapping for a.md, whose local file was then renamed to b.md.
    let token = env.drive.add_file(ROOT_TOKEN, "a.md", b"same bytes");
    let remote = env.drive.file(&token).unwrap();
    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "a.md".to_string(),
            remote_token: token.clone(),
            remote_type: "file".to_string(),
            local_hash: sha256_hex(b"same bytes"),
            remote_hash: remote_fingerprint(&remote.modified_time, remote.content.len() as u64),
            local_mtime: 1000.0,
            remote_modified_time: remote.modified_time.clone(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();
    env.write_local("b.md", b"same bytes");

    let mut engine = env.engine(env.options());
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.fatal_error, "", "run must not abort");
    assert_eq!(summary.renamed, 1);
    let mapping = env
        .store
        .file_mappings()
        .get_by_token(&token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.local_rel_path, "b.md");
    assert_eq!(env.drive.file(&token).unwrap().name, "b.md");
}

#[tokio::test]
async fn both_changed_bidirectional_pulls_when_remote_newer() {
    let env = TestEnv::new().await;
    // Remote modified time far in the future of any local mtime.
    let token =
        env.drive
            .add_file_with_mtime(ROOT_TOKEN, "doc.md", b"remote v2", "99999999999");

    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "doc.md".to_string(),
            remote_token: token.clone(),
            remote_type: "file".to_string(),
            local_hash: sha256_hex(b"v0"),
            remote_hash: "old-time:2".to_string(),
            local_mtime: 1000.0,
            remote_modified_time: "old-time".to_string(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();
    env.write_local("doc.md", b"local v1");

    let mut opts = env.options();
    opts.default_sync_direction = SyncDirection::Bidirectional;
    let mut engine = env.engine(opts);
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.downloaded, 1, "fatal: {}", summary.fatal_error);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(env.read_local("doc.md"), b"remote v2");

    let mapping = env
        .store
        .file_mappings()
        .get_by_path("doc.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.local_hash, sha256_hex(b"remote v2"));
    assert_eq!(mapping.remote_hash, remote_fingerprint("99999999999", 9));
}

#[tokio::test]
async fn both_changed_bidirectional_uploads_when_local_newer() {
    let env = TestEnv::new().await;
    // Remote timestamp of 100 seconds; the local mtime is "now".
    let token = env.drive.add_file_with_mtime(ROOT_TOKEN, "doc.md", b"remote v2", "100");

    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "doc.md".to_string(),
            remote_token: token.clone(),
            remote_type: "file".to_string(),
            local_hash: sha256_hex(b"v0"),
            remote_hash: "old-time:2".to_string(),
            local_mtime: 1000.0,
            remote_modified_time: "old-time".to_string(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();
    env.write_local("doc.md", b"local v1");

    let mut opts = env.options();
    opts.default_sync_direction = SyncDirection::Bidirectional;
    let mut engine = env.engine(opts);
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.uploaded, 1, "fatal: {}", summary.fatal_error);
    assert_eq!(summary.downloaded, 0);

    // The replaced remote id was retired into the recycle bin.
    let recycle = env.drive.find_by_name(ROOT_TOKEN, "SyncRecycleBin");
    assert_eq!(recycle.len(), 1);
    assert_eq!(env.drive.file(&token).unwrap().parent, recycle[0]);

    let mapping = env
        .store
        .file_mappings()
        .get_by_path("doc.md")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(mapping.remote_token, token);
    assert_eq!(mapping.local_hash, sha256_hex(b"local v1"));
}

#[tokio::test]
async fn unmapped_same_path_creates_conflict_copy() {
    let env = TestEnv::new().await;
    let token = env.drive.add_file(ROOT_TOKEN, "p", b"remote conflict bytes");
    env.write_local("p", b"local bytes");

    // A non-empty mapping table, so the initial-sync guard stays out of
    // the way. Dry-run strategy keeps the guard inert either way.
    let mut opts = env.options();
    opts.initial_sync_strategy = InitialSyncStrategy::DryRun;
    let mut engine = env.engine(opts);
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.conflicts, 1, "fatal: {}", summary.fatal_error);
    assert_eq!(summary.uploaded, 0);

    // The local file is untouched; the remote landed as a conflict copy.
    assert_eq!(env.read_local("p"), b"local bytes");
    let conflict_copy = std::fs::read_dir(&env.local_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .find(|name| name.starts_with("p.remote_conflict_"))
        .expect("conflict copy present");
    assert_eq!(
        std::fs::read(env.local_root.join(&conflict_copy)).unwrap(),
        b"remote conflict bytes"
    );

    let mapping = env
        .store
        .file_mappings()
        .get_by_path("p")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.status, MappingStatus::Conflict);
    assert!(mapping.conflict);
    assert_eq!(mapping.remote_token, token);
}

#[tokio::test]
async fn pull_then_rerun_is_idempotent() {
    let env = TestEnv::new().await;
    env.drive.add_file(ROOT_TOKEN, "doc.md", b"bytes");

    let mut opts = env.options();
    opts.initial_sync_strategy = InitialSyncStrategy::RemoteWins;
    let mut engine = env.engine(opts);
    let first = engine.run_once("manual").await;
    assert_eq!(first.downloaded, 1);

    let mut engine = env.engine(env.options());
    let second = engine.run_once("manual").await;
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.renamed, 0);
    assert_eq!(second.conflicts, 0);
    assert_eq!(second.errors, 0);
}

#[tokio::test]
async fn empty_local_root_is_not_destructive() {
    let env = TestEnv::new().await;
    env.drive.add_file(ROOT_TOKEN, "keep.md", b"keep me");

    let mut engine = env.engine(env.options());
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.local_total, 0);
    assert_eq!(summary.remote_soft_deleted, 0);
    assert_eq!(summary.remote_hard_deleted, 0);
    assert_eq!(env.drive.file_count(), 1);
}

#[tokio::test]
async fn remote_missing_remote_wins_soft_deletes_local() {
    let env = TestEnv::new().await;
    env.write_local("gone.md", b"precious bytes");

    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "gone.md".to_string(),
            remote_token: "boxcn-vanished".to_string(),
            remote_type: "file".to_string(),
            local_hash: sha256_hex(b"precious bytes"),
            remote_hash: "t:14".to_string(),
            local_mtime: 1000.0,
            remote_modified_time: "t".to_string(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();

    let mut engine = env.engine(env.options());
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.local_soft_deleted, 1, "fatal: {}", summary.fatal_error);
    assert_eq!(summary.errors, 0);
    assert!(!env.local_exists("gone.md"));

    // No silent loss: the bytes moved into the dated trash directory.
    let trash_root = env.local_root.join(".sync_trash");
    let stamp_dir = std::fs::read_dir(&trash_root)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    assert_eq!(
        std::fs::read(stamp_dir.join("gone.md")).unwrap(),
        b"precious bytes"
    );

    // Tombstone precedes the mapping transition to deleted.
    assert!(env
        .store
        .tombstones()
        .exists_for(Some("gone.md"), Some("boxcn-vanished"))
        .await
        .unwrap());
    let mapping = env
        .store
        .file_mappings()
        .get_by_path("gone.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.status, MappingStatus::Deleted);
}

#[tokio::test]
async fn local_missing_local_wins_retires_remote() {
    let env = TestEnv::new().await;
    let token = env.drive.add_file(ROOT_TOKEN, "dropped.md", b"bytes");
    let remote = env.drive.file(&token).unwrap();

    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "dropped.md".to_string(),
            remote_token: token.clone(),
            remote_type: "file".to_string(),
            local_hash: sha256_hex(b"bytes"),
            remote_hash: remote_fingerprint(&remote.modified_time, 5),
            local_mtime: 1000.0,
            remote_modified_time: remote.modified_time.clone(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();

    let mut opts = env.options();
    opts.default_sync_direction = SyncDirection::LocalWins;
    let mut engine = env.engine(opts);
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.remote_soft_deleted, 1, "fatal: {}", summary.fatal_error);

    // Moved into the recycle bin, not hard-deleted.
    let recycle = env.drive.find_by_name(ROOT_TOKEN, "SyncRecycleBin");
    assert_eq!(env.drive.file(&token).unwrap().parent, recycle[0]);

    // The ambiguous "never existed vs was deleted" case is audit-visible.
    let tombstones = env.store.tombstones().list_recent(10).await.unwrap();
    assert!(tombstones
        .iter()
        .any(|t| t.reason == "local_missing_assumed_deleted"));
}

#[tokio::test]
async fn both_missing_closes_the_mapping() {
    let env = TestEnv::new().await;
    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "phantom.md".to_string(),
            remote_token: "boxcn-phantom".to_string(),
            remote_type: "file".to_string(),
            local_hash: "h".to_string(),
            remote_hash: "t:1".to_string(),
            local_mtime: 1000.0,
            remote_modified_time: "2000".to_string(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();

    let mut engine = env.engine(env.options());
    let summary = engine.run_once("manual").await;
    assert_eq!(summary.errors, 0, "fatal: {}", summary.fatal_error);

    let mapping = env
        .store
        .file_mappings()
        .get_by_path("phantom.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.status, MappingStatus::Deleted);

    let tombstones = env.store.tombstones().list_recent(10).await.unwrap();
    assert!(tombstones.iter().any(|t| t.reason == "both_missing"));
}

#[tokio::test]
async fn new_remote_discovery_pulls_and_maps() {
    let env = TestEnv::new().await;
    // Seed one mapped pair so this is not an initial run.
    env.write_local("seed.md", b"seed");
    let seed_token = env.drive.add_file(ROOT_TOKEN, "seed.md", b"seed");
    let seed = env.drive.file(&seed_token).unwrap();
    env.store
        .file_mappings()
        .upsert(&FileMappingUpsert {
            local_rel_path: "seed.md".to_string(),
            remote_token: seed_token.clone(),
            remote_type: "file".to_string(),
            local_hash: sha256_hex(b"seed"),
            remote_hash: remote_fingerprint(&seed.modified_time, 4),
            local_mtime: 1000.0,
            remote_modified_time: seed.modified_time.clone(),
            status: MappingStatus::Active,
            conflict: false,
        })
        .await
        .unwrap();

    let fresh = env.drive.add_file(ROOT_TOKEN, "fresh.md", b"fresh bytes");

    let mut engine = env.engine(env.options());
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.downloaded, 1, "fatal: {}", summary.fatal_error);
    assert_eq!(env.read_local("fresh.md"), b"fresh bytes");
    let mapping = env
        .store
        .file_mappings()
        .get_by_token(&fresh)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.local_rel_path, "fresh.md");
}

#[tokio::test]
async fn gone_remote_during_pull_is_tombstoned_not_retried() {
    let env = TestEnv::new().await;
    let token = env.drive.add_file(ROOT_TOKEN, "ghost.md", b"bytes");
    env.drive.mark_gone(&token);

    let mut opts = env.options();
    opts.initial_sync_strategy = InitialSyncStrategy::RemoteWins;
    let mut engine = env.engine(opts);
    let summary = engine.run_once("manual").await;

    assert_eq!(summary.downloaded, 0);
    assert_eq!(env.store.retry_queue().count().await.unwrap(), 0);
    let tombstones = env.store.tombstones().list_recent(10).await.unwrap();
    assert!(tombstones.iter().any(|t| t.reason == "remote_404"));
}
