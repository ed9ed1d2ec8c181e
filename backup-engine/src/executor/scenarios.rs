//! End-to-end engine tests against local storage in temp directories.

use super::BackupService;
use crate::archive::{ArchiveKind, ArchiveMetadata, BackupOptions, FileRecord};
use crate::clock::{Clock, ManualClock, SystemClock};
use crate::config::EngineSettings;
use crate::fs::metadata::{modified_at, set_modified_at};
use crate::storage::{ArchiveReader, ArchiveStore, ArchiveWriter, LocalStorage};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const HI_SHA256: &str = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";
const YO_SHA256: &str = "e9058ab198f6908f702111b0c0fb5b36f99d00554521886c40e2891b349dc7a1";

struct Fixture {
    _temp_dir: TempDir,
    storage: LocalStorage,
    service: Arc<BackupService>,
    source: PathBuf,
    destination: PathBuf,
    scratch: PathBuf,
}

impl Fixture {
    async fn new() -> Self {
        Self::with(Arc::new(SystemClock), EngineSettings::default()).await
    }

    async fn with(clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::open(temp_dir.path().join("store")).await.unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir(&source).unwrap();

        let service = Arc::new(BackupService::new(Arc::new(storage.clone()), clock, settings));
        Self {
            destination: temp_dir.path().join("dest"),
            scratch: temp_dir.path().join("scratch"),
            _temp_dir: temp_dir,
            storage,
            service,
            source,
        }
    }

    fn write(&self, path: &str, content: &[u8]) {
        let full = self.source.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    fn options(&self) -> BackupOptions {
        BackupOptions::new(ArchiveKind::Full, &self.source, &self.destination).with_retention_days(0)
    }

    fn stored_dir_count(&self) -> usize {
        fs::read_dir(self.storage.base_dir()).unwrap().count()
    }
}

fn paths(metadata: &ArchiveMetadata) -> Vec<&str> {
    metadata.files.iter().map(|f| f.path.as_str()).collect()
}

#[tokio::test]
async fn test_minimal_full_archive_round_trips() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    fx.write("sub/b.txt", b"yo");
    let mtime = Utc.with_ymd_and_hms(2023, 3, 14, 15, 9, 26).unwrap();
    set_modified_at(&fx.source.join("a.txt"), mtime).unwrap();
    set_modified_at(&fx.source.join("sub/b.txt"), mtime + Duration::seconds(1)).unwrap();

    let metadata = fx.service.create(&fx.options()).await.unwrap();
    assert_eq!(paths(&metadata), vec!["a.txt", "sub/b.txt"]);
    assert_eq!(metadata.total_size, 4);
    assert_eq!(metadata.file_count, 2);
    assert_eq!(metadata.retention_days, 0);
    assert_eq!(metadata.kind, ArchiveKind::Full);
    assert_eq!(metadata.files[0].hash.as_deref(), Some(HI_SHA256));
    assert_eq!(metadata.files[1].hash.as_deref(), Some(YO_SHA256));
    assert_eq!(metadata.files[0].modified_at, mtime);
    assert!(metadata.source_root.is_absolute());

    assert_eq!(fx.service.list().await.unwrap(), vec![metadata.clone()]);
    assert_eq!(fx.service.get_metadata(&metadata.id).await.unwrap(), metadata);

    let summary = fx.service.verify(&metadata.id).await.unwrap();
    assert_eq!(summary.files_verified, 2);
    assert_eq!(summary.bytes_verified, 4);

    let restored = fx.scratch.join("restore");
    let summary = fx.service.restore(&metadata.id, &restored).await.unwrap();
    assert_eq!(summary.files_restored, 2);
    assert_eq!(fs::read(restored.join("a.txt")).unwrap(), b"hi");
    assert_eq!(fs::read(restored.join("sub/b.txt")).unwrap(), b"yo");
    assert_eq!(modified_at(&fs::metadata(restored.join("a.txt")).unwrap()).unwrap(), mtime);
    assert_eq!(
        modified_at(&fs::metadata(restored.join("sub/b.txt")).unwrap()).unwrap(),
        mtime + Duration::seconds(1)
    );
}

#[tokio::test]
async fn test_exclusion_skips_matching_files_and_subtrees() {
    let fx = Fixture::new().await;
    fx.write("keep.txt", b"k");
    fx.write("skip.log", b"s");
    fx.write("nested/also.log", b"x");
    fx.write("node_modules/pkg/index.js", b"js");

    let options = fx.options().with_exclude_rules(["*.log", "node_modules"]);
    let metadata = fx.service.create(&options).await.unwrap();

    assert_eq!(paths(&metadata), vec!["keep.txt"]);
    assert_eq!(metadata.file_count, 1);
    assert_eq!(metadata.exclude_rules, vec!["*.log", "node_modules"]);
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_archives() {
    let now = Utc::now();
    let clock = Arc::new(ManualClock::new(now - Duration::days(40)));
    let fx = Fixture::with(clock.clone(), EngineSettings::default()).await;
    fx.write("a.txt", b"hi");
    let options = fx.options().with_retention_days(30);

    let oldest = fx.service.create(&options).await.unwrap();
    clock.set(now - Duration::days(20));
    let middle = fx.service.create(&options).await.unwrap();
    clock.set(now - Duration::days(5));
    let newest = fx.service.create(&options).await.unwrap();

    clock.set(now);
    let report = fx.service.cleanup().await.unwrap();
    assert!(report.is_clean());

    let ids: Vec<_> = fx.service.list().await.unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![middle.id, newest.id]);
    assert!(!ids.contains(&oldest.id));
}

#[tokio::test]
async fn test_zero_retention_is_never_cleaned() {
    let now = Utc::now();
    let clock = Arc::new(ManualClock::new(now - Duration::days(400)));
    let fx = Fixture::with(clock.clone(), EngineSettings::default()).await;
    fx.write("a.txt", b"hi");

    let kept = fx.service.create(&fx.options()).await.unwrap();
    clock.set(now);
    let report = fx.service.cleanup().await.unwrap();

    assert!(report.expired.is_empty());
    assert_eq!(fx.service.list().await.unwrap()[0].id, kept.id);
}

#[tokio::test]
async fn test_default_retention_applies_when_unset() {
    let settings = EngineSettings {
        default_retention_days: 7,
        ..EngineSettings::default()
    };
    let fx = Fixture::with(Arc::new(SystemClock), settings).await;
    fx.write("a.txt", b"hi");

    let options = BackupOptions::new(ArchiveKind::Incremental, &fx.source, &fx.destination);
    let metadata = fx.service.create(&options).await.unwrap();
    assert_eq!(metadata.retention_days, 7);
    assert_eq!(metadata.kind, ArchiveKind::Incremental);
    assert_eq!(metadata.parent_id, None);
}

#[tokio::test]
async fn test_corruption_is_detected_by_verify() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    fx.write("sub/b.txt", b"yo");
    let metadata = fx.service.create(&fx.options()).await.unwrap();

    let stored = fx.storage.base_dir().join(&metadata.id).join("a.txt");
    fs::write(&stored, b"hx").unwrap();

    match fx.service.verify(&metadata.id).await {
        Err(BackupError::Integrity { path, .. }) => assert_eq!(path, "a.txt"),
        other => panic!("expected integrity error, got {:?}", other),
    }
    assert_eq!(fx.service.list().await.unwrap().len(), 1);
    assert_eq!(fx.service.get_metadata(&metadata.id).await.unwrap(), metadata);
}

#[tokio::test]
async fn test_missing_content_is_an_integrity_error() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    fx.write("sub/b.txt", b"yo");
    let metadata = fx.service.create(&fx.options()).await.unwrap();

    fs::remove_file(fx.storage.base_dir().join(&metadata.id).join("sub").join("b.txt")).unwrap();

    match fx.service.verify(&metadata.id).await {
        Err(BackupError::Integrity { path, .. }) => assert_eq!(path, "sub/b.txt"),
        other => panic!("expected integrity error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_abandoned_archive_is_invisible_and_swept() {
    let now = Utc::now();
    let clock = Arc::new(ManualClock::new(now));
    let fx = Fixture::with(clock.clone(), EngineSettings::default()).await;
    fx.write("a.txt", b"hi");

    let draft = ArchiveMetadata::draft(
        "20240101T000000.000000Z-deadbeef".to_string(),
        ArchiveKind::Full,
        fx.source.clone(),
        fx.destination.display().to_string(),
        now,
        Vec::new(),
        0,
    );
    {
        let mut writer = fx.storage.create_writer(&draft).await.unwrap();
        let mut content: &[u8] = b"hi";
        writer
            .add_file(&FileRecord::file("a.txt", 2, now), &mut content)
            .await
            .unwrap();
        // Dropped before commit_metadata
    }

    assert!(fx.service.list().await.unwrap().is_empty());
    assert!(matches!(
        fx.service.get_metadata(&draft.id).await,
        Err(BackupError::NotFound(_))
    ));

    // Still inside the grace window
    let report = fx.service.cleanup().await.unwrap();
    assert!(report.orphans.is_empty());

    clock.set(now + Duration::hours(2));
    let report = fx.service.cleanup().await.unwrap();
    assert_eq!(report.orphans, vec![draft.id.clone()]);
    assert!(!fx.storage.base_dir().join(&draft.id).exists());

    let metadata = fx.service.create(&fx.options()).await.unwrap();
    assert_eq!(fx.service.list().await.unwrap(), vec![metadata]);
}

#[tokio::test]
async fn test_walk_is_deterministic_across_runs() {
    let fx = Fixture::new().await;
    fx.write("z.txt", b"last");
    fx.write("a/b/c.txt", b"deep");
    fx.write("a/a.txt", b"first");
    fx.write("m.txt", b"");

    let first = fx.service.create(&fx.options()).await.unwrap();
    let second = fx.service.create(&fx.options()).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(paths(&first), vec!["a/a.txt", "a/b/c.txt", "m.txt", "z.txt"]);
    let hashes = |m: &ArchiveMetadata| m.files.iter().map(|f| f.hash.clone()).collect::<Vec<_>>();
    assert_eq!(hashes(&first), hashes(&second));
    assert_eq!(paths(&first), paths(&second));
}

#[tokio::test]
async fn test_invalid_options_leave_storage_untouched() {
    let fx = Fixture::new().await;
    let options = BackupOptions::new(ArchiveKind::Full, fx.source.join("missing"), &fx.destination);

    let err = fx.service.create(&options).await.unwrap_err();
    assert!(matches!(err, BackupError::InvalidOption(_)));
    assert_eq!(fx.stored_dir_count(), 0);

    let options = fx.options().with_exclude_rules(["[broken"]);
    let err = fx.service.create(&options).await.unwrap_err();
    assert!(matches!(err, BackupError::InvalidOption(_)));
    assert_eq!(fx.stored_dir_count(), 0);
}

#[tokio::test]
async fn test_delete_is_idempotent_and_hides_archive() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    let metadata = fx.service.create(&fx.options()).await.unwrap();

    fx.service.delete(&metadata.id).await.unwrap();
    fx.service.delete(&metadata.id).await.unwrap();

    assert!(fx.service.list().await.unwrap().is_empty());
    assert!(matches!(
        fx.service.get_metadata(&metadata.id).await,
        Err(BackupError::NotFound(_))
    ));
    assert!(matches!(
        fx.service.restore(&metadata.id, &fx.scratch).await,
        Err(BackupError::NotFound(_))
    ));
    assert!(matches!(fx.service.verify(&metadata.id).await, Err(BackupError::NotFound(_))));
}

#[tokio::test]
async fn test_pre_cancelled_run_creates_nothing() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");

    let token = CancellationToken::new();
    token.cancel();
    let err = fx.service.create_with_cancel(&fx.options(), token).await.unwrap_err();

    assert!(matches!(err, BackupError::Cancelled));
    assert_eq!(fx.stored_dir_count(), 0);
}

/// Storage whose writers hang inside `add_file` until the run is abandoned.
struct StallingStore {
    inner: LocalStorage,
    entered: Arc<Notify>,
}

struct StallingWriter {
    inner: Box<dyn ArchiveWriter>,
    entered: Arc<Notify>,
}

#[async_trait]
impl ArchiveStore for StallingStore {
    async fn create_writer(&self, draft: &ArchiveMetadata) -> Result<Box<dyn ArchiveWriter>> {
        let inner = self.inner.create_writer(draft).await?;
        Ok(Box::new(StallingWriter {
            inner,
            entered: self.entered.clone(),
        }))
    }

    async fn open_reader(&self, id: &str) -> Result<Box<dyn ArchiveReader>> {
        self.inner.open_reader(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> Result<Vec<ArchiveMetadata>> {
        self.inner.list().await
    }
}

#[async_trait]
impl ArchiveWriter for StallingWriter {
    fn archive_id(&self) -> &str {
        self.inner.archive_id()
    }

    async fn add_file(&mut self, _record: &FileRecord, _content: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        self.entered.notify_one();
        std::future::pending::<Result<u64>>().await
    }

    async fn commit_metadata(&mut self, metadata: &ArchiveMetadata) -> Result<()> {
        self.inner.commit_metadata(metadata).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.inner.close().await
    }

    async fn abort(self: Box<Self>) {
        self.inner.abort().await
    }
}

async fn stalling_service(base: &Path, settings: EngineSettings) -> (Arc<BackupService>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let store = StallingStore {
        inner: LocalStorage::open(base).await.unwrap(),
        entered: entered.clone(),
    };
    let service = BackupService::new(Arc::new(store), Arc::new(SystemClock), settings);
    (Arc::new(service), entered)
}

#[tokio::test]
async fn test_cancel_interrupts_file_stream_and_removes_partial() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    let (service, entered) = stalling_service(fx.storage.base_dir(), EngineSettings::default()).await;

    let token = CancellationToken::new();
    let run = {
        let service = service.clone();
        let options = fx.options();
        let token = token.clone();
        tokio::spawn(async move { service.create_with_cancel(&options, token).await })
    };

    entered.notified().await;
    token.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, BackupError::Cancelled));
    assert!(service.list().await.unwrap().is_empty());
    assert_eq!(fx.stored_dir_count(), 0);
}

#[tokio::test]
async fn test_run_deadline_cancels_stuck_archive() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    let settings = EngineSettings {
        run_timeout_secs: 1,
        ..EngineSettings::default()
    };
    let (service, _entered) = stalling_service(fx.storage.base_dir(), settings).await;

    let err = service.create(&fx.options()).await.unwrap_err();
    assert!(matches!(err, BackupError::Cancelled));
    assert_eq!(fx.stored_dir_count(), 0);
}

#[tokio::test]
async fn test_oversized_run_timeout_means_no_deadline() {
    let fx = Fixture::with(
        Arc::new(SystemClock),
        EngineSettings {
            run_timeout_secs: u64::MAX,
            ..EngineSettings::default()
        },
    )
    .await;
    fx.write("a.txt", b"hi");

    let metadata = fx.service.create(&fx.options()).await.unwrap();
    assert_eq!(metadata.file_count, 1);
}

#[tokio::test]
async fn test_restore_stops_at_missing_content() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    fx.write("sub/b.txt", b"yo");
    let metadata = fx.service.create(&fx.options()).await.unwrap();

    fs::remove_file(fx.storage.base_dir().join(&metadata.id).join("sub").join("b.txt")).unwrap();

    match fx.service.restore(&metadata.id, &fx.scratch).await {
        Err(BackupError::Restore { path, .. }) => assert_eq!(path, "sub/b.txt"),
        other => panic!("expected restore error, got {:?}", other),
    }
    // Earlier files stay restored
    assert_eq!(fs::read(fx.scratch.join("a.txt")).unwrap(), b"hi");
    assert!(!fx.scratch.join("sub").join("b.txt").exists());
}

/// Storage that runs a side effect at a chosen point of the write and can
/// refuse deletes.
struct ScriptedStore {
    inner: LocalStorage,
    remove_after_first_file: Option<PathBuf>,
    cancel_after_commit: Option<CancellationToken>,
    fail_delete: bool,
}

struct ScriptedWriter {
    inner: Box<dyn ArchiveWriter>,
    remove_after_first_file: Option<PathBuf>,
    cancel_after_commit: Option<CancellationToken>,
}

impl ScriptedStore {
    fn over(inner: LocalStorage) -> Self {
        Self {
            inner,
            remove_after_first_file: None,
            cancel_after_commit: None,
            fail_delete: false,
        }
    }
}

#[async_trait]
impl ArchiveStore for ScriptedStore {
    async fn create_writer(&self, draft: &ArchiveMetadata) -> Result<Box<dyn ArchiveWriter>> {
        let inner = self.inner.create_writer(draft).await?;
        Ok(Box::new(ScriptedWriter {
            inner,
            remove_after_first_file: self.remove_after_first_file.clone(),
            cancel_after_commit: self.cancel_after_commit.clone(),
        }))
    }

    async fn open_reader(&self, id: &str) -> Result<Box<dyn ArchiveReader>> {
        self.inner.open_reader(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if self.fail_delete {
            return Err(BackupError::Backend(format!("refusing to delete {}", id)));
        }
        self.inner.delete(id).await
    }

    async fn list(&self) -> Result<Vec<ArchiveMetadata>> {
        self.inner.list().await
    }
}

#[async_trait]
impl ArchiveWriter for ScriptedWriter {
    fn archive_id(&self) -> &str {
        self.inner.archive_id()
    }

    async fn add_file(&mut self, record: &FileRecord, content: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        let stored = self.inner.add_file(record, content).await?;
        if let Some(path) = self.remove_after_first_file.take() {
            fs::remove_file(path).unwrap();
        }
        Ok(stored)
    }

    async fn commit_metadata(&mut self, metadata: &ArchiveMetadata) -> Result<()> {
        self.inner.commit_metadata(metadata).await?;
        if let Some(token) = &self.cancel_after_commit {
            token.cancel();
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.inner.close().await
    }

    async fn abort(self: Box<Self>) {
        self.inner.abort().await
    }
}

#[tokio::test]
async fn test_source_file_vanishing_mid_run_is_a_read_error() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");
    fx.write("sub/b.txt", b"yo");

    let store = ScriptedStore {
        remove_after_first_file: Some(fx.source.join("sub").join("b.txt")),
        ..ScriptedStore::over(fx.storage.clone())
    };
    let service = BackupService::new(Arc::new(store), Arc::new(SystemClock), EngineSettings::default());

    match service.create(&fx.options()).await {
        Err(BackupError::Read { path, .. }) => assert!(path.ends_with("sub/b.txt")),
        other => panic!("expected read error, got {:?}", other),
    }
    assert!(service.list().await.unwrap().is_empty());
    assert_eq!(fx.stored_dir_count(), 0);
}

#[tokio::test]
async fn test_cancel_after_commit_never_publishes() {
    let fx = Fixture::new().await;
    fx.write("a.txt", b"hi");

    let token = CancellationToken::new();
    let store = ScriptedStore {
        cancel_after_commit: Some(token.clone()),
        fail_delete: true,
        ..ScriptedStore::over(fx.storage.clone())
    };
    let service = BackupService::new(Arc::new(store), Arc::new(SystemClock), EngineSettings::default());

    let err = service.create_with_cancel(&fx.options(), token).await.unwrap_err();
    assert!(matches!(err, BackupError::Cancelled));

    // The partial directory survives the refused delete but stays unpublished
    assert!(service.list().await.unwrap().is_empty());
    assert_eq!(fx.stored_dir_count(), 1);
    let leftover = fs::read_dir(fx.storage.base_dir()).unwrap().next().unwrap().unwrap().path();
    assert!(!leftover.join("metadata.json").exists());
}
