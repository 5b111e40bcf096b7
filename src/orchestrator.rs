//! Background indexing orchestration.
//!
//! [`Orchestrator::start`] validates a request, records the transition in
//! the snapshot, and spawns the actual indexing run as a detached task.
//! The spawned task owns the terminal transition: whatever the engine
//! returns, the snapshot ends in `Indexed` or `IndexFailed`, never stuck
//! in `Indexing`. Progress reports are written to the snapshot on every
//! callback but persisted to disk at most once per throttle interval.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Result};
use tracing::{error, info, warn};

use crate::engine::{IndexOptions, IndexResultStatus, IndexingEngine, VectorStore, COLLECTION_LIMIT_MESSAGE};
use crate::snapshot::{CodebaseRecord, SnapshotStore};
use crate::tuning::PROGRESS_PERSIST_THROTTLE;

/// Coordinates snapshot state, preflight checks, and background jobs.
pub struct Orchestrator {
    store: Arc<Mutex<SnapshotStore>>,
    engine: Arc<dyn IndexingEngine>,
    vector_store: Arc<dyn VectorStore>,
}

/// Outcome of a successfully started request, for the caller's reply.
#[derive(Debug)]
pub struct StartedJob {
    pub path: PathBuf,
    /// Set when a previous failed attempt is being retried.
    pub previous_error: Option<String>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Mutex<SnapshotStore>>,
        engine: Arc<dyn IndexingEngine>,
        vector_store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            store,
            engine,
            vector_store,
        }
    }

    pub fn snapshot(&self) -> &Arc<Mutex<SnapshotStore>> {
        &self.store
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.vector_store
    }

    /// Validate and launch a background indexing job for `path`.
    ///
    /// Returns as soon as the job is recorded and spawned. The path is
    /// reserved in the snapshot before the first await, so a concurrent
    /// start for the same path is rejected immediately rather than racing
    /// through the preflight. A rejected preflight rolls the reservation
    /// back, leaving whatever record was there before.
    pub async fn start(
        &self,
        path: &Path,
        options: IndexOptions,
        force: bool,
    ) -> Result<StartedJob> {
        if !path.is_dir() {
            bail!("Path '{}' does not exist or is not a directory", path.display());
        }

        // Single-flight gate: decide and reserve under one lock.
        let (previous, previous_error, clear_existing) = {
            let mut store = self.store.lock().expect("snapshot lock poisoned");
            let previous = store.record(path);

            let mut previous_error = None;
            let mut clear_existing = false;
            match &previous {
                Some(CodebaseRecord::Indexing { .. }) => {
                    bail!(
                        "Codebase '{}' is already being indexed in the background. Please wait for completion.",
                        path.display()
                    );
                }
                Some(CodebaseRecord::Indexed { .. }) if !force => {
                    bail!(
                        "Codebase '{}' is already indexed. Use force=true to re-index.",
                        path.display()
                    );
                }
                Some(CodebaseRecord::Indexed { .. }) => {
                    info!(path = %path.display(), "force re-index requested, clearing existing index");
                    clear_existing = true;
                }
                Some(CodebaseRecord::IndexFailed { error_message, .. }) => {
                    info!(
                        path = %path.display(),
                        previous_error = %error_message,
                        "retrying previously failed indexing"
                    );
                    previous_error = Some(error_message.clone());
                    clear_existing = force;
                }
                None => {}
            }

            store.set_indexing(path, 0.0);
            (previous, previous_error, clear_existing)
        };

        if let Err(e) = self.preflight(path, &previous, clear_existing).await {
            let mut store = self.store.lock().expect("snapshot lock poisoned");
            store.restore(path, previous);
            return Err(e);
        }

        {
            let mut store = self.store.lock().expect("snapshot lock poisoned");
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to persist snapshot at job start");
            }
        }

        let store = Arc::clone(&self.store);
        let engine = Arc::clone(&self.engine);
        let path_owned = path.to_path_buf();
        tokio::spawn(async move {
            run_index_job(store, engine, path_owned, options).await;
        });

        Ok(StartedJob {
            path: path.to_path_buf(),
            previous_error,
        })
    }

    /// Remote checks between the reservation and the spawn. Any error here
    /// means the reservation must be rolled back.
    async fn preflight(
        &self,
        path: &Path,
        previous: &Option<CodebaseRecord>,
        clear_existing: bool,
    ) -> Result<()> {
        if clear_existing {
            self.engine.clear_index(path).await?;
        }

        if previous.is_none() {
            // Snapshot and engine can disagree after a lost snapshot file;
            // flag it but let the run proceed and re-establish the truth.
            if self.engine.has_index(path).await.unwrap_or(false) {
                warn!(
                    path = %path.display(),
                    "engine has an index the snapshot does not know about"
                );
            }
        }

        // Fail fast when the store cannot take a new collection, rather
        // than discovering it deep into the run.
        match self.vector_store.can_create_collection().await {
            Ok(true) => Ok(()),
            Ok(false) => bail!("{}", COLLECTION_LIMIT_MESSAGE),
            Err(e) => Err(e),
        }
    }
}

/// The detached indexing run. Never propagates errors; every exit writes
/// a terminal snapshot record.
async fn run_index_job(
    store: Arc<Mutex<SnapshotStore>>,
    engine: Arc<dyn IndexingEngine>,
    path: PathBuf,
    options: IndexOptions,
) {
    let progress_store = Arc::clone(&store);
    let progress_path = path.clone();
    let last_persist = Mutex::new(Instant::now());

    let progress = Box::new(move |progress: &crate::engine::IndexProgress| {
        let mut store = progress_store.lock().expect("snapshot lock poisoned");
        store.set_indexing(&progress_path, progress.percentage);

        let mut last = last_persist.lock().expect("persist lock poisoned");
        if last.elapsed() >= PROGRESS_PERSIST_THROTTLE {
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to persist indexing progress");
            } else {
                *last = Instant::now();
            }
        }
    });

    let result = engine.index_codebase(&path, &options, progress).await;

    let mut store = store.lock().expect("snapshot lock poisoned");
    match result {
        Ok(stats) => {
            if stats.status == IndexResultStatus::LimitReached {
                warn!(
                    path = %path.display(),
                    chunks = stats.total_chunks,
                    "indexing stopped at the chunk limit, index is partial"
                );
            }
            info!(
                path = %path.display(),
                files = stats.indexed_files,
                chunks = stats.total_chunks,
                "indexing completed"
            );
            store.set_indexed(&path, &stats);
        }
        Err(e) => {
            let last_pct = store.indexing_progress(&path);
            error!(path = %path.display(), error = %e, "indexing failed");
            store.set_failed(&path, e.to_string(), last_pct);
        }
    }
    if let Err(e) = store.save() {
        warn!(error = %e, "failed to persist snapshot at job end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{IndexProgress, IndexStats, ProgressFn, SearchHit};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Scripted engine: completes, fails at a given percentage, blocks
    /// until released so in-flight behavior can be observed, or emits a
    /// burst of progress callbacks and then blocks.
    enum Script {
        Complete(IndexStats),
        FailAt(f32, &'static str),
        BlockUntil(Arc<Notify>),
        ProgressBurst(Vec<f32>, Arc<Notify>),
    }

    struct MockEngine {
        script: Script,
        has_index: bool,
        cleared: Mutex<HashSet<PathBuf>>,
        runs: AtomicUsize,
    }

    impl MockEngine {
        fn completing(files: u64, chunks: u64) -> Self {
            Self::with_script(Script::Complete(IndexStats {
                indexed_files: files,
                total_chunks: chunks,
                status: IndexResultStatus::Completed,
            }))
        }

        fn with_script(script: Script) -> Self {
            Self {
                script,
                has_index: false,
                cleared: Mutex::new(HashSet::new()),
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IndexingEngine for MockEngine {
        async fn index_codebase(
            &self,
            _path: &Path,
            _options: &IndexOptions,
            progress: ProgressFn,
        ) -> Result<IndexStats> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Complete(stats) => {
                    progress(&IndexProgress {
                        phase: "embedding".to_string(),
                        current: stats.indexed_files,
                        total: stats.indexed_files,
                        percentage: 100.0,
                    });
                    Ok(*stats)
                }
                Script::FailAt(pct, message) => {
                    progress(&IndexProgress {
                        phase: "embedding".to_string(),
                        current: 1,
                        total: 2,
                        percentage: *pct,
                    });
                    bail!("{}", message)
                }
                Script::BlockUntil(release) => {
                    progress(&IndexProgress {
                        phase: "scanning".to_string(),
                        current: 0,
                        total: 1,
                        percentage: 5.0,
                    });
                    release.notified().await;
                    Ok(IndexStats {
                        indexed_files: 1,
                        total_chunks: 1,
                        status: IndexResultStatus::Completed,
                    })
                }
                Script::ProgressBurst(percents, release) => {
                    for pct in percents {
                        progress(&IndexProgress {
                            phase: "embedding".to_string(),
                            current: 0,
                            total: 1,
                            percentage: *pct,
                        });
                    }
                    release.notified().await;
                    Ok(IndexStats {
                        indexed_files: 1,
                        total_chunks: 1,
                        status: IndexResultStatus::Completed,
                    })
                }
            }
        }

        async fn semantic_search(
            &self,
            _path: &Path,
            _query: &str,
            _limit: usize,
            _filter: Option<&str>,
        ) -> Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }

        async fn has_index(&self, _path: &Path) -> Result<bool> {
            Ok(self.has_index)
        }

        async fn clear_index(&self, path: &Path) -> Result<()> {
            self.cleared.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }
    }

    struct OkVectorStore {
        can_create: bool,
    }

    #[async_trait]
    impl VectorStore for OkVectorStore {
        async fn list_collections(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn sample_metadata(&self, _collection: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn can_create_collection(&self) -> Result<bool> {
            Ok(self.can_create)
        }
    }

    /// Store whose preflight check yields, widening the window in which a
    /// concurrent start could slip in.
    struct SlowVectorStore;

    #[async_trait]
    impl VectorStore for SlowVectorStore {
        async fn list_collections(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn sample_metadata(&self, _collection: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn can_create_collection(&self) -> Result<bool> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(true)
        }
    }

    struct Fixture {
        tmp: TempDir,
        orchestrator: Orchestrator,
        engine: Arc<MockEngine>,
    }

    fn fixture(engine: MockEngine) -> Fixture {
        fixture_with_store(engine, OkVectorStore { can_create: true })
    }

    fn fixture_with_store(engine: MockEngine, vs: impl VectorStore + 'static) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(SnapshotStore::new(
            tmp.path().join("snapshot.json"),
        )));
        let engine = Arc::new(engine);
        let orchestrator = Orchestrator::new(
            store,
            engine.clone() as Arc<dyn IndexingEngine>,
            Arc::new(vs),
        );
        Fixture {
            tmp,
            orchestrator,
            engine,
        }
    }

    impl Fixture {
        fn codebase(&self) -> PathBuf {
            let path = self.tmp.path().join("codebase");
            std::fs::create_dir_all(&path).unwrap();
            path
        }

        async fn wait_for_terminal(&self, path: &Path) -> CodebaseRecord {
            for _ in 0..100 {
                {
                    let store = self.orchestrator.snapshot().lock().unwrap();
                    if let Some(record) = store.record(path) {
                        if !record.is_indexing() {
                            return record;
                        }
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("job never reached a terminal state");
        }
    }

    #[tokio::test]
    async fn completed_run_records_stats() {
        let f = fixture(MockEngine::completing(120, 900));
        let path = f.codebase();

        f.orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap();

        match f.wait_for_terminal(&path).await {
            CodebaseRecord::Indexed {
                indexed_files,
                total_chunks,
                index_status,
                ..
            } => {
                assert_eq!(indexed_files, 120);
                assert_eq!(total_chunks, 900);
                assert_eq!(index_status, IndexResultStatus::Completed);
            }
            other => panic!("expected Indexed, got {:?}", other),
        }

        // Terminal state was persisted.
        let reloaded = SnapshotStore::load(f.tmp.path().join("snapshot.json"));
        assert_eq!(reloaded.indexed_paths().len(), 1);
    }

    #[tokio::test]
    async fn second_start_while_indexing_is_rejected() {
        let release = Arc::new(Notify::new());
        let f = fixture(MockEngine::with_script(Script::BlockUntil(release.clone())));
        let path = f.codebase();

        f.orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap();

        let err = f
            .orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already being indexed"));

        release.notify_one();
        f.wait_for_terminal(&path).await;
        assert_eq!(f.engine.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_admit_only_one_job() {
        let f = fixture_with_store(MockEngine::completing(1, 1), SlowVectorStore);
        let path = f.codebase();

        // Both starts reach the slow preflight at the same time; the path
        // reservation must let exactly one through.
        let (first, second) = tokio::join!(
            f.orchestrator.start(&path, IndexOptions::default(), false),
            f.orchestrator.start(&path, IndexOptions::default(), false),
        );
        let errors: Vec<String> = [&first, &second]
            .iter()
            .filter_map(|r| r.as_ref().err().map(|e| e.to_string()))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("already being indexed"));

        f.wait_for_terminal(&path).await;
        assert_eq!(f.engine.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_preflight_keeps_the_previous_record() {
        let f = fixture_with_store(
            MockEngine::completing(1, 1),
            OkVectorStore { can_create: false },
        );
        let path = f.codebase();
        {
            let mut store = f.orchestrator.snapshot().lock().unwrap();
            store.set_failed(&path, "boom", Some(10.0));
        }

        let err = f
            .orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), COLLECTION_LIMIT_MESSAGE);

        // The reservation was rolled back to the failed record.
        let record = f
            .orchestrator
            .snapshot()
            .lock()
            .unwrap()
            .record(&path)
            .unwrap();
        assert!(record.is_failed());
    }

    #[tokio::test]
    async fn rapid_progress_is_persisted_at_most_once_per_interval() {
        let release = Arc::new(Notify::new());
        let f = fixture(MockEngine::with_script(Script::ProgressBurst(
            vec![10.0, 25.0, 40.0, 55.0, 70.0, 85.0],
            release.clone(),
        )));
        let path = f.codebase();
        let snapshot_file = f.tmp.path().join("snapshot.json");

        f.orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap();

        // Wait for the whole burst to land in memory.
        for _ in 0..100 {
            let progress = f
                .orchestrator
                .snapshot()
                .lock()
                .unwrap()
                .indexing_progress(&path);
            if progress == Some(85.0) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            f.orchestrator
                .snapshot()
                .lock()
                .unwrap()
                .indexing_progress(&path),
            Some(85.0)
        );

        // All callbacks fell inside one throttle interval, so the file
        // still holds the 0% written when the job was recorded.
        let on_disk = SnapshotStore::load(&snapshot_file);
        assert_eq!(on_disk.indexing_progress(&path), Some(0.0));

        // The terminal transition is flushed regardless of the throttle.
        release.notify_one();
        f.wait_for_terminal(&path).await;
        let on_disk = SnapshotStore::load(&snapshot_file);
        assert!(on_disk.record(&path).unwrap().is_indexed());
    }

    #[tokio::test]
    async fn indexed_requires_force() {
        let f = fixture(MockEngine::completing(1, 1));
        let path = f.codebase();

        f.orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap();
        f.wait_for_terminal(&path).await;

        let err = f
            .orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Use force=true"));

        // With force the old index is cleared and a new run happens.
        f.orchestrator
            .start(&path, IndexOptions::default(), true)
            .await
            .unwrap();
        f.wait_for_terminal(&path).await;
        assert!(f.engine.cleared.lock().unwrap().contains(&path));
        assert_eq!(f.engine.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_records_message_and_progress() {
        let f = fixture(MockEngine::with_script(Script::FailAt(
            42.0,
            "connection reset",
        )));
        let path = f.codebase();

        f.orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap();

        match f.wait_for_terminal(&path).await {
            CodebaseRecord::IndexFailed {
                error_message,
                last_attempted_percentage,
                ..
            } => {
                assert_eq!(error_message, "connection reset");
                assert_eq!(last_attempted_percentage, Some(42.0));
            }
            other => panic!("expected IndexFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn retry_after_failure_reports_previous_error() {
        let f = fixture(MockEngine::with_script(Script::FailAt(10.0, "boom")));
        let path = f.codebase();

        f.orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap();
        f.wait_for_terminal(&path).await;

        let started = f
            .orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap();
        assert_eq!(started.previous_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn collection_limit_blocks_the_start() {
        let f = fixture_with_store(
            MockEngine::completing(1, 1),
            OkVectorStore { can_create: false },
        );
        let path = f.codebase();

        let err = f
            .orchestrator
            .start(&path, IndexOptions::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), COLLECTION_LIMIT_MESSAGE);

        // Nothing was recorded for the path.
        assert!(f
            .orchestrator
            .snapshot()
            .lock()
            .unwrap()
            .record(&path)
            .is_none());
    }

    #[tokio::test]
    async fn missing_path_is_rejected() {
        let f = fixture(MockEngine::completing(1, 1));
        let err = f
            .orchestrator
            .start(Path::new("/no/such/dir"), IndexOptions::default(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
