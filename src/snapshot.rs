//! Durable snapshot of per-codebase indexing state.
//!
//! The snapshot is a single JSON file mapping each codebase path to exactly
//! one record: `indexing`, `indexed`, or `indexfailed`. Transitions replace
//! the whole record, so readers never observe a half-updated state and a
//! crash between a mutation and a save loses at most one throttle interval
//! of progress.
//!
//! Two on-disk formats are understood:
//!
//! - **v2** (always written): `{ formatVersion: "v2", codebases: { path →
//!   record }, lastUpdated }`.
//! - **v1** (legacy, read-only): flat `indexedCodebases` /
//!   `indexingCodebases` lists, upgraded in memory on load.
//!
//! Persistence is explicit: mutators only flip a dirty flag, and [`SnapshotStore::save`]
//! is a no-op while the store is clean. Load failures degrade to an empty
//! snapshot so a corrupt file can never block startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::{IndexResultStatus, IndexStats};

/// State of one codebase path. Exactly one record exists per path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum CodebaseRecord {
    #[serde(rename = "indexing", rename_all = "camelCase")]
    Indexing {
        /// Completion in `0.0..=100.0`.
        indexing_percentage: f32,
        last_updated: String,
    },
    #[serde(rename = "indexed", rename_all = "camelCase")]
    Indexed {
        indexed_files: u64,
        total_chunks: u64,
        index_status: IndexResultStatus,
        last_updated: String,
    },
    #[serde(rename = "indexfailed", rename_all = "camelCase")]
    IndexFailed {
        error_message: String,
        /// Progress reached before the failure; absent if the job failed
        /// before reporting any progress.
        #[serde(skip_serializing_if = "Option::is_none")]
        last_attempted_percentage: Option<f32>,
        last_updated: String,
    },
}

impl CodebaseRecord {
    pub fn is_indexing(&self) -> bool {
        matches!(self, CodebaseRecord::Indexing { .. })
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, CodebaseRecord::Indexed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CodebaseRecord::IndexFailed { .. })
    }
}

/// v2 wire format.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotV2 {
    format_version: String,
    codebases: BTreeMap<String, CodebaseRecord>,
    last_updated: String,
}

/// v1 wire format (legacy). `indexingCodebases` was a plain path list in
/// the earliest files and a path → percentage map later; both are accepted.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotV1 {
    #[serde(default)]
    indexed_codebases: Vec<String>,
    #[serde(default)]
    indexing_codebases: IndexingV1,
    #[serde(default)]
    last_updated: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IndexingV1 {
    Paths(Vec<String>),
    Percentages(BTreeMap<String, f32>),
}

impl Default for IndexingV1 {
    fn default() -> Self {
        IndexingV1::Paths(Vec::new())
    }
}

/// The in-memory snapshot plus its persistence location.
///
/// All mutators are synchronous over the in-memory map; callers decide when
/// to [`save`](SnapshotStore::save). The orchestrator is the only writer of
/// state transitions.
pub struct SnapshotStore {
    path: PathBuf,
    codebases: BTreeMap<String, CodebaseRecord>,
    last_updated: String,
    dirty: bool,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl SnapshotStore {
    /// Create an empty store that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            codebases: BTreeMap::new(),
            last_updated: now_rfc3339(),
            dirty: false,
        }
    }

    /// Load the snapshot from `path`, upgrading v1 files in memory.
    ///
    /// Fails soft: a missing, unreadable, or unparseable file yields an
    /// empty snapshot with a warning rather than an error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::new(path.clone());

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return store,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read snapshot, starting empty");
                return store;
            }
        };

        match parse_snapshot(&raw) {
            Ok((codebases, last_updated)) => {
                store.codebases = codebases;
                if !last_updated.is_empty() {
                    store.last_updated = last_updated;
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse snapshot, starting empty");
            }
        }

        store
    }

    /// All paths currently recorded as fully indexed, in sorted order.
    pub fn indexed_paths(&self) -> Vec<String> {
        self.codebases
            .iter()
            .filter(|(_, r)| r.is_indexed())
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// All paths with an in-flight job, with their last reported percentage.
    pub fn indexing_paths(&self) -> Vec<(String, f32)> {
        self.codebases
            .iter()
            .filter_map(|(p, r)| match r {
                CodebaseRecord::Indexing {
                    indexing_percentage,
                    ..
                } => Some((p.clone(), *indexing_percentage)),
                _ => None,
            })
            .collect()
    }

    /// The full record for `path`, if any.
    pub fn record(&self, path: &Path) -> Option<CodebaseRecord> {
        self.codebases.get(&key(path)).cloned()
    }

    /// Every known path with its record, in sorted order.
    pub fn all(&self) -> Vec<(String, CodebaseRecord)> {
        self.codebases
            .iter()
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.codebases.is_empty()
    }

    /// Last reported percentage for an in-flight job, if `path` is indexing.
    pub fn indexing_progress(&self, path: &Path) -> Option<f32> {
        match self.codebases.get(&key(path)) {
            Some(CodebaseRecord::Indexing {
                indexing_percentage,
                ..
            }) => Some(*indexing_percentage),
            _ => None,
        }
    }

    /// Replace the record for `path` with `Indexing { percentage }`.
    pub fn set_indexing(&mut self, path: &Path, percentage: f32) {
        self.insert(
            path,
            CodebaseRecord::Indexing {
                indexing_percentage: percentage.clamp(0.0, 100.0),
                last_updated: now_rfc3339(),
            },
        );
    }

    /// Replace the record for `path` with `Indexed` carrying the run stats.
    pub fn set_indexed(&mut self, path: &Path, stats: &IndexStats) {
        self.insert(
            path,
            CodebaseRecord::Indexed {
                indexed_files: stats.indexed_files,
                total_chunks: stats.total_chunks,
                index_status: stats.status,
                last_updated: now_rfc3339(),
            },
        );
    }

    /// Replace the record for `path` with `IndexFailed`.
    pub fn set_failed(
        &mut self,
        path: &Path,
        error_message: impl Into<String>,
        last_attempted_percentage: Option<f32>,
    ) {
        self.insert(
            path,
            CodebaseRecord::IndexFailed {
                error_message: error_message.into(),
                last_attempted_percentage,
                last_updated: now_rfc3339(),
            },
        );
    }

    /// Put back a previously observed record, or drop the entry when there
    /// was none. Rolls back a provisional transition that did not go
    /// through.
    pub fn restore(&mut self, path: &Path, record: Option<CodebaseRecord>) {
        match record {
            Some(record) => self.insert(path, record),
            None => {
                self.remove(path);
            }
        }
    }

    /// Delete the record for `path` entirely. Returns whether it existed.
    pub fn remove(&mut self, path: &Path) -> bool {
        let removed = self.codebases.remove(&key(path)).is_some();
        if removed {
            self.last_updated = now_rfc3339();
            self.dirty = true;
        }
        removed
    }

    fn insert(&mut self, path: &Path, record: CodebaseRecord) {
        self.codebases.insert(key(path), record);
        self.last_updated = now_rfc3339();
        self.dirty = true;
    }

    /// Persist the snapshot in v2 format if anything changed since the last
    /// successful save. Safe to call redundantly; the dirty flag stays set
    /// on failure so the next scheduled save retries.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let v2 = SnapshotV2 {
            format_version: "v2".to_string(),
            codebases: self.codebases.clone(),
            last_updated: self.last_updated.clone(),
        };
        let json = serde_json::to_string_pretty(&v2)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write snapshot to {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }

    /// Whether there are unsaved mutations.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The file this store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Parse either snapshot format into the in-memory map.
fn parse_snapshot(raw: &str) -> Result<(BTreeMap<String, CodebaseRecord>, String)> {
    let value: serde_json::Value = serde_json::from_str(raw)?;

    let is_v2 = value
        .get("formatVersion")
        .and_then(|v| v.as_str())
        .map(|v| v == "v2")
        .unwrap_or(false);

    if is_v2 {
        let v2: SnapshotV2 = serde_json::from_value(value)?;
        return Ok((v2.codebases, v2.last_updated));
    }

    // Legacy v1: flat path lists, upgraded to v2 records with what little
    // the old format recorded (counts unknown, percentage defaults to 0).
    let v1: SnapshotV1 = serde_json::from_value(value)?;
    let mut codebases = BTreeMap::new();

    for path in v1.indexed_codebases {
        codebases.insert(
            path,
            CodebaseRecord::Indexed {
                indexed_files: 0,
                total_chunks: 0,
                index_status: IndexResultStatus::Completed,
                last_updated: v1.last_updated.clone(),
            },
        );
    }

    match v1.indexing_codebases {
        IndexingV1::Paths(paths) => {
            for path in paths {
                codebases.insert(
                    path,
                    CodebaseRecord::Indexing {
                        indexing_percentage: 0.0,
                        last_updated: v1.last_updated.clone(),
                    },
                );
            }
        }
        IndexingV1::Percentages(map) => {
            for (path, percentage) in map {
                codebases.insert(
                    path,
                    CodebaseRecord::Indexing {
                        indexing_percentage: percentage,
                        last_updated: v1.last_updated.clone(),
                    },
                );
            }
        }
    }

    Ok((codebases, v1.last_updated))
}
