//! One-way reconciliation of the local snapshot against the vector store.
//!
//! Before serving privileged operations (and only for shared remote
//! stores), the snapshot's indexed entries are compared against the
//! collections that actually exist remotely. Entries whose collection is gone are dropped locally; nothing
//! is ever added, and in-flight or failed records are left alone. Every
//! failure path degrades to "change nothing": a reconciliation problem
//! must not block the server.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::engine::VectorStore;
use crate::snapshot::SnapshotStore;

/// Collection name prefixes used for code indexes.
const COLLECTION_PREFIXES: [&str; 2] = ["code_chunks_", "hybrid_code_chunks_"];

/// Whether `address` points at a store shared across writers: any TLS
/// endpoint or a managed cloud hostname. Plain local deployments are
/// skipped; their collections belong to this host alone.
pub fn is_cloud_address(address: &str) -> bool {
    address.contains("https") || address.contains("cloud.zilliz.com")
}

/// Shrink the snapshot's indexed entries to those with a live remote
/// collection. Errors are logged and leave the snapshot untouched.
pub async fn reconcile_with_remote(
    store: &Mutex<SnapshotStore>,
    vector_store: &Arc<dyn VectorStore>,
    address: &str,
) {
    if !is_cloud_address(address) {
        info!(address, "local vector store, skipping snapshot reconciliation");
        return;
    }

    let local_indexed = {
        let store = store.lock().expect("snapshot lock poisoned");
        store.indexed_paths()
    };
    if local_indexed.is_empty() {
        return;
    }

    let collections = match vector_store.list_collections().await {
        Ok(collections) => collections,
        Err(e) => {
            warn!(error = %e, "could not list remote collections, keeping snapshot as-is");
            return;
        }
    };

    // Resolve each code collection back to the codebase path recorded in
    // its metadata. Collections without readable metadata are skipped.
    let mut remote_paths: Vec<String> = Vec::new();
    for name in collections
        .iter()
        .filter(|n| COLLECTION_PREFIXES.iter().any(|p| n.starts_with(p)))
    {
        match vector_store.sample_metadata(name).await {
            Ok(Some(metadata)) => {
                if let Some(path) = codebase_path_from_metadata(&metadata) {
                    remote_paths.push(path);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(collection = %name, error = %e, "could not sample collection metadata");
            }
        }
    }

    let stale: Vec<String> = local_indexed
        .into_iter()
        .filter(|p| !remote_paths.contains(p))
        .collect();
    if stale.is_empty() {
        return;
    }

    let mut store = store.lock().expect("snapshot lock poisoned");
    for path in &stale {
        info!(path, "indexed entry has no remote collection, removing");
        store.remove(Path::new(path));
    }
    if let Err(e) = store.save() {
        warn!(error = %e, "failed to save snapshot after reconciliation");
    }
}

/// Extract the `codebasePath` field from a metadata JSON document.
fn codebase_path_from_metadata(metadata: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(metadata).ok()?;
    value
        .get("codebasePath")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
