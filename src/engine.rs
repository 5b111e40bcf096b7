//! External collaborator interfaces.
//!
//! The actual chunking/parsing engine and the vector store are supplied by
//! the embedding binary through these traits:
//!
//! - **[`IndexingEngine`]**: walks a source tree, chunks it, embeds it, and
//!   writes it into the vector store; also answers semantic queries.
//! - **[`VectorStore`]**: the management surface of the remote store that
//!   the orchestration layer needs directly: collection listing, a metadata
//!   probe, and the pre-flight capacity check.
//!
//! Both are consumed as `Arc<dyn …>` trait objects so custom binaries can
//! inject their own implementations (see [`crate::server::EngineFactory`]).

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Terminal message returned when the vector-store account cannot hold
/// another collection. Callers compare against this exact string to decide
/// whether a failure is retryable, so it must stay stable.
pub const COLLECTION_LIMIT_MESSAGE: &str = "The vector store account has reached its collection limit. \
Clear an existing index with clear_index or expand the account's capacity before indexing another codebase.";

/// How an indexing run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexResultStatus {
    /// Every eligible file was indexed.
    Completed,
    /// The engine stopped early because the chunk limit was reached;
    /// the index is usable but incomplete.
    LimitReached,
}

/// Final statistics reported by the engine for one indexing run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStats {
    pub indexed_files: u64,
    pub total_chunks: u64,
    pub status: IndexResultStatus,
}

/// A progress report emitted by the engine while indexing.
#[derive(Debug, Clone)]
pub struct IndexProgress {
    /// Engine-defined phase label (e.g. `"scanning"`, `"embedding"`).
    pub phase: String,
    pub current: u64,
    pub total: u64,
    /// Overall completion in `0.0..=100.0`.
    pub percentage: f32,
}

/// Progress callback handed to [`IndexingEngine::index_codebase`].
/// Called from the engine's task; implementations must be cheap.
pub type ProgressFn = Box<dyn Fn(&IndexProgress) + Send + Sync>;

/// Which chunking strategy the engine should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Splitter {
    /// Syntax-aware splitting with automatic fallback.
    Ast,
    /// Character-based splitting.
    Langchain,
}

impl FromStr for Splitter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ast" => Ok(Splitter::Ast),
            "langchain" => Ok(Splitter::Langchain),
            other => anyhow::bail!(
                "Invalid splitter type '{}'. Must be 'ast' or 'langchain'.",
                other
            ),
        }
    }
}

impl Splitter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Splitter::Ast => "ast",
            Splitter::Langchain => "langchain",
        }
    }
}

/// Per-run options forwarded to the engine.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub splitter: Splitter,
    /// Extra file extensions to index beyond the engine's defaults
    /// (dot-prefixed, e.g. `".vue"`).
    pub extra_extensions: Vec<String>,
    /// Extra ignore globs beyond the engine's defaults.
    pub extra_ignore_patterns: Vec<String>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            splitter: Splitter::Ast,
            extra_extensions: Vec::new(),
            extra_ignore_patterns: Vec::new(),
        }
    }
}

/// One ranked snippet returned by a semantic search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Path relative to the searched codebase root.
    pub relative_path: String,
    pub start_line: u32,
    pub end_line: u32,
    /// Language label for fenced rendering (e.g. `"rust"`).
    pub language: String,
    pub content: String,
    pub score: f32,
}

/// The indexing engine: chunking, embedding, storage, and query.
///
/// Implementations own their concurrency limits; the orchestrator only
/// guarantees at most one in-flight `index_codebase` per path.
#[async_trait]
pub trait IndexingEngine: Send + Sync {
    /// Index the source tree at `path`, reporting progress through
    /// `progress`. Long-running; runs inside a background task.
    async fn index_codebase(
        &self,
        path: &Path,
        options: &IndexOptions,
        progress: ProgressFn,
    ) -> Result<IndexStats>;

    /// Ranked semantic search over an indexed (or currently indexing) path.
    /// `filter` is an engine-level filter expression such as
    /// `fileExtension in ['.rs']`.
    async fn semantic_search(
        &self,
        path: &Path,
        query: &str,
        limit: usize,
        filter: Option<&str>,
    ) -> Result<Vec<SearchHit>>;

    /// Whether the remote store currently holds an index for `path`.
    async fn has_index(&self, path: &Path) -> Result<bool>;

    /// Drop all stored vectors for `path`. Must complete before a
    /// re-index starts so old and new chunks never mix.
    async fn clear_index(&self, path: &Path) -> Result<()>;
}

/// Management surface of the remote vector store.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Names of all collections in the account, across all writers.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Fetch one representative record's metadata JSON from a collection,
    /// or `None` if the collection is empty.
    async fn sample_metadata(&self, collection: &str) -> Result<Option<String>>;

    /// Pre-flight capacity check: can another collection still be created
    /// under the account's quota?
    async fn can_create_collection(&self) -> Result<bool>;
}

/// Placeholder engine used when no real engine is linked into the binary.
///
/// Mirrors the disabled-provider pattern: every operation returns a clear
/// error instead of panicking, so the server surface stays reachable.
pub struct DisabledEngine;

#[async_trait]
impl IndexingEngine for DisabledEngine {
    async fn index_codebase(
        &self,
        _path: &Path,
        _options: &IndexOptions,
        _progress: ProgressFn,
    ) -> Result<IndexStats> {
        anyhow::bail!("No indexing engine is linked into this binary")
    }

    async fn semantic_search(
        &self,
        _path: &Path,
        _query: &str,
        _limit: usize,
        _filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        anyhow::bail!("No indexing engine is linked into this binary")
    }

    async fn has_index(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    async fn clear_index(&self, _path: &Path) -> Result<()> {
        anyhow::bail!("No indexing engine is linked into this binary")
    }
}

/// Vector-store counterpart of [`DisabledEngine`].
pub struct DisabledVectorStore;

#[async_trait]
impl VectorStore for DisabledVectorStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        anyhow::bail!("No vector store is linked into this binary")
    }

    async fn sample_metadata(&self, _collection: &str) -> Result<Option<String>> {
        anyhow::bail!("No vector store is linked into this binary")
    }

    async fn can_create_collection(&self) -> Result<bool> {
        anyhow::bail!("No vector store is linked into this binary")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_parses_known_names() {
        assert_eq!("ast".parse::<Splitter>().unwrap(), Splitter::Ast);
        assert_eq!("langchain".parse::<Splitter>().unwrap(), Splitter::Langchain);
    }

    #[test]
    fn splitter_rejects_unknown_names() {
        let err = "treesitter".parse::<Splitter>().unwrap_err();
        assert!(err.to_string().contains("Invalid splitter type"));
    }

    #[test]
    fn index_result_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&IndexResultStatus::LimitReached).unwrap(),
            "\"limit_reached\""
        );
        assert_eq!(
            serde_json::to_string(&IndexResultStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
