//! MCP tool handlers.
//!
//! Every handler consumes a JSON argument object and produces a
//! [`ToolResult`]: a plain-text body plus an error flag. Handlers never
//! return `Err`; failures become flagged results so the transport layer
//! stays free of tool-specific error mapping.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::{available_branches, available_components, available_projects, ConnectionParams, McpConfig};
use crate::engine::{IndexOptions, IndexResultStatus, IndexingEngine, Splitter, COLLECTION_LIMIT_MESSAGE};
use crate::orchestrator::Orchestrator;
use crate::reconcile::reconcile_with_remote;
use crate::snapshot::{CodebaseRecord, SnapshotStore};

const DEFAULT_SEARCH_LIMIT: usize = 10;
const MAX_SEARCH_LIMIT: usize = 50;
const MAX_SNIPPET_CHARS: usize = 5000;

/// One content block of a tool reply. Only text is produced.
#[derive(Debug, Clone, Serialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

/// Structured tool reply: a text body plus an error flag.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: text.into(),
            }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: text.into(),
            }],
            is_error: true,
        }
    }

    pub fn body(&self) -> &str {
        self.content.first().map(|c| c.text.as_str()).unwrap_or("")
    }
}

/// Everything one request needs: resolved connection parameters and the
/// collaborators built from them.
pub struct AppContext {
    pub config: Arc<McpConfig>,
    pub params: ConnectionParams,
    pub orchestrator: Orchestrator,
    pub engine: Arc<dyn IndexingEngine>,
}

pub struct ToolHandlers {
    ctx: Arc<AppContext>,
}

// ============ Arguments ============

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IndexArgs {
    force: bool,
    splitter: Option<String>,
    custom_extensions: Vec<String>,
    ignore_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    extension_filter: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IndexProjectArgs {
    force: bool,
    splitter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListBranchesArgs {
    project: Option<String>,
}

impl ToolHandlers {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Dispatch by tool name. Unknown names are a flagged result, not a
    /// transport error, so the caller sees a readable message.
    pub async fn call(&self, name: &str, args: Value) -> ToolResult {
        match name {
            "index_codebase" => self.index_codebase(args).await,
            "search_code" => self.search_code(args).await,
            "clear_index" => self.clear_index(args).await,
            "get_indexing_status" => self.get_indexing_status(args).await,
            "index_project" => self.index_project(args).await,
            "list_projects" => self.list_projects(args).await,
            "list_branches" => self.list_branches(args).await,
            "list_components" => self.list_components(args).await,
            other => ToolResult::error(format!("Unknown tool: {}", other)),
        }
    }

    /// Shrink the snapshot to what exists remotely before a privileged
    /// operation, so another writer's deletions are noticed even on a
    /// long-lived connection. A no-op for local stores and on errors.
    async fn reconcile(&self) {
        if let Some(address) = self.ctx.params.store_address.as_deref() {
            reconcile_with_remote(
                self.snapshot(),
                self.ctx.orchestrator.vector_store(),
                address,
            )
            .await;
        }
    }

    /// The codebase path the current connection targets.
    fn target_path(&self) -> Result<PathBuf, ToolResult> {
        let project = self.ctx.params.default_project.as_deref().ok_or_else(|| {
            ToolResult::error(
                "No project configured. Set DEFAULT_PROJECT or the x-default-project header.",
            )
        })?;
        Ok(self
            .ctx
            .config
            .project_path(project, &self.ctx.params.default_branch))
    }

    async fn index_codebase(&self, args: Value) -> ToolResult {
        let args: IndexArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("Invalid arguments: {}", e)),
        };
        self.reconcile().await;

        let path = match self.target_path() {
            Ok(path) => path,
            Err(result) => return result,
        };

        let options = match build_index_options(
            args.splitter.as_deref(),
            &args.custom_extensions,
            &args.ignore_patterns,
        ) {
            Ok(options) => options,
            Err(message) => return ToolResult::error(message),
        };

        self.start_indexing(&path, options, args.force).await
    }

    /// Shared start path for single-codebase and per-component indexing.
    async fn start_indexing(&self, path: &Path, options: IndexOptions, force: bool) -> ToolResult {
        match self.ctx.orchestrator.start(path, options, force).await {
            Ok(started) => {
                let mut body = format!(
                    "Started background indexing for '{}'. Use get_indexing_status to track progress.",
                    started.path.display()
                );
                if let Some(previous) = started.previous_error {
                    body.push_str(&format!(
                        "\nNote: retrying after a previous failure: {}",
                        previous
                    ));
                }
                ToolResult::text(body)
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn search_code(&self, args: Value) -> ToolResult {
        let args: SearchArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("Invalid arguments: {}", e)),
        };
        if args.query.trim().is_empty() {
            return ToolResult::error("Query must not be empty.");
        }

        if let Err(invalid) = validate_extensions(&args.extension_filter) {
            return ToolResult::error(format!(
                "Invalid extensionFilter values: [{}]. Extensions must be dot-prefixed, like '.rs' or '.ts'.",
                invalid.join(", ")
            ));
        }
        self.reconcile().await;

        let path = match self.target_path() {
            Ok(path) => path,
            Err(result) => return result,
        };

        let record = {
            let store = self.snapshot().lock().expect("snapshot lock poisoned");
            store.record(&path)
        };
        let indexing_note = match record {
            Some(CodebaseRecord::Indexed { .. }) => None,
            Some(CodebaseRecord::Indexing {
                indexing_percentage,
                ..
            }) => Some(format!(
                "Note: indexing is still in progress ({:.0}%), results may be incomplete.\n\n",
                indexing_percentage
            )),
            _ => {
                return ToolResult::error(format!(
                    "Codebase '{}' is not indexed. Please index it first using the index_codebase tool.",
                    path.display()
                ));
            }
        };

        let limit = args
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        let filter = build_extension_filter(&args.extension_filter);

        let hits = match self
            .ctx
            .engine
            .semantic_search(&path, &args.query, limit, filter.as_deref())
            .await
        {
            Ok(hits) => hits,
            Err(e) if e.to_string() == COLLECTION_LIMIT_MESSAGE => {
                return flag_failure(e.to_string())
            }
            Err(e) => return ToolResult::error(format!("Search failed: {}", e)),
        };

        if hits.is_empty() {
            return ToolResult::text(format!(
                "{}No results found for '{}' in '{}'.",
                indexing_note.unwrap_or_default(),
                args.query,
                path.display()
            ));
        }

        let mut body = format!(
            "{}Found {} result{} for '{}' in '{}':\n",
            indexing_note.unwrap_or_default(),
            hits.len(),
            if hits.len() == 1 { "" } else { "s" },
            args.query,
            path.display()
        );
        for (i, hit) in hits.iter().enumerate() {
            let mut content = hit.content.clone();
            if content.len() > MAX_SNIPPET_CHARS {
                let mut end = MAX_SNIPPET_CHARS;
                while !content.is_char_boundary(end) {
                    end -= 1;
                }
                content.truncate(end);
                content.push_str("\n... (truncated)");
            }
            body.push_str(&format!(
                "\n{}. {}:{}-{} (score {:.3})\n```{}\n{}\n```\n",
                i + 1,
                hit.relative_path,
                hit.start_line,
                hit.end_line,
                hit.score,
                hit.language,
                content
            ));
        }
        ToolResult::text(body)
    }

    async fn clear_index(&self, _args: Value) -> ToolResult {
        self.reconcile().await;
        let path = match self.target_path() {
            Ok(path) => path,
            Err(result) => return result,
        };

        let known = {
            let store = self.snapshot().lock().expect("snapshot lock poisoned");
            store.record(&path).is_some()
        };
        if !known {
            return ToolResult::error(format!(
                "Codebase '{}' is not indexed. Please index it first using the index_codebase tool.",
                path.display()
            ));
        }

        if let Err(e) = self.ctx.engine.clear_index(&path).await {
            if e.to_string() == COLLECTION_LIMIT_MESSAGE {
                return flag_failure(e.to_string());
            }
            return ToolResult::error(format!("Failed to clear index: {}", e));
        }

        {
            let mut store = self.snapshot().lock().expect("snapshot lock poisoned");
            store.remove(&path);
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to persist snapshot after clear");
            }
        }

        ToolResult::text(format!("Cleared index for '{}'.", path.display()))
    }

    async fn get_indexing_status(&self, _args: Value) -> ToolResult {
        let records = {
            let store = self.snapshot().lock().expect("snapshot lock poisoned");
            store.all()
        };
        if records.is_empty() {
            return ToolResult::text("No codebases are currently indexed or being indexed.");
        }

        let mut indexed = Vec::new();
        let mut indexing = Vec::new();
        let mut failed = Vec::new();
        for (path, record) in records {
            match record {
                CodebaseRecord::Indexed {
                    indexed_files,
                    total_chunks,
                    index_status,
                    ..
                } => {
                    let suffix = match index_status {
                        IndexResultStatus::Completed => String::new(),
                        IndexResultStatus::LimitReached => {
                            " (partial: chunk limit reached)".to_string()
                        }
                    };
                    indexed.push(format!(
                        "  {} ({} files, {} chunks){}",
                        path, indexed_files, total_chunks, suffix
                    ));
                }
                CodebaseRecord::Indexing {
                    indexing_percentage,
                    ..
                } => indexing.push(format!("  {} ({:.0}%)", path, indexing_percentage)),
                CodebaseRecord::IndexFailed { error_message, .. } => {
                    failed.push(format!("  {} (error: {})", path, error_message))
                }
            }
        }

        let mut body = String::new();
        if !indexed.is_empty() {
            body.push_str(&format!("Indexed codebases:\n{}\n", indexed.join("\n")));
        }
        if !indexing.is_empty() {
            body.push_str(&format!(
                "Currently indexing:\n{}\n",
                indexing.join("\n")
            ));
        }
        if !failed.is_empty() {
            body.push_str(&format!("Failed:\n{}\n", failed.join("\n")));
        }
        ToolResult::text(body.trim_end().to_string())
    }

    async fn index_project(&self, args: Value) -> ToolResult {
        let args: IndexProjectArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("Invalid arguments: {}", e)),
        };
        self.reconcile().await;

        let branch_path = match self.target_path() {
            Ok(path) => path,
            Err(result) => return result,
        };

        let options = match build_index_options(args.splitter.as_deref(), &[], &[]) {
            Ok(options) => options,
            Err(message) => return ToolResult::error(message),
        };

        let components = available_components(&branch_path);
        if components.is_empty() {
            return ToolResult::error(format!(
                "No components found under '{}'.",
                branch_path.display()
            ));
        }

        let mut started = Vec::new();
        let mut skipped = Vec::new();
        let mut failures = Vec::new();
        for component in &components {
            let path = branch_path.join(component);
            match self
                .ctx
                .orchestrator
                .start(&path, options.clone(), args.force)
                .await
            {
                Ok(_) => started.push(component.clone()),
                Err(e) if e.to_string() == COLLECTION_LIMIT_MESSAGE => {
                    // Stop here: later components would hit the same wall.
                    return ToolResult::error(format!(
                        "{}\nStarted before the limit: [{}].",
                        COLLECTION_LIMIT_MESSAGE,
                        started.join(", ")
                    ));
                }
                Err(e) => {
                    let message = e.to_string();
                    if message.contains("already indexed") || message.contains("already being indexed")
                    {
                        skipped.push(component.clone());
                    } else {
                        failures.push(format!("{}: {}", component, message));
                    }
                }
            }
        }

        let mut body = format!(
            "Project indexing started for {} of {} components under '{}'.",
            started.len(),
            components.len(),
            branch_path.display()
        );
        if !started.is_empty() {
            body.push_str(&format!("\nStarted: [{}]", started.join(", ")));
        }
        if !skipped.is_empty() {
            body.push_str(&format!("\nSkipped (already indexed or indexing): [{}]", skipped.join(", ")));
        }
        if !failures.is_empty() {
            body.push_str(&format!("\nFailed to start: [{}]", failures.join("; ")));
            return ToolResult::error(body);
        }
        ToolResult::text(body)
    }

    async fn list_projects(&self, _args: Value) -> ToolResult {
        let projects = available_projects(&self.ctx.config);
        if projects.is_empty() {
            return ToolResult::text(format!(
                "No projects found under '{}'.",
                self.ctx.config.repos_base_path.display()
            ));
        }
        ToolResult::text(format!("Available projects:\n  {}", projects.join("\n  ")))
    }

    async fn list_branches(&self, args: Value) -> ToolResult {
        let args: ListBranchesArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("Invalid arguments: {}", e)),
        };
        let project = match args
            .project
            .or_else(|| self.ctx.params.default_project.clone())
        {
            Some(project) => project,
            None => {
                return ToolResult::error(
                    "No project given and no default project configured.",
                )
            }
        };

        let branches = available_branches(&self.ctx.config, &project);
        if branches.is_empty() {
            return ToolResult::text(format!("No branches found for project '{}'.", project));
        }
        ToolResult::text(format!(
            "Branches for '{}':\n  {}",
            project,
            branches.join("\n  ")
        ))
    }

    async fn list_components(&self, _args: Value) -> ToolResult {
        let branch_path = match self.target_path() {
            Ok(path) => path,
            Err(result) => return result,
        };
        let components = available_components(&branch_path);
        if components.is_empty() {
            return ToolResult::text(format!(
                "No components found under '{}'.",
                branch_path.display()
            ));
        }
        ToolResult::text(format!(
            "Components under '{}':\n  {}",
            branch_path.display(),
            components.join("\n  ")
        ))
    }

    fn snapshot(&self) -> &Arc<Mutex<SnapshotStore>> {
        self.ctx.orchestrator.snapshot()
    }
}

/// Map a failure message from a search or clear to a result. There the
/// collection-limit message is a final answer about account state, not a
/// failure to retry, so it comes back unflagged and callers stop asking.
/// Index starts report the same message flagged.
fn flag_failure(message: String) -> ToolResult {
    if message == COLLECTION_LIMIT_MESSAGE {
        ToolResult::text(message)
    } else {
        ToolResult::error(message)
    }
}

/// Parse splitter and validate the extension/ignore additions.
fn build_index_options(
    splitter: Option<&str>,
    custom_extensions: &[String],
    ignore_patterns: &[String],
) -> Result<IndexOptions, String> {
    let splitter = match splitter {
        Some(raw) => match raw.parse::<Splitter>() {
            Ok(splitter) => splitter,
            Err(e) => return Err(e.to_string()),
        },
        None => Splitter::Ast,
    };

    if let Err(invalid) = validate_extensions(custom_extensions) {
        return Err(format!(
            "Invalid customExtensions values: [{}]. Extensions must be dot-prefixed, like '.rs' or '.vue'.",
            invalid.join(", ")
        ));
    }

    Ok(IndexOptions {
        splitter,
        extra_extensions: custom_extensions.to_vec(),
        extra_ignore_patterns: ignore_patterns.to_vec(),
    })
}

/// An extension is valid when dot-prefixed, longer than the dot, and free
/// of whitespace.
fn validate_extensions(extensions: &[String]) -> Result<(), Vec<String>> {
    let invalid: Vec<String> = extensions
        .iter()
        .filter(|e| !e.starts_with('.') || e.len() < 2 || e.chars().any(char::is_whitespace))
        .cloned()
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(invalid)
    }
}

/// Engine-side filter expression for an extension allowlist.
fn build_extension_filter(extensions: &[String]) -> Option<String> {
    if extensions.is_empty() {
        return None;
    }
    let quoted: Vec<String> = extensions.iter().map(|e| format!("'{}'", e)).collect();
    Some(format!("fileExtension in [{}]", quoted.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_validation() {
        assert!(validate_extensions(&[".rs".to_string(), ".tsx".to_string()]).is_ok());
        assert!(validate_extensions(&[]).is_ok());

        let invalid = validate_extensions(&[
            "rs".to_string(),
            ".".to_string(),
            ". s".to_string(),
            ".ok".to_string(),
        ])
        .unwrap_err();
        assert_eq!(invalid, vec!["rs", ".", ". s"]);
    }

    #[test]
    fn extension_filter_expression() {
        assert_eq!(build_extension_filter(&[]), None);
        assert_eq!(
            build_extension_filter(&[".ts".to_string(), ".rs".to_string()]),
            Some("fileExtension in ['.ts', '.rs']".to_string())
        );
    }

    #[test]
    fn invalid_splitter_is_a_readable_error() {
        let err = build_index_options(Some("semantic"), &[], &[]).unwrap_err();
        assert!(err.contains("Must be 'ast' or 'langchain'"));
    }

    #[test]
    fn default_splitter_is_ast() {
        let options = build_index_options(None, &[], &[]).unwrap();
        assert_eq!(options.splitter, Splitter::Ast);
    }

    #[test]
    fn collection_limit_comes_back_unflagged() {
        let terminal = flag_failure(COLLECTION_LIMIT_MESSAGE.to_string());
        assert!(!terminal.is_error);
        assert_eq!(terminal.body(), COLLECTION_LIMIT_MESSAGE);

        let transient = flag_failure("connection reset".to_string());
        assert!(transient.is_error);
    }

    #[test]
    fn error_flag_is_omitted_when_false() {
        let ok = serde_json::to_value(ToolResult::text("done")).unwrap();
        assert!(ok.get("isError").is_none());
        assert_eq!(ok["content"][0]["type"], "text");

        let err = serde_json::to_value(ToolResult::error("nope")).unwrap();
        assert_eq!(err["isError"], true);
    }
}
