//! MCP-compatible HTTP server.
//!
//! Exposes the tool surface over stateless JSON-RPC, suitable for Cursor,
//! Claude, and other MCP clients.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/mcp` | JSON-RPC: `initialize`, `tools/list`, `tools/call` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Per-request connection overrides
//!
//! Callers may override embedding and vector store parameters per request
//! via `x-embedding-provider`, `x-embedding-model`, `x-embedding-api-key`,
//! `x-embedding-base-url`, `x-store-address`, `x-store-token`,
//! `x-default-project`, and `x-default-branch` headers. The indexing
//! context is built lazily from the first request with a complete
//! configuration and rebuilt whenever the effective parameters change.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients and cross-origin MCP tool calls.
//!
//! # Cursor Integration
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "codebase-index": {
//!       "url": "http://localhost:3000/mcp"
//!     }
//!   }
//! }
//! ```

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::{ConnectionParams, McpConfig};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::engine::{DisabledEngine, DisabledVectorStore, IndexingEngine, VectorStore};
use crate::orchestrator::Orchestrator;
use crate::reconcile::reconcile_with_remote;
use crate::snapshot::SnapshotStore;
use crate::tools::{AppContext, ToolHandlers};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Builds the engine and vector store for a resolved connection.
///
/// The server itself carries no engine; a binary links one in by passing
/// its factory to [`run_server_with_engine`]. The stock binary uses
/// [`UnlinkedEngineFactory`], whose tools answer with a clear error.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        params: &ConnectionParams,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<(Arc<dyn IndexingEngine>, Arc<dyn VectorStore>)>;
}

/// Factory for binaries without a linked engine.
pub struct UnlinkedEngineFactory;

#[async_trait]
impl EngineFactory for UnlinkedEngineFactory {
    async fn create(
        &self,
        _params: &ConnectionParams,
        _provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<(Arc<dyn IndexingEngine>, Arc<dyn VectorStore>)> {
        Ok((Arc::new(DisabledEngine), Arc::new(DisabledVectorStore)))
    }
}

/// Shared state behind every request handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<McpConfig>,
    store: Arc<Mutex<SnapshotStore>>,
    factory: Arc<dyn EngineFactory>,
    /// Lazily built context, cached with the parameters it was built from.
    context: Arc<RwLock<Option<(ConnectionParams, Arc<AppContext>)>>>,
}

impl AppState {
    pub fn new(
        config: Arc<McpConfig>,
        store: Arc<Mutex<SnapshotStore>>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            config,
            store,
            factory,
            context: Arc::new(RwLock::new(None)),
        }
    }

    pub fn snapshot(&self) -> &Arc<Mutex<SnapshotStore>> {
        &self.store
    }

    /// Resolve or build the context for the given effective parameters.
    async fn ensure_context(&self, params: ConnectionParams) -> Result<Arc<AppContext>> {
        {
            let cached = self.context.read().await;
            if let Some((cached_params, ctx)) = cached.as_ref() {
                if *cached_params == params {
                    return Ok(Arc::clone(ctx));
                }
            }
        }

        if !params.is_complete() {
            anyhow::bail!(
                "Embedding and vector store connection is not configured. \
                 Set EMBEDDING_API_KEY and STORE_ADDRESS, or pass the \
                 x-embedding-api-key and x-store-address headers."
            );
        }

        let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&params)?);
        let (engine, vector_store) = self.factory.create(&params, Arc::clone(&provider)).await?;

        // New connection, possibly a new account: shrink the snapshot to
        // what actually exists remotely before serving from it.
        if let Some(address) = params.store_address.as_deref() {
            reconcile_with_remote(&self.store, &vector_store, address).await;
        }

        let orchestrator = Orchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&engine),
            Arc::clone(&vector_store),
        );
        let ctx = Arc::new(AppContext {
            config: Arc::clone(&self.config),
            params: params.clone(),
            orchestrator,
            engine,
        });

        let mut cached = self.context.write().await;
        *cached = Some((params, Arc::clone(&ctx)));
        Ok(ctx)
    }
}

/// Start the server with no linked engine.
pub async fn run_server(config: Arc<McpConfig>, store: Arc<Mutex<SnapshotStore>>) -> Result<()> {
    run_server_with_engine(config, store, Arc::new(UnlinkedEngineFactory)).await
}

/// Start the server with a linked engine factory. Runs until shutdown is
/// requested through `ctrl-c` or SIGTERM; the final snapshot save happens
/// after the listener stops accepting.
pub async fn run_server_with_engine(
    config: Arc<McpConfig>,
    store: Arc<Mutex<SnapshotStore>>,
    factory: Arc<dyn EngineFactory>,
) -> Result<()> {
    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, Arc::clone(&store), factory);
    let app = router(state);

    info!(address = %bind_addr, "MCP server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let mut store = store.lock().expect("snapshot lock poisoned");
    store.save()?;
    info!("shutdown complete");
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "could not install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /mcp ============

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn rpc_result(id: Option<Value>, result: Value) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    }))
}

fn rpc_error(id: Option<Value>, code: i64, message: impl Into<String>) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    }))
}

async fn handle_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return rpc_error(None, -32700, format!("Parse error: {}", e)).into_response();
        }
    };

    // Notifications carry no id and expect no body.
    if request.id.is_none() && request.method.starts_with("notifications/") {
        return StatusCode::ACCEPTED.into_response();
    }

    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": state.config.server_name.clone(),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .into_response(),
        "tools/list" => rpc_result(id, json!({ "tools": tool_descriptors() })).into_response(),
        "tools/call" => handle_tool_call(state, headers, id, request.params)
            .await
            .into_response(),
        "ping" => rpc_result(id, json!({})).into_response(),
        other => rpc_error(id, -32601, format!("Method not found: {}", other)).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn handle_tool_call(
    state: AppState,
    headers: HeaderMap,
    id: Option<Value>,
    params: Value,
) -> Json<Value> {
    let call: ToolCallParams = match serde_json::from_value(params) {
        Ok(call) => call,
        Err(e) => return rpc_error(id, -32602, format!("Invalid params: {}", e)),
    };

    let effective = state.config.connection.with_overrides(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    });

    let ctx = match state.ensure_context(effective).await {
        Ok(ctx) => ctx,
        Err(e) => return rpc_error(id, -32000, e.to_string()),
    };

    let result = ToolHandlers::new(ctx).call(&call.name, call.arguments).await;
    match serde_json::to_value(&result) {
        Ok(value) => rpc_result(id, value),
        Err(e) => rpc_error(id, -32603, format!("Internal error: {}", e)),
    }
}

/// Static tool descriptors for `tools/list`.
fn tool_descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": "index_codebase",
            "description": "Index the configured codebase for semantic search. Runs in the background; use get_indexing_status to track progress.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "force": {
                        "type": "boolean",
                        "description": "Re-index even if the codebase is already indexed.",
                        "default": false
                    },
                    "splitter": {
                        "type": "string",
                        "enum": ["ast", "langchain"],
                        "description": "Code splitter to use. Defaults to 'ast'.",
                        "default": "ast"
                    },
                    "customExtensions": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Extra file extensions to index, dot-prefixed (e.g. '.vue')."
                    },
                    "ignorePatterns": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Extra glob patterns to exclude from indexing."
                    }
                }
            }
        }),
        json!({
            "name": "search_code",
            "description": "Semantic search over the indexed codebase. Returns ranked snippets with file paths and line ranges.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural-language search query."
                    },
                    "limit": {
                        "type": "number",
                        "description": "Maximum number of results (1-50).",
                        "default": 10
                    },
                    "extensionFilter": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Restrict results to these file extensions (e.g. ['.rs'])."
                    }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "clear_index",
            "description": "Remove the index and local state record for the configured codebase.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "get_indexing_status",
            "description": "List all known codebases with their indexing state and progress.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "index_project",
            "description": "Index every component under the configured project and branch.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "force": {
                        "type": "boolean",
                        "description": "Re-index components that are already indexed.",
                        "default": false
                    },
                    "splitter": {
                        "type": "string",
                        "enum": ["ast", "langchain"],
                        "description": "Code splitter to use. Defaults to 'ast'.",
                        "default": "ast"
                    }
                }
            }
        }),
        json!({
            "name": "list_projects",
            "description": "List projects available under the repository base path.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "list_branches",
            "description": "List branches available for a project.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "project": {
                        "type": "string",
                        "description": "Project name. Defaults to the configured project."
                    }
                }
            }
        }),
        json!({
            "name": "list_components",
            "description": "List components under the configured project and branch.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_cover_the_full_tool_surface() {
        let descriptors = tool_descriptors();
        let names: Vec<&str> = descriptors
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "index_codebase",
                "search_code",
                "clear_index",
                "get_indexing_status",
                "index_project",
                "list_projects",
                "list_branches",
                "list_components",
            ]
        );
        for descriptor in &descriptors {
            assert!(descriptor["inputSchema"]["type"] == "object");
            assert!(descriptor["description"].as_str().unwrap().len() > 10);
        }
    }

    #[test]
    fn rpc_error_shape() {
        let Json(body) = rpc_error(Some(json!(7)), -32601, "Method not found: nope");
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["id"], 7);
        assert_eq!(body["error"]["code"], -32601);
    }
}
