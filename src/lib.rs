//! # Codebase Index MCP
//!
//! An MCP server that orchestrates semantic indexing and search over
//! checked-out codebases. Indexing runs as background jobs whose state is
//! tracked in a durable JSON snapshot; search, status, and discovery are
//! exposed as MCP tools over stateless HTTP JSON-RPC.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐
//! │ MCP HTTP │──▶│ Tool Handlers │──▶│ Orchestrator   │
//! │  /mcp    │   │ (8 tools)     │   │ background jobs│
//! └──────────┘   └──────────────┘   └───────┬───────┘
//!                                           │
//!                      ┌────────────────────┤
//!                      ▼                    ▼
//!                ┌───────────┐       ┌─────────────┐
//!                │ Snapshot  │       │   Engine     │
//!                │ (JSON)    │       │ + VectorStore│
//!                └───────────┘       └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export EMBEDDING_API_KEY=sk-...
//! export STORE_ADDRESS=https://...
//! export DEFAULT_PROJECT=myproject
//! cim serve                     # start the MCP server
//! cim status                    # inspect the local snapshot
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment configuration and per-request overrides |
//! | [`snapshot`] | Durable per-codebase state store |
//! | [`engine`] | Indexing engine and vector store abstractions |
//! | [`embedding`] | Embedding provider abstraction and HTTP client |
//! | [`batch`] | Ordered batch embedding |
//! | [`tuning`] | Per-provider batching knobs |
//! | [`orchestrator`] | Background indexing jobs |
//! | [`reconcile`] | Snapshot ↔ remote store reconciliation |
//! | [`tools`] | MCP tool handlers |
//! | [`server`] | MCP HTTP server |

pub mod batch;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod orchestrator;
pub mod reconcile;
pub mod server;
pub mod snapshot;
pub mod tools;
pub mod tuning;
