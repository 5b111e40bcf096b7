//! Server configuration and per-request connection parameters.
//!
//! Base configuration comes from environment variables at startup. A copy
//! of the [`ConnectionParams`] can then be overridden per request from
//! `x-*` HTTP headers, so one running server can serve callers with
//! different embedding backends or vector store credentials.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::tuning::Environment;

/// Connection parameters for the embedding backend and vector store.
///
/// These are the fields a request may override via headers; everything
/// else in [`McpConfig`] is fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Embedding backend name (e.g. `"openai"`, `"gateway"`).
    pub embedding_provider: String,
    pub embedding_model: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_base_url: Option<String>,
    /// Vector store endpoint (a URI for managed stores, a host for local).
    pub store_address: Option<String>,
    pub store_token: Option<String>,
    pub default_project: Option<String>,
    pub default_branch: String,
}

impl ConnectionParams {
    fn from_env() -> Self {
        Self {
            embedding_provider: env_or("EMBEDDING_PROVIDER", "openai"),
            embedding_model: env_opt("EMBEDDING_MODEL"),
            embedding_api_key: env_opt("EMBEDDING_API_KEY"),
            embedding_base_url: env_opt("EMBEDDING_BASE_URL"),
            store_address: env_opt("STORE_ADDRESS"),
            store_token: env_opt("STORE_TOKEN"),
            default_project: env_opt("DEFAULT_PROJECT"),
            default_branch: env_or("DEFAULT_BRANCH", "prod"),
        }
    }

    /// Apply per-request header overrides. `get` looks up a header by its
    /// lowercase name; `None` or an empty value leaves the base value.
    pub fn with_overrides(&self, get: impl Fn(&str) -> Option<String>) -> Self {
        let pick = |name: &str, base: &Option<String>| -> Option<String> {
            match get(name) {
                Some(v) if !v.is_empty() => Some(v),
                _ => base.clone(),
            }
        };

        Self {
            embedding_provider: get("x-embedding-provider")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| self.embedding_provider.clone()),
            embedding_model: pick("x-embedding-model", &self.embedding_model),
            embedding_api_key: pick("x-embedding-api-key", &self.embedding_api_key),
            embedding_base_url: pick("x-embedding-base-url", &self.embedding_base_url),
            store_address: pick("x-store-address", &self.store_address),
            store_token: pick("x-store-token", &self.store_token),
            default_project: pick("x-default-project", &self.default_project),
            default_branch: get("x-default-branch")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| self.default_branch.clone()),
        }
    }

    /// Whether enough is configured to build an indexing context.
    pub fn is_complete(&self) -> bool {
        self.embedding_api_key.is_some() && self.store_address.is_some()
    }
}

/// Process-wide server configuration.
#[derive(Debug, Clone)]
pub struct McpConfig {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    /// Root under which codebases are laid out as `<project>/<branch>`.
    pub repos_base_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub environment: Environment,
    pub connection: ConnectionParams,
}

impl McpConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port_raw = env_or("MCP_HTTP_PORT", "3000");
        let port: u16 = match port_raw.parse() {
            Ok(p) => p,
            Err(_) => bail!("MCP_HTTP_PORT must be a port number, got '{}'", port_raw),
        };

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let repos_base_path = env_opt("REPOS_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.join("repos"));
        let snapshot_path = env_opt("SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.join("mcp-codebase-snapshot.json"));

        Ok(Self {
            server_name: env_or("MCP_SERVER_NAME", "codebase-index-mcp"),
            host: env_or("MCP_HTTP_HOST", "localhost"),
            port,
            repos_base_path,
            snapshot_path,
            environment: Environment::from_env(),
            connection: ConnectionParams::from_env(),
        })
    }

    /// Absolute path of one codebase: `<repos_base>/<project>/<branch>`.
    pub fn project_path(&self, project: &str, branch: &str) -> PathBuf {
        self.repos_base_path.join(project).join(branch)
    }
}

fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Names of the immediate subdirectories of `dir`, sorted. Unreadable
/// directories yield an empty list rather than an error, so discovery
/// degrades gracefully when the repos tree is absent.
pub fn list_subdirectories(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return names,
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Ok(name) = entry.file_name().into_string() {
                if !name.starts_with('.') {
                    names.push(name);
                }
            }
        }
    }
    names.sort();
    names
}

/// Projects available under the repos base path.
pub fn available_projects(config: &McpConfig) -> Vec<String> {
    list_subdirectories(&config.repos_base_path)
}

/// Branches available for one project.
pub fn available_branches(config: &McpConfig, project: &str) -> Vec<String> {
    list_subdirectories(&config.repos_base_path.join(project))
}

/// Components (top-level subdirectories) of one checked-out branch.
pub fn available_components(branch_path: &Path) -> Vec<String> {
    list_subdirectories(branch_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base_params() -> ConnectionParams {
        ConnectionParams {
            embedding_provider: "openai".to_string(),
            embedding_model: None,
            embedding_api_key: Some("sk-base".to_string()),
            embedding_base_url: None,
            store_address: Some("https://in01.cloud.example.com".to_string()),
            store_token: None,
            default_project: None,
            default_branch: "prod".to_string(),
        }
    }

    #[test]
    fn overrides_replace_only_present_headers() {
        let params = base_params();
        let overridden = params.with_overrides(|name| match name {
            "x-embedding-provider" => Some("gateway".to_string()),
            "x-embedding-api-key" => Some("sk-header".to_string()),
            _ => None,
        });

        assert_eq!(overridden.embedding_provider, "gateway");
        assert_eq!(overridden.embedding_api_key.as_deref(), Some("sk-header"));
        // Untouched fields keep base values.
        assert_eq!(overridden.default_branch, "prod");
        assert_eq!(
            overridden.store_address.as_deref(),
            Some("https://in01.cloud.example.com")
        );
    }

    #[test]
    fn empty_header_values_are_ignored() {
        let params = base_params();
        let overridden = params.with_overrides(|name| match name {
            "x-embedding-provider" => Some(String::new()),
            _ => None,
        });
        assert_eq!(overridden.embedding_provider, "openai");
    }

    #[test]
    fn completeness_requires_key_and_address() {
        let mut params = base_params();
        assert!(params.is_complete());
        params.store_address = None;
        assert!(!params.is_complete());
        params.store_address = Some("http://localhost:19530".to_string());
        params.embedding_api_key = None;
        assert!(!params.is_complete());
    }

    #[test]
    fn subdirectory_discovery_skips_files_and_hidden_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("beta")).unwrap();
        std::fs::create_dir(tmp.path().join("alpha")).unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        assert_eq!(list_subdirectories(tmp.path()), vec!["alpha", "beta"]);
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let tmp = TempDir::new().unwrap();
        assert!(list_subdirectories(&tmp.path().join("nope")).is_empty());
    }
}
