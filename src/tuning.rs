//! Per-provider batching knobs and snapshot persistence intervals.
//!
//! Embedding backends differ widely in rate limits and per-request latency,
//! so the batch pipeline is tuned per provider rather than with one global
//! setting. Values are resolved once at context construction from the
//! provider name and the runtime environment.

use std::time::Duration;

/// Runtime environment, from the `CIM_ENV` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Development,
    #[default]
    Production,
    Test,
}

impl Environment {
    /// Resolve from `CIM_ENV`. Unset or unrecognized values mean production.
    pub fn from_env() -> Self {
        match std::env::var("CIM_ENV").as_deref() {
            Ok("development") | Ok("dev") => Environment::Development,
            Ok("test") => Environment::Test,
            _ => Environment::Production,
        }
    }
}

/// Batching parameters for one embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTuning {
    /// Requests in flight at once within a batch window.
    pub concurrent_requests: usize,
    /// Texts per embedding request.
    pub chunk_size: usize,
    /// Pause between consecutive windows.
    pub batch_delay: Duration,
}

/// Look up the tuning for `provider` (case-insensitive) in `env`.
///
/// Unknown providers get a conservative default rather than an error, so a
/// newly configured backend works before it has dedicated tuning.
pub fn tuning_for(provider: &str, env: Environment) -> ProviderTuning {
    let provider = provider.to_ascii_lowercase();
    let mut tuning = match provider.as_str() {
        "gateway" => ProviderTuning {
            concurrent_requests: 3,
            chunk_size: 50,
            batch_delay: Duration::from_millis(100),
        },
        "openai" => ProviderTuning {
            concurrent_requests: 5,
            chunk_size: 100,
            batch_delay: Duration::from_millis(200),
        },
        "voyageai" => ProviderTuning {
            concurrent_requests: 4,
            chunk_size: 75,
            batch_delay: Duration::from_millis(150),
        },
        "gemini" => ProviderTuning {
            concurrent_requests: 2,
            chunk_size: 25,
            batch_delay: Duration::from_millis(300),
        },
        "ollama" => ProviderTuning {
            concurrent_requests: 1,
            chunk_size: 10,
            batch_delay: Duration::ZERO,
        },
        _ => ProviderTuning {
            concurrent_requests: 2,
            chunk_size: 50,
            batch_delay: Duration::from_millis(200),
        },
    };

    // Development favors responsiveness over throughput for the busiest
    // backends; everything else keeps its production values.
    if env == Environment::Development {
        match provider.as_str() {
            "gateway" => tuning.concurrent_requests = 2,
            "openai" => tuning.concurrent_requests = 3,
            _ => {}
        }
    }

    tuning
}

/// Interval between periodic snapshot saves.
pub fn snapshot_save_interval(env: Environment) -> Duration {
    match env {
        Environment::Test => Duration::from_secs(5),
        _ => Duration::from_secs(15),
    }
}

/// Minimum gap between progress-driven snapshot persists during indexing.
pub const PROGRESS_PERSIST_THROTTLE: Duration = Duration::from_millis(2000);
