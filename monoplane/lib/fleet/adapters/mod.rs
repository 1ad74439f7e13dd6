//! Implementations of [`RunnerAdapter`](super::RunnerAdapter), one per runner protocol generation.

mod declarative;
mod direct;
mod memory;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use reqwest::StatusCode;
use typed_builder::TypedBuilder;

use crate::{
    config::{
        MonoplaneConfig, DEFAULT_HEALTH_CHECK_TIMEOUT_SECS, DEFAULT_HTTP_RETRIES,
        DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS,
        DEFAULT_RETRY_MAX_BACKOFF_MS, DEFAULT_RETRY_MIN_BACKOFF_MS,
    },
    models::{Runner, RunnerApiVersion},
    MonoplaneError, MonoplaneResult,
};

use super::{AdapterFactory, RunnerAdapter};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use declarative::*;
pub use direct::*;
pub use memory::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Timeouts and retry bounds shared by the HTTP adapters.
#[derive(Debug, Clone, TypedBuilder)]
pub struct AdapterSettings {
    /// Deadline of a health check request.
    #[builder(default = Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS))]
    pub health_timeout: Duration,

    /// Deadline of any other request.
    #[builder(default = Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS))]
    pub operation_timeout: Duration,

    /// Transport-level retries of a single request.
    #[builder(default = DEFAULT_HTTP_RETRIES)]
    pub http_retries: u32,

    /// Lower bound of the transport retry backoff.
    #[builder(default = Duration::from_millis(DEFAULT_RETRY_MIN_BACKOFF_MS))]
    pub min_backoff: Duration,

    /// Upper bound of the transport retry backoff.
    #[builder(default = Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS))]
    pub max_backoff: Duration,

    /// Status polls before a declarative runner is given up on.
    #[builder(default = DEFAULT_POLL_ATTEMPTS)]
    pub poll_attempts: u32,

    /// The pause between status polls.
    #[builder(default = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))]
    pub poll_interval: Duration,
}

/// Picks [`DirectHttpAdapter`] for v0 runners and [`DeclarativeStateAdapter`] for v2 runners.
///
/// Adapters are cached per runner and rebuilt when the runner's URL or credential changes.
#[derive(Debug)]
pub struct DefaultAdapterFactory {
    settings: AdapterSettings,
    cache: Mutex<HashMap<String, CachedAdapter>>,
}

#[derive(Debug)]
struct CachedAdapter {
    api_url: String,
    api_key: String,
    api_version: RunnerApiVersion,
    adapter: Arc<dyn RunnerAdapter>,
}

/// Serves adapters registered up front, keyed by runner id.
#[derive(Debug, Default)]
pub struct StaticAdapterFactory {
    adapters: Mutex<HashMap<String, Arc<dyn RunnerAdapter>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AdapterSettings {
    /// Reads the adapter settings from the configuration.
    pub fn from_config(config: &MonoplaneConfig) -> Self {
        let fleet = config.get_fleet();
        let orchestrator = config.get_orchestrator();

        Self {
            health_timeout: fleet.health_check_timeout(),
            operation_timeout: fleet.operation_timeout(),
            http_retries: *fleet.get_http_retries(),
            min_backoff: orchestrator.retry_min_backoff(),
            max_backoff: orchestrator.retry_max_backoff(),
            poll_attempts: *fleet.get_poll_attempts(),
            poll_interval: fleet.poll_interval(),
        }
    }
}

impl DefaultAdapterFactory {
    /// Creates a factory using `settings` for every adapter it builds.
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn build(&self, runner: &Runner) -> MonoplaneResult<Arc<dyn RunnerAdapter>> {
        Ok(match runner.api_version {
            RunnerApiVersion::V0 => Arc::new(DirectHttpAdapter::new(runner, &self.settings)?),
            RunnerApiVersion::V2 => {
                Arc::new(DeclarativeStateAdapter::new(runner, &self.settings)?)
            }
        })
    }
}

impl StaticAdapterFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the adapter served for `runner_id`.
    pub fn insert(&self, runner_id: impl Into<String>, adapter: Arc<dyn RunnerAdapter>) {
        self.adapters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(runner_id.into(), adapter);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl AdapterFactory for DefaultAdapterFactory {
    fn adapter_for(&self, runner: &Runner) -> MonoplaneResult<Arc<dyn RunnerAdapter>> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(cached) = cache.get(&runner.id) {
            if cached.api_url == runner.api_url
                && cached.api_key == runner.api_key
                && cached.api_version == runner.api_version
            {
                return Ok(cached.adapter.clone());
            }
        }

        let adapter = self.build(runner)?;
        cache.insert(
            runner.id.clone(),
            CachedAdapter {
                api_url: runner.api_url.clone(),
                api_key: runner.api_key.clone(),
                api_version: runner.api_version,
                adapter: adapter.clone(),
            },
        );

        Ok(adapter)
    }
}

impl AdapterFactory for StaticAdapterFactory {
    fn adapter_for(&self, runner: &Runner) -> MonoplaneResult<Arc<dyn RunnerAdapter>> {
        self.adapters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&runner.id)
            .cloned()
            .ok_or_else(|| MonoplaneError::not_found("runner adapter", &runner.id))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Turns a non-success runner response into the matching error.
///
/// 429 and 5xx are transient, every other status is an explicit refusal.
pub(crate) async fn runner_error(runner_id: &str, response: reqwest::Response) -> MonoplaneError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let reason = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        MonoplaneError::Unavailable(format!("runner {runner_id} returned {reason}"))
    } else {
        MonoplaneError::RunnerRejected {
            runner: runner_id.to_string(),
            reason,
        }
    }
}

/// Joins a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
