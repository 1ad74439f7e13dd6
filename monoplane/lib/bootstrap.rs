//! Idempotent platform bootstrap.
//!
//! Every step checks whether its entity exists before creating it, so bootstrapping an already
//! bootstrapped store changes nothing.

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::{
    config::{MonoplaneConfig, RegistryCredentials, RunnerConfig},
    db,
    fleet::{FleetManager, NewRunner},
    models::{DockerRegistry, RegistryType, RunnerState},
    region::NewRegion,
    MonoplaneError, MonoplaneResult, Services,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a bootstrap run created.
#[derive(Debug, Default)]
pub struct BootstrapReport {
    /// Whether the default region was created.
    pub region_created: bool,

    /// The registries that were created.
    pub registries_created: Vec<String>,

    /// Whether the default runner was registered.
    pub runner_registered: bool,

    /// The background poll of the default runner's readiness. Resolves to whether it became
    /// ready.
    pub readiness: Option<JoinHandle<bool>>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Ensures the default region, the default registries and the configured default runner exist.
///
/// Does not wait for the default runner to become ready. Its readiness is polled in the
/// background.
pub async fn bootstrap(services: &Services, config: &MonoplaneConfig) -> MonoplaneResult<BootstrapReport> {
    let mut report = BootstrapReport {
        region_created: ensure_region(services, config).await?,
        ..Default::default()
    };

    let region_id = config.get_region().get_id();
    let registries = config.get_registry();
    if let Some(credentials) = registries.get_internal() {
        if ensure_registry(services, credentials, RegistryType::Internal).await? {
            report.registries_created.push(RegistryType::Internal.to_string());
        }
    }
    if let Some(credentials) = registries.get_backup() {
        if ensure_registry(services, credentials, RegistryType::Backup).await? {
            report.registries_created.push(RegistryType::Backup.to_string());
        }
    }

    if let Some(runner) = config.get_runner() {
        report.runner_registered = ensure_runner(services.get_fleet(), runner, region_id).await?;
        report.readiness = Some(spawn_readiness_poll(
            services.get_tasks(),
            services.get_fleet().clone(),
            runner.get_id().clone(),
        ));
    }

    tracing::info!(
        region_id = %region_id,
        "bootstrap complete: region created={}, registries created={:?}, runner registered={}",
        report.region_created,
        report.registries_created,
        report.runner_registered
    );

    Ok(report)
}

async fn ensure_region(services: &Services, config: &MonoplaneConfig) -> MonoplaneResult<bool> {
    let region = config.get_region();
    if db::get_region(services.get_pool(), region.get_id())
        .await?
        .is_some()
    {
        tracing::debug!(region_id = %region.get_id(), "default region exists");
        return Ok(false);
    }

    services
        .get_regions()
        .create(
            NewRegion::builder()
                .id(region.get_id().clone())
                .name(region.get_name().clone())
                .enforce_quotas(*region.get_enforce_quotas())
                .build(),
            None,
        )
        .await?;

    Ok(true)
}

async fn ensure_registry(
    services: &Services,
    credentials: &RegistryCredentials,
    registry_type: RegistryType,
) -> MonoplaneResult<bool> {
    let pool = services.get_pool();
    if db::find_fallback_registry(pool, registry_type)
        .await?
        .is_some()
    {
        tracing::debug!("{registry_type} registry exists");
        return Ok(false);
    }

    let now = Utc::now();
    let registry = DockerRegistry {
        id: uuid::Uuid::new_v4().to_string(),
        name: format!("{registry_type}-default"),
        url: credentials.get_url().clone(),
        project: credentials.get_project().clone(),
        username: credentials.get_username().clone(),
        password: credentials.get_password().clone(),
        registry_type,
        tenant_id: None,
        region_id: None,
        is_fallback: true,
        created_at: now,
        modified_at: now,
    };
    db::insert_registry(pool, &registry).await?;

    tracing::info!("created {registry_type} registry at {}", registry.url);
    Ok(true)
}

async fn ensure_runner(
    fleet: &FleetManager,
    runner: &RunnerConfig,
    region_id: &str,
) -> MonoplaneResult<bool> {
    match fleet.get(runner.get_id()).await {
        Ok(_) => {
            tracing::debug!(runner_id = %runner.get_id(), "default runner exists");
            return Ok(false);
        }
        Err(MonoplaneError::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    fleet
        .register(
            NewRunner::builder()
                .id(runner.get_id().clone())
                .region_id(region_id)
                .api_url(runner.get_api_url().clone())
                .api_key(runner.get_api_key().clone())
                .api_version(*runner.get_api_version())
                .capacity(runner.capacity())
                .build(),
        )
        .await?;

    Ok(true)
}

/// Health checks the default runner until it is ready, for a bounded number of attempts.
///
/// The poll runs on `tasks` and stops early when the fleet shuts down.
fn spawn_readiness_poll(
    tasks: &TaskTracker,
    fleet: FleetManager,
    runner_id: String,
) -> JoinHandle<bool> {
    let attempts = *fleet.config().get_bootstrap_attempts();
    let interval = fleet.config().bootstrap_interval();
    let token = fleet.shutdown_token();

    tasks.spawn(async move {
        for attempt in 1..=attempts {
            match fleet.health_check(&runner_id).await {
                Ok(RunnerState::Ready) => {
                    tracing::info!(runner_id = %runner_id, "default runner ready after {attempt} checks");
                    return true;
                }
                Ok(state) => {
                    tracing::debug!(runner_id = %runner_id, "default runner is {state} (check {attempt}/{attempts})");
                }
                Err(e) => {
                    tracing::debug!(runner_id = %runner_id, "default runner check {attempt}/{attempts} failed: {e}");
                }
            }

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        tracing::warn!(
            runner_id = %runner_id,
            "default runner not ready after {attempts} checks, starting degraded"
        );
        false
    })
}
