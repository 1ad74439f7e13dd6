//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use monoplane::{
    config::{
        FleetConfig, MonoplaneConfig, OrchestratorConfig, RegionConfig, RegistryConfig,
        RegistryCredentials,
    },
    db::{self, init_db, SandboxFilter, CONTROL_DB_MIGRATOR},
    fleet::{InMemoryRunnerAdapter, NewRunner, StaticAdapterFactory},
    models::{Resources, Runner, RunnerState, Sandbox, Snapshot},
    snapshot::{NewSnapshot, NoopRegistryProvider, RegistryProvider},
    Services,
};
use tempfile::TempDir;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default region every platform is bootstrapped with.
pub const REGION: &str = "eu";

/// The tenant used by the scenarios.
pub const TENANT: &str = "acme";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A bootstrapped control plane over a temporary store, with in-memory runners.
pub struct Platform {
    _dir: TempDir,
    pub config: MonoplaneConfig,
    pub services: Services,
    pub adapters: Arc<StaticAdapterFactory>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Platform {
    /// A platform with auto-migration disabled.
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(config(false)).await
    }

    /// A platform with auto-migration enabled.
    pub async fn migrating() -> anyhow::Result<Self> {
        Self::with_config(config(true)).await
    }

    /// Opens and bootstraps a platform with `config` and the no-op registry provider.
    pub async fn with_config(config: MonoplaneConfig) -> anyhow::Result<Self> {
        Self::with_provider(config, Arc::new(NoopRegistryProvider::default())).await
    }

    /// Opens and bootstraps a platform with `config` and `provider`.
    pub async fn with_provider(
        config: MonoplaneConfig,
        provider: Arc<dyn RegistryProvider>,
    ) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let pool = init_db(dir.path().join("control.db"), &CONTROL_DB_MIGRATOR).await?;
        let adapters = Arc::new(StaticAdapterFactory::new());
        let services = Services::with_parts(pool, &config, adapters.clone(), provider);
        monoplane::bootstrap::bootstrap(&services, &config).await?;

        Ok(Self {
            _dir: dir,
            config,
            services,
            adapters,
        })
    }

    /// Registers an in-memory runner in `region_id` and health checks it into `ready`.
    pub async fn runner_in(
        &self,
        id: &str,
        region_id: &str,
        capacity: Resources,
    ) -> anyhow::Result<InMemoryRunnerAdapter> {
        let adapter = InMemoryRunnerAdapter::new(id);
        self.adapters.insert(id, Arc::new(adapter.clone()));

        let fleet = self.services.get_fleet();
        fleet
            .register(
                NewRunner::builder()
                    .id(id)
                    .region_id(region_id)
                    .api_url(format!("http://{id}.runners.test"))
                    .api_key("runner-key")
                    .capacity(capacity)
                    .build(),
            )
            .await?;
        assert_eq!(fleet.health_check(id).await?, RunnerState::Ready);

        Ok(adapter)
    }

    /// Registers a ready in-memory runner in the default region.
    pub async fn runner(&self, id: &str, capacity: Resources) -> anyhow::Result<InMemoryRunnerAdapter> {
        self.runner_in(id, REGION, capacity).await
    }

    /// Registers a tenant snapshot and builds it in the default region.
    pub async fn active_snapshot(&self, name: &str, footprint: Resources) -> anyhow::Result<Snapshot> {
        let snapshots = self.services.get_snapshots();
        let snapshot = snapshots
            .create(
                NewSnapshot::builder()
                    .tenant_id(TENANT)
                    .name(name)
                    .image_name(format!("docker.io/library/{name}:latest"))
                    .footprint(footprint)
                    .build(),
            )
            .await?;

        Ok(snapshots.build(&snapshot.id, REGION).await?)
    }

    /// Reads a runner.
    pub async fn runner_row(&self, id: &str) -> anyhow::Result<Runner> {
        Ok(self.services.get_fleet().get(id).await?)
    }

    /// Every sandbox of the tenant, destroyed ones included.
    pub async fn sandboxes(&self) -> anyhow::Result<Vec<Sandbox>> {
        let filter = SandboxFilter {
            tenant_id: Some(TENANT.to_string()),
            include_destroyed: true,
            ..Default::default()
        };
        Ok(db::list_sandboxes(self.services.get_pool(), &filter).await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// A configuration with fast retries and health loops that never tick on their own.
pub fn config(auto_migrate: bool) -> MonoplaneConfig {
    MonoplaneConfig::builder()
        .region(RegionConfig::builder().id(REGION).name(REGION).build())
        .registry(
            RegistryConfig::builder()
                .internal(credentials("https://internal.registry.test"))
                .backup(credentials("https://backup.registry.test"))
                .build(),
        )
        .fleet(
            FleetConfig::builder()
                .health_check_interval_secs(3600)
                .unhealthy_threshold(1)
                .disable_after_secs(3600)
                .bootstrap_attempts(3)
                .bootstrap_interval_ms(10)
                .build(),
        )
        .orchestrator(
            OrchestratorConfig::builder()
                .adapter_retries(2)
                .retry_min_backoff_ms(1)
                .retry_max_backoff_ms(5)
                .auto_migrate(auto_migrate)
                .build(),
        )
        .build()
}

/// Credentials for a registry at `url` under the `monoplane` project.
pub fn credentials(url: &str) -> RegistryCredentials {
    RegistryCredentials::builder()
        .url(url)
        .project("monoplane")
        .username("admin")
        .password("registry-secret")
        .build()
}

/// Polls `check` until it holds or the deadline passes.
pub async fn eventually<F, Fut>(mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    for _ in 0..200 {
        if check().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    anyhow::bail!("condition not reached in time")
}
