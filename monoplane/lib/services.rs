use std::{path::Path, sync::Arc};

use getset::Getters;
use sqlx::{Pool, Sqlite};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::{
    config::MonoplaneConfig,
    db::{self, CONTROL_DB_MIGRATOR},
    fleet::{AdapterFactory, AdapterSettings, DefaultAdapterFactory, FleetManager},
    orchestration::Orchestrator,
    region::RegionRegistry,
    snapshot::{HarborRegistryProvider, RegistryProvider, SnapshotPipeline},
    utils::backoff_policy,
    MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The wired-up control plane components, sharing one store.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Services {
    /// The store.
    pool: Pool<Sqlite>,

    /// The region registry.
    regions: RegionRegistry,

    /// The runner fleet manager.
    fleet: FleetManager,

    /// The snapshot pipeline.
    snapshots: SnapshotPipeline,

    /// The sandbox orchestrator.
    orchestrator: Orchestrator,

    /// Background tasks joined by [`Services::shutdown`] before the store closes.
    tasks: TaskTracker,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Services {
    /// Opens the store under `home` (unless configured elsewhere), applies migrations and builds
    /// every component with the HTTP runner adapters and the Harbor registry provider.
    pub async fn open(config: &MonoplaneConfig, home: impl AsRef<Path>) -> MonoplaneResult<Self> {
        let pool = db::init_db(config.database_path(home), &CONTROL_DB_MIGRATOR).await?;

        let fleet = config.get_fleet();
        let orchestrator = config.get_orchestrator();
        let adapters = Arc::new(DefaultAdapterFactory::new(AdapterSettings::from_config(
            config,
        )));
        let provider = Arc::new(HarborRegistryProvider::new(
            fleet.operation_timeout(),
            *fleet.get_http_retries(),
            orchestrator.retry_min_backoff(),
            orchestrator.retry_max_backoff(),
        )?);

        Ok(Self::with_parts(pool, config, adapters, provider))
    }

    /// Builds every component over an open store with the given runner adapters and registry
    /// provider.
    pub fn with_parts(
        pool: Pool<Sqlite>,
        config: &MonoplaneConfig,
        adapters: Arc<dyn AdapterFactory>,
        provider: Arc<dyn RegistryProvider>,
    ) -> Self {
        let orchestrator_config = config.get_orchestrator().clone();
        let retry = backoff_policy(
            *orchestrator_config.get_adapter_retries(),
            orchestrator_config.retry_min_backoff(),
            orchestrator_config.retry_max_backoff(),
        );

        let regions = RegionRegistry::new(pool.clone());
        let fleet = FleetManager::new(
            pool.clone(),
            config.get_fleet().clone(),
            regions.clone(),
            adapters,
        );
        let snapshots = SnapshotPipeline::new(
            pool.clone(),
            config.get_snapshots().clone(),
            regions.clone(),
            fleet.clone(),
            provider,
            retry,
        );
        let orchestrator = Orchestrator::new(
            pool.clone(),
            orchestrator_config,
            regions.clone(),
            fleet.clone(),
            snapshots.clone(),
        );

        Self {
            pool,
            regions,
            fleet,
            snapshots,
            orchestrator,
            tasks: TaskTracker::new(),
        }
    }

    /// Starts a health loop for every monitored runner and the auto-migration task.
    ///
    /// Both stop on [`Services::shutdown`].
    pub async fn start(&self) -> MonoplaneResult<JoinHandle<()>> {
        let loops = self.fleet.start_health_loops().await?;
        tracing::info!("started {loops} runner health loops");

        Ok(self
            .orchestrator
            .spawn_auto_migration(&self.tasks, self.fleet.shutdown_token().child_token()))
    }

    /// Stops every background task and closes the store.
    ///
    /// Health loops are cancelled first. Tracked tasks then finish the work they are doing,
    /// against an open store, before the pool is closed.
    pub async fn shutdown(&self) {
        self.fleet.shutdown().await;

        self.tasks.close();
        tracing::debug!("waiting for {} background task(s)", self.tasks.len());
        self.tasks.wait().await;

        self.pool.close().await;
        tracing::info!("monoplane services stopped");
    }
}
