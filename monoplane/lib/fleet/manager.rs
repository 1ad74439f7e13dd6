use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::Utc;
use futures::future;
use reqwest::Url;
use sqlx::{Pool, Sqlite};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::FleetConfig,
    db,
    models::{EndpointKind, Resources, Runner, RunnerState},
    region::RegionRegistry,
    utils::{self, EntityLocks},
    MonoplaneError, MonoplaneResult,
};

use super::{health, rank_candidates, AdapterFactory, FleetEvent, NewRunner, RunnerAdapter};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Buffered fleet events per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Registers runners, keeps their health current and hands out capacity.
///
/// Cloning is cheap and every clone shares the same health loops.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    pool: Pool<Sqlite>,
    config: FleetConfig,
    regions: RegionRegistry,
    adapters: Arc<dyn AdapterFactory>,
    locks: EntityLocks,
    events: broadcast::Sender<FleetEvent>,
    shutdown: CancellationToken,
    loops: Mutex<HashMap<String, HealthLoop>>,
}

struct HealthLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetManager {
    /// Creates a fleet manager. No health loop runs until a runner is registered or
    /// [`start_health_loops`](Self::start_health_loops) is called.
    pub fn new(
        pool: Pool<Sqlite>,
        config: FleetConfig,
        regions: RegionRegistry,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(FleetInner {
                pool,
                config,
                regions,
                adapters,
                locks: EntityLocks::new(),
                events,
                shutdown: CancellationToken::new(),
                loops: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a runner in `registering` and schedules its health checks.
    ///
    /// The region's proxy credential version is read once and recorded on the runner.
    pub async fn register(&self, new: NewRunner) -> MonoplaneResult<Runner> {
        if let Some(id) = &new.id {
            utils::validate_name(id)?;
        }

        if !new.capacity.is_positive() {
            return Err(MonoplaneError::Validation(format!(
                "runner capacity must be positive: {:?}",
                new.capacity
            )));
        }

        Url::parse(&new.api_url).map_err(|e| {
            MonoplaneError::Validation(format!("invalid runner api url {:?}: {e}", new.api_url))
        })?;

        self.inner.regions.get(&new.region_id).await?;
        let credential_version = self
            .inner
            .regions
            .endpoint(&new.region_id, EndpointKind::Proxy)
            .await?
            .map(|credential| credential.version);

        let now = Utc::now();
        let runner = Runner {
            id: new.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            region_id: new.region_id,
            api_url: new.api_url,
            api_key: new.api_key,
            api_version: new.api_version,
            capacity: new.capacity,
            allocated: Resources::default(),
            capacity_version: 0,
            state: RunnerState::Registering,
            consecutive_failures: 0,
            last_checked_at: None,
            unresponsive_since: None,
            region_credential_version: credential_version,
            created_at: now,
            modified_at: now,
        };

        match db::insert_runner(&self.inner.pool, &runner).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                return Err(MonoplaneError::Conflict(format!(
                    "runner {} already exists",
                    runner.id
                )))
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            runner_id = %runner.id,
            region_id = %runner.region_id,
            "registered {} runner at {}",
            runner.api_version,
            runner.api_url
        );

        self.start_health_loop(&runner.id);
        Ok(runner)
    }

    /// Probes a runner once and records the outcome. Returns the runner's resulting state.
    ///
    /// `disabled` and `decommissioned` runners are not probed.
    pub async fn health_check(&self, runner_id: &str) -> MonoplaneResult<RunnerState> {
        let _guard = self.inner.locks.lock(format!("runner:{runner_id}")).await;
        let runner = self.get(runner_id).await?;
        if !runner.state.is_monitored() {
            return Ok(runner.state);
        }

        let adapter = self.adapter_for(&runner)?;
        let outcome =
            match tokio::time::timeout(self.inner.config.health_check_timeout(), adapter.health())
                .await
            {
                Ok(result) => result,
                Err(_) => Err(MonoplaneError::Timeout(format!(
                    "health check of runner {runner_id}"
                ))),
            };

        let now = Utc::now();
        let (state, failures, unresponsive_since) = match outcome {
            Ok(()) => (RunnerState::Ready, 0, None),
            Err(e) => {
                let failures = runner.consecutive_failures + 1;
                tracing::warn!(runner_id = %runner_id, "health check {failures} failed: {e}");

                match runner.state {
                    RunnerState::Ready | RunnerState::Registering
                        if failures >= *self.inner.config.get_unhealthy_threshold() =>
                    {
                        (RunnerState::Unresponsive, failures, Some(now))
                    }
                    RunnerState::Unresponsive => {
                        let since = runner.unresponsive_since.unwrap_or(now);
                        let elapsed = (now - since).to_std().unwrap_or_default();
                        if elapsed >= self.inner.config.disable_after() {
                            (RunnerState::Disabled, failures, Some(since))
                        } else {
                            (RunnerState::Unresponsive, failures, Some(since))
                        }
                    }
                    state => (state, failures, runner.unresponsive_since),
                }
            }
        };

        db::update_runner_health(
            &self.inner.pool,
            runner_id,
            state,
            failures,
            now,
            unresponsive_since,
        )
        .await?;

        if state != runner.state {
            tracing::info!(runner_id = %runner_id, "runner {} -> {}", runner.state, state);
            let region_id = runner.region_id.clone();
            match state {
                RunnerState::Ready => self.emit(FleetEvent::RunnerReady {
                    runner_id: runner.id,
                    region_id,
                }),
                RunnerState::Unresponsive => self.emit(FleetEvent::RunnerUnresponsive {
                    runner_id: runner.id,
                    region_id,
                }),
                RunnerState::Disabled => {
                    tracing::warn!(runner_id = %runner_id, "runner disabled after sustained unresponsiveness");
                    self.emit(FleetEvent::RunnerDisabled {
                        runner_id: runner.id,
                        region_id,
                    })
                }
                _ => {}
            }
        }

        Ok(state)
    }

    /// Selects the best `ready` runner in `region_id` that can take `resources`.
    ///
    /// The choice is made on a point-in-time read and must be confirmed with
    /// [`reserve`](Self::reserve) or a reserving store write.
    pub async fn select_runner_for(
        &self,
        region_id: &str,
        resources: &Resources,
        exclude: &[String],
    ) -> MonoplaneResult<Runner> {
        let runners =
            db::list_runners_in_state(&self.inner.pool, region_id, RunnerState::Ready).await?;

        rank_candidates(runners, resources, exclude)
            .into_iter()
            .next()
            .ok_or_else(|| MonoplaneError::NoCapacity {
                region: region_id.to_string(),
                cpu: resources.cpu,
                memory: resources.memory,
                disk: resources.disk,
            })
    }

    /// Reserves `resources` on `candidate` if nothing changed its capacity since it was read.
    ///
    /// Returns `false` when the reservation lost the race. The caller should select again.
    pub async fn reserve(&self, candidate: &Runner, resources: &Resources) -> MonoplaneResult<bool> {
        let reserved = db::reserve_runner_capacity(
            &self.inner.pool,
            &candidate.id,
            candidate.capacity_version,
            resources,
        )
        .await?;

        if !reserved {
            tracing::debug!(runner_id = %candidate.id, "reservation lost at version {}", candidate.capacity_version);
        }

        Ok(reserved)
    }

    /// Returns `resources` to a runner.
    pub async fn release(&self, runner_id: &str, resources: &Resources) -> MonoplaneResult<()> {
        db::release_runner_capacity(&self.inner.pool, runner_id, resources).await
    }

    /// Takes a runner out of placement and stops its health checks.
    pub async fn disable(&self, runner_id: &str) -> MonoplaneResult<Runner> {
        let runner = {
            let _guard = self.inner.locks.lock(format!("runner:{runner_id}")).await;
            let runner = self.get(runner_id).await?;
            match runner.state {
                RunnerState::Disabled => return Ok(runner),
                RunnerState::Decommissioned => {
                    return Err(MonoplaneError::Precondition(format!(
                        "runner {runner_id} is decommissioned"
                    )))
                }
                _ => {}
            }

            db::transition_runner_state(
                &self.inner.pool,
                runner_id,
                &[
                    RunnerState::Registering,
                    RunnerState::Ready,
                    RunnerState::Unresponsive,
                ],
                RunnerState::Disabled,
            )
            .await?;
            self.get(runner_id).await?
        };

        self.stop_health_loop(runner_id);
        tracing::info!(runner_id = %runner_id, "runner disabled by operator");
        self.emit(FleetEvent::RunnerDisabled {
            runner_id: runner.id.clone(),
            region_id: runner.region_id.clone(),
        });

        Ok(runner)
    }

    /// Puts a disabled or unresponsive runner back into `registering` so it is checked again.
    pub async fn enable(&self, runner_id: &str) -> MonoplaneResult<Runner> {
        let runner = {
            let _guard = self.inner.locks.lock(format!("runner:{runner_id}")).await;
            let runner = self.get(runner_id).await?;
            match runner.state {
                RunnerState::Registering | RunnerState::Ready => return Ok(runner),
                RunnerState::Decommissioned => {
                    return Err(MonoplaneError::Precondition(format!(
                        "runner {runner_id} is decommissioned"
                    )))
                }
                _ => {}
            }

            db::transition_runner_state(
                &self.inner.pool,
                runner_id,
                &[RunnerState::Disabled, RunnerState::Unresponsive],
                RunnerState::Registering,
            )
            .await?;
            self.get(runner_id).await?
        };

        tracing::info!(runner_id = %runner_id, "runner enabled by operator");
        self.start_health_loop(runner_id);
        Ok(runner)
    }

    /// Retires a runner. Fails while any non-destroyed sandbox still references it.
    pub async fn decommission(&self, runner_id: &str) -> MonoplaneResult<Runner> {
        let runner = {
            let _guard = self.inner.locks.lock(format!("runner:{runner_id}")).await;
            let runner = self.get(runner_id).await?;
            if runner.state == RunnerState::Decommissioned {
                return Ok(runner);
            }

            let live = db::count_live_sandboxes_on_runner(&self.inner.pool, runner_id).await?;
            if live > 0 {
                return Err(MonoplaneError::Precondition(format!(
                    "runner {runner_id} still hosts {live} sandbox(es)"
                )));
            }

            db::transition_runner_state(
                &self.inner.pool,
                runner_id,
                &[
                    RunnerState::Registering,
                    RunnerState::Ready,
                    RunnerState::Unresponsive,
                    RunnerState::Disabled,
                ],
                RunnerState::Decommissioned,
            )
            .await?;
            self.get(runner_id).await?
        };

        self.stop_health_loop(runner_id);
        tracing::info!(runner_id = %runner_id, "runner decommissioned");
        Ok(runner)
    }

    /// Builds the adapter speaking `runner`'s protocol generation.
    pub fn adapter_for(&self, runner: &Runner) -> MonoplaneResult<Arc<dyn RunnerAdapter>> {
        self.inner.adapters.adapter_for(runner)
    }

    /// Gets a runner by id.
    pub async fn get(&self, runner_id: &str) -> MonoplaneResult<Runner> {
        db::get_runner(&self.inner.pool, runner_id)
            .await?
            .ok_or_else(|| MonoplaneError::not_found("runner", runner_id))
    }

    /// Lists runners, optionally restricted to one region.
    pub async fn list(&self, region_id: Option<&str>) -> MonoplaneResult<Vec<Runner>> {
        db::list_runners(&self.inner.pool, region_id).await
    }

    /// Subscribes to fleet events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    /// The fleet tuning in effect.
    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    /// Starts the health loop of every runner that is still monitored.
    pub async fn start_health_loops(&self) -> MonoplaneResult<usize> {
        let runners = self.list(None).await?;
        let mut started = 0;
        for runner in runners.iter().filter(|runner| runner.state.is_monitored()) {
            if self.start_health_loop(&runner.id) {
                started += 1;
            }
        }

        tracing::info!("started {started} health loop(s)");
        Ok(started)
    }

    /// The number of health loops still running.
    pub fn active_health_loops(&self) -> usize {
        self.loops()
            .values()
            .filter(|health_loop| !health_loop.handle.is_finished())
            .count()
    }

    /// The token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancels every health loop and waits until all of them have exited.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let loops: Vec<(String, HealthLoop)> = self.loops().drain().collect();
        let exits = loops.into_iter().map(|(runner_id, health_loop)| async move {
            health_loop.token.cancel();
            if let Err(e) = health_loop.handle.await {
                tracing::error!(runner_id = %runner_id, "health loop ended abnormally: {e}");
            }
        });
        future::join_all(exits).await;

        tracing::info!("fleet manager shut down");
    }

    fn start_health_loop(&self, runner_id: &str) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        let mut loops = self.loops();
        if loops
            .get(runner_id)
            .is_some_and(|health_loop| !health_loop.handle.is_finished())
        {
            return false;
        }

        let token = self.inner.shutdown.child_token();
        let handle = tokio::spawn(health::run_health_loop(
            self.clone(),
            runner_id.to_string(),
            token.clone(),
        ));

        loops.insert(runner_id.to_string(), HealthLoop { token, handle });
        true
    }

    fn stop_health_loop(&self, runner_id: &str) {
        if let Some(health_loop) = self.loops().remove(runner_id) {
            health_loop.token.cancel();
        }
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.inner.events.send(event);
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<String, HealthLoop>> {
        self.inner
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetManager")
            .field("config", &self.inner.config)
            .field("active_health_loops", &self.active_health_loops())
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::{
        db::{init_db, CONTROL_DB_MIGRATOR},
        fleet::{InMemoryRunnerAdapter, StaticAdapterFactory},
        region::NewRegion,
    };

    struct Fixture {
        _dir: TempDir,
        fleet: FleetManager,
        adapters: Arc<StaticAdapterFactory>,
    }

    impl Fixture {
        async fn new(config: FleetConfig) -> anyhow::Result<Self> {
            let dir = tempdir()?;
            let pool = init_db(dir.path().join("control.db"), &CONTROL_DB_MIGRATOR).await?;
            let regions = RegionRegistry::new(pool.clone());
            regions
                .create(NewRegion::builder().id("eu").name("eu").build(), None)
                .await?;

            let adapters = Arc::new(StaticAdapterFactory::new());
            let fleet = FleetManager::new(pool, config, regions, adapters.clone());

            Ok(Self {
                _dir: dir,
                fleet,
                adapters,
            })
        }

        async fn runner(&self, id: &str) -> anyhow::Result<InMemoryRunnerAdapter> {
            let adapter = InMemoryRunnerAdapter::new(id);
            self.adapters.insert(id, Arc::new(adapter.clone()));
            self.fleet
                .register(
                    NewRunner::builder()
                        .id(id)
                        .region_id("eu")
                        .api_url(format!("http://{id}.runners.test"))
                        .api_key("key")
                        .capacity(Resources::new(8, 16, 100))
                        .build(),
                )
                .await?;
            Ok(adapter)
        }
    }

    fn quiet_config() -> FleetConfig {
        FleetConfig::builder()
            .health_check_interval_secs(3600)
            .unhealthy_threshold(2)
            .disable_after_secs(0)
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_fleet_health_check_promotes_registering_runner() -> anyhow::Result<()> {
        let fixture = Fixture::new(quiet_config()).await?;
        let mut events = fixture.fleet.subscribe();
        fixture.runner("r1").await?;

        assert_eq!(fixture.fleet.get("r1").await?.state, RunnerState::Registering);
        assert_eq!(fixture.fleet.health_check("r1").await?, RunnerState::Ready);
        assert_eq!(
            events.recv().await?,
            FleetEvent::RunnerReady {
                runner_id: "r1".to_string(),
                region_id: "eu".to_string(),
            }
        );

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fleet_failures_lead_to_unresponsive_then_disabled() -> anyhow::Result<()> {
        let fixture = Fixture::new(quiet_config()).await?;
        let adapter = fixture.runner("r1").await?;
        fixture.fleet.health_check("r1").await?;

        let mut events = fixture.fleet.subscribe();
        adapter.set_healthy(false);

        assert_eq!(fixture.fleet.health_check("r1").await?, RunnerState::Ready);
        assert_eq!(fixture.fleet.get("r1").await?.consecutive_failures, 1);

        assert_eq!(
            fixture.fleet.health_check("r1").await?,
            RunnerState::Unresponsive
        );
        assert!(matches!(
            events.recv().await?,
            FleetEvent::RunnerUnresponsive { .. }
        ));
        assert!(fixture.fleet.get("r1").await?.unresponsive_since.is_some());

        assert_eq!(fixture.fleet.health_check("r1").await?, RunnerState::Disabled);
        assert!(matches!(
            events.recv().await?,
            FleetEvent::RunnerDisabled { .. }
        ));

        // Disabled runners are no longer probed and do not recover on their own.
        let probes = adapter.health_checks();
        adapter.set_healthy(true);
        assert_eq!(fixture.fleet.health_check("r1").await?, RunnerState::Disabled);
        assert_eq!(adapter.health_checks(), probes);

        fixture.fleet.enable("r1").await?;
        assert_eq!(fixture.fleet.health_check("r1").await?, RunnerState::Ready);

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fleet_recovers_unresponsive_runner() -> anyhow::Result<()> {
        let config = FleetConfig::builder()
            .health_check_interval_secs(3600)
            .unhealthy_threshold(1)
            .build();
        let fixture = Fixture::new(config).await?;
        let adapter = fixture.runner("r1").await?;

        adapter.set_healthy(false);
        assert_eq!(
            fixture.fleet.health_check("r1").await?,
            RunnerState::Unresponsive
        );

        adapter.set_healthy(true);
        assert_eq!(fixture.fleet.health_check("r1").await?, RunnerState::Ready);
        let runner = fixture.fleet.get("r1").await?;
        assert_eq!(runner.consecutive_failures, 0);
        assert!(runner.unresponsive_since.is_none());

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fleet_selection_and_reservation() -> anyhow::Result<()> {
        let fixture = Fixture::new(quiet_config()).await?;
        for id in ["r1", "r2", "r3"] {
            fixture.runner(id).await?;
            fixture.fleet.health_check(id).await?;
        }

        let request = Resources::new(2, 4, 10);
        let r1 = fixture.fleet.select_runner_for("eu", &request, &[]).await?;
        assert_eq!(r1.id, "r1");

        assert!(fixture.fleet.reserve(&r1, &request).await?);
        // The same point-in-time read cannot reserve twice.
        assert!(!fixture.fleet.reserve(&r1, &request).await?);

        let next = fixture.fleet.select_runner_for("eu", &request, &[]).await?;
        assert_eq!(next.id, "r2");

        let excluded = fixture
            .fleet
            .select_runner_for("eu", &request, &["r2".to_string()])
            .await?;
        assert_eq!(excluded.id, "r3");

        let err = fixture
            .fleet
            .select_runner_for("eu", &Resources::new(64, 1, 1), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::NoCapacity { .. }));
        assert!(err.is_transient());

        fixture.fleet.release("r1", &request).await?;
        fixture.fleet.release("r1", &request).await?;
        assert_eq!(fixture.fleet.get("r1").await?.allocated, Resources::default());

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fleet_register_validates_input() -> anyhow::Result<()> {
        let fixture = Fixture::new(quiet_config()).await?;

        let err = fixture
            .fleet
            .register(
                NewRunner::builder()
                    .region_id("nowhere")
                    .api_url("http://r1.runners.test")
                    .api_key("key")
                    .capacity(Resources::new(1, 1, 1))
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::NotFound { .. }));

        let err = fixture
            .fleet
            .register(
                NewRunner::builder()
                    .region_id("eu")
                    .api_url("http://r1.runners.test")
                    .api_key("key")
                    .capacity(Resources::new(0, 1, 1))
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Validation(_)));

        fixture.runner("r1").await?;
        let err = fixture.runner("r1").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MonoplaneError>(),
            Some(MonoplaneError::Conflict(_))
        ));

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fleet_decommission_stops_monitoring() -> anyhow::Result<()> {
        let fixture = Fixture::new(quiet_config()).await?;
        let adapter = fixture.runner("r1").await?;
        assert_eq!(fixture.fleet.active_health_loops(), 1);

        let runner = fixture.fleet.decommission("r1").await?;
        assert_eq!(runner.state, RunnerState::Decommissioned);

        let probes = adapter.health_checks();
        assert_eq!(
            fixture.fleet.health_check("r1").await?,
            RunnerState::Decommissioned
        );
        assert_eq!(adapter.health_checks(), probes);

        let err = fixture.fleet.enable("r1").await.unwrap_err();
        assert!(matches!(err, MonoplaneError::Precondition(_)));

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fleet_shutdown_stops_every_health_loop() -> anyhow::Result<()> {
        let fixture = Fixture::new(quiet_config()).await?;
        fixture.runner("r1").await?;
        fixture.runner("r2").await?;
        assert_eq!(fixture.fleet.active_health_loops(), 2);

        fixture.fleet.shutdown().await;
        assert_eq!(fixture.fleet.active_health_loops(), 0);

        // Nothing new is scheduled once shut down.
        assert_eq!(fixture.fleet.start_health_loops().await?, 0);
        assert_eq!(fixture.fleet.active_health_loops(), 0);

        Ok(())
    }
}
