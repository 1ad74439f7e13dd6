use chrono::Utc;
use reqwest_retry::policies::ExponentialBackoff;
use sqlx::{Pool, Sqlite};
use typed_builder::TypedBuilder;

use crate::{
    config::OrchestratorConfig,
    db::{self, SandboxFilter},
    fleet::{DesiredState, FleetManager, RegistryAuth, SandboxSource},
    models::{Resources, Runner, RunnerState, Sandbox, SandboxState, Snapshot},
    region::RegionRegistry,
    snapshot::SnapshotPipeline,
    utils::{backoff_policy, retry_transient, EntityGuard, EntityLocks},
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives sandboxes through their lifecycle on the runner fleet.
///
/// Every operation on one sandbox holds that sandbox's lock for its whole duration, so operations
/// on the same sandbox never interleave. No lock is held on runners while talking to them.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    pub(super) pool: Pool<Sqlite>,
    pub(super) config: OrchestratorConfig,
    pub(super) regions: RegionRegistry,
    pub(super) fleet: FleetManager,
    pub(super) snapshots: SnapshotPipeline,
    pub(super) retry: ExponentialBackoff,
    pub(super) locks: EntityLocks,
}

/// A sandbox creation request.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CreateSandbox {
    /// The sandbox id. Generated when not given.
    #[builder(default, setter(strip_option, into))]
    pub id: Option<String>,

    /// The owning tenant.
    #[builder(setter(into))]
    pub tenant_id: String,

    /// The region to place the sandbox in.
    #[builder(setter(into))]
    pub region_id: String,

    /// The source snapshot, by id or by name.
    #[builder(setter(into))]
    pub snapshot: String,

    /// Requested resources. Defaults to the snapshot's footprint.
    #[builder(default, setter(strip_option))]
    pub resources: Option<Resources>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates an orchestrator.
    pub fn new(
        pool: Pool<Sqlite>,
        config: OrchestratorConfig,
        regions: RegionRegistry,
        fleet: FleetManager,
        snapshots: SnapshotPipeline,
    ) -> Self {
        let retry = backoff_policy(
            *config.get_adapter_retries(),
            config.retry_min_backoff(),
            config.retry_max_backoff(),
        );

        Self {
            pool,
            config,
            regions,
            fleet,
            snapshots,
            retry,
            locks: EntityLocks::new(),
        }
    }

    /// Gets a sandbox by id.
    pub async fn get(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        db::get_sandbox(&self.pool, sandbox_id)
            .await?
            .ok_or_else(|| MonoplaneError::not_found("sandbox", sandbox_id))
    }

    /// Lists sandboxes matching `filter`, oldest first.
    pub async fn list(&self, filter: &SandboxFilter) -> MonoplaneResult<Vec<Sandbox>> {
        db::list_sandboxes(&self.pool, filter).await
    }

    pub(super) async fn lock(&self, sandbox_id: &str) -> EntityGuard {
        self.locks.lock(format!("sandbox:{sandbox_id}")).await
    }

    /// Validates and persists `sandbox.state -> to`.
    pub(super) async fn transition(
        &self,
        sandbox: &mut Sandbox,
        to: SandboxState,
    ) -> MonoplaneResult<()> {
        if !sandbox.state.can_transition_to(to) {
            return Err(MonoplaneError::InvalidTransition {
                sandbox: sandbox.id.clone(),
                from: sandbox.state.to_string(),
                to: to.to_string(),
            });
        }

        tracing::info!(sandbox_id = %sandbox.id, "sandbox {} -> {}", sandbox.state, to);
        sandbox.state = to;
        self.persist(sandbox).await
    }

    pub(super) async fn persist(&self, sandbox: &mut Sandbox) -> MonoplaneResult<()> {
        sandbox.modified_at = Utc::now();
        db::update_sandbox(&self.pool, sandbox).await
    }

    /// Moves the sandbox to `error` after `cause`.
    ///
    /// A runner refusal also returns the sandbox's reservation. Returns `cause` for chaining.
    pub(super) async fn fail(&self, sandbox: &mut Sandbox, cause: MonoplaneError) -> MonoplaneError {
        tracing::error!(sandbox_id = %sandbox.id, "sandbox failed in {}: {cause}", sandbox.state);

        if matches!(cause, MonoplaneError::RunnerRejected { .. }) {
            if let Err(e) = self.release_reservation(sandbox).await {
                tracing::error!(sandbox_id = %sandbox.id, "could not release reservation: {e}");
            }
        }

        if let Err(e) = self.mark_error(sandbox, cause.to_string()).await {
            tracing::error!(sandbox_id = %sandbox.id, "could not record failure: {e}");
        }

        cause
    }

    pub(super) async fn mark_error(
        &self,
        sandbox: &mut Sandbox,
        reason: String,
    ) -> MonoplaneResult<()> {
        if sandbox.state.is_terminal() {
            return Ok(());
        }

        tracing::info!(sandbox_id = %sandbox.id, "sandbox {} -> error", sandbox.state);
        sandbox.state = SandboxState::Error;
        sandbox.error_reason = Some(reason);
        self.persist(sandbox).await
    }

    /// Returns the sandbox's reservation to its runner, once.
    pub(super) async fn release_reservation(&self, sandbox: &mut Sandbox) -> MonoplaneResult<()> {
        let Some(runner_id) = sandbox.runner_id.clone() else {
            return Ok(());
        };

        if db::release_sandbox_reservation(&self.pool, &sandbox.id, &runner_id, &sandbox.resources)
            .await?
        {
            tracing::debug!(sandbox_id = %sandbox.id, runner_id = %runner_id, "released {:?}", sandbox.resources);
        }

        sandbox.capacity_reserved = false;
        Ok(())
    }

    /// Reserves a runner in the sandbox's region and makes it the current runner.
    ///
    /// The sandbox's `state`, `desired_state` and `prev_runner_id` are written along with the
    /// reservation. Selection is repeated when another placement wins the reservation race.
    pub(super) async fn place(
        &self,
        sandbox: &mut Sandbox,
        exclude: &[String],
    ) -> MonoplaneResult<Runner> {
        let attempts = *self.config.get_placement_attempts();
        for attempt in 0..=attempts {
            let runner = self
                .fleet
                .select_runner_for(&sandbox.region_id, &sandbox.resources, exclude)
                .await?;

            if db::assign_sandbox_runner(&self.pool, sandbox, &runner.id, runner.capacity_version)
                .await?
            {
                sandbox.runner_id = Some(runner.id.clone());
                sandbox.capacity_reserved = true;
                sandbox.error_reason = None;
                tracing::info!(sandbox_id = %sandbox.id, runner_id = %runner.id, "placed sandbox");
                return Ok(runner);
            }

            tracing::debug!(sandbox_id = %sandbox.id, runner_id = %runner.id, "lost reservation race (attempt {})", attempt + 1);
        }

        Err(MonoplaneError::Unavailable(format!(
            "sandbox {} lost the reservation race {} times",
            sandbox.id,
            attempts + 1
        )))
    }

    /// The sandbox's current runner.
    pub(super) async fn current_runner(&self, sandbox: &Sandbox) -> MonoplaneResult<Runner> {
        match &sandbox.runner_id {
            Some(runner_id) => self.fleet.get(runner_id).await,
            None => Err(MonoplaneError::Precondition(format!(
                "sandbox {} has no runner",
                sandbox.id
            ))),
        }
    }

    /// Drives `runner` to `desired`, retrying transient failures.
    pub(super) async fn realize(&self, runner: &Runner, desired: &DesiredState) -> MonoplaneResult<()> {
        let adapter = self.fleet.adapter_for(runner)?;
        let label = format!("{} on runner {}", desired.kind(), runner.id);

        tracing::debug!(runner_id = %runner.id, "realizing {}", desired.kind());
        retry_transient(&self.retry, &label, || adapter.realize(desired)).await
    }

    /// Resolves `reference` as a snapshot id, then as a name of the tenant, then as a
    /// platform-wide name.
    pub(super) async fn resolve_snapshot(
        &self,
        tenant_id: &str,
        reference: &str,
    ) -> MonoplaneResult<Snapshot> {
        if let Some(snapshot) = db::get_snapshot(&self.pool, reference).await? {
            if snapshot.tenant_id.as_deref().map_or(true, |owner| owner == tenant_id) {
                return Ok(snapshot);
            }
        }

        if let Some(snapshot) = self.snapshots.find_by_name(Some(tenant_id), reference).await? {
            return Ok(snapshot);
        }

        self.snapshots
            .find_by_name(None, reference)
            .await?
            .ok_or_else(|| MonoplaneError::not_found("snapshot", reference))
    }

    /// Where the sandbox is started from: its latest backup if it has one, else its snapshot.
    ///
    /// The snapshot is only read when there is no backup, so a backed-up sandbox outlives the
    /// snapshot it was created from.
    pub(super) async fn sandbox_source(&self, sandbox: &Sandbox) -> MonoplaneResult<SandboxSource> {
        if let (Some(image), Some(registry_id)) = (&sandbox.backup_image, &sandbox.backup_registry_id)
        {
            let registry = self.snapshots.resolver().get(registry_id).await?;
            return Ok(SandboxSource::Backup {
                image: image.clone(),
                registry: Some(RegistryAuth::from(&registry)),
            });
        }

        let snapshot = self.snapshots.get(&sandbox.snapshot_id).await?;
        let image = self
            .snapshots
            .image_in_region(&snapshot, &sandbox.region_id)
            .await?;
        Ok(SandboxSource::Snapshot {
            image: image.image,
            registry: Some(image.registry),
        })
    }

    /// The sandbox's runner if it can be asked to act on the sandbox, else `None`.
    ///
    /// Runners that are unresponsive, disabled or gone are skipped with a warning.
    pub(super) async fn reachable_runner(&self, sandbox: &Sandbox) -> MonoplaneResult<Option<Runner>> {
        let Some(runner_id) = &sandbox.runner_id else {
            return Ok(None);
        };

        match self.fleet.get(runner_id).await {
            Ok(runner) if matches!(runner.state, RunnerState::Ready | RunnerState::Registering) => {
                Ok(Some(runner))
            }
            Ok(runner) => {
                tracing::warn!(
                    sandbox_id = %sandbox.id,
                    runner_id = %runner.id,
                    "runner is {}, skipping remote call",
                    runner.state
                );
                Ok(None)
            }
            Err(MonoplaneError::NotFound { .. }) => {
                tracing::warn!(sandbox_id = %sandbox.id, runner_id = %runner_id, "runner no longer exists, skipping remote call");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
