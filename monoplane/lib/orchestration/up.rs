use chrono::Utc;

use super::{CreateSandbox, Orchestrator};
use crate::{
    db,
    fleet::{DesiredState, PushTarget, SandboxSource},
    models::{Runner, Sandbox, SandboxState, Snapshot, SnapshotState},
    snapshot::RegionImage,
    utils::validate_name,
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates a sandbox from a snapshot and starts it.
    ///
    /// The sandbox row is only written together with a successful capacity reservation, so a
    /// placement failure leaves nothing behind. Failures after placement land in `error`.
    pub async fn create(&self, request: CreateSandbox) -> MonoplaneResult<Sandbox> {
        let id = match request.id {
            Some(id) => {
                validate_name(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let _guard = self.lock(&id).await;

        let region = self.regions.get(&request.region_id).await?;
        if !region.is_usable_by(&request.tenant_id) {
            return Err(MonoplaneError::Precondition(format!(
                "region {} is not available to tenant {}",
                region.id, request.tenant_id
            )));
        }

        let snapshot = self
            .resolve_snapshot(&request.tenant_id, &request.snapshot)
            .await?;
        if snapshot.state != SnapshotState::Active
            || !self.snapshots.is_available_in(&snapshot.id, &region.id).await?
        {
            return Err(MonoplaneError::SnapshotUnavailable {
                snapshot: snapshot.id,
                region: region.id,
            });
        }

        let resources = request.resources.unwrap_or(snapshot.footprint);
        if !resources.is_positive() {
            return Err(MonoplaneError::Validation(format!(
                "sandbox {id} must request positive resources"
            )));
        }

        let image = self.snapshots.image_in_region(&snapshot, &region.id).await?;

        let now = Utc::now();
        let mut sandbox = Sandbox {
            id,
            tenant_id: request.tenant_id,
            region_id: region.id,
            runner_id: None,
            prev_runner_id: None,
            snapshot_id: snapshot.id.clone(),
            resources,
            state: SandboxState::PullingSnapshot,
            desired_state: SandboxState::Started,
            capacity_reserved: true,
            backup_image: None,
            backup_registry_id: None,
            last_backup_at: None,
            error_reason: None,
            created_at: now,
            modified_at: now,
        };

        let runner = self.insert_placed(&mut sandbox).await?;
        tracing::info!(
            sandbox_id = %sandbox.id,
            runner_id = %runner.id,
            region_id = %sandbox.region_id,
            "created sandbox from snapshot {}",
            snapshot.name
        );

        if let Err(e) = self.provision(&mut sandbox, &runner, &snapshot, image).await {
            return Err(self.fail(&mut sandbox, e).await);
        }

        Ok(sandbox)
    }

    /// Starts a stopped sandbox. Starting a started sandbox is a no-op.
    pub async fn start(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;
        if sandbox.state == SandboxState::Started {
            return Ok(sandbox);
        }

        if !matches!(sandbox.state, SandboxState::Stopped | SandboxState::BackedUp) {
            return Err(MonoplaneError::InvalidTransition {
                sandbox: sandbox.id,
                from: sandbox.state.to_string(),
                to: SandboxState::Started.to_string(),
            });
        }

        let runner = self.current_runner(&sandbox).await?;
        let source = self.sandbox_source(&sandbox).await?;

        sandbox.desired_state = SandboxState::Started;
        self.persist(&mut sandbox).await?;

        let desired = DesiredState::SandboxStarted {
            sandbox_id: sandbox.id.clone(),
            source,
            resources: sandbox.resources,
        };
        if let Err(e) = self.realize(&runner, &desired).await {
            return Err(self.fail(&mut sandbox, e).await);
        }

        self.transition(&mut sandbox, SandboxState::Started).await?;
        Ok(sandbox)
    }

    /// Brings an archived sandbox back onto a runner from its latest backup.
    ///
    /// A sandbox in `error` can be restored too, as long as it was backed up before.
    pub async fn restore(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;

        match sandbox.state {
            SandboxState::Archived => {}
            SandboxState::Error if sandbox.backup_image.is_some() => {}
            SandboxState::Error => {
                return Err(MonoplaneError::Precondition(format!(
                    "sandbox {sandbox_id} has no backup to restore from"
                )));
            }
            state => {
                return Err(MonoplaneError::InvalidTransition {
                    sandbox: sandbox.id,
                    from: state.to_string(),
                    to: SandboxState::Restoring.to_string(),
                });
            }
        }

        let source = self.sandbox_source(&sandbox).await?;

        // A failed sandbox may still be hosted by its old runner.
        if let Some(old_runner) = self.reachable_runner(&sandbox).await? {
            let desired = DesiredState::SandboxDestroyed {
                sandbox_id: sandbox.id.clone(),
            };
            self.realize(&old_runner, &desired).await?;
        }

        if sandbox.runner_id.is_some() {
            self.release_reservation(&mut sandbox).await?;
            sandbox.prev_runner_id = sandbox.runner_id.take();
            self.persist(&mut sandbox).await?;
        }

        sandbox.state = SandboxState::Restoring;
        sandbox.desired_state = SandboxState::Started;
        let runner = self.place(&mut sandbox, &[]).await?;
        tracing::info!(sandbox_id = %sandbox.id, runner_id = %runner.id, "restoring sandbox");

        let desired = DesiredState::SandboxStarted {
            sandbox_id: sandbox.id.clone(),
            source,
            resources: sandbox.resources,
        };
        if let Err(e) = self.realize(&runner, &desired).await {
            return Err(self.fail(&mut sandbox, e).await);
        }

        self.transition(&mut sandbox, SandboxState::Started).await?;
        Ok(sandbox)
    }

    /// Selects a runner and inserts the sandbox with its reservation in one transaction.
    async fn insert_placed(&self, sandbox: &mut Sandbox) -> MonoplaneResult<Runner> {
        let attempts = *self.config.get_placement_attempts();
        for attempt in 0..=attempts {
            let runner = self
                .fleet
                .select_runner_for(&sandbox.region_id, &sandbox.resources, &[])
                .await?;
            sandbox.runner_id = Some(runner.id.clone());

            let inserted = db::insert_sandbox_with_reservation(
                &self.pool,
                sandbox,
                runner.capacity_version,
            )
            .await
            .map_err(|e| {
                if e.is_unique_violation() {
                    MonoplaneError::Conflict(format!("sandbox {} already exists", sandbox.id))
                } else {
                    e
                }
            })?;

            if inserted {
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

    /// Pulls (and builds) the snapshot on the runner, then starts the sandbox.
    async fn provision(
        &self,
        sandbox: &mut Sandbox,
        runner: &Runner,
        snapshot: &Snapshot,
        image: RegionImage,
    ) -> MonoplaneResult<()> {
        let pull = DesiredState::SnapshotPulled {
            image: image.image.clone(),
            source: Some(image.registry.clone()),
            destination: None,
        };
        self.realize(runner, &pull).await?;

        if let Some(dockerfile) = &snapshot.build_context {
            self.transition(sandbox, SandboxState::BuildingSnapshot)
                .await?;

            let build = DesiredState::SnapshotBuilt {
                snapshot_id: snapshot.id.clone(),
                dockerfile: dockerfile.clone(),
                destination: PushTarget {
                    image: image.image.clone(),
                    registry: image.registry.clone(),
                },
            };
            self.realize(runner, &build).await?;
        }

        let start = DesiredState::SandboxStarted {
            sandbox_id: sandbox.id.clone(),
            source: SandboxSource::Snapshot {
                image: image.image,
                registry: Some(image.registry),
            },
            resources: sandbox.resources,
        };
        self.realize(runner, &start).await?;

        self.transition(sandbox, SandboxState::Started).await
    }
}
