use super::{utils, Orchestrator};
use crate::{
    fleet::{DesiredState, SandboxSource},
    models::{Runner, Sandbox, SandboxState},
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Moves a sandbox off its current runner onto another ready runner in the same region.
    ///
    /// The sandbox is replayed from its latest backup when it has one and from its snapshot
    /// otherwise, then settles back in `started` or `stopped`. The old runner is never contacted
    /// and never used again by this sandbox, even when the replay fails.
    pub async fn migrate(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;

        let Some(old_runner_id) = sandbox.runner_id.clone() else {
            return Err(MonoplaneError::Precondition(format!(
                "sandbox {sandbox_id} has no runner to migrate from"
            )));
        };
        if !sandbox.state.can_transition_to(SandboxState::Restoring) {
            return Err(MonoplaneError::InvalidTransition {
                sandbox: sandbox.id,
                from: sandbox.state.to_string(),
                to: SandboxState::Restoring.to_string(),
            });
        }

        let exclude = [old_runner_id.clone()];
        let source = self.sandbox_source(&sandbox).await?;
        self.fleet
            .select_runner_for(&sandbox.region_id, &sandbox.resources, &exclude)
            .await
            .map_err(|e| no_target(&sandbox, e))?;

        let resume = utils::resume_state(&sandbox);
        self.release_reservation(&mut sandbox).await?;
        sandbox.prev_runner_id = Some(old_runner_id.clone());
        sandbox.state = SandboxState::Restoring;
        sandbox.desired_state = resume;

        let runner = match self.place(&mut sandbox, &exclude).await {
            Ok(runner) => runner,
            Err(e) => {
                sandbox.runner_id = None;
                let cause = no_target(&sandbox, e);
                return Err(self.fail(&mut sandbox, cause).await);
            }
        };
        tracing::info!(
            sandbox_id = %sandbox.id,
            runner_id = %runner.id,
            "migrating sandbox off runner {old_runner_id}"
        );

        if let Err(e) = self.replay(&mut sandbox, &runner, source, resume).await {
            return Err(self.fail(&mut sandbox, e).await);
        }

        Ok(sandbox)
    }

    async fn replay(
        &self,
        sandbox: &mut Sandbox,
        runner: &Runner,
        source: SandboxSource,
        resume: SandboxState,
    ) -> MonoplaneResult<()> {
        if let SandboxSource::Snapshot { image, registry } = &source {
            let pull = DesiredState::SnapshotPulled {
                image: image.clone(),
                source: registry.clone(),
                destination: None,
            };
            self.realize(runner, &pull).await?;
        }

        let start = DesiredState::SandboxStarted {
            sandbox_id: sandbox.id.clone(),
            source,
            resources: sandbox.resources,
        };
        self.realize(runner, &start).await?;

        if resume == SandboxState::Stopped {
            let stop = DesiredState::SandboxStopped {
                sandbox_id: sandbox.id.clone(),
            };
            self.realize(runner, &stop).await?;
        }

        self.transition(sandbox, resume).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn no_target(sandbox: &Sandbox, error: MonoplaneError) -> MonoplaneError {
    match error {
        MonoplaneError::NoCapacity { region, .. } => MonoplaneError::Precondition(format!(
            "no other runner in region {region} can take sandbox {}",
            sandbox.id
        )),
        e => e,
    }
}
