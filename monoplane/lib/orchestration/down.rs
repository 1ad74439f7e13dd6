use super::Orchestrator;
use crate::{
    fleet::DesiredState,
    models::{Sandbox, SandboxState},
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Stops a started sandbox. Stopping a stopped sandbox is a no-op.
    pub async fn stop(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;
        if sandbox.state == SandboxState::Stopped {
            return Ok(sandbox);
        }

        if sandbox.state != SandboxState::Started {
            return Err(MonoplaneError::InvalidTransition {
                sandbox: sandbox.id,
                from: sandbox.state.to_string(),
                to: SandboxState::Stopped.to_string(),
            });
        }

        let runner = self.current_runner(&sandbox).await?;
        sandbox.desired_state = SandboxState::Stopped;
        self.persist(&mut sandbox).await?;

        let desired = DesiredState::SandboxStopped {
            sandbox_id: sandbox.id.clone(),
        };
        if let Err(e) = self.realize(&runner, &desired).await {
            return Err(self.fail(&mut sandbox, e).await);
        }

        self.transition(&mut sandbox, SandboxState::Stopped).await?;
        Ok(sandbox)
    }

    /// Removes a backed-up sandbox from its runner, keeping only the backup.
    pub async fn archive(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;
        if sandbox.state != SandboxState::BackedUp {
            return Err(MonoplaneError::InvalidTransition {
                sandbox: sandbox.id,
                from: sandbox.state.to_string(),
                to: SandboxState::Archived.to_string(),
            });
        }

        let runner = self.current_runner(&sandbox).await?;
        sandbox.desired_state = SandboxState::Archived;
        self.persist(&mut sandbox).await?;

        let desired = DesiredState::SandboxDestroyed {
            sandbox_id: sandbox.id.clone(),
        };
        if let Err(e) = self.realize(&runner, &desired).await {
            return Err(self.fail(&mut sandbox, e).await);
        }

        self.release_reservation(&mut sandbox).await?;
        sandbox.prev_runner_id = sandbox.runner_id.take();
        self.transition(&mut sandbox, SandboxState::Archived).await?;
        Ok(sandbox)
    }

    /// Destroys a sandbox and returns its capacity.
    ///
    /// Destroying a destroyed sandbox succeeds without doing anything. The runner is only asked
    /// to remove the sandbox while it is reachable; a runner that lost the sandbox already counts
    /// as success.
    pub async fn destroy(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;
        if sandbox.state == SandboxState::Destroyed {
            return Ok(sandbox);
        }

        sandbox.desired_state = SandboxState::Destroyed;
        if let Some(runner) = self.reachable_runner(&sandbox).await? {
            let desired = DesiredState::SandboxDestroyed {
                sandbox_id: sandbox.id.clone(),
            };
            if let Err(e) = self.realize(&runner, &desired).await {
                return Err(self.fail(&mut sandbox, e).await);
            }
        }

        self.release_reservation(&mut sandbox).await?;
        if sandbox.runner_id.is_some() {
            sandbox.prev_runner_id = sandbox.runner_id.take();
        }
        self.transition(&mut sandbox, SandboxState::Destroyed).await?;
        Ok(sandbox)
    }
}
