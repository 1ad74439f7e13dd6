use chrono::Utc;

use super::{utils, Orchestrator};
use crate::{
    fleet::{DesiredState, PushTarget, RegistryAuth},
    models::{Sandbox, SandboxState},
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Pushes a stopped sandbox's filesystem to the region's backup registry.
    ///
    /// Every backup gets its own tag. The previous backup stays in the registry.
    pub async fn backup(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;
        if !matches!(sandbox.state, SandboxState::Stopped | SandboxState::BackedUp) {
            return Err(MonoplaneError::InvalidTransition {
                sandbox: sandbox.id,
                from: sandbox.state.to_string(),
                to: SandboxState::BackingUp.to_string(),
            });
        }

        let runner = self.current_runner(&sandbox).await?;
        let registry = self
            .snapshots
            .resolver()
            .backup_target(&sandbox.region_id)
            .await?;
        let started_at = Utc::now();
        let image = utils::backup_image(&registry, &sandbox.id, started_at);

        sandbox.desired_state = SandboxState::BackedUp;
        self.transition(&mut sandbox, SandboxState::BackingUp).await?;
        tracing::info!(sandbox_id = %sandbox.id, runner_id = %runner.id, "backing up to {image}");

        let desired = DesiredState::SandboxBackedUp {
            sandbox_id: sandbox.id.clone(),
            destination: PushTarget {
                image: image.clone(),
                registry: RegistryAuth::from(&registry),
            },
        };
        if let Err(e) = self.realize(&runner, &desired).await {
            return Err(self.fail(&mut sandbox, e).await);
        }

        sandbox.backup_image = Some(image);
        sandbox.backup_registry_id = Some(registry.id);
        sandbox.last_backup_at = Some(Utc::now());
        self.transition(&mut sandbox, SandboxState::BackedUp).await?;
        Ok(sandbox)
    }
}
