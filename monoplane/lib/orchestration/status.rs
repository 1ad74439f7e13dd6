use super::{utils, Orchestrator};
use crate::{
    fleet::{ObservedSandbox, ObservedSandboxState},
    models::{Sandbox, SandboxState},
    utils::retry_transient,
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Reconciles the sandbox with what its runner currently reports.
    ///
    /// Reports that do not fit the state machine are logged and ignored.
    pub async fn sync(&self, sandbox_id: &str) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;
        if !sandbox.state.is_placed() {
            return Ok(sandbox);
        }

        let runner = self.current_runner(&sandbox).await?;
        let adapter = self.fleet.adapter_for(&runner)?;
        let label = format!("observe {} on runner {}", sandbox.id, runner.id);
        let observed = retry_transient(&self.retry, &label, || adapter.observe(&sandbox.id)).await?;

        let Some(observed) = observed else {
            if matches!(
                sandbox.state,
                SandboxState::Started | SandboxState::Stopped | SandboxState::BackedUp
            ) {
                let reason = format!("runner {} no longer hosts the sandbox", runner.id);
                tracing::warn!(sandbox_id = %sandbox.id, runner_id = %runner.id, "{reason}");
                self.mark_error(&mut sandbox, reason).await?;
            }
            return Ok(sandbox);
        };

        match self.apply_observed(&mut sandbox, &observed).await {
            Ok(()) => Ok(sandbox),
            Err(MonoplaneError::InvalidTransition { from, to, .. }) => {
                tracing::warn!(
                    sandbox_id = %sandbox.id,
                    runner_id = %runner.id,
                    "ignoring runner report {from} -> {to}"
                );
                Ok(sandbox)
            }
            Err(e) => Err(e),
        }
    }

    /// Records a state the sandbox's runner reported on its own.
    pub async fn report_state(
        &self,
        sandbox_id: &str,
        observed: ObservedSandbox,
    ) -> MonoplaneResult<Sandbox> {
        let _guard = self.lock(sandbox_id).await;
        let mut sandbox = self.get(sandbox_id).await?;
        self.apply_observed(&mut sandbox, &observed).await?;
        Ok(sandbox)
    }

    async fn apply_observed(
        &self,
        sandbox: &mut Sandbox,
        observed: &ObservedSandbox,
    ) -> MonoplaneResult<()> {
        let Some(target) = utils::observed_target(sandbox.state, observed.state) else {
            return Ok(());
        };

        match (target, observed.state) {
            (SandboxState::Error, _) => {
                let reason = observed
                    .error
                    .clone()
                    .unwrap_or_else(|| "runner reported an error".to_string());
                self.mark_error(sandbox, reason).await
            }
            (SandboxState::Destroyed, ObservedSandboxState::Destroyed) => {
                self.release_reservation(sandbox).await?;
                sandbox.prev_runner_id = sandbox.runner_id.take();
                sandbox.desired_state = SandboxState::Destroyed;
                self.transition(sandbox, SandboxState::Destroyed).await
            }
            (target, _) => self.transition(sandbox, target).await,
        }
    }
}
