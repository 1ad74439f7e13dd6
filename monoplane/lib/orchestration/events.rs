use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::Orchestrator;
use crate::{db, fleet::FleetEvent, MonoplaneError, MonoplaneResult};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Reacts to a fleet event. Returns the ids of the sandboxes that were migrated.
    ///
    /// With `auto_migrate` enabled, every placed sandbox of a runner that became unresponsive is
    /// migrated. Sandboxes that cannot be migrated are moved to `error`.
    pub async fn handle_fleet_event(&self, event: &FleetEvent) -> MonoplaneResult<Vec<String>> {
        let FleetEvent::RunnerUnresponsive { runner_id, .. } = event else {
            return Ok(Vec::new());
        };
        if !*self.config.get_auto_migrate() {
            return Ok(Vec::new());
        }

        let sandboxes = db::list_placed_sandboxes_on_runner(&self.pool, runner_id).await?;
        tracing::info!(runner_id = %runner_id, "migrating {} sandboxes off unresponsive runner", sandboxes.len());

        let mut migrated = Vec::new();
        for sandbox in sandboxes {
            match self.migrate(&sandbox.id).await {
                Ok(_) => migrated.push(sandbox.id),
                Err(MonoplaneError::InvalidTransition { .. }) => {
                    let _guard = self.lock(&sandbox.id).await;
                    let mut current = self.get(&sandbox.id).await?;
                    self.mark_error(
                        &mut current,
                        format!("runner {runner_id} became unresponsive"),
                    )
                    .await?;
                }
                Err(e) => {
                    tracing::error!(sandbox_id = %sandbox.id, runner_id = %runner_id, "migration failed: {e}");
                }
            }
        }

        Ok(migrated)
    }

    /// Feeds fleet events into [`Orchestrator::handle_fleet_event`] until `token` is cancelled.
    ///
    /// The task runs on `tasks`. A migration in flight when `token` is cancelled runs to
    /// completion before the task exits.
    pub fn spawn_auto_migration(
        &self,
        tasks: &TaskTracker,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let mut events = self.fleet.subscribe();

        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let Err(e) = orchestrator.handle_fleet_event(&event).await {
                                tracing::error!(runner_id = %event.runner_id(), "could not handle fleet event: {e}");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("auto-migration skipped {skipped} fleet events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            tracing::debug!("auto-migration stopped");
        })
    }
}
