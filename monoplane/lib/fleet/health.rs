use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::MonoplaneError;

use super::FleetManager;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Health checks one runner every `health_check_interval` until cancelled, or until the runner
/// leaves the monitored states.
pub(super) async fn run_health_loop(fleet: FleetManager, runner_id: String, token: CancellationToken) {
    let period = fleet.config().health_check_interval();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(runner_id = %runner_id, "health loop started, every {:?}", period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = fleet.health_check(&runner_id) => result,
        };

        match result {
            Ok(state) if !state.is_monitored() => {
                tracing::info!(runner_id = %runner_id, "runner is {state}, stopping health checks");
                break;
            }
            Ok(_) => {}
            Err(MonoplaneError::NotFound { .. }) => {
                tracing::warn!(runner_id = %runner_id, "runner vanished, stopping health checks");
                break;
            }
            Err(e) => {
                tracing::error!(runner_id = %runner_id, "health check could not run: {e}");
            }
        }
    }

    tracing::debug!(runner_id = %runner_id, "health loop stopped");
}
