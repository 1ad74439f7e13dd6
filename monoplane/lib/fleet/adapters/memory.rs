use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    fleet::{DesiredState, DesiredStateKind, ObservedSandbox, ObservedSandboxState, RunnerAdapter},
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A scriptable in-process runner for development and tests.
///
/// It realizes desired states immediately and records every call. Health, refusals and transient
/// failures can be scripted per operation kind.
#[derive(Debug, Clone)]
pub struct InMemoryRunnerAdapter {
    runner_id: String,
    state: Arc<Mutex<MemoryRunnerState>>,
}

#[derive(Debug, Default)]
struct MemoryRunnerState {
    healthy: bool,
    sandboxes: HashMap<String, ObservedSandbox>,
    images: HashSet<String>,
    rejections: HashMap<DesiredStateKind, String>,
    transient_failures: HashMap<DesiredStateKind, u32>,
    realized: Vec<DesiredState>,
    health_checks: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InMemoryRunnerAdapter {
    /// Creates a healthy, empty runner.
    pub fn new(runner_id: impl Into<String>) -> Self {
        Self {
            runner_id: runner_id.into(),
            state: Arc::new(Mutex::new(MemoryRunnerState {
                healthy: true,
                ..Default::default()
            })),
        }
    }

    /// Makes health checks succeed or fail.
    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    /// Refuses every future request of `kind` with `reason`.
    pub fn reject(&self, kind: DesiredStateKind, reason: impl Into<String>) {
        self.lock().rejections.insert(kind, reason.into());
    }

    /// Stops refusing requests of `kind`.
    pub fn accept(&self, kind: DesiredStateKind) {
        self.lock().rejections.remove(&kind);
    }

    /// Fails the next `times` requests of `kind` with a transient error.
    pub fn fail_transiently(&self, kind: DesiredStateKind, times: u32) {
        self.lock().transient_failures.insert(kind, times);
    }

    /// Overrides what the runner reports for a sandbox.
    pub fn set_observed(&self, sandbox_id: &str, state: ObservedSandboxState, error: Option<String>) {
        self.lock().sandboxes.insert(
            sandbox_id.to_string(),
            ObservedSandbox {
                id: sandbox_id.to_string(),
                state,
                error,
                revision: None,
            },
        );
    }

    /// Every desired state realized so far, in order.
    pub fn realized(&self) -> Vec<DesiredState> {
        self.lock().realized.clone()
    }

    /// The kinds of every desired state realized so far, in order.
    pub fn realized_kinds(&self) -> Vec<DesiredStateKind> {
        self.lock().realized.iter().map(DesiredState::kind).collect()
    }

    /// The number of health checks received.
    pub fn health_checks(&self) -> u32 {
        self.lock().health_checks
    }

    /// Whether the runner currently hosts the sandbox.
    pub fn hosts(&self, sandbox_id: &str) -> bool {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .is_some_and(|s| s.state != ObservedSandboxState::Destroyed)
    }

    /// Whether the runner holds the image.
    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRunnerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl RunnerAdapter for InMemoryRunnerAdapter {
    fn runner_id(&self) -> &str {
        &self.runner_id
    }

    async fn health(&self) -> MonoplaneResult<()> {
        let mut state = self.lock();
        state.health_checks += 1;

        if state.healthy {
            Ok(())
        } else {
            Err(MonoplaneError::Unavailable(format!(
                "runner {} is unreachable",
                self.runner_id
            )))
        }
    }

    async fn realize(&self, desired: &DesiredState) -> MonoplaneResult<()> {
        let mut state = self.lock();
        let kind = desired.kind();

        if let Some(remaining) = state.transient_failures.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MonoplaneError::Unavailable(format!(
                    "runner {} timed out on {kind}",
                    self.runner_id
                )));
            }
        }

        if let Some(reason) = state.rejections.get(&kind) {
            return Err(MonoplaneError::RunnerRejected {
                runner: self.runner_id.clone(),
                reason: reason.clone(),
            });
        }

        if !state.healthy {
            return Err(MonoplaneError::Unavailable(format!(
                "runner {} is unreachable",
                self.runner_id
            )));
        }

        let observed = match desired {
            DesiredState::SnapshotPulled { image, .. } => {
                state.images.insert(image.clone());
                None
            }
            DesiredState::SnapshotBuilt { .. } => None,
            DesiredState::SandboxStarted { sandbox_id, .. } => {
                Some((sandbox_id, ObservedSandboxState::Started))
            }
            DesiredState::SandboxStopped { sandbox_id } => {
                Some((sandbox_id, ObservedSandboxState::Stopped))
            }
            DesiredState::SandboxBackedUp { sandbox_id, .. } => {
                Some((sandbox_id, ObservedSandboxState::BackedUp))
            }
            DesiredState::SandboxDestroyed { sandbox_id } => {
                state.sandboxes.remove(sandbox_id);
                None
            }
        };

        if let Some((sandbox_id, observed)) = observed {
            state.sandboxes.insert(
                sandbox_id.clone(),
                ObservedSandbox {
                    id: sandbox_id.clone(),
                    state: observed,
                    error: None,
                    revision: None,
                },
            );
        }

        // Pushed images end up under their destination reference.
        if let Some(image) = desired.snapshot_image() {
            state.images.insert(image.to_string());
        }

        state.realized.push(desired.clone());
        Ok(())
    }

    async fn observe(&self, sandbox_id: &str) -> MonoplaneResult<Option<ObservedSandbox>> {
        let state = self.lock();
        if !state.healthy {
            return Err(MonoplaneError::Unavailable(format!(
                "runner {} is unreachable",
                self.runner_id
            )));
        }

        Ok(state.sandboxes.get(sandbox_id).cloned())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_memory_runner_scripts_failures() -> anyhow::Result<()> {
        let runner = InMemoryRunnerAdapter::new("r1");
        let stop = DesiredState::SandboxStopped {
            sandbox_id: "sbx-1".to_string(),
        };

        runner.fail_transiently(DesiredStateKind::SandboxStopped, 1);
        assert!(matches!(
            runner.realize(&stop).await,
            Err(MonoplaneError::Unavailable(_))
        ));
        runner.realize(&stop).await?;
        assert_eq!(
            runner.observe("sbx-1").await?.map(|s| s.state),
            Some(ObservedSandboxState::Stopped)
        );

        runner.reject(DesiredStateKind::SandboxStopped, "busy");
        assert!(matches!(
            runner.realize(&stop).await,
            Err(MonoplaneError::RunnerRejected { .. })
        ));

        runner.set_healthy(false);
        assert!(runner.health().await.is_err());
        assert_eq!(runner.health_checks(), 1);
        assert_eq!(runner.realized_kinds(), vec![DesiredStateKind::SandboxStopped]);

        Ok(())
    }
}
