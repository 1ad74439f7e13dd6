use std::time::Duration;

use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};

use crate::{
    fleet::{DesiredState, ObservedSandbox, ObservedSandboxState, RunnerAdapter},
    models::Runner,
    utils::{build_http_client, map_send_error},
    MonoplaneError, MonoplaneResult,
};

use super::{join_url, runner_error, AdapterSettings};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The runner state a v2 runner reports when it accepts work.
const READY_STATE: &str = "ready";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Talks to v2 runners by writing desired state and polling the runner's reported state.
#[derive(Debug)]
pub struct DeclarativeStateAdapter {
    runner_id: String,
    api_url: String,
    api_key: String,
    client: ClientWithMiddleware,
    health_timeout: Duration,
    poll_attempts: u32,
    poll_interval: Duration,
}

/// The status document a v2 runner serves.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerStatus {
    /// The runner id.
    #[serde(default)]
    pub id: String,

    /// The runner's own state, `ready` when it accepts work.
    pub state: String,

    /// The sandboxes the runner hosts.
    #[serde(default)]
    pub sandboxes: Vec<ObservedSandbox>,

    /// The images the runner has pulled, built or pushed.
    #[serde(default)]
    pub snapshots: Vec<ObservedSnapshot>,
}

/// A v2 runner's report on one image.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservedSnapshot {
    /// The image reference.
    pub image: String,

    /// `ready` once the image is present (and pushed, if requested), `error` on failure.
    pub state: String,

    /// The runner's failure description.
    #[serde(default)]
    pub error: Option<String>,

    /// The desired-state revision the report answers.
    #[serde(default)]
    pub revision: Option<String>,
}

/// The body of a desired-state write. The runner echoes `revision` on the entries it reports
/// once it has acted on this write.
#[derive(Debug, Serialize)]
struct DesiredEntry<'a> {
    revision: &'a str,

    #[serde(flatten)]
    desired: &'a DesiredState,
}

#[derive(Debug)]
enum Progress {
    Done,
    Pending,
    Failed(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeclarativeStateAdapter {
    /// Creates an adapter for `runner`.
    pub fn new(runner: &Runner, settings: &AdapterSettings) -> MonoplaneResult<Self> {
        let client = build_http_client(
            settings.operation_timeout,
            settings.http_retries,
            settings.min_backoff,
            settings.max_backoff,
        )?;

        Ok(Self {
            runner_id: runner.id.clone(),
            api_url: runner.api_url.clone(),
            api_key: runner.api_key.clone(),
            client,
            health_timeout: settings.health_timeout,
            poll_attempts: settings.poll_attempts.max(1),
            poll_interval: settings.poll_interval,
        })
    }

    fn target(&self) -> String {
        format!("runner {}", self.runner_id)
    }

    /// Reads the runner's status document.
    pub async fn status(&self, timeout: Option<Duration>) -> MonoplaneResult<RunnerStatus> {
        let url = join_url(&self.api_url, &format!("/runners/{}", self.runner_id));
        let mut request = self.client.get(&url).bearer_auth(&self.api_key);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(&self.target(), e))?;

        if !response.status().is_success() {
            return Err(runner_error(&self.runner_id, response).await);
        }

        Ok(response.json().await?)
    }

    async fn write_desired(&self, desired: &DesiredState, revision: &str) -> MonoplaneResult<()> {
        let url = join_url(&self.api_url, &format!("/runners/{}/desired", self.runner_id));
        tracing::debug!(
            runner_id = %self.runner_id,
            "PUT {} ({} at revision {})",
            url,
            desired.kind(),
            revision
        );

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(&DesiredEntry { revision, desired })
            .send()
            .await
            .map_err(|e| map_send_error(&self.target(), e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(runner_error(&self.runner_id, response).await)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl RunnerAdapter for DeclarativeStateAdapter {
    fn runner_id(&self) -> &str {
        &self.runner_id
    }

    async fn health(&self) -> MonoplaneResult<()> {
        let status = self.status(Some(self.health_timeout)).await?;
        if status.state == READY_STATE {
            Ok(())
        } else {
            Err(MonoplaneError::Unavailable(format!(
                "runner {} reports state {}",
                self.runner_id, status.state
            )))
        }
    }

    async fn realize(&self, desired: &DesiredState) -> MonoplaneResult<()> {
        let revision = uuid::Uuid::new_v4().to_string();
        self.write_desired(desired, &revision).await?;

        for attempt in 1..=self.poll_attempts {
            let status = self.status(None).await?;
            match progress(desired, &revision, &status) {
                Progress::Done => {
                    tracing::debug!(
                        runner_id = %self.runner_id,
                        "observed {} after {} poll(s)",
                        desired.kind(),
                        attempt
                    );
                    return Ok(());
                }
                Progress::Failed(reason) => {
                    return Err(MonoplaneError::RunnerRejected {
                        runner: self.runner_id.clone(),
                        reason,
                    })
                }
                Progress::Pending if attempt < self.poll_attempts => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Progress::Pending => {}
            }
        }

        Err(MonoplaneError::Unavailable(format!(
            "runner {} did not reach {} after {} polls",
            self.runner_id,
            desired.kind(),
            self.poll_attempts
        )))
    }

    async fn observe(&self, sandbox_id: &str) -> MonoplaneResult<Option<ObservedSandbox>> {
        let status = self.status(None).await?;
        Ok(status.sandboxes.into_iter().find(|s| s.id == sandbox_id))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Compares the runner's report with `desired`. Only entries echoing `revision` count, so a
/// state left over from an earlier write is never taken as confirmation.
fn progress(desired: &DesiredState, revision: &str, status: &RunnerStatus) -> Progress {
    if let Some(image) = desired.snapshot_image() {
        let observed = status
            .snapshots
            .iter()
            .find(|s| s.image == image && s.revision.as_deref() == Some(revision));
        return match observed {
            Some(s) if s.state == READY_STATE => Progress::Done,
            Some(s) if s.state == "error" => Progress::Failed(
                s.error
                    .clone()
                    .unwrap_or_else(|| format!("failed to prepare {image}")),
            ),
            _ => Progress::Pending,
        };
    }

    let Some(sandbox_id) = desired.sandbox_id() else {
        return Progress::Pending;
    };
    let observed = status.sandboxes.iter().find(|s| s.id == sandbox_id);
    let current = observed.filter(|s| s.revision.as_deref() == Some(revision));

    let target = match desired {
        DesiredState::SandboxStarted { .. } => ObservedSandboxState::Started,
        DesiredState::SandboxStopped { .. } => ObservedSandboxState::Stopped,
        DesiredState::SandboxBackedUp { .. } => ObservedSandboxState::BackedUp,
        DesiredState::SandboxDestroyed { .. } => {
            return match observed {
                None => Progress::Done,
                Some(s) if s.state == ObservedSandboxState::Destroyed => Progress::Done,
                Some(_) => Progress::Pending,
            }
        }
        DesiredState::SnapshotPulled { .. } | DesiredState::SnapshotBuilt { .. } => {
            return Progress::Pending
        }
    };

    match current {
        Some(s) if s.state == target => Progress::Done,
        Some(s) if s.state == ObservedSandboxState::Error => Progress::Failed(
            s.error
                .clone()
                .unwrap_or_else(|| format!("sandbox {sandbox_id} failed")),
        ),
        _ => Progress::Pending,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
