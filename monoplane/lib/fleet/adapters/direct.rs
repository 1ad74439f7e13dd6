use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;

use crate::{
    fleet::{DesiredState, ObservedSandbox, PushTarget, RegistryAuth, RunnerAdapter, SandboxSource},
    models::{Resources, Runner},
    utils::{build_http_client, map_send_error},
    MonoplaneResult,
};

use super::{join_url, runner_error, AdapterSettings};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Talks to v0 runners with synchronous HTTP calls against the runner's own API.
///
/// Every call blocks until the runner has finished the operation.
#[derive(Debug)]
pub struct DirectHttpAdapter {
    runner_id: String,
    api_url: String,
    api_key: String,
    client: ClientWithMiddleware,
    health_timeout: std::time::Duration,
}

#[derive(Debug, Serialize)]
struct PullSnapshotRequest<'a> {
    image: &'a str,
    registry: Option<&'a RegistryAuth>,
    destination: Option<&'a PushTarget>,
}

#[derive(Debug, Serialize)]
struct BuildSnapshotRequest<'a> {
    snapshot_id: &'a str,
    dockerfile: &'a str,
    image: &'a str,
    registry: &'a RegistryAuth,
}

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    id: &'a str,
    image: &'a str,
    from_backup: bool,
    registry: Option<&'a RegistryAuth>,
    cpu: i64,
    memory_gib: i64,
    disk_gib: i64,
}

#[derive(Debug, Serialize)]
struct BackupSandboxRequest<'a> {
    image: &'a str,
    registry: &'a RegistryAuth,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirectHttpAdapter {
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
        })
    }

    fn target(&self) -> String {
        format!("runner {}", self.runner_id)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> MonoplaneResult<()> {
        let url = join_url(&self.api_url, path);
        tracing::debug!(runner_id = %self.runner_id, "POST {}", url);

        let mut request = self.client.post(&url).bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(&self.target(), e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(runner_error(&self.runner_id, response).await)
        }
    }

    async fn sandbox_exists(&self, sandbox_id: &str) -> MonoplaneResult<bool> {
        Ok(self.observe(sandbox_id).await?.is_some())
    }

    async fn start_sandbox(
        &self,
        sandbox_id: &str,
        source: &SandboxSource,
        resources: &Resources,
    ) -> MonoplaneResult<()> {
        if !self.sandbox_exists(sandbox_id).await? {
            let request = CreateSandboxRequest {
                id: sandbox_id,
                image: source.image(),
                from_backup: matches!(source, SandboxSource::Backup { .. }),
                registry: source.registry(),
                cpu: resources.cpu,
                memory_gib: resources.memory,
                disk_gib: resources.disk,
            };
            self.post("/sandboxes", Some(&request)).await?;
        }

        self.post::<()>(&format!("/sandboxes/{sandbox_id}/start"), None)
            .await
    }

    async fn destroy_sandbox(&self, sandbox_id: &str) -> MonoplaneResult<()> {
        let url = join_url(&self.api_url, &format!("/sandboxes/{sandbox_id}"));
        tracing::debug!(runner_id = %self.runner_id, "DELETE {}", url);

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| map_send_error(&self.target(), e))?;

        // An absent sandbox is already destroyed.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
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
impl RunnerAdapter for DirectHttpAdapter {
    fn runner_id(&self) -> &str {
        &self.runner_id
    }

    async fn health(&self) -> MonoplaneResult<()> {
        let url = join_url(&self.api_url, "/health");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| map_send_error(&self.target(), e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(runner_error(&self.runner_id, response).await)
        }
    }

    async fn realize(&self, desired: &DesiredState) -> MonoplaneResult<()> {
        match desired {
            DesiredState::SnapshotPulled {
                image,
                source,
                destination,
            } => {
                let request = PullSnapshotRequest {
                    image,
                    registry: source.as_ref(),
                    destination: destination.as_ref(),
                };
                self.post("/snapshots/pull", Some(&request)).await
            }
            DesiredState::SnapshotBuilt {
                snapshot_id,
                dockerfile,
                destination,
            } => {
                let request = BuildSnapshotRequest {
                    snapshot_id,
                    dockerfile,
                    image: &destination.image,
                    registry: &destination.registry,
                };
                self.post("/snapshots/build", Some(&request)).await
            }
            DesiredState::SandboxStarted {
                sandbox_id,
                source,
                resources,
            } => self.start_sandbox(sandbox_id, source, resources).await,
            DesiredState::SandboxStopped { sandbox_id } => {
                self.post::<()>(&format!("/sandboxes/{sandbox_id}/stop"), None)
                    .await
            }
            DesiredState::SandboxBackedUp {
                sandbox_id,
                destination,
            } => {
                let request = BackupSandboxRequest {
                    image: &destination.image,
                    registry: &destination.registry,
                };
                self.post(&format!("/sandboxes/{sandbox_id}/backup"), Some(&request))
                    .await
            }
            DesiredState::SandboxDestroyed { sandbox_id } => {
                self.destroy_sandbox(sandbox_id).await
            }
        }
    }

    async fn observe(&self, sandbox_id: &str) -> MonoplaneResult<Option<ObservedSandbox>> {
        let url = join_url(&self.api_url, &format!("/sandboxes/{sandbox_id}"));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| map_send_error(&self.target(), e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(runner_error(&self.runner_id, response).await),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        fleet::ObservedSandboxState,
        models::{RunnerApiVersion, RunnerState},
        MonoplaneError,
    };

    fn runner(api_url: &str) -> Runner {
        let now = Utc::now();
        Runner {
            id: "r1".to_string(),
            region_id: "eu".to_string(),
            api_url: api_url.to_string(),
            api_key: "runner-key".to_string(),
            api_version: RunnerApiVersion::V0,
            capacity: Resources::new(4, 8, 50),
            allocated: Resources::default(),
            capacity_version: 0,
            state: RunnerState::Ready,
            consecutive_failures: 0,
            last_checked_at: None,
            unresponsive_since: None,
            region_credential_version: None,
            created_at: now,
            modified_at: now,
        }
    }

    fn settings() -> AdapterSettings {
        AdapterSettings::builder()
            .health_timeout(Duration::from_secs(2))
            .operation_timeout(Duration::from_secs(5))
            .http_retries(0)
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_direct_health_sends_bearer_credential() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(header("authorization", "Bearer runner-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = DirectHttpAdapter::new(&runner(&server.uri()), &settings())?;
        adapter.health().await?;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_direct_start_creates_missing_sandbox() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/sbx-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandboxes/sbx-1/start"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = DirectHttpAdapter::new(&runner(&server.uri()), &settings())?;
        adapter
            .realize(&DesiredState::SandboxStarted {
                sandbox_id: "sbx-1".to_string(),
                source: SandboxSource::Snapshot {
                    image: "registry.example.com/monoplane/ubuntu:22.04".to_string(),
                    registry: None,
                },
                resources: Resources::new(1, 2, 10),
            })
            .await?;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_direct_maps_statuses_to_errors() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes/sbx-1/stop"))
            .respond_with(ResponseTemplate::new(409).set_body_string("sandbox is busy"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandboxes/sbx-2/stop"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = DirectHttpAdapter::new(&runner(&server.uri()), &settings())?;

        let err = adapter
            .realize(&DesiredState::SandboxStopped {
                sandbox_id: "sbx-1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(
            matches!(&err, MonoplaneError::RunnerRejected { reason, .. } if reason.contains("busy"))
        );

        let err = adapter
            .realize(&DesiredState::SandboxStopped {
                sandbox_id: "sbx-2".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Unavailable(_)));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_direct_destroy_treats_missing_as_done() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/sbx-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = DirectHttpAdapter::new(&runner(&server.uri()), &settings())?;
        adapter
            .realize(&DesiredState::SandboxDestroyed {
                sandbox_id: "sbx-1".to_string(),
            })
            .await?;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_direct_observe_parses_sandbox() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/sbx-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "sbx-1",
                "state": "error",
                "error_reason": "oom killed"
            })))
            .mount(&server)
            .await;

        let adapter = DirectHttpAdapter::new(&runner(&server.uri()), &settings())?;
        let observed = adapter.observe("sbx-1").await?.unwrap();

        assert_eq!(observed.state, ObservedSandboxState::Error);
        assert_eq!(observed.error.as_deref(), Some("oom killed"));
        assert!(adapter.observe("sbx-2").await?.is_none());

        Ok(())
    }
}
