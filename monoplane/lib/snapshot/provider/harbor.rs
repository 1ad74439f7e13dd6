use std::time::Duration;

use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;

use crate::{
    fleet::RegistryAuth,
    utils::{build_http_client, map_send_error},
    MonoplaneError, MonoplaneResult,
};

use super::{ArtifactRef, RegistryAction, RegistryProvider, RobotAccount, RobotAccountRequest};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Talks to the Harbor v2 REST API.
#[derive(Debug)]
pub struct HarborRegistryProvider {
    client: ClientWithMiddleware,
}

#[derive(Debug, Serialize)]
struct CreateRobotBody<'a> {
    name: &'a str,
    description: &'a str,
    duration: i64,
    level: &'static str,
    permissions: Vec<RobotPermissionBody<'a>>,
}

#[derive(Debug, Serialize)]
struct RobotPermissionBody<'a> {
    kind: &'static str,
    namespace: &'a str,
    access: Vec<RobotAccessBody>,
}

#[derive(Debug, Serialize)]
struct RobotAccessBody {
    resource: &'static str,
    action: RegistryAction,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HarborRegistryProvider {
    /// Creates a provider whose requests time out after `timeout` and are retried up to
    /// `max_retries` times on transient failures.
    pub fn new(
        timeout: Duration,
        max_retries: u32,
        min_backoff: Duration,
        max_backoff: Duration,
    ) -> MonoplaneResult<Self> {
        Ok(Self {
            client: build_http_client(timeout, max_retries, min_backoff, max_backoff)?,
        })
    }

    fn endpoint(auth: &RegistryAuth, path: &str) -> String {
        let base = auth.url.trim_end_matches('/');
        let base = if base.starts_with("http://") || base.starts_with("https://") {
            base.to_string()
        } else {
            format!("https://{base}")
        };

        format!("{base}/api/v2.0{path}")
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl RegistryProvider for HarborRegistryProvider {
    async fn create_robot_account(
        &self,
        auth: &RegistryAuth,
        request: &RobotAccountRequest,
    ) -> MonoplaneResult<RobotAccount> {
        let url = Self::endpoint(auth, "/robots");
        let body = CreateRobotBody {
            name: &request.name,
            description: &request.description,
            duration: request.duration,
            level: "project",
            permissions: request
                .permissions
                .iter()
                .map(|permission| RobotPermissionBody {
                    kind: "project",
                    namespace: &permission.project,
                    access: permission
                        .actions
                        .iter()
                        .map(|action| RobotAccessBody {
                            resource: "repository",
                            action: *action,
                        })
                        .collect(),
                })
                .collect(),
        };

        tracing::debug!("POST {} ({})", url, request.name);
        let response = self
            .client
            .post(&url)
            .basic_auth(&auth.username, Some(&auth.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&auth.url, e))?;

        if !response.status().is_success() {
            return Err(registry_error(&auth.url, response).await);
        }

        Ok(response.json::<RobotAccount>().await?)
    }

    async fn delete_artifact(
        &self,
        auth: &RegistryAuth,
        artifact: &ArtifactRef,
    ) -> MonoplaneResult<()> {
        // Harbor expects nested repository names double-encoded.
        let repository = artifact.repository.replace('/', "%252F");
        let url = Self::endpoint(
            auth,
            &format!(
                "/projects/{}/repositories/{}/artifacts/{}",
                artifact.project, repository, artifact.tag
            ),
        );

        tracing::debug!("DELETE {}", url);
        let response = self
            .client
            .delete(&url)
            .basic_auth(&auth.username, Some(&auth.password))
            .send()
            .await
            .map_err(|e| map_send_error(&auth.url, e))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!("artifact {} already gone", url);
                Ok(())
            }
            _ => Err(registry_error(&auth.url, response).await),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn registry_error(registry: &str, response: reqwest::Response) -> MonoplaneError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let reason = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        MonoplaneError::Unavailable(format!("registry {registry} returned {reason}"))
    } else {
        MonoplaneError::RegistryRejected {
            registry: registry.to_string(),
            reason,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
