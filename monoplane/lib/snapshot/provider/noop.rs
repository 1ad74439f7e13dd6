use crate::{fleet::RegistryAuth, utils::Secret, MonoplaneResult};

use super::{ArtifactRef, RegistryProvider, RobotAccount, RobotAccountRequest};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A provider for registries without an administrative API.
///
/// Robot accounts are minted locally and artifact deletion does nothing.
#[derive(Debug, Default, Clone)]
pub struct NoopRegistryProvider;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl RegistryProvider for NoopRegistryProvider {
    async fn create_robot_account(
        &self,
        _auth: &RegistryAuth,
        request: &RobotAccountRequest,
    ) -> MonoplaneResult<RobotAccount> {
        Ok(RobotAccount {
            name: format!("robot${}", request.name),
            secret: Secret::generate().expose().to_string(),
        })
    }

    async fn delete_artifact(
        &self,
        auth: &RegistryAuth,
        artifact: &ArtifactRef,
    ) -> MonoplaneResult<()> {
        tracing::debug!(
            "skipping deletion of {}/{}:{} on {}",
            artifact.project,
            artifact.repository,
            artifact.tag,
            auth.url
        );
        Ok(())
    }
}
