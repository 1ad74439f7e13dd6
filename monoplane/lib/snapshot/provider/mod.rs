//! Registry providers: robot accounts and artifact removal on a container registry.

mod harbor;
mod noop;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{fleet::RegistryAuth, MonoplaneResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use harbor::*;
pub use noop::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An action a robot account may perform on a project's repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAction {
    /// Push images.
    Push,

    /// Pull images.
    Pull,
}

/// The actions granted on one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotPermission {
    /// The registry project.
    pub project: String,

    /// The granted actions.
    pub actions: Vec<RegistryAction>,
}

/// A request for a short-lived registry credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotAccountRequest {
    /// The account name, unique per registry.
    pub name: String,

    /// A human description.
    pub description: String,

    /// Lifetime of the account, in seconds.
    pub duration: i64,

    /// What the account may do.
    pub permissions: Vec<RobotPermission>,
}

/// A short-lived registry credential.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RobotAccount {
    /// The login name, as issued by the registry.
    pub name: String,

    /// The login secret.
    pub secret: String,
}

/// An image inside a registry project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// The registry project.
    pub project: String,

    /// The repository within the project.
    pub repository: String,

    /// The tag.
    pub tag: String,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Administrative operations on a container registry.
#[async_trait::async_trait]
pub trait RegistryProvider: fmt::Debug + Send + Sync {
    /// Creates a robot account on the registry `auth` points at.
    async fn create_robot_account(
        &self,
        auth: &RegistryAuth,
        request: &RobotAccountRequest,
    ) -> MonoplaneResult<RobotAccount>;

    /// Deletes an artifact. Deleting an artifact that is already gone succeeds.
    async fn delete_artifact(&self, auth: &RegistryAuth, artifact: &ArtifactRef)
        -> MonoplaneResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ArtifactRef {
    /// The full image reference on the registry at `host`.
    pub fn image(&self, host: &str) -> String {
        format!("{}/{}/{}:{}", host, self.project, self.repository, self.tag)
    }
}

impl RobotAccount {
    /// Push/pull credentials for the registry at `url`.
    pub fn auth(&self, url: &str) -> RegistryAuth {
        RegistryAuth {
            url: url.to_string(),
            username: self.name.clone(),
            password: self.secret.clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for RobotAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotAccount")
            .field("name", &self.name)
            .field("secret", &"***")
            .finish()
    }
}
