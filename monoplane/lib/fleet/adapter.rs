use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    models::{Resources, Runner},
    MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Credentials a runner uses to talk to a container registry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// The registry base URL.
    pub url: String,

    /// Registry username.
    pub username: String,

    /// Registry password.
    pub password: String,
}

/// Where a runner pushes an image after pulling or building it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTarget {
    /// The full image reference to push to.
    pub image: String,

    /// Credentials for the destination registry.
    pub registry: RegistryAuth,
}

/// The image a sandbox is realized from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxSource {
    /// A built snapshot.
    Snapshot {
        /// The image reference.
        image: String,

        /// Pull credentials, if the registry needs them.
        registry: Option<RegistryAuth>,
    },

    /// A sandbox backup.
    Backup {
        /// The backup image reference.
        image: String,

        /// Pull credentials, if the registry needs them.
        registry: Option<RegistryAuth>,
    },
}

/// A state the control plane asks a runner to reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesiredState {
    /// The image is present on the runner, and pushed to `destination` if set.
    SnapshotPulled {
        /// The image to pull.
        image: String,

        /// Pull credentials, if the source registry needs them.
        source: Option<RegistryAuth>,

        /// Where to push the image afterwards.
        destination: Option<PushTarget>,
    },

    /// The image is built from a Dockerfile and pushed to `destination`.
    SnapshotBuilt {
        /// The snapshot the build belongs to.
        snapshot_id: String,

        /// The Dockerfile body.
        dockerfile: String,

        /// Where to push the built image.
        destination: PushTarget,
    },

    /// The sandbox exists and runs. It is created from `source` if missing.
    SandboxStarted {
        /// The sandbox.
        sandbox_id: String,

        /// The image the sandbox is created from.
        source: SandboxSource,

        /// The resources the sandbox may use.
        resources: Resources,
    },

    /// The sandbox exists and is stopped.
    SandboxStopped {
        /// The sandbox.
        sandbox_id: String,
    },

    /// The sandbox filesystem was pushed as `destination`.
    SandboxBackedUp {
        /// The sandbox.
        sandbox_id: String,

        /// Where the backup goes.
        destination: PushTarget,
    },

    /// The sandbox no longer exists on the runner.
    SandboxDestroyed {
        /// The sandbox.
        sandbox_id: String,
    },
}

/// The kind of a [`DesiredState`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesiredStateKind {
    /// See [`DesiredState::SnapshotPulled`].
    SnapshotPulled,

    /// See [`DesiredState::SnapshotBuilt`].
    SnapshotBuilt,

    /// See [`DesiredState::SandboxStarted`].
    SandboxStarted,

    /// See [`DesiredState::SandboxStopped`].
    SandboxStopped,

    /// See [`DesiredState::SandboxBackedUp`].
    SandboxBackedUp,

    /// See [`DesiredState::SandboxDestroyed`].
    SandboxDestroyed,
}

/// What a runner reports about one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedSandboxState {
    /// Being created or pulled.
    Creating,

    /// Running.
    Started,

    /// Stopped.
    Stopped,

    /// A backup is being pushed.
    BackingUp,

    /// The last backup completed.
    BackedUp,

    /// Removed.
    Destroyed,

    /// Failed on the runner.
    Error,

    /// Anything the control plane does not know about.
    #[serde(other)]
    Unknown,
}

/// A runner's report on one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedSandbox {
    /// The sandbox id.
    pub id: String,

    /// The reported state.
    pub state: ObservedSandboxState,

    /// The runner's failure description.
    #[serde(default, alias = "error_reason")]
    pub error: Option<String>,

    /// The desired-state revision the report answers, for runners that echo one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The operations the control plane needs from a runner, whatever protocol it speaks.
#[async_trait::async_trait]
pub trait RunnerAdapter: fmt::Debug + Send + Sync {
    /// The runner this adapter talks to.
    fn runner_id(&self) -> &str;

    /// Succeeds when the runner is reachable and ready to accept work.
    async fn health(&self) -> MonoplaneResult<()>;

    /// Drives the runner to `desired` and returns once the runner confirms it.
    ///
    /// Explicit refusals surface as `RunnerRejected`, transient failures as `Unavailable`.
    async fn realize(&self, desired: &DesiredState) -> MonoplaneResult<()>;

    /// Reads what the runner reports about a sandbox. `None` if the runner does not know it.
    async fn observe(&self, sandbox_id: &str) -> MonoplaneResult<Option<ObservedSandbox>>;
}

/// Builds the adapter for a runner.
pub trait AdapterFactory: Send + Sync {
    /// Returns an adapter speaking the runner's protocol generation.
    fn adapter_for(&self, runner: &Runner) -> MonoplaneResult<Arc<dyn RunnerAdapter>>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DesiredState {
    /// The payload-free kind of this state.
    pub fn kind(&self) -> DesiredStateKind {
        match self {
            DesiredState::SnapshotPulled { .. } => DesiredStateKind::SnapshotPulled,
            DesiredState::SnapshotBuilt { .. } => DesiredStateKind::SnapshotBuilt,
            DesiredState::SandboxStarted { .. } => DesiredStateKind::SandboxStarted,
            DesiredState::SandboxStopped { .. } => DesiredStateKind::SandboxStopped,
            DesiredState::SandboxBackedUp { .. } => DesiredStateKind::SandboxBackedUp,
            DesiredState::SandboxDestroyed { .. } => DesiredStateKind::SandboxDestroyed,
        }
    }

    /// The sandbox this state is about, if any.
    pub fn sandbox_id(&self) -> Option<&str> {
        match self {
            DesiredState::SandboxStarted { sandbox_id, .. }
            | DesiredState::SandboxStopped { sandbox_id }
            | DesiredState::SandboxBackedUp { sandbox_id, .. }
            | DesiredState::SandboxDestroyed { sandbox_id } => Some(sandbox_id),
            DesiredState::SnapshotPulled { .. } | DesiredState::SnapshotBuilt { .. } => None,
        }
    }

    /// The image reference a snapshot state ends up under on the runner or in the registry.
    pub fn snapshot_image(&self) -> Option<&str> {
        match self {
            DesiredState::SnapshotPulled {
                image, destination, ..
            } => Some(destination.as_ref().map_or(image.as_str(), |d| d.image.as_str())),
            DesiredState::SnapshotBuilt { destination, .. } => Some(&destination.image),
            _ => None,
        }
    }
}

impl SandboxSource {
    /// The image reference.
    pub fn image(&self) -> &str {
        match self {
            SandboxSource::Snapshot { image, .. } | SandboxSource::Backup { image, .. } => image,
        }
    }

    /// Pull credentials, if any.
    pub fn registry(&self) -> Option<&RegistryAuth> {
        match self {
            SandboxSource::Snapshot { registry, .. } | SandboxSource::Backup { registry, .. } => {
                registry.as_ref()
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl fmt::Display for DesiredStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DesiredStateKind::SnapshotPulled => "snapshot_pulled",
            DesiredStateKind::SnapshotBuilt => "snapshot_built",
            DesiredStateKind::SandboxStarted => "sandbox_started",
            DesiredStateKind::SandboxStopped => "sandbox_stopped",
            DesiredStateKind::SandboxBackedUp => "sandbox_backed_up",
            DesiredStateKind::SandboxDestroyed => "sandbox_destroyed",
        };

        f.write_str(name)
    }
}
