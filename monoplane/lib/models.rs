//! Persisted entities of the control plane.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MonoplaneError;

//--------------------------------------------------------------------------------------------------
// Macros
//--------------------------------------------------------------------------------------------------

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as TEXT.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Returns the persisted representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = MonoplaneError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Result::Ok(Self::$variant),)+
                    _ => Err(MonoplaneError::Validation(format!(
                        concat!("unknown ", $kind, ": {}"),
                        s
                    ))),
                }
            }
        }
    };
}

//--------------------------------------------------------------------------------------------------
// Types: Resources
//--------------------------------------------------------------------------------------------------

/// A CPU/memory/disk triple. Memory and disk are in GiB.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    /// Number of vCPUs.
    pub cpu: i64,

    /// Memory in GiB.
    pub memory: i64,

    /// Disk in GiB.
    pub disk: i64,
}

impl Resources {
    /// Creates a new resource triple.
    pub const fn new(cpu: i64, memory: i64, disk: i64) -> Self {
        Self { cpu, memory, disk }
    }

    /// Whether every dimension of `self` is at most the matching dimension of `available`.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu <= available.cpu && self.memory <= available.memory && self.disk <= available.disk
    }

    /// Subtracts `other`, clamping each dimension at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0),
            memory: (self.memory - other.memory).max(0),
            disk: (self.disk - other.disk).max(0),
        }
    }

    /// Whether every dimension is strictly positive.
    pub fn is_positive(&self) -> bool {
        self.cpu > 0 && self.memory > 0 && self.disk > 0
    }
}

//--------------------------------------------------------------------------------------------------
// Types: Region
//--------------------------------------------------------------------------------------------------

/// Who may use a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionScope {
    /// Usable by every tenant.
    Shared,

    /// Reserved for a specific tenant.
    Dedicated,

    /// Created and owned by one tenant.
    Custom,
}

text_enum!(RegionScope, "region scope", {
    Shared => "shared",
    Dedicated => "dedicated",
    Custom => "custom",
});

/// An administrative/network grouping of runners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// The unique identifier for the region.
    pub id: String,

    /// The human name, unique within the owner's scope.
    pub name: String,

    /// Who may use the region.
    pub scope: RegionScope,

    /// The owning tenant, if any.
    pub owner: Option<String>,

    /// Whether quota enforcement applies to sandboxes in this region.
    pub enforce_quotas: bool,

    /// When the region was created.
    pub created_at: DateTime<Utc>,

    /// When the region was last modified.
    pub modified_at: DateTime<Utc>,
}

impl Region {
    /// Whether `tenant` may place sandboxes in this region.
    pub fn is_usable_by(&self, tenant: &str) -> bool {
        match self.scope {
            RegionScope::Shared => true,
            RegionScope::Dedicated | RegionScope::Custom => self.owner.as_deref() == Some(tenant),
        }
    }
}

/// A per-region service endpoint that carries its own credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// The ingress proxy.
    Proxy,

    /// The SSH gateway.
    SshGateway,

    /// The snapshot manager.
    SnapshotManager,
}

text_enum!(EndpointKind, "endpoint kind", {
    Proxy => "proxy",
    SshGateway => "ssh_gateway",
    SnapshotManager => "snapshot_manager",
});

impl EndpointKind {
    /// All endpoint kinds.
    pub const ALL: [EndpointKind; 3] = [
        EndpointKind::Proxy,
        EndpointKind::SshGateway,
        EndpointKind::SnapshotManager,
    ];
}

/// The persisted endpoint row. Only the hash of the credential is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEndpoint {
    /// The region the endpoint belongs to.
    pub region_id: String,

    /// Which endpoint this is.
    pub kind: EndpointKind,

    /// The endpoint URL.
    pub url: String,

    /// Monotonic credential version, starting at 1.
    pub credential_version: i64,

    /// Hex SHA-256 of the current secret.
    pub credential_hash: String,

    /// When the credential was last rotated.
    pub rotated_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Types: Runner
//--------------------------------------------------------------------------------------------------

/// The control protocol generation a runner speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerApiVersion {
    /// Direct synchronous HTTP calls against the runner.
    #[serde(rename = "v0")]
    V0,

    /// Declarative desired state, polled until observed.
    #[serde(rename = "v2")]
    V2,
}

text_enum!(RunnerApiVersion, "runner api version", {
    V0 => "v0",
    V2 => "v2",
});

/// The lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// Persisted but not yet confirmed healthy.
    Registering,

    /// Healthy and eligible for placement.
    Ready,

    /// Failed repeated health checks.
    Unresponsive,

    /// Excluded from placement until an operator enables it again.
    Disabled,

    /// Retired by an operator.
    Decommissioned,
}

text_enum!(RunnerState, "runner state", {
    Registering => "registering",
    Ready => "ready",
    Unresponsive => "unresponsive",
    Disabled => "disabled",
    Decommissioned => "decommissioned",
});

impl RunnerState {
    /// Whether the health-check loop should keep probing a runner in this state.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            RunnerState::Registering | RunnerState::Ready | RunnerState::Unresponsive
        )
    }
}

/// A remote host that executes sandbox workloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    /// The unique identifier for the runner.
    pub id: String,

    /// The region the runner belongs to.
    pub region_id: String,

    /// The base URL of the runner's API.
    pub api_url: String,

    /// The bearer credential for the runner's API.
    pub api_key: String,

    /// The protocol generation the runner speaks.
    pub api_version: RunnerApiVersion,

    /// Advertised capacity.
    pub capacity: Resources,

    /// Capacity currently reserved by placed sandboxes.
    pub allocated: Resources,

    /// Optimistic counter bumped by every reservation and release.
    pub capacity_version: i64,

    /// The lifecycle state.
    pub state: RunnerState,

    /// Health checks failed in a row.
    pub consecutive_failures: i64,

    /// When the runner was last probed.
    pub last_checked_at: Option<DateTime<Utc>>,

    /// When the runner became unresponsive.
    pub unresponsive_since: Option<DateTime<Utc>>,

    /// The region proxy credential version current when registration started.
    pub region_credential_version: Option<i64>,

    /// When the runner was created.
    pub created_at: DateTime<Utc>,

    /// When the runner was last modified.
    pub modified_at: DateTime<Utc>,
}

impl Runner {
    /// Capacity not yet reserved.
    pub fn available(&self) -> Resources {
        self.capacity.saturating_sub(&self.allocated)
    }

    /// The highest allocated/advertised ratio across the three dimensions.
    pub fn load(&self) -> f64 {
        fn ratio(used: i64, total: i64) -> f64 {
            if total <= 0 {
                1.0
            } else {
                used as f64 / total as f64
            }
        }

        ratio(self.allocated.cpu, self.capacity.cpu)
            .max(ratio(self.allocated.memory, self.capacity.memory))
            .max(ratio(self.allocated.disk, self.capacity.disk))
    }
}

//--------------------------------------------------------------------------------------------------
// Types: Sandbox
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// The runner is pulling the source snapshot.
    PullingSnapshot,

    /// The runner is building the source snapshot.
    BuildingSnapshot,

    /// Running.
    Started,

    /// Stopped on its runner.
    Stopped,

    /// Filesystem state is being pushed to the backup registry.
    BackingUp,

    /// Stopped with an up-to-date backup.
    BackedUp,

    /// Lives only in the backup registry. Holds no runner.
    Archived,

    /// Being realized on a (new) runner from a backup or snapshot.
    Restoring,

    /// An unrecoverable failure happened. See `error_reason`.
    Error,

    /// Gone. Terminal.
    Destroyed,
}

text_enum!(SandboxState, "sandbox state", {
    PullingSnapshot => "pulling_snapshot",
    BuildingSnapshot => "building_snapshot",
    Started => "started",
    Stopped => "stopped",
    BackingUp => "backing_up",
    BackedUp => "backed_up",
    Archived => "archived",
    Restoring => "restoring",
    Error => "error",
    Destroyed => "destroyed",
});

impl SandboxState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Destroyed)
    }

    /// Whether a sandbox in this state must reference exactly one current runner.
    pub fn is_placed(&self) -> bool {
        !matches!(self, SandboxState::Destroyed | SandboxState::Archived)
    }

    /// Whether `self -> to` is a valid transition.
    pub fn can_transition_to(&self, to: SandboxState) -> bool {
        use SandboxState::*;

        if self.is_terminal() {
            return false;
        }

        if matches!(to, Error | Destroyed) {
            return true;
        }

        matches!(
            (self, to),
            (PullingSnapshot, BuildingSnapshot)
                | (PullingSnapshot, Started)
                | (BuildingSnapshot, Started)
                | (Started, Stopped)
                | (Started, Restoring)
                | (Stopped, Started)
                | (Stopped, BackingUp)
                | (Stopped, Restoring)
                | (BackingUp, BackedUp)
                | (BackedUp, BackingUp)
                | (BackedUp, Started)
                | (BackedUp, Archived)
                | (BackedUp, Restoring)
                | (Archived, Restoring)
                | (Restoring, Started)
                | (Restoring, Stopped)
                | (Error, Restoring)
        )
    }
}

/// A tenant's ephemeral compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    /// The unique identifier for the sandbox.
    pub id: String,

    /// The owning tenant.
    pub tenant_id: String,

    /// The region the sandbox was requested in.
    pub region_id: String,

    /// The current runner. Set while the sandbox is placed.
    pub runner_id: Option<String>,

    /// The previous runner, kept for migration bookkeeping.
    pub prev_runner_id: Option<String>,

    /// The source snapshot.
    pub snapshot_id: String,

    /// The requested resources.
    pub resources: Resources,

    /// The lifecycle state.
    pub state: SandboxState,

    /// The state the sandbox should settle in once in-flight work completes.
    pub desired_state: SandboxState,

    /// Whether the sandbox currently holds a reservation on `runner_id`.
    pub capacity_reserved: bool,

    /// The most recent backup image reference.
    pub backup_image: Option<String>,

    /// The registry holding `backup_image`.
    pub backup_registry_id: Option<String>,

    /// When the last backup completed.
    pub last_backup_at: Option<DateTime<Utc>>,

    /// Why the sandbox is in `error`.
    pub error_reason: Option<String>,

    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,

    /// When the sandbox was last modified.
    pub modified_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Types: Snapshot
//--------------------------------------------------------------------------------------------------

/// The build state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Registered but not built.
    Pending,

    /// A build is in flight.
    Building,

    /// Built and pushed.
    Active,

    /// The last build failed.
    Error,
}

text_enum!(SnapshotState, "snapshot state", {
    Pending => "pending",
    Building => "building",
    Active => "active",
    Error => "error",
});

/// A built, registry-stored filesystem image sandboxes are instantiated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The unique identifier for the snapshot.
    pub id: String,

    /// The owning tenant. `None` for platform-wide snapshots.
    pub tenant_id: Option<String>,

    /// The name, unique per tenant.
    pub name: String,

    /// The source image reference.
    pub image_name: String,

    /// A Dockerfile body, when the snapshot is built rather than pulled.
    pub build_context: Option<String>,

    /// The reference in the platform registry once pushed.
    pub internal_name: Option<String>,

    /// The build state.
    pub state: SnapshotState,

    /// Why the last build failed.
    pub error_reason: Option<String>,

    /// Resources used by sandboxes created from this snapshot.
    pub footprint: Resources,

    /// Hidden from end users.
    pub hidden: bool,

    /// The region the snapshot was built in.
    pub build_region_id: Option<String>,

    /// The registry the snapshot was pushed to.
    pub registry_id: Option<String>,

    /// When the snapshot was created.
    pub created_at: DateTime<Utc>,

    /// When the snapshot was last modified.
    pub modified_at: DateTime<Utc>,
}

/// Confirms a snapshot is available in a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRegion {
    /// The snapshot.
    pub snapshot_id: String,

    /// The region.
    pub region_id: String,

    /// When availability was confirmed.
    pub available_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Types: DockerRegistry
//--------------------------------------------------------------------------------------------------

/// The role a registry plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryType {
    /// Platform-managed build target.
    Internal,

    /// Tenant-supplied.
    Organization,

    /// Short-lived per-build credential.
    Transient,

    /// Sandbox state backups.
    Backup,
}

text_enum!(RegistryType, "registry type", {
    Internal => "internal",
    Organization => "organization",
    Transient => "transient",
    Backup => "backup",
});

/// A container registry the control plane pushes to or pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerRegistry {
    /// The unique identifier for the registry.
    pub id: String,

    /// A human name.
    pub name: String,

    /// The registry base URL.
    pub url: String,

    /// The registry project images are pushed under.
    pub project: String,

    /// Registry username.
    pub username: String,

    /// Registry password.
    pub password: String,

    /// The role the registry plays.
    pub registry_type: RegistryType,

    /// The owning tenant for `organization` registries.
    pub tenant_id: Option<String>,

    /// The region the registry serves, if region-scoped.
    pub region_id: Option<String>,

    /// Used when no more specific registry is configured.
    pub is_fallback: bool,

    /// When the registry was created.
    pub created_at: DateTime<Utc>,

    /// When the registry was last modified.
    pub modified_at: DateTime<Utc>,
}

impl DockerRegistry {
    /// The registry host without scheme, as used in image references.
    pub fn host(&self) -> &str {
        self.url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
    }

    /// Whether `other` points at the same storage.
    pub fn same_storage_as(&self, other: &DockerRegistry) -> bool {
        self.host() == other.host() && self.project == other.project
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
