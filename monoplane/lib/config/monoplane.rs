//! Monoplane configuration types and helpers.

use std::{path::Path, path::PathBuf, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::*;
use crate::{models::RunnerApiVersion, models::Resources, MonoplaneError, MonoplaneResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The monoplane configuration, read once at process start.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct MonoplaneConfig {
    /// Where the store lives.
    #[serde(default)]
    #[builder(default)]
    pub(super) database: DatabaseConfig,

    /// The default region created at bootstrap.
    #[serde(default)]
    #[builder(default)]
    pub(super) region: RegionConfig,

    /// The default runner registered at bootstrap, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(super) runner: Option<RunnerConfig>,

    /// The default registries created at bootstrap.
    #[serde(default)]
    #[builder(default)]
    pub(super) registry: RegistryConfig,

    /// Runner fleet tuning.
    #[serde(default)]
    #[builder(default)]
    pub(super) fleet: FleetConfig,

    /// Sandbox orchestration tuning.
    #[serde(default)]
    #[builder(default)]
    pub(super) orchestrator: OrchestratorConfig,

    /// Snapshot pipeline tuning.
    #[serde(default)]
    #[builder(default)]
    pub(super) snapshots: SnapshotConfig,
}

/// Store location.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct DatabaseConfig {
    /// Path of the SQLite file. Defaults to `$MONOPLANE_HOME/control.db`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    pub(super) path: Option<PathBuf>,
}

/// The default region.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct RegionConfig {
    /// The region id.
    #[serde(default = "RegionConfig::default_id")]
    #[builder(default = RegionConfig::default_id(), setter(into))]
    pub(super) id: String,

    /// The region name.
    #[serde(default = "RegionConfig::default_name")]
    #[builder(default = RegionConfig::default_name(), setter(into))]
    pub(super) name: String,

    /// Whether quota enforcement applies in the region.
    #[serde(default = "RegionConfig::default_enforce_quotas")]
    #[builder(default = RegionConfig::default_enforce_quotas())]
    pub(super) enforce_quotas: bool,
}

/// Connection parameters of the default runner.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct RunnerConfig {
    /// The runner id.
    #[builder(setter(into))]
    pub(super) id: String,

    /// The runner API base URL.
    #[builder(setter(into))]
    pub(super) api_url: String,

    /// The runner API bearer credential.
    #[builder(setter(into))]
    pub(super) api_key: String,

    /// The protocol generation.
    #[serde(default = "RunnerConfig::default_api_version")]
    #[builder(default = RunnerConfig::default_api_version())]
    pub(super) api_version: RunnerApiVersion,

    /// Advertised vCPUs.
    pub(super) cpu: i64,

    /// Advertised memory in GiB.
    pub(super) memory: i64,

    /// Advertised disk in GiB.
    pub(super) disk: i64,
}

/// Credentials for one registry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct RegistryCredentials {
    /// The registry base URL.
    #[builder(setter(into))]
    pub(super) url: String,

    /// The project images are pushed under.
    #[builder(setter(into))]
    pub(super) project: String,

    /// Registry username.
    #[builder(setter(into))]
    pub(super) username: String,

    /// Registry password.
    #[builder(setter(into))]
    pub(super) password: String,
}

/// The default registries.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct RegistryConfig {
    /// The internal build target, created as the fallback registry.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(super) internal: Option<RegistryCredentials>,

    /// The registry sandbox backups are pushed to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(super) backup: Option<RegistryCredentials>,
}

/// Runner fleet tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct FleetConfig {
    /// Seconds between health checks of one runner.
    #[builder(default = DEFAULT_HEALTH_CHECK_INTERVAL_SECS)]
    pub(super) health_check_interval_secs: u64,

    /// Deadline of a single health check, in seconds.
    #[builder(default = DEFAULT_HEALTH_CHECK_TIMEOUT_SECS)]
    pub(super) health_check_timeout_secs: u64,

    /// Consecutive failures before `ready -> unresponsive`.
    #[builder(default = DEFAULT_UNHEALTHY_THRESHOLD)]
    pub(super) unhealthy_threshold: i64,

    /// Seconds of sustained unresponsiveness before a runner is disabled.
    #[builder(default = DEFAULT_DISABLE_AFTER_SECS)]
    pub(super) disable_after_secs: u64,

    /// Startup polls of the default runner.
    #[builder(default = DEFAULT_BOOTSTRAP_ATTEMPTS)]
    pub(super) bootstrap_attempts: u32,

    /// Milliseconds between startup polls of the default runner.
    #[builder(default = DEFAULT_BOOTSTRAP_INTERVAL_MS)]
    pub(super) bootstrap_interval_ms: u64,

    /// Status polls of a v2 runner before a desired state is abandoned.
    #[builder(default = DEFAULT_POLL_ATTEMPTS)]
    pub(super) poll_attempts: u32,

    /// Milliseconds between v2 status polls.
    #[builder(default = DEFAULT_POLL_INTERVAL_MS)]
    pub(super) poll_interval_ms: u64,

    /// Deadline of a single runner operation, in seconds.
    #[builder(default = DEFAULT_OPERATION_TIMEOUT_SECS)]
    pub(super) operation_timeout_secs: u64,

    /// Transport-level retries of a single HTTP request to a runner or registry.
    #[builder(default = DEFAULT_HTTP_RETRIES)]
    pub(super) http_retries: u32,
}

/// Sandbox orchestration tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bounded retries of transient adapter failures.
    #[builder(default = DEFAULT_ADAPTER_RETRIES)]
    pub(super) adapter_retries: u32,

    /// Lower bound of the retry backoff, in milliseconds.
    #[builder(default = DEFAULT_RETRY_MIN_BACKOFF_MS)]
    pub(super) retry_min_backoff_ms: u64,

    /// Upper bound of the retry backoff, in milliseconds.
    #[builder(default = DEFAULT_RETRY_MAX_BACKOFF_MS)]
    pub(super) retry_max_backoff_ms: u64,

    /// Re-selections after losing a reservation race.
    #[builder(default = DEFAULT_PLACEMENT_ATTEMPTS)]
    pub(super) placement_attempts: u32,

    /// Migrate sandboxes off runners that become unresponsive.
    #[builder(default = false)]
    pub(super) auto_migrate: bool,
}

/// Snapshot pipeline tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct SnapshotConfig {
    /// Lifetime of the robot account requested for each push, in seconds.
    #[builder(default = DEFAULT_ROBOT_ACCOUNT_DURATION_SECS)]
    pub(super) robot_account_duration_secs: i64,

    /// Footprint used when a snapshot does not declare one.
    #[builder(default = Resources::new(DEFAULT_SNAPSHOT_CPU, DEFAULT_SNAPSHOT_MEMORY_GIB, DEFAULT_SNAPSHOT_DISK_GIB))]
    pub(super) default_footprint: Resources,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MonoplaneConfig {
    /// Reads and validates a TOML configuration file.
    pub async fn load(path: impl AsRef<Path>) -> MonoplaneResult<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!("loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parses and validates a TOML configuration.
    pub fn from_toml_str(contents: &str) -> MonoplaneResult<Self> {
        let config: MonoplaneConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that serde cannot.
    pub fn validate(&self) -> MonoplaneResult<()> {
        if let Some(runner) = &self.runner {
            if !runner.capacity().is_positive() {
                return Err(MonoplaneError::Validation(format!(
                    "default runner {} must advertise positive capacity",
                    runner.id
                )));
            }

            if runner.api_url.is_empty() {
                return Err(MonoplaneError::Validation(format!(
                    "default runner {} has no api_url",
                    runner.id
                )));
            }
        }

        if self.fleet.unhealthy_threshold < 1 {
            return Err(MonoplaneError::Validation(
                "fleet.unhealthy_threshold must be at least 1".to_string(),
            ));
        }

        if self.fleet.health_check_interval_secs == 0 {
            return Err(MonoplaneError::Validation(
                "fleet.health_check_interval_secs must be positive".to_string(),
            ));
        }

        if self.orchestrator.retry_min_backoff_ms > self.orchestrator.retry_max_backoff_ms {
            return Err(MonoplaneError::Validation(
                "orchestrator.retry_min_backoff_ms exceeds retry_max_backoff_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// The store path, falling back to the home directory.
    pub fn database_path(&self, home: impl AsRef<Path>) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| home.as_ref().join(crate::utils::CONTROL_DB_FILENAME))
    }
}

impl RegionConfig {
    fn default_id() -> String {
        DEFAULT_REGION_ID.to_string()
    }

    fn default_name() -> String {
        DEFAULT_REGION_NAME.to_string()
    }

    fn default_enforce_quotas() -> bool {
        true
    }
}

impl RunnerConfig {
    fn default_api_version() -> RunnerApiVersion {
        RunnerApiVersion::V0
    }

    /// The advertised capacity triple.
    pub fn capacity(&self) -> Resources {
        Resources::new(self.cpu, self.memory, self.disk)
    }
}

impl FleetConfig {
    /// The health check period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// The health check deadline.
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    /// How long a runner may stay unresponsive before it is disabled.
    pub fn disable_after(&self) -> Duration {
        Duration::from_secs(self.disable_after_secs)
    }

    /// The pause between startup polls of the default runner.
    pub fn bootstrap_interval(&self) -> Duration {
        Duration::from_millis(self.bootstrap_interval_ms)
    }

    /// The pause between v2 status polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The deadline of a single runner operation.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl OrchestratorConfig {
    /// The lower bound of the retry backoff.
    pub fn retry_min_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_min_backoff_ms)
    }

    /// The upper bound of the retry backoff.
    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for RegionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_document() -> anyhow::Result<()> {
        let config = MonoplaneConfig::from_toml_str("")?;

        assert_eq!(config.get_region().get_id(), DEFAULT_REGION_ID);
        assert!(config.get_runner().is_none());
        assert_eq!(
            *config.get_fleet().get_bootstrap_attempts(),
            DEFAULT_BOOTSTRAP_ATTEMPTS
        );
        assert_eq!(
            config.get_fleet().poll_interval(),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        );
        assert!(!config.get_orchestrator().get_auto_migrate());

        Ok(())
    }

    #[test]
    fn test_config_parses_full_document() -> anyhow::Result<()> {
        let config = MonoplaneConfig::from_toml_str(
            r#"
            [database]
            path = "/var/lib/monoplane/control.db"

            [region]
            id = "eu"
            name = "eu-central"
            enforce_quotas = false

            [runner]
            id = "default-runner"
            api_url = "http://localhost:3003"
            api_key = "secret"
            api_version = "v2"
            cpu = 4
            memory = 8
            disk = 50

            [registry.internal]
            url = "https://registry.internal"
            project = "monoplane"
            username = "admin"
            password = "harbor"

            [fleet]
            health_check_interval_secs = 3
            unhealthy_threshold = 2

            [orchestrator]
            auto_migrate = true
            "#,
        )?;

        assert_eq!(config.get_region().get_name(), "eu-central");
        let runner = config.get_runner().as_ref().unwrap();
        assert_eq!(*runner.get_api_version(), RunnerApiVersion::V2);
        assert_eq!(runner.capacity(), Resources::new(4, 8, 50));
        assert!(config.get_registry().get_internal().is_some());
        assert!(config.get_registry().get_backup().is_none());
        assert_eq!(*config.get_fleet().get_unhealthy_threshold(), 2);
        assert_eq!(
            *config.get_fleet().get_health_check_timeout_secs(),
            DEFAULT_HEALTH_CHECK_TIMEOUT_SECS
        );
        assert!(config.get_orchestrator().get_auto_migrate());
        assert_eq!(
            config.database_path("/home"),
            PathBuf::from("/var/lib/monoplane/control.db")
        );

        Ok(())
    }

    #[test]
    fn test_config_rejects_runner_without_capacity() {
        let result = MonoplaneConfig::from_toml_str(
            r#"
            [runner]
            id = "r"
            api_url = "http://localhost:3003"
            api_key = "k"
            cpu = 0
            memory = 8
            disk = 50
            "#,
        );

        assert!(matches!(result, Err(MonoplaneError::Validation(_))));
    }
}
