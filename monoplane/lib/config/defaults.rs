use std::{path::PathBuf, sync::LazyLock};

use crate::utils::MONOPLANE_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The id of the region created at bootstrap.
pub const DEFAULT_REGION_ID: &str = "us";

/// The name of the region created at bootstrap.
pub const DEFAULT_REGION_NAME: &str = "us";

/// How often each runner is health checked, in seconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

/// Deadline for a single health check, in seconds.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Consecutive failed health checks before a runner is marked unresponsive.
pub const DEFAULT_UNHEALTHY_THRESHOLD: i64 = 3;

/// How long a runner may stay unresponsive before it is disabled, in seconds.
pub const DEFAULT_DISABLE_AFTER_SECS: u64 = 30 * 60;

/// How many times the default runner is polled at startup.
pub const DEFAULT_BOOTSTRAP_ATTEMPTS: u32 = 30;

/// The pause between default runner startup polls, in milliseconds.
pub const DEFAULT_BOOTSTRAP_INTERVAL_MS: u64 = 1000;

/// How many times a v2 runner's status is polled before giving up.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 30;

/// The pause between v2 status polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Deadline for a single runner operation, in seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;

/// Transport-level retries of a single HTTP request.
pub const DEFAULT_HTTP_RETRIES: u32 = 3;

/// Bounded retries for transient adapter failures.
pub const DEFAULT_ADAPTER_RETRIES: u32 = 3;

/// Lower bound of the retry backoff, in milliseconds.
pub const DEFAULT_RETRY_MIN_BACKOFF_MS: u64 = 200;

/// Upper bound of the retry backoff, in milliseconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 5000;

/// How many times placement re-selects after losing a reservation race.
pub const DEFAULT_PLACEMENT_ATTEMPTS: u32 = 5;

/// Lifetime of a registry robot account, in seconds.
pub const DEFAULT_ROBOT_ACCOUNT_DURATION_SECS: i64 = 3600;

/// The default CPU footprint of a snapshot.
pub const DEFAULT_SNAPSHOT_CPU: i64 = 1;

/// The default memory footprint of a snapshot, in GiB.
pub const DEFAULT_SNAPSHOT_MEMORY_GIB: i64 = 1;

/// The default disk footprint of a snapshot, in GiB.
pub const DEFAULT_SNAPSHOT_DISK_GIB: i64 = 3;

/// The path where all monoplane global data is stored.
pub static DEFAULT_MONOPLANE_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(MONOPLANE_HOME_DIR)
});
