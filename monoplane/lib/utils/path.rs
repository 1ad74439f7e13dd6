use std::path::PathBuf;

use crate::config::DEFAULT_MONOPLANE_HOME;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the user's home where monoplane keeps its data.
pub const MONOPLANE_HOME_DIR: &str = ".monoplane";

/// The filename of the control plane database.
pub const CONTROL_DB_FILENAME: &str = "control.db";

/// The filename of the configuration file looked up in the monoplane home.
pub const MONOPLANE_CONFIG_FILENAME: &str = "monoplane.toml";

/// Environment variable pointing at the monoplane home directory.
pub const MONOPLANE_HOME_ENV_VAR: &str = "MONOPLANE_HOME";

/// Environment variable pointing at the configuration file.
pub const MONOPLANE_CONFIG_ENV_VAR: &str = "MONOPLANE_CONFIG";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the monoplane home directory.
///
/// `MONOPLANE_HOME` takes precedence over `~/.monoplane`.
pub fn monoplane_home_path() -> PathBuf {
    std::env::var(MONOPLANE_HOME_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| DEFAULT_MONOPLANE_HOME.clone())
}

/// Returns the configuration file path.
///
/// `MONOPLANE_CONFIG` takes precedence over `$MONOPLANE_HOME/monoplane.toml`.
pub fn monoplane_config_path() -> PathBuf {
    std::env::var(MONOPLANE_CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| monoplane_home_path().join(MONOPLANE_CONFIG_FILENAME))
}
