use std::path::Path;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Loads a `.env` file from the working directory, then one from the monoplane home.
///
/// Variables already set in the process environment are never overridden.
pub fn load_dotenv(home: &Path) {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!("loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("failed to load .env: {}", e),
    }

    let home_env = home.join(".env");
    if home_env.exists() {
        if let Err(e) = dotenvy::from_path(&home_env) {
            tracing::warn!("failed to load {}: {}", home_env.display(), e);
        }
    }
}
