use std::path::Path;

use clap::{CommandFactory, Parser};
use monoplane::{
    bootstrap,
    cli::{MonoplaneArgs, MonoplaneSubcommand},
    config::MonoplaneConfig,
    utils, MonoplaneResult, Services,
};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The log filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "monoplane=info";

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> MonoplaneResult<()> {
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = MonoplaneArgs::parse();
    let home = args.home.clone().unwrap_or_else(utils::monoplane_home_path);
    utils::load_dotenv(&home);
    let config_path = args.config.clone().unwrap_or_else(utils::monoplane_config_path);

    match args.subcommand {
        Some(MonoplaneSubcommand::Serve) => {
            let config = load_config(&config_path).await?;
            serve(&config, &home).await?;
        }
        Some(MonoplaneSubcommand::Bootstrap { wait }) => {
            let config = load_config(&config_path).await?;
            let services = Services::open(&config, &home).await?;
            let report = bootstrap::bootstrap(&services, &config).await?;
            if let (true, Some(readiness)) = (wait, report.readiness) {
                if !readiness.await.unwrap_or(false) {
                    tracing::warn!("default runner did not become ready");
                }
            }
            services.shutdown().await;
        }
        Some(MonoplaneSubcommand::CheckConfig) => {
            MonoplaneConfig::load(&config_path).await?;
            println!("{} is valid", config_path.display());
        }
        None => {
            MonoplaneArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

async fn load_config(path: &Path) -> MonoplaneResult<MonoplaneConfig> {
    if tokio::fs::try_exists(path).await? {
        return MonoplaneConfig::load(path).await;
    }

    tracing::warn!("no configuration at {}, using defaults", path.display());
    Ok(MonoplaneConfig::default())
}

async fn serve(config: &MonoplaneConfig, home: &Path) -> MonoplaneResult<()> {
    let services = Services::open(config, home).await?;
    bootstrap::bootstrap(&services, config).await?;
    let auto_migration = services.start().await?;

    tracing::info!("monoplane is serving, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    services.shutdown().await;
    if let Err(e) = auto_migration.await {
        tracing::error!("auto-migration task ended abnormally: {e}");
    }

    Ok(())
}
