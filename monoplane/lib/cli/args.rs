use std::path::PathBuf;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Parser,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// monoplane - places sandboxes onto a fleet of remote runners
#[derive(Debug, Parser)]
#[command(name = "monoplane", author, about, version, styles = styles())]
pub struct MonoplaneArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<MonoplaneSubcommand>,

    /// Path of the configuration file. Defaults to `$MONOPLANE_CONFIG`
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// The home directory holding the store. Defaults to `$MONOPLANE_HOME`
    #[arg(long, global = true, value_name = "PATH")]
    pub home: Option<PathBuf>,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum MonoplaneSubcommand {
    /// Bootstrap the platform and run until interrupted
    #[command(name = "serve")]
    Serve,

    /// Bootstrap the platform once and exit
    #[command(name = "bootstrap")]
    Bootstrap {
        /// Wait for the default runner to become ready before exiting
        #[arg(long)]
        wait: bool,
    },

    /// Validate the configuration file and exit
    #[command(name = "check-config")]
    CheckConfig,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The help output styles.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::White.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_parse_subcommands() {
        MonoplaneArgs::command().debug_assert();

        let args = MonoplaneArgs::parse_from(["monoplane", "serve", "--config", "/etc/m.toml"]);
        assert!(matches!(args.subcommand, Some(MonoplaneSubcommand::Serve)));
        assert_eq!(args.config, Some(PathBuf::from("/etc/m.toml")));

        let args = MonoplaneArgs::parse_from(["monoplane", "bootstrap", "--wait"]);
        assert!(matches!(
            args.subcommand,
            Some(MonoplaneSubcommand::Bootstrap { wait: true })
        ));
    }
}
