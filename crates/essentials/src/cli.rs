//! Command-line interface handling for the Essentials storage host.
//!
//! Every option here overrides the matching setting from the config file.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the storage data directory
    pub data_dir: Option<PathBuf>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Rebuild the user cache at startup even when it looks current
    pub rebuild_user_cache: bool,
}

impl CliArgs {
    /// Parses the process arguments.
    ///
    /// # Returns
    ///
    /// A `CliArgs` instance containing all parsed command-line options.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Parses an explicit argument list, first item being the binary name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&Self::command().try_get_matches_from(args)?))
    }

    fn command() -> Command {
        Command::new("Essentials Storage Host")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Persistent player, world and server data for the Essentials plugin")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("data-dir")
                    .short('d')
                    .long("data-dir")
                    .value_name("DIR")
                    .help("Directory holding all stored documents"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("rebuild-user-cache")
                    .long("rebuild-user-cache")
                    .help("Rebuild the user cache from every user document at startup")
                    .action(clap::ArgAction::SetTrue),
            )
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            data_dir: matches.get_one::<String>("data-dir").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            rebuild_user_cache: matches.get_flag("rebuild-user-cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["essentials"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.data_dir.is_none());
        assert!(args.log_level.is_none());
        assert!(!args.json_logs);
        assert!(!args.rebuild_user_cache);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::try_parse_from([
            "essentials",
            "-c",
            "server.toml",
            "--data-dir",
            "/srv/essentials",
            "-l",
            "debug",
            "--json-logs",
            "--rebuild-user-cache",
        ])
        .unwrap();
        assert_eq!(args.config_path, PathBuf::from("server.toml"));
        assert_eq!(args.data_dir, Some(PathBuf::from("/srv/essentials")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert!(args.rebuild_user_cache);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(CliArgs::try_parse_from(["essentials", "--bind", "0.0.0.0:1"]).is_err());
    }
}
