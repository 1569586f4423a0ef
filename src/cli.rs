/// Command line interface of the lxce daemon
use crate::engine::Engine;
use crate::types::{LxceError, Result, DEFAULT_CONFIG_FILE};

use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lxced")]
#[command(version, about = "Contained space and app engine", long_about = None)]
pub struct Cli {
    /// Orchestrator config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR), overrides the config file
    #[arg(short, long)]
    pub level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start every configured space and manifest app (default)
    Start {
        /// Status file, overrides the config file
        #[arg(short = 'f', long)]
        status_file: Option<PathBuf>,
    },
    /// Validate the configuration and print a summary
    Check,
}

impl Cli {
    pub fn command(&self) -> Commands {
        match self.command {
            Some(Commands::Start { ref status_file }) => Commands::Start {
                status_file: status_file.clone(),
            },
            Some(Commands::Check) => Commands::Check,
            None => Commands::Start { status_file: None },
        }
    }
}

/// Map a level name to a log filter
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(LevelFilter::Trace),
        "DEBUG" => Ok(LevelFilter::Debug),
        "INFO" => Ok(LevelFilter::Info),
        "WARN" | "WARNING" => Ok(LevelFilter::Warn),
        "ERROR" => Ok(LevelFilter::Error),
        "OFF" => Ok(LevelFilter::Off),
        other => Err(LxceError::Config(format!("Unknown log level: {}", other))),
    }
}

/// Summary printed by `check`
pub fn check_report(engine: &Engine) -> serde_json::Value {
    let config = engine.config();
    let spaces: Vec<_> = engine
        .spaces()
        .iter()
        .map(|space| {
            serde_json::json!({
                "name": space.name,
                "type": space.kind.to_string(),
                "hostname": space.hostname,
                "rootfs": space.rootfs,
                "uid": space.uid,
                "gid": space.gid,
                "namespaces": format!("{:?}", space.namespaces),
                "capabilities": space.capabilities.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            })
        })
        .collect();

    serde_json::json!({
        "manifest": config.config.manifest,
        "status_file": config.config.status_file,
        "user_ns": {
            "offset": config.user_ns.offset,
            "count": config.user_ns.count,
        },
        "spaces": spaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_start() {
        let cli = Cli::parse_from(["lxced"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(cli.command(), Commands::Start { status_file: None });
    }

    #[test]
    fn test_check_with_overrides() {
        let cli = Cli::parse_from(["lxced", "-c", "/tmp/x.toml", "-l", "info", "check"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/x.toml"));
        assert_eq!(cli.level.as_deref(), Some("info"));
        assert_eq!(cli.command(), Commands::Check);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_level("WARNING").unwrap(), LevelFilter::Warn);
        assert!(parse_level("loud").is_err());
    }
}
