/// lxced: contained space and app engine
///
/// Reads the orchestrator config, creates every configured contained space
/// and starts the manifest apps inside them. Runs until SIGINT, SIGTERM or
/// SIGHUP, then tears the spaces down.
///
/// # Usage
/// ```bash
/// lxced --config /etc/lxce/lxce.toml
/// lxced --config /etc/lxce/lxce.toml check
/// ```
use anyhow::{Context, Result};
use clap::Parser;
use lxce::cli::{self, Cli, Commands};
use lxce::engine::{Engine, StatusFile};
use lxce::signal::SignalHandler;
use lxce::types::LxceConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LxceConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let level = cli::parse_level(cli.level.as_deref().unwrap_or(&config.config.level))?;
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match cli.command() {
        Commands::Check => {
            let engine = Engine::from_config(config)?;
            println!("{}", serde_json::to_string_pretty(&cli::check_report(&engine))?);
            Ok(())
        }
        Commands::Start { status_file } => {
            let status_file = status_file.unwrap_or_else(|| config.config.status_file.clone());
            start(config, StatusFile::new(&status_file))
        }
    }
}

fn start(config: LxceConfig, status: StatusFile) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        log::warn!("lxced is not running as root, space creation will most likely fail");
    }

    status.started(std::process::id())?;
    let signals = SignalHandler::init()?;

    let mut engine = Engine::from_config(config)?;
    let result = engine
        .start()
        .and_then(|()| engine.run_until(|| signals.shutdown_requested()));

    if let Some(signal) = signals.received() {
        log::info!("Received {}, shutting down", signal);
    }
    engine.shutdown();

    let code = match result {
        Ok(()) => 0,
        Err(ref e) => {
            log::error!("lxced exiting: {}", e);
            1
        }
    };
    status.exited(code)?;

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
