mod config;
mod controller;
mod error;
mod lifecycle;
mod locator;
mod probe;
mod server;
mod setup;

use clap::Parser;
use config::{AgentConfig, DEFAULT_AGENT_PORT, DEFAULT_COMPANION_PORT};
use controller::platform_controller;
use dialoguer::console::style;
use error::AgentError;
use lifecycle::{LifecycleManager, Timings};
use probe::{HttpProbe, DEFAULT_PROBE_TIMEOUT};
use server::{Dispatcher, AGENT_NAME};
use setup::SetupOptions;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "t2-agent", version, about = "T2AutoTron Local Agent")]
struct Cli {
    /// Port for the agent's own HTTP server (default 5050)
    #[arg(long)]
    port: Option<u16>,
    /// Discard the saved config and run setup again
    #[arg(long, default_value_t = false)]
    reconfigure: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Configure from this Chatterbox folder without prompting
    #[arg(long)]
    install_dir: Option<PathBuf>,
    #[arg(long)]
    companion_port: Option<u16>,
    /// Run setup, save the config and exit
    #[arg(long, default_value_t = false)]
    setup_only: bool,
}

fn main() -> Result<(), AgentError> {
    init_logging();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("{err}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("t2_agent=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<(), AgentError> {
    let config_path = config::resolve_config_path(cli.config.as_ref());
    if cli.reconfigure {
        match config::remove(&config_path) {
            Ok(true) => tracing::info!(path = %config_path.display(), "removed saved config"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %config_path.display(), error = %err, "could not remove config"),
        }
    }

    let mut cfg = load_or_setup(cli, &config_path)?;
    if cli.setup_only {
        return Ok(());
    }
    if let Some(port) = cli.companion_port {
        cfg.companion_port = port;
    }
    let agent_port = cli.port.unwrap_or(cfg.agent_port);

    let listener = TcpListener::bind(("0.0.0.0", agent_port)).map_err(|err| {
        AgentError::Process(format!("failed to bind agent port {agent_port}: {err}"))
    })?;
    let manager = LifecycleManager::new(
        cfg,
        platform_controller(),
        Box::new(HttpProbe::new(DEFAULT_PROBE_TIMEOUT)),
        Timings::default(),
    );
    print_running_banner(agent_port, manager.config());
    tracing::info!(
        port = agent_port,
        companion_port = manager.config().companion_port,
        "agent listening"
    );
    server::serve(listener, Arc::new(Dispatcher::new(Arc::new(manager))))
}

fn load_or_setup(cli: &Cli, config_path: &Path) -> Result<AgentConfig, AgentError> {
    if !cli.reconfigure && cli.install_dir.is_none() {
        if let Some(cfg) = config::load_valid(config_path) {
            return Ok(cfg);
        }
    }
    let options = SetupOptions {
        install_dir: cli.install_dir.clone(),
        companion_port: cli.companion_port.unwrap_or(DEFAULT_COMPANION_PORT),
        agent_port: cli.port.unwrap_or(DEFAULT_AGENT_PORT),
    };
    setup::run_setup(config_path, &options)
}

fn print_running_banner(port: u16, cfg: &AgentConfig) {
    println!();
    println!("{}", style(format!("{AGENT_NAME} is RUNNING")).bold().cyan());
    println!("  Agent URL:   http://localhost:{port}");
    println!("  Chatterbox:  {}", cfg.install_dir.display());
    println!("  Companion:   port {}", cfg.companion_port);
    println!();
    println!("{}", style("Keep this window open while using T2. Press Ctrl+C to stop the agent.").dim());
    println!("Waiting for commands...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_port_and_reconfigure() {
        let cli = Cli::try_parse_from(["t2-agent", "--port", "6060", "--reconfigure"]).unwrap();
        assert_eq!(cli.port, Some(6060));
        assert!(cli.reconfigure);
        assert!(!cli.setup_only);
        assert!(cli.install_dir.is_none());
    }

    #[test]
    fn cli_rejects_out_of_range_port() {
        assert!(Cli::try_parse_from(["t2-agent", "--port", "70000"]).is_err());
    }
}
