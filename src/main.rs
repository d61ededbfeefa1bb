mod app;
mod domain;
mod infrastructure;

use anyhow::Context;
use clap::{Parser, Subcommand};
use domain::parser;
use domain::settings::SettingsService;
use infrastructure::bluetooth::connection::strategies_from_settings;
use infrastructure::bluetooth::protocol;
use infrastructure::bluetooth::scanner::BluetoothctlScanner;
use infrastructure::bluetooth::LinkManager;
use infrastructure::{logging, turret};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Voice control for the DMG turret.
#[derive(Parser)]
#[command(name = "turret_voice", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a settings file.
    #[arg(long, global = true, env = "TURRET_CONFIG")]
    config: Option<PathBuf>,

    /// Bluetooth address of the turret, overrides the settings file.
    #[arg(long, global = true, env = "TURRET_TARGET")]
    target: Option<String>,

    /// Log filter such as `debug` or `turret_voice=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the turret and read transcripts from stdin (default).
    Run,
    /// Parse one transcript and print the resulting frame.
    Parse {
        /// Words of the transcript.
        #[arg(required = true)]
        words: Vec<String>,
    },
    /// Pretend to be the turret on a TCP port.
    Simulate {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: SocketAddr,
        /// Append control lines to this file instead of stdout.
        #[arg(long)]
        control_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::load(path.clone()),
        None => SettingsService::new()?,
    };

    let _log_guard = logging::init_logger(
        &settings_service.get().log_settings,
        cli.log_level.as_deref(),
    )?;
    info!(settings = %settings_service.path().display(), "Starting turret voice control");

    // Leave an editable settings file behind on first start
    if !settings_service.path().exists() {
        match settings_service.save() {
            Ok(()) => info!("Wrote default settings to {}", settings_service.path().display()),
            Err(e) => warn!(error = %e, "Could not write default settings"),
        }
    }
    if let Some(target) = &cli.target {
        settings_service.get_mut().link.target_address = Some(target.clone());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_console(&settings_service).await,
        Commands::Parse { words } => {
            println!("{}", parse_report(&words));
            Ok(())
        }
        Commands::Simulate {
            listen,
            control_file,
        } => turret::run_simulator(listen, control_file).await,
    }
}

async fn run_console(settings_service: &SettingsService) -> anyhow::Result<()> {
    let link_settings = &settings_service.get().link;
    let target = link_settings.target();
    if target.address.is_none() && target.name.is_none() {
        warn!("No turret configured, set link.target_address or pass --target");
    }

    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (manager, link) = LinkManager::new(
        target,
        BluetoothctlScanner::new(link_settings.scan_duration_secs),
        strategies_from_settings(link_settings),
        app_tx.clone(),
    );
    let manager_task = tokio::spawn(manager.run());

    link.start_discovery();
    let mut console = app::Console::new(link.clone(), app_tx, app_rx, tokio::io::stdout());
    let result = console
        .run(BufReader::new(tokio::io::stdin()))
        .await
        .context("console failed");

    link.shutdown();
    if let Err(e) = manager_task.await {
        warn!(error = %e, "Link manager task ended abnormally");
    }
    result
}

/// One-line summary of how a transcript parses, with its frame when valid.
fn parse_report(words: &[String]) -> String {
    let command = parser::parse(words);
    if command.is_valid() {
        let frame = protocol::encode(&command);
        format!("{:?}: {} {:?}", command.opcode(), command.describe(), frame)
    } else {
        command.describe()
    }
}
