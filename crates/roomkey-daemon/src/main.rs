//! roomkey - Keypad installation inspector and live monitor
//!
//! Offline subcommands ingest an installation export and print what they
//! find; `monitor` and `time` talk to the control processor.

mod config;
mod state;

use anyhow::{bail, Context, Result};
use chrono::Timelike;
use clap::{Parser, Subcommand};
use roomkey_core::{load_export, Ingestion};
use roomkey_telnet::CommandSender;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "roomkey")]
#[command(about = "Keypad installation inspector and live monitor")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "roomkey.toml", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List rooms, devices, and buttons of an export
    Rooms {
        export: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List the named sections of an export
    Sections {
        export: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Connect, poll keypads, and print state changes until Ctrl-C
    Monitor {
        /// Export to load (defaults to the configured path)
        #[arg(long)]
        export: Option<PathBuf>,
        /// Only poll keypads of this room
        #[arg(long)]
        room: Option<String>,
    },
    /// Query the processor clock, or set its hour
    Time {
        /// Hour to set; the current local hour when given without a value
        #[arg(long, num_args = 0..=1, value_name = "HOUR")]
        set: Option<Option<u8>>,
    },
    /// Write a default configuration file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("roomkey v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::InitConfig = args.command {
        return config::save_default_config(&args.config);
    }

    let config = config::load_config(&args.config)?;

    match args.command {
        Commands::Rooms { export, json } => {
            let ingestion = ingest(&config, &export)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ingestion.topology)?);
            } else {
                print_rooms(&ingestion);
            }
        }
        Commands::Sections { export, json } => {
            let ingestion = ingest(&config, &export)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ingestion.sections)?);
            } else {
                print_sections(&ingestion);
            }
        }
        Commands::Monitor { export, room } => monitor(config, export, room).await?,
        Commands::Time { set } => time(config, set).await?,
        Commands::InitConfig => {}
    }

    Ok(())
}

fn ingest(config: &Config, path: &Path) -> Result<Ingestion> {
    let ingestion = load_export(path, &config.to_export_format())?;
    info!(
        rooms = ingestion.topology.rooms.len(),
        devices = ingestion.topology.device_count(),
        "Export ingested"
    );
    Ok(ingestion)
}

fn print_rooms(ingestion: &Ingestion) {
    for room in &ingestion.topology.rooms {
        println!("{}", room.key);
        for device in &room.devices {
            let width = device
                .keypad_width()
                .map(|w| format!(", {}-wide", w))
                .unwrap_or_default();
            println!(
                "  {} [{}] {} ({} buttons{})",
                device.id,
                device.model,
                device.name,
                device.real_button_count(),
                width
            );
            for (i, button) in device.buttons.iter().enumerate() {
                let marker = if button.placeholder { "-" } else { " " };
                println!("    {}{:>2} {}", marker, i + 1, button.label);
            }
        }
    }
}

fn print_sections(ingestion: &Ingestion) {
    for section in &ingestion.sections.sections {
        println!("{}", section.name);
        for entry in &section.entries {
            println!("  {} = {}", entry.key, entry.value);
        }
    }
}

async fn monitor(config: Config, export: Option<PathBuf>, room: Option<String>) -> Result<()> {
    let export = export.unwrap_or_else(|| PathBuf::from(&config.export.path));
    let mut state = AppState::new(config);
    state.load_export(&export)?;

    if let Some(room) = &room {
        if state.registry.room(room).is_none() {
            bail!("room {:?} not found in {}", room, export.display());
        }
    }

    let printer = tokio::spawn(state::print_notifications(state.subscribe()));

    state.connect().await?;
    state.start().await?;
    let sent = state.poll(room.as_deref()).await?;
    info!(commands = sent, "Monitoring, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("Shutting down");
    state.shutdown().await;
    printer.abort();
    Ok(())
}

async fn time(config: Config, set: Option<Option<u8>>) -> Result<()> {
    let mut state = AppState::new(config);
    let printer = tokio::spawn(state::print_notifications(state.subscribe()));

    state.connect().await?;
    state.start().await?;

    let sender = CommandSender::new(&state.session);
    match set {
        None => sender.get_time().await?,
        Some(hour) => {
            let hour = match hour {
                Some(h) if h < 24 => h,
                Some(h) => bail!("hour {} is out of range", h),
                None => chrono::Local::now().hour() as u8,
            };
            sender.set_time(hour).await?;
        }
    }

    // Give the reply a moment to arrive and be dispatched
    let settle = state.config.polling.scan_interval_ms.max(100) * 5;
    tokio::time::sleep(std::time::Duration::from_millis(settle)).await;

    state.shutdown().await;
    printer.abort();
    Ok(())
}
