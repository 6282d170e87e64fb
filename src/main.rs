// src/main.rs - Actuator host entry point
use std::path::PathBuf;

use clap::Parser;
use linact_rs::config::{self, Config, Protocol};
use linact_rs::hardware::serial::{stdio_link, SerialLink};
use linact_rs::ActuatorSystem;

#[derive(Parser, Debug)]
#[command(name = "actuator-host", version, about = "Closed-loop linear actuator positioning host")]
struct Args {
    /// TOML configuration file; built-in defaults are used when omitted
    config: Option<PathBuf>,

    /// Read commands from this serial port instead of stdin
    #[arg(long)]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Command surface: gcode, terminal or both
    #[arg(long)]
    protocol: Option<Protocol>,

    /// Include raw readings and drive output in transition events
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<tracing::Level>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_config(path).map_err(|e| {
            eprintln!("Failed to load config from '{}': {}", path.display(), e);
            e
        })?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    let level = match args.log_level {
        Some(level) => level,
        None => config.logging.level.parse().unwrap_or(tracing::Level::INFO),
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting actuator host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => tracing::info!("Configuration: {}", path.display()),
        None => tracing::info!("Configuration: built-in defaults"),
    }
    tracing::info!("Protocol: {:?}", config.interface.protocol);

    let serial = config.interface.serial.clone();
    let baud = config.interface.baud;
    let system = ActuatorSystem::new(config).map_err(|e| {
        tracing::error!("Failed to initialize actuator: {}", e);
        e
    })?;

    match serial {
        Some(path) => {
            let link = SerialLink::open(&path, baud).map_err(|e| {
                tracing::error!("Failed to open serial port {}: {}", path, e);
                e
            })?;
            system.run(link).await?;
        }
        None => system.run(stdio_link()).await?,
    }
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(serial) = &args.serial {
        config.interface.serial = Some(serial.clone());
    }
    if let Some(baud) = args.baud {
        config.interface.baud = baud;
    }
    if let Some(protocol) = args.protocol {
        config.interface.protocol = protocol;
    }
    if args.verbose {
        config.logging.verbose = true;
    }
}
