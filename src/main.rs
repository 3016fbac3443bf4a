//! CLI Entry Point for mercury-itc
//!
//! Provides command-line access to the controller:
//! - Listing serial ports and their resource names
//! - Identification and device enumeration
//! - Monitoring the channel feed (real instrument or simulated)
//! - Single writes with status reporting
//!
//! # Usage
//!
//! ```bash
//! mercury-itc ports
//! mercury-itc --resource ASRL3::INSTR identify
//! mercury-itc monitor --simulate --ticks 10
//! mercury-itc --resource ASRL3::INSTR set setpoint MB1 80
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mercury_itc::config::{ItcConfig, DEFAULT_CONFIG_PATH};
use mercury_itc::hardware::link::SharedLink;
use mercury_itc::hardware::mock::MockLink;
use mercury_itc::hardware::resource::list_resources;
use mercury_itc::logging;
use mercury_itc::messages::{FeedEvent, WorkerKind};
use mercury_itc::writer::WriteCommand;
use mercury_itc::{ConnectionState, ItcSession, SessionFeeds};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mercury-itc")]
#[command(about = "Headless temperature/heater controller over a single serial link", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Resource name or device path, overriding the configuration
    #[arg(long)]
    resource: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Print the effective configuration as TOML
    Config,

    /// Query the identification string
    Identify {
        /// Use the built-in simulated instrument
        #[arg(long)]
        simulate: bool,
    },

    /// List the devices reported by the instrument
    Devices {
        /// Use the built-in simulated instrument
        #[arg(long)]
        simulate: bool,
    },

    /// Stream channel updates until interrupted
    Monitor {
        /// Use the built-in simulated instrument
        #[arg(long)]
        simulate: bool,

        /// Stop after this many poller updates
        #[arg(long)]
        ticks: Option<usize>,
    },

    /// Write one value and print the status line
    Set {
        /// heater, flow, setpoint, p, i, d, flow-control, sweep, pid,
        /// max-voltage, resistance, sweep-table
        command: String,

        /// Logical channel id (e.g. MB1)
        channel: String,

        /// Value (number, ON/OFF, or file name)
        value: String,

        /// Use the built-in simulated instrument
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ItcConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(resource) = cli.resource.clone() {
        config.link.resource = Some(resource);
    }
    logging::init_from_config(&config).context("initializing logging")?;

    match cli.command {
        Commands::Ports => list_ports(cli.json),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Identify { simulate } => {
            let (session, _feeds) = connect(config, simulate).await?;
            println!("{}", session.identify().await?);
            Ok(())
        }
        Commands::Devices { simulate } => {
            let (session, _feeds) = connect(config, simulate).await?;
            let devices = session.devices().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                for device in devices {
                    println!("{device}");
                }
            }
            Ok(())
        }
        Commands::Monitor { simulate, ticks } => monitor(config, simulate, ticks, cli.json).await,
        Commands::Set {
            command,
            channel,
            value,
            simulate,
        } => {
            let write = WriteCommand::parse(&command, &value)?;
            let (session, _feeds) = connect(config, simulate).await?;
            let status = session.submit(&write, &channel).await;
            if !status.accepted {
                bail!("{status}");
            }
            println!("{status}");
            Ok(())
        }
    }
}

fn list_ports(json: bool) -> Result<()> {
    let ports = list_resources()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{:<24} {:<32} {}", port.port_name, port.resource, port.kind);
    }
    Ok(())
}

async fn connect(config: ItcConfig, simulate: bool) -> Result<(ItcSession, SessionFeeds)> {
    let (mut session, feeds) = if simulate {
        ItcSession::new(config, SharedLink::new(MockLink::simulated()))?
    } else {
        ItcSession::from_config(config).context("no usable link; pass --resource or --simulate")?
    };
    if session.connect().await != ConnectionState::Connected {
        bail!("ITC not connected");
    }
    Ok((session, feeds))
}

async fn monitor(config: ItcConfig, simulate: bool, ticks: Option<usize>, json: bool) -> Result<()> {
    let (mut session, mut feeds) = if simulate {
        ItcSession::new(config, SharedLink::new(MockLink::simulated()))?
    } else {
        ItcSession::from_config(config)?
    };
    // A failed connect still starts the workers: they report N/A and stop.
    session.connect().await;
    session.start_workers();

    let mut updates = 0usize;
    loop {
        let event = tokio::select! {
            event = feeds.updates.recv() => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(event) = event else { break };

        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }

        match event {
            FeedEvent::Update(_) => {
                updates += 1;
                if ticks.is_some_and(|limit| updates >= limit) {
                    break;
                }
            }
            FeedEvent::Ended(WorkerKind::Poller) => break,
            _ => {}
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_event(event: &FeedEvent) {
    match event {
        FeedEvent::Update(update) => println!(
            "{} {:<6} {}",
            update.timestamp.format("%H:%M:%S"),
            update.channel_id,
            update.value
        ),
        FeedEvent::LoopSetting {
            channel_id,
            parameter,
            value,
        } => println!("         {channel_id:<6} {parameter}: {value}"),
        FeedEvent::Calibration {
            channel_id,
            max_voltage,
            resistance,
        } => println!(
            "         {channel_id:<6} max voltage: {}  resistance: {}",
            max_voltage.map_or("N/A".to_string(), |v| format!("{v}V")),
            resistance.map_or("N/A".to_string(), |r| format!("{r}O")),
        ),
        FeedEvent::Ended(kind) => println!("         {kind} ended"),
    }
}
