//! spindlesrv: drive a VFD spindle from the command line

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use common::logging::{self, LogConfig};
use spindlesrv::link::VfdLink;
use spindlesrv::protocol::StatusRegister;
use spindlesrv::transport::SerialTransport;
use spindlesrv::{
    create_protocol, Huanyang, MachineContext, MachineState, ServiceConfig, SpindleState,
    VfdBrand, VfdController, VfdProtocol,
};

const SERVICE_NAME: &str = "spindlesrv";

#[derive(Debug, Parser)]
#[clap(author, version, about = "VFD spindle control over RS-485 Modbus-RTU")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[clap(short, long, env = "SPINDLESRV_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[clap(short = 'l', long)]
    log_level: Option<String>,

    /// Disable colored output
    #[clap(long)]
    no_color: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the drive and log status until interrupted
    Watch,
    /// Spin up, hold, then stop
    Run {
        #[clap(long)]
        rpm: u32,
        /// Counter-clockwise instead of clockwise
        #[clap(long)]
        ccw: bool,
        /// Hold time; runs until interrupted when omitted
        #[clap(long)]
        seconds: Option<u64>,
    },
    /// Command a stop
    Stop,
    /// Read every status register once (Huanyang only)
    Registers,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(args.config.as_deref())?;

    let mut log_section = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_section.level = level.clone();
    }
    let log_config = LogConfig {
        ansi: !args.no_color,
        ..LogConfig::from_section(SERVICE_NAME, &log_section)
    };
    logging::init_with_config(log_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    match args.command {
        Command::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        },
        Command::Registers => read_registers(&config).await,
        Command::Watch => {
            let (controller, machine) = start(&config).await?;
            watch(&controller, &machine, None).await;
            Ok(())
        },
        Command::Run { rpm, ccw, seconds } => {
            let (controller, machine) = start(&config).await?;
            let state = if ccw {
                SpindleState::CounterClockwise
            } else {
                SpindleState::Clockwise
            };

            info!("Spindle {} at {} rpm requested", state, rpm);
            controller.set_state(state, rpm).await;
            watch(&controller, &machine, seconds.map(Duration::from_secs)).await;

            controller.stop().await;
            settle(&controller).await;
            finish(&machine)
        },
        Command::Stop => {
            let (controller, machine) = start(&config).await?;
            controller.stop().await;
            settle(&controller).await;
            finish(&machine)
        },
    }
}

async fn start(config: &ServiceConfig) -> anyhow::Result<(VfdController, Arc<MachineState>)> {
    let machine = Arc::new(MachineState::new());
    machine.set_reset_handler(|| warn!("Machine reset requested by spindle controller"));

    let transport = SerialTransport::new(config.vfd.port.clone())?;
    let protocol = create_protocol(config.vfd.brand);
    let controller = VfdController::try_init(config, protocol, Box::new(transport), machine.clone())
        .await
        .context("VFD controller failed to start")?;
    Ok((controller, machine))
}

/// Log status once a second until the deadline, a signal or an alarm
async fn watch(controller: &VfdController, machine: &MachineState, limit: Option<Duration>) {
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let shutdown = common::wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            sig = &mut shutdown => {
                info!("{} received, leaving", sig);
                break;
            }
            _ = &mut deadline => break,
            _ = ticker.tick() => {
                match controller.last_status() {
                    Some(status) => info!(
                        "healthy={} {}",
                        controller.is_healthy(),
                        status
                    ),
                    None => info!("healthy={} no status yet", controller.is_healthy()),
                }
                if machine.is_alarmed() {
                    break;
                }
            }
        }
    }
}

/// Give the poll task a few cycles to deliver the last command
async fn settle(controller: &VfdController) {
    let target = controller.poll_count() + 3;
    while controller.poll_count() < target {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn finish(machine: &MachineState) -> anyhow::Result<()> {
    match machine.alarm() {
        Some(alarm) => bail!("{}", alarm),
        None => Ok(()),
    }
}

async fn read_registers(config: &ServiceConfig) -> anyhow::Result<()> {
    if config.vfd.brand != VfdBrand::Huanyang {
        bail!("register dump is only available for Huanyang drives");
    }

    let mut vfd = Huanyang::new();
    let transport = SerialTransport::new(config.vfd.port.clone())?;
    let mut link = VfdLink::new(Box::new(transport), config.vfd.address, config.vfd.link_timing());
    let settings = vfd
        .default_serial_settings()
        .with_overrides(config.vfd.baud_rate, config.vfd.parity);
    link.open(&settings).await?;

    let owner = link.owner();
    owner
        .scope(async {
            for register in StatusRegister::ALL {
                match vfd.read_register(&mut link, register).await {
                    Ok(value) => println!("{:>2} {:<17} {}", register.index(), register.label(), value),
                    Err(e) => println!("{:>2} {:<17} error: {}", register.index(), register.label(), e),
                }
            }
        })
        .await;

    link.close().await?;
    Ok(())
}
