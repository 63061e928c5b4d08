use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use haptickle_core::{osc, HapticEngine, HaptickleConfig, TracingDevice};
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

/// Largest datagram the host bus sends for a single parameter.
const MAX_DATAGRAM: usize = 1536;

#[tokio::main]
async fn main() -> haptickle_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen { config, bind } => run_listen(&config, bind).await,
        Commands::Check { config } => run_check(&config),
        Commands::Encode { address, value } => run_encode(&address, value),
    }
}

async fn run_listen(config: &Path, bind: SocketAddr) -> haptickle_core::Result<()> {
    tracing::info!(?config, %bind, "starting listener");

    let config = HaptickleConfig::load(config)?;
    let engine = HapticEngine::start(config, Some(Arc::new(TracingDevice))).await?;
    let socket = UdpSocket::bind(bind).await?;
    let mut status = engine.subscribe_status();
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        tracing::warn!(%err, "receive failed");
                        continue;
                    }
                };
                let updates = match osc::decode_parameters(&buffer[..len]) {
                    Ok(updates) => updates,
                    Err(err) => {
                        tracing::debug!(%err, %peer, "ignoring datagram");
                        continue;
                    }
                };
                for update in &updates {
                    if let Err(err) = engine.handle_update(update) {
                        tracing::warn!(%err, parameter = %update.name, "update rejected");
                    }
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                for parameter in current.as_parameters() {
                    tracing::info!(name = %parameter.name, value = ?parameter.value, "status");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}

fn run_check(config: &Path) -> haptickle_core::Result<()> {
    let config = HaptickleConfig::load(config)?;
    println!(
        "{} trigger(s), {} device mapping(s), timeout {}s",
        config.triggers.len(),
        config.device_mappings.len(),
        config.engine.timeout_seconds
    );
    for trigger in &config.triggers {
        let target = config.resolve_target(trigger)?;
        println!(
            "  {:<16} {:<10} {:<28} {} watch(es)",
            trigger.id,
            format!("{:?}", trigger.mode),
            target.identity(),
            trigger.watches.len()
        );
    }
    Ok(())
}

fn run_encode(address: &str, value: i32) -> haptickle_core::Result<()> {
    let datagram = osc::encode_int_message(address, value)?;
    let hex: Vec<String> = datagram.iter().map(|byte| format!("{byte:02x}")).collect();
    println!("{}", hex.join(" "));
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Haptic feedback from avatar parameters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Receive parameter updates over OSC and drive the configured devices.
    Listen {
        /// Path to the JSON trigger configuration.
        #[arg(short, long)]
        config: PathBuf,
        /// Address the host bus sends parameter datagrams to.
        #[arg(short, long, default_value = "127.0.0.1:9001")]
        bind: SocketAddr,
    },
    /// Load and validate a configuration file.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the control datagram for an address and intensity.
    Encode {
        /// OSC address, e.g. `/motor`.
        #[arg(short, long)]
        address: String,
        /// Intensity between 0 and 255.
        #[arg(short, long, value_parser = clap::value_parser!(i32).range(0..=255))]
        value: i32,
    },
}
