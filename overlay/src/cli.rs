//! Parses the command line arguments and starts the requested process.
//!
//! Basic usage for running a registry and a node with logging on:
//!
//! ```text
//! overlay --log registry --port 5000
//! overlay --log node --registry-host 127.0.0.1 --registry-port 5000
//! ```

use crate::{
    applications::{overlay_node::NodeError, registry::RegistryError, OverlayNode, Registry},
    config::{NodeConfig, RegistryConfig, DEFAULT_QUIESCENCE_DELAY, DEFAULT_TABLE_SIZE},
    console::{run_node_console, run_registry_console},
};
use clap::{Parser, Subcommand};
use overlay_core::{PeerAddress, RING_SIZE};
use std::{
    fs::{create_dir_all, OpenOptions},
    io,
    sync::Arc,
    time::Duration,
};
use thiserror::Error as ThisError;
use tokio::io::BufReader;
use tracing::{subscriber::SetGlobalDefaultError, Level};
use tracing_subscriber::FmtSubscriber;

/// Stores the different command line arguments.
#[derive(Parser)]
#[command(version, about = "A ring-structured overlay network over TCP")]
struct Args {
    /// Logging flag. Used to turn logging on or off.
    #[arg(short, long, global = true)]
    log: bool,
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Runs the registry that nodes join through
    Registry {
        /// The port to listen on
        #[arg(short, long)]
        port: u16,
        /// The number of identifiers on the ring
        #[arg(long, default_value_t = RING_SIZE)]
        ring_size: u32,
        /// The routing table size used when setup-overlay is given none
        #[arg(long, default_value_t = DEFAULT_TABLE_SIZE)]
        table_size: usize,
        /// How long to let packets settle before collecting traffic summaries
        #[arg(long, default_value_t = DEFAULT_QUIESCENCE_DELAY.as_millis() as u64)]
        quiescence_ms: u64,
    },
    /// Runs an overlay node and registers it with the registry
    Node {
        #[arg(long)]
        registry_host: String,
        #[arg(long)]
        registry_port: u16,
    },
}

/// Parses command line arguments, starts the registry or node they ask for,
/// and hands stdin to its console until stdin closes or the process is
/// interrupted.
pub async fn initialize_from_arguments() -> Result<(), CliError> {
    let cli = Args::parse();
    let stdin = BufReader::new(tokio::io::stdin());

    match cli.role {
        Role::Registry {
            port,
            ring_size,
            table_size,
            quiescence_ms,
        } => {
            if cli.log {
                initialize_logging("registry")?;
            }
            let config = RegistryConfig::new()
                .port(port)
                .ring_size(ring_size)
                .default_table_size(table_size)
                .quiescence_delay(Duration::from_millis(quiescence_ms));
            let registry = Registry::listen(config).await?;
            println!("Registry is listening on {}", registry.local_addr());
            tokio::select! {
                result = run_registry_console(registry.clone(), stdin) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
            registry.shut_down();
        }
        Role::Node {
            registry_host,
            registry_port,
        } => {
            if cli.log {
                initialize_logging("node")?;
            }
            let config = NodeConfig::new(PeerAddress::new(registry_host, registry_port));
            let node = OverlayNode::join(config).await?;
            println!("Node is listening on {}", node.address());
            tokio::select! {
                result = run_node_console(node.clone(), stdin) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
            node.shut_down();
        }
    }
    Ok(())
}

/// Installs a JSON subscriber writing every event to a fresh file under
/// `./logs`. Only should be called once per process.
fn initialize_logging(role: &str) -> Result<(), CliError> {
    let main_path = "./logs";
    create_dir_all(main_path)?;
    let file_path = format!(
        "{}/{}-{}.log",
        main_path,
        role,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(Level::DEBUG)
        .json()
        .finish();
    // set the global default so all events/logs go to the same subscriber and
    // subsequently the same file
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[derive(Debug, ThisError)]
pub enum CliError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("Could not set up logging: {0}")]
    Logging(#[from] SetGlobalDefaultError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
