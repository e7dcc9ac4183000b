use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vorze_control_runtime::config::RuntimeConfig;
use vorze_control_runtime::device::list_ports;

/// Serial control runtime for Vorze actuators
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port to open at startup (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,

    /// Action library file (overrides the config file)
    #[arg(short, long)]
    actions: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        match list_ports() {
            Ok(ports) => {
                for port in ports {
                    println!("{}\t{}", port.port_name, port.friendly_name);
                }
            }
            Err(e) => {
                eprintln!("Failed to list serial ports: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let mut config = match &cli.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => RuntimeConfig::default(),
    };
    if cli.port.is_some() {
        config.port = cli.port;
    }
    if cli.actions.is_some() {
        config.actions = cli.actions;
    }

    if let Err(e) = vorze_control_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
