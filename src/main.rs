//! # Faro CLI
//!
//! Command-line interface for the shared thermal printer service.
//!
//! ## Usage
//!
//! ```bash
//! # Run the HTTP API with keep-alive
//! faro serve --address AA:BB:CC:DD:EE:FF --listen 0.0.0.0:8080
//!
//! # Same, without hardware
//! faro serve --simulate --address AA:BB:CC:DD:EE:FF
//!
//! # Find printers
//! faro scan --name MXW01 --timeout 5
//!
//! # Print one PNG and exit
//! faro print --address AA:BB:CC:DD:EE:FF label.png
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use faro::{
    Bitmap, FaroError, PrinterSettings, Timings,
    server::{self, ServerConfig},
    service::{PrinterService, ServiceConfig},
    transport::{ClientFactory, sim::SimPrinter},
};

/// Faro - shared Bluetooth LE thermal printer service
#[derive(Parser, Debug)]
#[command(name = "faro")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Printer options shared by every command.
#[derive(Args, Debug)]
struct PrinterArgs {
    /// JSON settings file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Printer MAC address (XX:XX:XX:XX:XX:XX)
    #[arg(long)]
    address: Option<String>,

    /// Run the full pipeline without printing
    #[arg(long)]
    dry_run: bool,

    /// Use the in-process simulated printer
    #[arg(long)]
    simulate: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API, print queue and keep-alive
    Serve {
        #[command(flatten)]
        printer: PrinterArgs,

        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// Seconds between keep-alive cycles
        #[arg(long, value_name = "SECS")]
        keep_alive_interval: Option<u64>,

        /// Disable keep-alive
        #[arg(long)]
        no_keep_alive: bool,
    },

    /// Discover nearby printers
    Scan {
        #[command(flatten)]
        printer: PrinterArgs,

        /// Only list printers whose name contains this
        #[arg(long, default_value = "")]
        name: String,

        /// Scan duration in seconds
        #[arg(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: u64,
    },

    /// Print a PNG and exit once it is done
    Print {
        #[command(flatten)]
        printer: PrinterArgs,

        /// PNG file to print
        image: PathBuf,
    },
}

/// Initialize logging
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<(), FaroError> {
    match command {
        Commands::Serve {
            printer,
            listen,
            keep_alive_interval,
            no_keep_alive,
        } => {
            let mut settings = load_settings(&printer)?;
            if let Some(secs) = keep_alive_interval {
                settings.keep_alive_interval_secs = secs;
            }
            if no_keep_alive {
                settings.keep_alive_enabled = false;
            }

            let factory = client_factory(&printer, &settings)?;
            let config = ServiceConfig {
                settings,
                ..Default::default()
            };
            let service = Arc::new(PrinterService::start(factory, config).await?);

            let server_config = ServerConfig {
                listen_addr: listen,
                ..Default::default()
            };
            server::serve(server_config, service).await
        }

        Commands::Scan {
            printer,
            name,
            timeout,
        } => {
            let mut settings = load_settings(&printer)?;
            settings.keep_alive_enabled = false;

            let factory = client_factory(&printer, &settings)?;
            let timeout = Duration::from_secs(timeout);
            let config = ServiceConfig {
                settings,
                timings: Timings {
                    scan_timeout: timeout,
                    ..Default::default()
                },
                ..Default::default()
            };
            let service = PrinterService::start(factory, config).await?;

            let found = service.scan(&name, timeout).await;
            service.shutdown().await;
            let found = found?;

            if found.is_empty() {
                println!("No printers found");
            }
            for (address, name) in found {
                println!("{}  {}", address, name);
            }
            Ok(())
        }

        Commands::Print { printer, image } => {
            let mut settings = load_settings(&printer)?;
            settings.keep_alive_enabled = false;
            if settings.address.is_none() {
                return Err(FaroError::NoAddress);
            }

            let bytes = std::fs::read(&image)?;
            let bitmap = Bitmap::decode(&bytes)?;
            info!(
                file = %image.display(),
                width = bitmap.width(),
                height = bitmap.height(),
                "Loaded image"
            );

            let factory = client_factory(&printer, &settings)?;
            let config = ServiceConfig {
                settings,
                ..Default::default()
            };
            let service = PrinterService::start(factory, config).await?;
            service.submit(bitmap)?;
            service.shutdown().await;

            let stats = service.stats();
            if stats.failed > 0 {
                return Err(FaroError::Transport("print failed, see log".to_string()));
            }
            println!("Printed successfully!");
            Ok(())
        }
    }
}

/// Settings file, overridden by command-line flags.
fn load_settings(args: &PrinterArgs) -> Result<PrinterSettings, FaroError> {
    let mut settings = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading settings");
            PrinterSettings::load(path)?
        }
        None => PrinterSettings::default(),
    };
    if let Some(address) = &args.address {
        settings.address = Some(address.clone());
    }
    if args.dry_run {
        settings.dry_run = true;
    }
    Ok(settings.normalized())
}

fn client_factory(
    args: &PrinterArgs,
    settings: &PrinterSettings,
) -> Result<Arc<dyn ClientFactory>, FaroError> {
    if args.simulate {
        warn!("Using the simulated printer");
        let sim = SimPrinter::new();
        let address = settings
            .address
            .clone()
            .unwrap_or_else(|| "00:11:22:33:44:55".to_string());
        sim.add_device(&address, "SIM-PRINTER");
        return Ok(sim.factory());
    }
    ble_factory()
}

#[cfg(feature = "ble")]
fn ble_factory() -> Result<Arc<dyn ClientFactory>, FaroError> {
    Ok(Arc::new(faro::transport::btle::BtleFactory::new(
        Timings::default().scan_timeout,
    )))
}

#[cfg(not(feature = "ble"))]
fn ble_factory() -> Result<Arc<dyn ClientFactory>, FaroError> {
    Err(FaroError::Config(
        "built without Bluetooth support; rebuild with `--features ble` or pass --simulate"
            .to_string(),
    ))
}
