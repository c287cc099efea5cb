use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gattbench::config::{RunConfig, CONFIG_ENV};
use gattbench::discovery::{self, Suite, TestSelector};
use gattbench::report::{ConsoleReporter, JsonReporter, Reporter};
use gattbench::Transport;

#[derive(Parser)]
#[command(
    name = "gattbench",
    about = "Test automation harness for Bluetooth Low Energy peripherals",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: ./gattbench.toml if present)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a device and run the selected tests
    Run {
        /// Device address (MAC, or platform UUID on macOS)
        #[arg(long, conflicts_with = "name")]
        address: Option<String>,

        /// Advertised device name
        #[arg(long)]
        name: Option<String>,

        /// Directory containing test_*.toml modules
        #[arg(long)]
        dir: Option<PathBuf>,

        /// `all`, a module, a test name, or a wildcard pattern
        #[arg(long)]
        test: Option<String>,

        /// Default per-test timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Retries for characteristic reads
        #[arg(long)]
        read_retries: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Show captured characteristic values for failed tests
        #[arg(long, short)]
        verbose: bool,
    },

    /// List the tests a run would execute, without touching a device
    List {
        /// Directory containing test_*.toml modules
        #[arg(long)]
        dir: Option<PathBuf>,

        /// `all`, a module, a test name, or a wildcard pattern
        #[arg(long)]
        test: Option<String>,
    },
}

fn init_tracing(json: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let open = |path: &Path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))
    };

    match (json, log_file) {
        (false, None) => builder.with_writer(std::io::stderr).init(),
        (true, None) => builder.json().with_writer(std::io::stderr).init(),
        (false, Some(path)) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(open(path)?))
            .init(),
        (true, Some(path)) => builder.json().with_writer(Mutex::new(open(path)?)).init(),
    }
    Ok(())
}

#[cfg(feature = "btleplug")]
async fn backend(config: &RunConfig) -> Result<Arc<dyn Transport>> {
    let transport =
        gattbench::transport::btleplug::BtleplugTransport::new(config.device.scan_timeout()).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "btleplug"))]
async fn backend(_config: &RunConfig) -> Result<Arc<dyn Transport>> {
    anyhow::bail!("no BLE backend compiled in; rebuild with `--features btleplug`")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.log_file.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::load_or_default(),
    };

    match cli.command {
        Commands::Run {
            address,
            name,
            dir,
            test,
            timeout_ms,
            read_retries,
            json,
            verbose,
        } => {
            if address.is_some() {
                config.device.address = address;
                config.device.name = None;
            } else if name.is_some() {
                config.device.address = None;
                config.device.name = name;
            }
            if let Some(dir) = dir {
                config.tests.dir = dir;
            }
            if let Some(test) = test {
                config.tests.select = test;
            }
            if let Some(ms) = timeout_ms {
                config.tests.timeout_ms = ms;
            }
            if let Some(retries) = read_retries {
                config.interaction.read_retries = retries;
            }

            if config.target().is_none() {
                anyhow::bail!("interactive device selection is not supported; pass --address or --name");
            }

            let transport = backend(&config).await?;
            let report = gattbench::run(&config, transport, &Suite::new()).await?;

            if json {
                JsonReporter.report(&report)?;
            } else {
                ConsoleReporter { verbose }.report(&report)?;
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }

        Commands::List { dir, test } => {
            let dir = dir.unwrap_or(config.tests.dir);
            let selector = test.map_or_else(|| TestSelector::parse(&config.tests.select), |t| TestSelector::parse(&t));
            let registry = discovery::discover(&Suite::new(), Some(dir.as_path()), &selector)?;

            println!("{:<40} | {:<30} | Description", "Test", "Location");
            println!("{:-<40}-|-{:-<30}-|-{:-<30}", "", "", "");
            for case in registry.cases() {
                println!(
                    "{:<40} | {:<30} | {}",
                    case.name(),
                    case.location().to_string(),
                    case.description().unwrap_or("")
                );
            }
            println!("\n{} test(s)", registry.len());
        }
    }

    Ok(())
}
