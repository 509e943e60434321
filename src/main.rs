use anyhow::{bail, Context};
use bson::doc;
use clap::{Parser, Subcommand};
use mongo_session::config::{Config, LoggingConfig};
use mongo_session::{connect, ClientOptions, Preference};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mongo-session")]
#[command(about = "Connection pooling, server selection and command dispatch for MongoDB deployments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a ping through server selection and report the round trip
    Ping {
        /// Connection string or comma-separated host list
        #[arg(short, long, default_value = "mongodb://localhost:27017")]
        uri: String,
        /// Configuration file supplying base options and logging
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Monitor a deployment briefly and print what was discovered
    Topology {
        /// Connection string or comma-separated host list
        #[arg(short, long, default_value = "mongodb://localhost:27017")]
        uri: String,
        /// How long to let heartbeats run before printing
        #[arg(short, long, default_value_t = 2000)]
        wait_ms: u64,
        /// Configuration file supplying base options and logging
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ping { uri, config } => {
            let options = load_options(config.as_ref())?;
            ping(&uri, options).await?;
        }
        Commands::Topology { uri, wait_ms, config } => {
            let options = load_options(config.as_ref())?;
            show_topology(&uri, options, Duration::from_millis(wait_ms)).await?;
        }
        Commands::Validate { config } => validate_config(config)?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

/// Base options from the config file when given; logging is set up either way
fn load_options(path: Option<&PathBuf>) -> anyhow::Result<ClientOptions> {
    match path {
        Some(path) => {
            let config = Config::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            init_logging(&config.logging);
            Ok(config.client_options()?)
        }
        None => {
            init_logging(&LoggingConfig::default());
            Ok(ClientOptions::default())
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

async fn ping(uri: &str, options: ClientOptions) -> anyhow::Result<()> {
    let client = connect(uri, options).await?;
    let admin = client.database("admin");

    let started = Instant::now();
    let result = admin.run_read_command(doc! { "ping": 1 }, Preference::primary_preferred()).await;
    let elapsed = started.elapsed();
    client.shutdown().await;

    match result {
        Ok(reply) => {
            println!("✓ ping succeeded in {}", mongo_session::utils::format_duration(elapsed));
            println!("  reply: {}", mongo_session::utils::sanitize(&reply));
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ ping failed after {}", mongo_session::utils::format_duration(elapsed));
            Err(e.into())
        }
    }
}

async fn show_topology(uri: &str, options: ClientOptions, wait: Duration) -> anyhow::Result<()> {
    let client = connect(uri, options).await?;
    info!("Waiting {:?} for heartbeats", wait);
    tokio::time::sleep(wait).await;

    let view = client.topology().snapshot();
    println!("Topology version {}: {} server(s)", view.version(), view.len());
    for state in view.endpoints() {
        let rtt = state
            .round_trip_time
            .map(mongo_session::utils::format_duration)
            .unwrap_or_else(|| "-".to_string());
        print!("  {:<30} {:<10} rtt {}", state.endpoint.to_string(), state.role.to_string(), rtt);
        if !state.tags.is_empty() {
            let tags: Vec<String> = state.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
            print!("  tags {}", tags.join(","));
        }
        println!();
    }
    client.shutdown().await;

    if !view.has_known_servers() {
        bail!("no server answered within {:?}", wait);
    }
    Ok(())
}

fn validate_config(path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {}", path.display());

    let config = Config::load_from_file(&path).with_context(|| format!("Failed to load {}", path.display()))?;
    if let Err(e) = config.validate() {
        eprintln!("✗ Configuration file validation failed:");
        eprintln!("  {e}");
        return Err(e.into());
    }
    let options = config.client_options()?;

    println!("✓ Configuration file is valid");
    println!("  Servers: {} seed(s)", options.hosts.len());
    for (i, host) in options.hosts.iter().enumerate() {
        println!("    {}: {}", i + 1, host);
    }
    if let Some(database) = &options.default_database {
        println!("  Default database: {database}");
    }
    println!("  Read preference: {}", options.read_preference);
    println!(
        "  Pool size: {}..{}, wait queue timeout {}ms",
        options.min_pool_size, options.max_pool_size, options.wait_queue_timeout_ms
    );
    println!("  Heartbeat frequency: {}ms", options.heartbeat_frequency_ms);
    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {}", output.display());
    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  mongo-session validate --config {}", output.display());
    Ok(())
}

fn show_version() {
    println!("mongo-session v{}", env!("CARGO_PKG_VERSION"));
    println!("Connection pooling, server selection and command dispatch for MongoDB deployments");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
}
