use clap::{Parser, Subcommand};
use log::info;
use singularity_edge::config::{Config, ConfigError};
use singularity_edge::Edge;
use std::path::PathBuf;

// Pingora framework imports
use pingora_core::server::configuration::Opt;

#[derive(Parser)]
#[command(name = "singularity-edge")]
#[command(about = "A global HTTP/HTTPS reverse proxy and L4 passthrough load balancer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the edge node
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_edge(config)?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn run_edge(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config)?;

    info!("Starting singularity-edge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Base domain: {}", config.server.base_domain);
    info!("Default pool: {}", config.server.default_pool);
    info!("Store directory: {:?}", config.store.dir);
    if config.cluster.enabled {
        info!(
            "Clustering enabled as node {} (discovery: {:?})",
            config.cluster.node_name, config.cluster.discovery_query
        );
    }

    let mut edge = Edge::new(config);
    edge.initialize(Some(Opt::default()))
        .map_err(|e| format!("Failed to initialize edge: {}", e))?;

    info!("Edge initialized, starting services...");
    if let Err(e) = edge.run() {
        // Unrecoverable startup failure (e.g. store corruption)
        return Err(format!("Failed to run edge: {}", e).into());
    }

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating example configuration file: {:?}", output);

    Config::create_example_config(&output)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  singularity-edge run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  HTTP port: {}", config.server.http_port);
            println!("  HTTPS port: {:?}", config.server.https_port);
            println!("  Admin port: {}", config.server.admin_port);
            println!("  Base domain: {}", config.server.base_domain);
            println!(
                "  Passthrough bindings: {}",
                config.proxy.passthrough.len()
            );
            for binding in &config.proxy.passthrough {
                println!("    :{} -> pool {}", binding.port, binding.pool);
            }
            if config.cluster.enabled {
                println!("  Cluster node: {}", config.cluster.node_name);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("singularity-edge v{}", env!("CARGO_PKG_VERSION"));
    println!("A global HTTP/HTTPS reverse proxy and L4 passthrough load balancer");
    println!();
    println!("Features:");
    println!("  • Named backend pools with per-pool load-balancing policies");
    println!("  • Periodic TCP health checking with immediate failover");
    println!("  • TLS termination with SNI certificate lookup, or L4 passthrough");
    println!("  • Replicated pool/backend/certificate state across cluster nodes");
    println!("  • High-performance async I/O with Pingora and Tokio");
}

fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    // The store engine emits tracing events; route them alongside the
    // log facade
    let tracing_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter)
        .init();

    info!("Logging initialized at level: {:?}", log_level);
    Ok(())
}
