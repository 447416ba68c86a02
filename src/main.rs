//! Viaduct - a pluggable multi-protocol proxy and tunnel engine

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use viaduct::config::Config;
use viaduct::error::Result;
use viaduct::Runtime;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            eprintln!("no config file specified (-c <FILE>)");
            std::process::exit(1);
        }
    };

    info!("viaduct v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::new(config)?;
        runtime.run().await
    })?;

    info!("goodbye");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, version }
    }
}

fn print_help() {
    println!(
        r#"Viaduct - a pluggable multi-protocol proxy and tunnel engine

USAGE:
    viaduct [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    viaduct -c config.json

CONTROL API ENDPOINTS (when "api" is configured):
    GET  /metrics             Prometheus metrics
    GET  /config              Current configuration
    POST /config/reload       Hot reload
    *    /config/ingresses    Ingress CRUD
    *    /config/resolvers    Resolver CRUD
"#
    );
}

fn print_version() {
    println!("viaduct v{}", env!("CARGO_PKG_VERSION"));
}
