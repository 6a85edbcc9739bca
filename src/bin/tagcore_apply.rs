//! tagcore-apply
//!
//! Applies a batch configuration (JSON) against an in-memory store and prints
//! the resulting report as JSON.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tagcore::persistence::InMemoryPersistence;
use tagcore::{Configuration, ConfigurationEngine, EntityCache, TagCoreConfig};

/// Command line arguments.
struct Args {
    /// Batch to apply.
    configuration: PathBuf,
    /// Optional runtime configuration.
    config: Option<PathBuf>,
}

fn print_usage() {
    println!("tagcore-apply - apply a configuration batch to an in-memory model");
    println!();
    println!("USAGE:");
    println!("    tagcore-apply <CONFIGURATION.json> [CONFIG.json]");
    println!();
    println!("Log level is taken from RUST_LOG (default: info).");
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(0);
    }
    match args.as_slice() {
        [configuration] => Args {
            configuration: PathBuf::from(configuration),
            config: None,
        },
        [configuration, config] => Args {
            configuration: PathBuf::from(configuration),
            config: Some(PathBuf::from(config)),
        },
        _ => {
            eprintln!("error: expected <CONFIGURATION.json> [CONFIG.json]");
            print_usage();
            std::process::exit(2);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    let config = match &args.config {
        Some(path) => TagCoreConfig::from_path(path)?,
        None => TagCoreConfig::default(),
    };

    let raw = fs::read_to_string(&args.configuration)?;
    let configuration: Configuration = serde_json::from_str(&raw)?;
    info!(
        path = %args.configuration.display(),
        elements = configuration.elements.len(),
        "configuration loaded"
    );

    let cache = Arc::new(EntityCache::default());
    let engine = ConfigurationEngine::new(cache, Arc::new(InMemoryPersistence::new()), config.engine);
    let report = engine.apply_configuration(&configuration);

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}
