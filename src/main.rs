use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use rig_runtime::config::RigConfig;

/// Hardware runtime for the rotary stage, indicator panel and servo
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "rig.toml")]
    config: PathBuf,

    /// Default log level (RUST_LOG directives still apply)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Setup logging (set RUST_LOG=info or debug)
    let directive = match args.log_level.parse() {
        Ok(directive) => directive,
        Err(e) => {
            eprintln!("Invalid --log-level '{}': {}", args.log_level, e);
            std::process::exit(2);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .init(); // installs the subscriber globally

    let config = match RigConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rig_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
