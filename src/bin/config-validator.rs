//! # Build Step Engine Configuration Validator
//!
//! Command-line tool that loads an engine configuration the same way the
//! engine does (defaults, optional file, `BUILDSTEP__*` environment) and
//! reports whether it is usable.

use buildstep_engine::config::EngineConfig;
use buildstep_engine::logging::init_structured_logging_with_level;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate build step engine configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (TOML or YAML); defaults and environment only when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the whole configuration
    All,

    /// Print the resolved configuration as JSON
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    init_structured_logging_with_level(Some(level));

    let result = match &cli.command {
        Some(Commands::Show) => show_config(&cli),
        Some(Commands::All) | None => validate_all_config(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match EngineConfig::load(cli.config.as_deref()) {
        Ok(config) => Ok(config),
        Err(e) => {
            println!("❌ Failed to load configuration: {e}");
            Err(Box::new(e))
        }
    }
}

fn validate_all_config(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔧 Validating Build Step Engine Configuration");
    if let Some(path) = &cli.config {
        println!("Config File: {}", path.display());
    }
    println!();

    let config = load(cli)?;
    println!("✅ Configuration loaded and validated");

    println!("\n📊 Database:");
    println!("   URL: {}", config.database.url);
    println!("   Max connections: {}", config.database.max_connections);
    println!(
        "   Acquire timeout: {}s",
        config.database.acquire_timeout_seconds
    );
    println!("   Busy timeout: {}s", config.database.busy_timeout_seconds);

    println!("\n📨 Events:");
    println!("   Verify messages: {}", config.events.verify_messages);
    println!(
        "   Production log capacity: {}",
        config.events.production_log_capacity
    );

    println!("\n⚙️  Execution:");
    match config.execution.default_command_timeout_seconds {
        Some(seconds) => println!("   Default command timeout: {seconds}s"),
        None => println!("   Default command timeout: none"),
    }
    println!("   Finish batch size: {}", config.execution.finish_batch_size);
    println!("   History limit cap: {}", config.execution.history_limit_cap);

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn show_config(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(cli)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
