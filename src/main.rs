//! CLI Entry Point for daq-validate
//!
//! Runs validation suites against the configured instrument and reports
//! pass/fail per device and per operation.
//!
//! # Usage
//!
//! Run everything against `config/validate.toml` (or the built-in demo
//! instrument when that file is absent):
//! ```bash
//! daq-validate all
//! ```
//!
//! Connectivity only, machine-readable:
//! ```bash
//! daq-validate --json connectivity
//! ```
//!
//! Inspect one device:
//! ```bash
//! daq-validate inventory --analyze m1
//! ```
//!
//! Exit status is 0 when every suite passed and 1 otherwise.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_validate::config::{ValidationConfig, DEFAULT_CONFIG_PATH};
use daq_validate::error::ValidationError;
use daq_validate::inventory::{analyze_device, Inventory};
use daq_validate::tracing_setup;
use daq_validate::validation::{Suite, ValidationContext, ValidationOrchestrator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "daq-validate")]
#[command(about = "Validate an instrument-control setup: devices, plans and catalog", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/validate.toml, then the demo instrument)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the report as JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Run every plan in simulation mode
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every suite
    All,
    /// Probe every device
    Connectivity,
    /// Motion round trip and a single count
    Operations,
    /// Plans that must leave a catalog record
    Data,
    /// Built-in, custom and configured plans
    Plans,
    /// List devices by label
    Inventory {
        /// Read every property of one device
        #[arg(long, value_name = "ID")]
        analyze: Option<String>,
    },
}

impl Commands {
    fn suites(&self) -> Vec<Suite> {
        match self {
            Commands::All => Suite::all(),
            Commands::Connectivity => vec![Suite::Connectivity],
            Commands::Operations => vec![Suite::Operations],
            Commands::Data => vec![Suite::DataCollection],
            Commands::Plans => vec![Suite::Plans],
            Commands::Inventory { .. } => Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(ValidationError::AggregationInvariant { .. }) =
                e.downcast_ref::<ValidationError>()
            {
                error!(error = %e, "Validation engine fault");
                eprintln!("❌ Validation engine fault, results cannot be trusted: {e}");
            } else {
                eprintln!("❌ {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<ValidationConfig> {
    let mut config = match &cli.config {
        Some(path) => ValidationConfig::load_from(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => ValidationConfig::load()?,
        None => ValidationConfig::demo()?,
    };
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    if cli.simulate {
        config.plans.simulate = true;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli).context("loading configuration")?;
    tracing_setup::init_from_config(&config)?;
    info!(
        name = %config.application.name,
        devices = config.devices.len(),
        "Configuration loaded"
    );

    let probe_timeout = config.probe.timeout;
    let ctx = ValidationContext::from_config(config).await?;

    if let Commands::Inventory { analyze } = &cli.command {
        return inventory(&ctx, analyze.as_deref(), probe_timeout, cli.json).await;
    }

    let orchestrator = ValidationOrchestrator::new(ctx);
    let report = orchestrator.run(&cli.command.suites()).await?;

    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        println!("{report}");
    }

    Ok(if report.overall_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn inventory(
    ctx: &ValidationContext,
    analyze: Option<&str>,
    timeout: std::time::Duration,
    json: bool,
) -> Result<ExitCode> {
    let Some(id) = analyze else {
        let inventory = Inventory::generate(&ctx.registry);
        if json {
            println!("{}", serde_json::to_string_pretty(&inventory)?);
        } else {
            println!("{inventory}");
        }
        return Ok(ExitCode::SUCCESS);
    };

    let device = ctx
        .registry
        .get(id)
        .with_context(|| format!("no device with id '{id}'"))?;
    let analysis = analyze_device(&device, timeout).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        print!("{analysis}");
    }
    Ok(if analysis.connected {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
