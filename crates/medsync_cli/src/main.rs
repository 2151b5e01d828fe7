//! medsync CLI
//!
//! Command-line tools that run the sync engine against an in-memory central
//! server populated with demo data.
//!
//! # Commands
//!
//! - `simulate` - Run concurrent devices pushing and pulling
//! - `lookup` - Build the lookup table and show the run log
//! - `plan` - Plan a pull snapshot for a facility

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// medsync command-line tools.
#[derive(Parser)]
#[command(name = "medsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent devices pushing and pulling against one server
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value = "4")]
        devices: usize,

        /// Push-then-pull rounds per device
        #[arg(short, long, default_value = "10")]
        rounds: usize,

        /// Encounters pushed per round
        #[arg(short, long, default_value = "5")]
        changes: usize,
    },

    /// Populate demo data, build the lookup table and show the run log
    Lookup {
        /// Number of patients
        #[arg(short, long, default_value = "100")]
        patients: usize,

        /// Number of facilities
        #[arg(long, default_value = "4")]
        facilities: usize,

        /// Run a second, forced full rebuild
        #[arg(long)]
        force: bool,
    },

    /// Populate demo data and plan a pull for one facility
    Plan {
        /// Facility to pull for
        #[arg(long, default_value = "f0")]
        facility: String,

        /// Last tick the facility synced (omit for an initial pull)
        #[arg(short, long)]
        since: Option<i64>,

        /// Number of patients
        #[arg(short, long, default_value = "20")]
        patients: usize,

        /// Include sensitive records
        #[arg(long)]
        sensitive: bool,

        /// Maximum number of changes to list
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let format = commands::OutputFormat::parse(&cli.format)?;
    match cli.command {
        Commands::Simulate {
            devices,
            rounds,
            changes,
        } => commands::simulate::run(devices, rounds, changes, format)?,
        Commands::Lookup {
            patients,
            facilities,
            force,
        } => commands::lookup::run(patients, facilities, force, format)?,
        Commands::Plan {
            facility,
            since,
            patients,
            sensitive,
            limit,
        } => commands::plan::run(&facility, since, patients, sensitive, limit, format)?,
        Commands::Version => {
            println!("medsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
