//! Command-line arguments.

use std::path::PathBuf;

use cabletune::{ElementId, TuningSettings};
use clap::{ArgAction, Parser, Subcommand};

/// Tune cable pretensions of a bridge model until the completed-bridge forces match.
#[derive(Parser, Debug)]
#[command(name = "cabletune", version, about, long_about = None)]
pub struct Args {
    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the tuning loop against the host model
    Run {
        /// Initial trial tensions (host JSON or a list of records)
        #[arg(long)]
        tensions: PathBuf,
        /// Target tensions in the same format
        #[arg(long)]
        targets: PathBuf,
        /// Convergence threshold in percent
        #[arg(long)]
        tolerance: Option<f64>,
        /// Maximum number of analysis passes
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Directory for iteration-NN.csv snapshots
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
        /// Fixed terminal label as `stage:step`, skipping resolution
        #[arg(long)]
        stage_step: Option<String>,
        /// Write the last applied tensions here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Save the pretensions currently assigned in the model
    Fetch {
        /// Destination file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the resolved terminal stage/step label
    StageStep {
        /// Element used for the calibration query (first pretensioned element by default)
        #[arg(long)]
        element: Option<ElementId>,
    },
}

/// Apply the `run` flags that override settings file values.
pub fn apply_overrides(
    tuning: &mut TuningSettings,
    tolerance: Option<f64>,
    max_iterations: Option<usize>,
    snapshot_dir: Option<PathBuf>,
    stage_step: Option<String>,
) {
    if let Some(tolerance) = tolerance {
        tuning.tolerance_pct = tolerance;
    }
    if let Some(max_iterations) = max_iterations {
        tuning.max_iterations = max_iterations;
    }
    if let Some(snapshot_dir) = snapshot_dir {
        tuning.snapshot_dir = snapshot_dir;
    }
    if stage_step.is_some() {
        tuning.stage_step = stage_step;
    }
}
