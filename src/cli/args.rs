//! CLI argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::settings::settings_path;

/// Replay sensor counting events through the lane counting engine
#[derive(Parser, Debug, Clone)]
#[command(name = "lanecount-cli")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Newline-delimited JSON events (reads stdin when omitted or "-")
    pub events: Option<PathBuf>,

    /// Settings file (default: ~/.lanecount/settings.toml)
    #[arg(short = 's', long, env = "LANECOUNT_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Write a commented settings template and exit
    #[arg(long)]
    pub init_settings: bool,

    /// Override the default debounce window in seconds
    #[arg(short = 't', long)]
    pub timeout_secs: Option<f64>,

    /// Sleep between events according to their timestamps
    #[arg(long)]
    pub pace: bool,

    /// Exit without waiting for pending debounce timeouts
    #[arg(long)]
    pub no_drain: bool,

    /// Output events as JSON lines (for scripting/parsing)
    #[arg(long)]
    pub json: bool,

    /// Only output the final summary
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Show verbose output (debug information)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    pub fn settings_path(&self) -> PathBuf {
        self.settings.clone().unwrap_or_else(settings_path)
    }

    /// Events file, or `None` for stdin.
    pub fn events_path(&self) -> Option<&PathBuf> {
        self.events.as_ref().filter(|path| path.as_os_str() != "-")
    }
}
