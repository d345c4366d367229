use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct CliOpt {
    /// Path to the YAML (or JSON) document describing the topology and its scenarios
    #[arg(long)]
    pub topology: PathBuf,

    /// Path to the JSON file containing the engine config (defaults are used if absent)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check the document and report every problem found
    Validate,
    /// Show the addresses, routes and resources the topology would get
    Plan,
    /// Bring the topology up against an in-memory driver and run its scenarios
    Run(RunOpt),
}

#[derive(Parser, Debug, Clone)]
pub struct RunOpt {
    /// How long to keep the topology up before tearing it down, in seconds
    #[arg(long, default_value_t = 0)]
    pub for_secs: u64,

    /// Transient scenarios to trigger right after the topology comes up
    #[arg(long)]
    pub trigger: Vec<String>,

    /// Path where the event log will be written, as JSON
    #[arg(long)]
    pub events: Option<PathBuf>,
}
