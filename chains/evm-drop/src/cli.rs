use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use drop_core::{PhaseKey, Priority};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Phased NFT drop launchpad", long_about = None)]
pub struct Args {
    #[arg(short, long, default_value = "chains/evm-drop/config.toml")]
    pub config: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build or check allow-list commitments without touching storage
    #[command(subcommand)]
    Commitment(CommitmentCommand),
    /// Inspect and edit the collection's phases
    #[command(subcommand)]
    Phases(PhaseCommand),
    /// Manage allow-lists of gated phases
    #[command(subcommand)]
    Allowlist(AllowListCommand),
    /// Queue mints in the active phase and submit them
    Mint(MintArgs),
}

#[derive(Subcommand, Debug)]
pub enum CommitmentCommand {
    /// Compute the root and proofs for an address list
    Build {
        /// Text or CSV file of addresses
        file: PathBuf,
        /// Write the full commitment as JSON
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Check a proof against a root
    Verify {
        #[arg(long)]
        root: String,
        #[arg(long)]
        address: String,
        /// Comma-separated proof nodes
        #[arg(long, value_delimiter = ',')]
        proof: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PhaseCommand {
    /// Show every enabled phase with its status
    List,
    /// Create or edit a phase
    Set(PhaseSetArgs),
    /// Disable a phase (the catch-all phase cannot be removed)
    Remove { phase: PhaseKey },
    /// Show the phase accepting mints right now
    Active,
    /// Change the collection's total supply
    Supply { total: u64 },
}

#[derive(ClapArgs, Debug)]
pub struct PhaseSetArgs {
    pub phase: PhaseKey,
    /// Price in ether, e.g. 0.05
    #[arg(long)]
    pub price: Option<String>,
    #[arg(long)]
    pub allocation: Option<u64>,
    /// RFC 3339 start time
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,
    /// RFC 3339 end time
    #[arg(long)]
    pub end: Option<DateTime<Utc>>,
    #[arg(long)]
    pub active: Option<bool>,
    #[arg(long)]
    pub public: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub enum AllowListCommand {
    /// Replace the allow-list
    Set(AllowListArgs),
    /// Add addresses
    Add(AllowListArgs),
    /// Remove addresses
    Remove(AllowListArgs),
    /// Print members and root
    Show { phase: PhaseKey },
    /// Print the stored proof of one address
    Proof { phase: PhaseKey, address: String },
}

#[derive(ClapArgs, Debug)]
pub struct AllowListArgs {
    pub phase: PhaseKey,
    /// Addresses given inline
    pub addresses: Vec<String>,
    /// Text or CSV file of addresses
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct MintArgs {
    /// Units per request
    #[arg(short, long, default_value = "1")]
    pub quantity: u32,
    /// Number of requests to queue
    #[arg(short = 'n', long, default_value = "1")]
    pub count: u32,
    #[arg(short, long, default_value = "medium")]
    pub priority: Priority,
    #[arg(short, long)]
    pub export_metrics: Option<String>,
    #[arg(long, default_value = "30")]
    pub metrics_interval: u64,
}
