use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "accord",
    about = "Accord convergent consensus peer",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a peer key pair
    Keygen(KeygenArgs),
    /// Print the default peer configuration, or check a config file
    Config(ConfigArgs),
    /// Run in-process peers until they agree on every transaction
    Simulate(SimulateArgs),
}

#[derive(Args)]
pub struct KeygenArgs {
    /// Derive the key pair from a 32-byte hex seed instead of generating one
    #[arg(long)]
    pub seed: Option<String>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Config file to load and validate
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[arg(long, default_value = "4")]
    pub peers: usize,
    #[arg(long, default_value = "100")]
    pub transactions: usize,
    /// Stake given to every peer in the genesis state
    #[arg(long, default_value = "100")]
    pub stake: u64,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    pub timeout: u64,
}
