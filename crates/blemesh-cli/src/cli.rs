//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Local advertisement nonce (random when omitted)
    #[arg(short, long, allow_hyphen_values = true)]
    pub nonce: Option<i32>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan, connect to mesh peers and print what they send
    Scan {
        /// Stop after this many seconds (runs until Ctrl+C when omitted)
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Wait for a peer to become ready, write one payload and exit
    Send {
        /// Peer address as reported by the adapter
        #[arg(short, long)]
        to: String,
        /// Characteristic UUID to write to
        #[arg(short = 'u', long)]
        characteristic: String,
        /// Payload as a hex string
        payload: String,
    },
    /// Print the effective configuration as TOML
    Config,
}
