use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "slidemanager-daemon",
    version,
    about = "SlideManager indexing daemon"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Increase logging verbosity (-v, -vv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP daemon for one library root.
    Serve(ServeArgs),
}

#[derive(Debug, clap::Args)]
pub struct ServeArgs {
    /// Library root the index database lives under; defaults to the
    /// current directory.
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Override the configured listen address.
    #[arg(long)]
    pub listen: Option<String>,
}
