use std::ffi::OsString;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::counter::{self, CounterCliArgs, CounterConfig};

#[derive(Debug, Parser)]
#[command(name = "people-counter", version, about = "Count people entering a camera's view")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count entries until interrupted.
    Run(CounterCliArgs),
    /// Check the source, detector, and collector once, then exit.
    Probe(CounterCliArgs),
}

pub fn handle_commands<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::parse_from(args).command {
        Command::Run(args) => counter::run(CounterConfig::try_from(args)?),
        Command::Probe(args) => counter::probe(CounterConfig::try_from(args)?),
    }
}
