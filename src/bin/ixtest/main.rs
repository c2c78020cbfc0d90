use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

mod common;
mod simulate;

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs a cross-ledger transfer between two emulated chains
    Simulate(simulate::Args),
}

#[derive(Debug, Parser)]
#[clap(name = "ixtest")]
#[clap(bin_name = "ixtest")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = common::load_config(&args.config).into_diagnostic()?;

    match args.command {
        Command::Simulate(x) => simulate::run(config, &x)?,
    };

    Ok(())
}
