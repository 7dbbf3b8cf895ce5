mod cli;
mod runner;
mod still;

use clap::Parser;

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => runner::run(args.try_into()?),
        Command::Timer(args) => still::read_timer(args),
        #[cfg(feature = "with-tch")]
        Command::Classify(args) => still::classify(args),
    }
}
