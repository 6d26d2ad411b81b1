use std::path::PathBuf;

use clap::{Parser, Subcommand};
use esp_updater::{
    cli::{config::Config, inspect_command, stage, InspectCommandArgs, StageArgs},
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    /// Configuration file, `updater.toml` in the working directory by default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stage an application or filesystem image into a flash dump
    ///
    /// The image goes through the same checks as on the device: it is placed
    /// clear of the running application, verified, and only then announced to
    /// the bootloader through a command record.
    Stage(StageArgs),
    /// Decode and print a bootloader command record
    InspectCommand(InspectCommandArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    debug!("{:#?}", cli);

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match cli.subcommand {
        Commands::Stage(args) => {
            let config = Config::load(cli.config.as_deref())?;
            stage(args, &config)
        }
        Commands::InspectCommand(args) => inspect_command(args),
    }
}
