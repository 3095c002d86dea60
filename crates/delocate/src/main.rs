use std::process::ExitCode;

use anstream::eprintln;
use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;

use delocate_cli::{Cli, Commands};

use crate::commands::ExitStatus;
use crate::printer::Printer;

mod commands;
mod logging;
mod printer;

fn run() -> Result<ExitStatus> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };
    let globals = cli.global_args;

    // Colors must be configured before logging, which asks `anstream` whether to emit ANSI codes.
    anstream::ColorChoice::write_global(globals.color.into());

    // Configure the `tracing` crate, which controls internal logging.
    logging::setup_logging(match globals.verbose {
        0 => logging::Level::Default,
        1 => logging::Level::Verbose,
        _ => logging::Level::ExtraVerbose,
    })?;

    // Configure the `Printer`, which controls user-facing output in the CLI.
    let printer = if globals.quiet {
        Printer::Quiet
    } else if globals.verbose > 0 {
        Printer::Verbose
    } else {
        Printer::Default
    };

    match cli.command {
        Commands::Wheel(args) => commands::wheel(&args, printer),
        Commands::Path(args) => commands::path(&args, printer),
        Commands::ListDeps(args) => commands::list_deps(&args, printer),
        Commands::Fuse(args) => commands::fuse(&args, printer),
        Commands::PatchBinary(args) => commands::patch_binary(&args, printer),
        Commands::AddPlatforms(args) => commands::add_platforms(&args, printer),
    }
}

#[allow(clippy::print_stderr)]
fn main() -> ExitCode {
    match run() {
        Ok(code) => code.into(),
        Err(err) => {
            let mut causes = err.chain();
            if let Some(err) = causes.next() {
                eprintln!("{}: {}", "error".red().bold(), err);
            }
            for err in causes {
                eprintln!("  {}: {}", "Caused by".red().bold(), err);
            }
            ExitStatus::Error.into()
        }
    }
}
