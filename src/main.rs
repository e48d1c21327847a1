//! mosaic-stitch CLI
//!
//! Command-line entry point for stitching microscopy tile grids.

use clap::Parser;
use env_logger::Env;
use log::{debug, error};

use mosaic_stitch::cli::{commands, Cli, Commands};
use mosaic_stitch::Result;

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    debug!("mosaic-stitch v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Some(cmd) => handle_command(cmd),
        None => {
            println!("mosaic-stitch v{}", env!("CARGO_PKG_VERSION"));
            println!("Use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{}", e.report_line());
        if let Some(hint) = e.recovery_suggestion() {
            eprintln!("hint: {}", hint);
        }
        std::process::exit(1);
    }
}

fn handle_command(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Stitch(args) => commands::stitch(&args),
        Commands::Recover { directory } => commands::recover(&directory),
        Commands::Split { input, tiles_dir } => commands::split(&input, tiles_dir.as_deref()),
        Commands::ExtractXml { files } => commands::extract_xml(&files),
        Commands::Inspect { file } => commands::inspect(&file),
    }
}
