use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use epkx::{Context, ExtractionEngine, Outcome};

#[derive(Parser)]
#[command(name = "epkx")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "LG EPK firmware package extractor")]
struct Cli {
    /// Extract into the current directory instead of the input's directory
    #[arg(short = 'c')]
    current_dir: bool,

    /// Firmware image, pak, or partition dump to unpack
    input: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    println!("epkx - LG firmware package (EPK) extractor\n");

    match run(&cli) {
        Ok(Outcome::Success) => {
            println!("\nExtraction finished.");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Unsupported) => {
            eprintln!("Unsupported input file format: {}", cli.input.display());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<Outcome> {
    let dest_dir = if cli.current_dir {
        std::env::current_dir().context("cannot resolve current directory")?
    } else {
        match cli.input.parent() {
            Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
            Some(p) => p.to_path_buf(),
            None => PathBuf::from("."),
        }
    };

    println!("Input file: {}", cli.input.display());
    println!("Destination directory: {}\n", dest_dir.display());

    let engine = ExtractionEngine::new();
    let ctx = Context::new(dest_dir);
    Ok(engine.process(&cli.input, &ctx)?)
}
