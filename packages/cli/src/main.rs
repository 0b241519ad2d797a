use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wasi_farm_cli::RunArgs;

/// wasi-farm - run WASI modules across cooperating workers
#[derive(Parser, Debug)]
#[command(name = "wasi-farm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a module's `_start`
    Run(RunArgs),
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("WASI_FARM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Run(args) => match wasi_farm_cli::run(&args) {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
    }
}
