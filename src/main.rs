mod diagnostics;
mod executor;
mod wire;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// LTX: a transport-agnostic test executor. Reads the LTX wire protocol
/// on stdin, writes it on stdout; everything else (discovery, SSH,
/// reporting) lives in the controller that spawns this process.
#[derive(Debug, Parser)]
#[command(name = "ltx", version)]
struct Cli {
    /// Increase log verbosity (stackable: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "ltx=info",
        1 => "ltx=debug",
        _ => "ltx=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = executor::run().await {
        tracing::error!(error = %e, "executor loop failed");
        eprintln!("ltx: {e}");
        std::process::exit(1);
    }
}
