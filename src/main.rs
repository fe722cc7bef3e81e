use clap::Parser;
use git_chronicle::Cli;
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(failure) = cli.execute().await {
        eprintln!("Error: {}", failure.error);

        // Print the full error chain if available
        let mut source = failure.error.source();
        while let Some(err) = source {
            eprintln!("  Caused by: {}", err);
            source = err.source();
        }

        process::exit(failure.code);
    }
}
