use clap::Parser;

mod api;
mod changes;
mod cli;
mod error;
mod git;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stderr only; stdout carries command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gits=warn".into()),
        )
        .init();

    // clap exits with status 2 on usage errors
    let args = cli::Cli::parse();

    if let Err(e) = cli::run(args).await {
        eprintln!("Error: {e}");
        std::process::exit(e.class().exit_code());
    }
    Ok(())
}
