use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rtd-cli")]
#[command(about = "Returns tracking dashboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle against the configured source and exit.
    Sync,
    /// Apply the database schema.
    Migrate,
    /// Serve the dashboard and JSON API (default).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync => {
            let outcome = rtd_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} pages={} fetched={} created={} updated={} skipped={}",
                outcome.run_id,
                outcome.tally.pages,
                outcome.tally.fetched,
                outcome.tally.created,
                outcome.tally.updated,
                outcome.tally.skipped,
            );
        }
        Commands::Migrate => {
            let config = rtd_sync::SyncConfig::from_env();
            let store = rtd_store::Store::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("schema applied");
        }
        Commands::Serve => {
            rtd_web::serve_from_env().await?;
        }
    }

    Ok(())
}
