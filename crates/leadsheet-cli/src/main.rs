use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "leadsheet")]
#[command(about = "Leadsheet sheet-sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every active connection once
    Sync,
    /// Run pending database migrations
    Migrate,
    /// Serve the JSON API
    Serve,
    /// Analyze a sheet before connecting it
    Analyze {
        url: String,
        /// Tab names for multi-tab workbook analysis (repeatable)
        #[arg(long = "tab")]
        tabs: Vec<String>,
    },
    /// Run the cron scheduler in the foreground
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = leadsheet_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} connections={} failures={}",
                summary.run_id,
                summary.connections.len(),
                summary.failures.len()
            );
        }
        Commands::Migrate => {
            let config = leadsheet_sync::SyncConfig::from_env();
            let store = leadsheet_storage::PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => leadsheet_web::serve_from_env().await?,
        Commands::Analyze { url, tabs } => {
            let config = leadsheet_sync::SyncConfig::from_env();
            let engine = leadsheet_sync::engine_from_config(&config).await?;
            let tabs = (!tabs.is_empty()).then_some(tabs);
            let analyses = engine.analyze_sheet(None, &url, tabs).await?;
            println!("{}", serde_json::to_string_pretty(&analyses)?);
        }
        Commands::Schedule => {
            let config = leadsheet_sync::SyncConfig::from_env();
            if !config.scheduler_enabled {
                eprintln!("scheduler disabled; set LEADSHEET_SCHEDULER_ENABLED=1");
                return Ok(());
            }
            let engine = leadsheet_sync::engine_from_config(&config).await?;
            let mut sched = leadsheet_sync::build_scheduler(engine, &config.sync_cron).await?;
            sched.start().await?;
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}
