use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use finale_sync::{build_pipeline, build_scheduler, RunOptions, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "finale-cli")]
#[command(about = "Finale Ligure trail status sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync against the status listing (the default).
    Sync(SyncArgs),
    /// Run syncs on the FINALE_SCHEDULE_CRON schedule until interrupted.
    Schedule(SyncArgs),
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Compute and report changes without writing to the trail store.
    #[arg(long)]
    dry_run: bool,
    /// Override the status listing URL.
    #[arg(long)]
    url: Option<String>,
    /// Read the listing from a saved HTML file instead of fetching it.
    #[arg(long)]
    html_file: Option<PathBuf>,
    /// Load canonical trails from a JSON file instead of the database.
    #[arg(long)]
    trails_file: Option<PathBuf>,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl SyncArgs {
    fn apply(&self, mut config: SyncConfig) -> (SyncConfig, RunOptions) {
        config.dry_run |= self.dry_run;
        if let Some(url) = &self.url {
            config.status_url = Some(url.clone());
        }
        let options = RunOptions {
            html_file: self.html_file.clone(),
            trails_file: self.trails_file.clone(),
        };
        (config, options)
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("finale_sync=info".parse()?)
                .add_directive("finale_storage=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn sync(args: SyncArgs) -> Result<ExitCode> {
    let (config, options) = args.apply(SyncConfig::from_env()?);
    let pipeline = build_pipeline(config, &options)?;

    match pipeline.run_once().await {
        Ok(summary) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.render_text());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(%err, "status sync failed");
            eprintln!("status sync failed: {err}");
            Ok(ExitCode::from(err.exit_code()))
        }
    }
}

async fn schedule(args: SyncArgs) -> Result<ExitCode> {
    let (config, options) = args.apply(SyncConfig::from_env()?);
    let cron = config.schedule_cron.clone();
    let pipeline = Arc::new(build_pipeline(config, &options)?);

    let mut scheduler = build_scheduler(pipeline).await?;
    scheduler.start().await.context("starting scheduler")?;
    info!(%cron, "status sync scheduled; waiting for ctrl-c");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}

async fn migrate() -> Result<ExitCode> {
    let config = SyncConfig::from_env()?;
    let url = config
        .database_url
        .context("DATABASE_URL is required to run migrations")?;
    finale_sync::migrate(&url).await?;
    println!("migrations applied");
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        eprintln!("failed to initialise logging: {err:#}");
        return ExitCode::FAILURE;
    }

    let outcome = match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await,
        Commands::Schedule(args) => schedule(args).await,
        Commands::Migrate => migrate().await,
    };

    outcome.unwrap_or_else(|err| {
        error!(err = %format!("{err:#}"), "finale-cli failed");
        eprintln!("error: {err:#}");
        ExitCode::FAILURE
    })
}
