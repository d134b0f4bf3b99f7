use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobscout_core::{Posting, PostingId};
use jobscout_storage::PostingStore;
use jobscout_sync::{JobscoutConfig, DEFAULT_CONFIG_FILE};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobscout")]
#[command(about = "Crawl job postings and notify the ones matching your profile")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl, score and notify once.
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Replay a fixture bundle instead of the configured source.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
    /// List stored postings by last score.
    Inspect {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Clear every notified flag so postings can be sent again.
    ResetNotified {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        config: PathBuf::from(DEFAULT_CONFIG_FILE),
        fixtures: None,
        dry_run: false,
    });
    tracing::debug!(?command, "starting jobscout");

    match command {
        Commands::Run {
            config,
            fixtures,
            dry_run,
        } => {
            let summary =
                jobscout_sync::run_once_from_config(&config, fixtures.as_deref(), dry_run).await?;
            println!(
                "run complete: run_id={} fetched={} new={} scored={} selected={} dry_run={}",
                summary.run_id,
                summary.fetched_postings,
                summary.new_postings,
                summary.scored_postings,
                summary.batch.len(),
                summary.dry_run
            );
            if let Some(err) = &summary.notify_error {
                eprintln!("notification failed: {err}");
            }
        }
        Commands::Inspect { config, limit } => {
            let store = load_store(&config).await?;
            let mut postings: Vec<(&PostingId, &Posting)> = store.iter().collect();
            postings.sort_by(|(ia, a), (ib, b)| {
                let score = |p: &Posting| p.last_score.unwrap_or(f64::NEG_INFINITY);
                score(*b).total_cmp(&score(*a)).then_with(|| ia.cmp(ib))
            });
            println!("{} postings in {}", store.len(), store.path().display());
            for (id, posting) in postings.into_iter().take(limit) {
                let score = posting
                    .last_score
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                let flag = if posting.notified { "*" } else { " " };
                println!(
                    "{flag} {score:>6}  {id}  {} | {}",
                    posting.title, posting.company
                );
            }
        }
        Commands::ResetNotified { config } => {
            let mut store = load_store(&config).await?;
            let cleared = store.reset_notified();
            store.save().await.context("saving posting store")?;
            println!("cleared notified flag on {cleared} postings");
        }
    }

    Ok(())
}

async fn load_store(config_path: &Path) -> Result<PostingStore> {
    let mut config = JobscoutConfig::load(config_path)?;
    config.apply_env_overrides()?;
    let path = config.store_path();
    PostingStore::load(&path)
        .await
        .with_context(|| format!("loading posting store {}", path.display()))
}
