use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ai_client::AiClient;
use apify_client::ApifyClient;
use platecheck_common::{Config, Mode};
use platecheck_engine::{
    AnalysisRunOptions, AnalyzeOptions, Analyzer, BoundingBox, BulkOrchestrator, DiscoveryOptions,
    Gateway, ModelAnalyst, RegionFilter, TaskQueue,
};
use platecheck_store::Store;

#[derive(Parser)]
#[command(name = "platecheck")]
#[command(about = "Restaurant quality reports from scraped map reviews")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a place reference and print its quality report
    Check {
        /// Map URL, short link, or free-text query
        input: String,

        /// Analysis depth (quick or deep)
        #[arg(default_value = "quick")]
        mode: Mode,

        /// Re-scrape even when a fresh cached report exists
        #[arg(long)]
        refresh: bool,

        /// Serve an expired report when upstream fails
        #[arg(long)]
        allow_stale: bool,
    },

    /// Queue an analysis and poll until it finishes
    Submit {
        input: String,

        #[arg(default_value = "quick")]
        mode: Mode,
    },

    /// Drop cached reports for a place
    Forget {
        input: String,

        /// Only this mode's report; all modes when omitted
        mode: Option<Mode>,
    },

    /// Search the map for every query in a file and catalog accepted results
    /// under a tag. Region filter comes from the REGION_* env vars.
    Discover {
        tag: String,

        /// One search query per line; `#` starts a comment
        queries_file: PathBuf,

        /// Stop once this many new places entered the catalog
        /// (falls back to DISCOVER_MAX_NEW_PLACES)
        #[arg(long)]
        max_new_places: Option<u64>,
    },

    /// Analyze every place in a tag's catalog
    Analyze {
        tag: String,

        #[arg(default_value = "quick")]
        mode: Mode,

        /// Re-analyze even when the scrape turned up nothing new
        #[arg(long)]
        refresh: bool,
    },

    /// Print the catalog with reports as JSON
    Export {
        tag: String,

        #[arg(default_value = "quick")]
        mode: Mode,
    },

    /// Show recent bulk jobs
    Jobs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("platecheck=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env();
    let store = Arc::new(Store::connect(&config.database_url).await?);
    store.migrate().await?;

    let gateway = Arc::new(Gateway::new(
        config.max_concurrent_external_calls,
        config.call_timeout,
        config.heartbeat_interval,
    ));
    let apify = Arc::new(ApifyClient::new(config.apify_token.clone()));
    let mut ai = AiClient::new(&config.openai_api_key);
    if let Some(base) = &config.openai_base_url {
        ai = ai.with_base_url(base);
    }
    let analyst = Arc::new(ModelAnalyst::new(ai, &config.model));
    let analyzer = Arc::new(Analyzer::new(
        Arc::clone(&store),
        Arc::clone(&gateway),
        apify.clone(),
        analyst,
        config.cache_ttl,
        &config.language,
        config.max_reviews_for_analysis,
    ));

    match cli.command {
        Commands::Check {
            input,
            mode,
            refresh,
            allow_stale,
        } => {
            let options = AnalyzeOptions {
                mode,
                force_refresh: refresh,
                allow_stale,
                skip_unchanged: false,
                max_reviews: None,
            };
            let outcome = analyzer.analyze_place(&input, &options).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Submit { input, mode } => {
            let options = AnalyzeOptions::for_mode(mode);
            let queue = Arc::new(TaskQueue::new(
                analyzer,
                config.interactive_workers,
                config.task_ttl,
                config.heartbeat_interval,
            ));
            queue.spawn_reaper();

            let id = queue.submit(&input, options)?;
            info!(task = %id, "Task submitted");
            loop {
                let record = queue.status(&id)?;
                if record.state.is_terminal() {
                    let outcome = queue.result(&id).await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Commands::Forget { input, mode } => {
            let reference = platecheck_common::resolve(&input);
            let removed = store
                .delete_analysis(&reference.identity_key, mode.map(|m| m.as_str()))
                .await?;
            println!(
                "removed {removed} cached report(s) for {}",
                reference.identity_key
            );
        }
        Commands::Discover {
            tag,
            queries_file,
            max_new_places,
        } => {
            let queries: Vec<String> = std::fs::read_to_string(&queries_file)
                .with_context(|| format!("reading {}", queries_file.display()))?
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            if queries.is_empty() {
                bail!("no queries in {}", queries_file.display());
            }

            let orchestrator = BulkOrchestrator::new(
                Arc::clone(&store),
                gateway,
                apify,
                analyzer,
                config.heartbeat_interval,
            );
            let options = DiscoveryOptions {
                language: config.language.clone(),
                filter: region_filter_from_env()?,
                workers: config.batch_workers,
                max_new_places: max_new_places.or_else(|| {
                    env::var("DISCOVER_MAX_NEW_PLACES")
                        .ok()
                        .and_then(|v| v.trim().parse().ok())
                }),
                ..DiscoveryOptions::default()
            };
            let report = orchestrator.run_discovery(&tag, &queries, &options).await?;
            info!(
                job = %report.job_id,
                found = report.found,
                kept = report.kept,
                new = report.new,
                filtered = report.filtered,
                "Discovery complete"
            );
        }
        Commands::Analyze { tag, mode, refresh } => {
            let orchestrator = BulkOrchestrator::new(
                Arc::clone(&store),
                gateway,
                apify,
                analyzer,
                config.heartbeat_interval,
            );
            let options = AnalysisRunOptions {
                mode,
                workers: config.batch_workers,
                refresh,
            };
            let report = orchestrator.run_analysis(&tag, &options).await?;
            info!(
                job = %report.job_id,
                analyzed = report.analyzed,
                skipped = report.skipped,
                failed = report.failed,
                "Bulk analysis complete"
            );
        }
        Commands::Export { tag, mode } => {
            let rows = store.catalog_with_analysis(&tag, mode.as_str()).await?;
            let out: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "identity": row.place.place_identity,
                        "name": row.place.name,
                        "address": row.place.address,
                        "rating": row.place.rating,
                        "reviews_count": row.place.reviews_count,
                        "map_url": row.place.map_url,
                        "report": row.report,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Jobs => {
            let jobs = store.recent_jobs(20).await?;
            for job in jobs {
                println!(
                    "{}  {:<10} {:<10} {:<8} {}/{} done, {} failed, {} skipped",
                    job.started_at.format("%Y-%m-%d %H:%M:%S"),
                    job.kind,
                    job.tag,
                    job.status,
                    job.completed,
                    job.total,
                    job.failed,
                    job.skipped,
                );
            }
        }
    }

    Ok(())
}

/// Region filter from REGION_REQUIRED_TERMS, REGION_EXCLUDED_TERMS (comma
/// separated) and REGION_BBOX (min_lat,min_lng,max_lat,max_lng).
fn region_filter_from_env() -> Result<RegionFilter> {
    let terms = |key: &str| -> Vec<String> {
        env::var(key)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    };

    let bbox = match env::var("REGION_BBOX") {
        Ok(raw) if !raw.trim().is_empty() => {
            let parts: Vec<f64> = raw
                .split(',')
                .map(|p| p.trim().parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .context("REGION_BBOX must be min_lat,min_lng,max_lat,max_lng")?;
            if parts.len() != 4 {
                bail!("REGION_BBOX must have exactly four numbers");
            }
            Some(BoundingBox {
                min_lat: parts[0],
                min_lng: parts[1],
                max_lat: parts[2],
                max_lng: parts[3],
            })
        }
        _ => None,
    };

    Ok(RegionFilter {
        required_terms: terms("REGION_REQUIRED_TERMS"),
        excluded_terms: terms("REGION_EXCLUDED_TERMS"),
        bbox,
    })
}
