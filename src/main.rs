//! # Subtitle Catalog Main Driver
//!
//! ## Purpose
//! Command line entry point for the subtitle catalog engine: backfills
//! announcement history from a replay file, runs queries, duplicate scans
//! and catalog exports against the shared database.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration file, command line arguments, replay files
//! - **Output**: Catalog mutations, query results and reports on stdout
//! - **Initialization**: Loads configuration, initializes logging, opens
//!   the catalog and self-heals the index before any command runs
//!
//! ## Architecture Flow
//! 1. Parse command line arguments and load configuration
//! 2. Initialize logging and tracing
//! 3. Open the catalog (storage, index rebuild, self-heal)
//! 4. Dispatch the requested subcommand
//! 5. Flush storage before exit

use async_trait::async_trait;
use clap::{Arg, ArgAction, Command};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subtitle_catalog::{
    catalog::Catalog,
    config::Config,
    errors::{CatalogError, Result},
    ingest::{AnnouncementSource, CancelFlag},
    normalize::RawAnnouncement,
    RecordId,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("subtitle-catalog")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Subtitle catalog engine with fuzzy search and duplicate scanning")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("backfill")
                .about("Replay announcement history from a JSONL file")
                .arg(
                    Arg::new("file")
                        .value_name("FILE")
                        .help("Replay file, one announcement per line")
                        .required(true),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .help("Stop after processing N announcements")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("reset")
                        .long("reset")
                        .help("Drop the backfill checkpoint and start from scratch")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("search")
                .about("Run a query against the catalog")
                .arg(Arg::new("query").value_name("QUERY").required(true))
                .arg(
                    Arg::new("page")
                        .long("page")
                        .value_name("N")
                        .default_value("1")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("page-size")
                        .long("page-size")
                        .value_name("N")
                        .default_value("0")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(Command::new("scan").about("Scan for duplicates and collapse each group"))
        .subcommand(
            Command::new("export")
                .about("Export all live records as JSON")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Write to a file instead of stdout"),
                ),
        )
        .subcommand(Command::new("stats").about("Print catalog statistics"))
        .subcommand(Command::new("check-health").about("Run storage health checks and exit"))
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");
    let config = Config::from_file(config_path)?;

    init_logging(&config)?;
    info!(config = config_path, "starting subtitle catalog");

    let catalog = Catalog::open(config).await?;

    match matches.subcommand() {
        Some(("backfill", sub)) => {
            let file = sub
                .get_one::<String>("file")
                .ok_or_else(|| CatalogError::Validation {
                    field: "file".to_string(),
                    reason: "replay file is required".to_string(),
                })?;
            let limit = sub.get_one::<usize>("limit").copied();
            if sub.get_flag("reset") {
                catalog.reset_backfill().await?;
                info!("backfill checkpoint reset");
            }
            run_backfill(&catalog, file, limit).await?;
        }
        Some(("search", sub)) => {
            let query = sub
                .get_one::<String>("query")
                .ok_or_else(|| CatalogError::Validation {
                    field: "query".to_string(),
                    reason: "query is required".to_string(),
                })?;
            let page = sub.get_one::<usize>("page").copied().unwrap_or(1);
            let page_size = sub.get_one::<usize>("page-size").copied().unwrap_or(0);

            let results = catalog.search(query, page, page_size).await?;
            println!(
                "{} matches (page {} of results, {} shown)",
                results.total_matches,
                results.page,
                results.hits.len()
            );
            for hit in &results.hits {
                println!(
                    "  [{:>8}] {}{}  score={:.2}  downloads={}",
                    hit.record.id,
                    hit.record.normalized_title,
                    hit.record
                        .year
                        .map(|y| format!(" ({})", y))
                        .unwrap_or_default(),
                    hit.score,
                    hit.record.download_count
                );
            }
            if results.has_more {
                println!("  ... more results on page {}", results.page + 1);
            }
        }
        Some(("scan", _)) => {
            let report = catalog.run_scan().await?;
            println!(
                "scanned {} records, {} duplicate groups, {} superseded",
                report.records_scanned, report.groups_found, report.records_superseded
            );
        }
        Some(("export", sub)) => {
            let json = catalog.export_catalog()?;
            match sub.get_one::<String>("output") {
                Some(path) => {
                    tokio::fs::write(path, &json).await?;
                    info!(path = %path, "catalog exported");
                }
                None => println!("{}", json),
            }
        }
        Some(("stats", _)) => {
            let stats = catalog.stats();
            println!("live records:       {}", stats.index.live_records);
            println!("superseded records: {}", stats.index.superseded_records);
            println!("distinct tokens:    {}", stats.index.distinct_tokens);
            println!("distinct n-grams:   {}", stats.index.distinct_ngrams);
            println!("pending requests:   {}", stats.pending_requests);
            println!("persisted records:  {}", stats.persisted_records);
        }
        Some(("check-health", _)) => {
            catalog.health_check().await?;
            println!("storage healthy");
        }
        _ => unreachable!("subcommand is required"),
    }

    catalog.flush().await?;
    Ok(())
}

/// Initialize logging and tracing from the configured level, overridable
/// via `RUST_LOG`
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .map_err(|_| CatalogError::Config {
            message: format!("invalid log level: {}", config.logging.level),
        })?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .with(filter)
        .init();
    Ok(())
}

/// Run a backfill from a replay file, cancellable with Ctrl-C
async fn run_backfill(catalog: &Catalog, file: &str, limit: Option<usize>) -> Result<()> {
    let mut source = JsonlSource::load(file).await?;
    info!(file, announcements = source.len(), "replay file loaded");

    let cancel = CancelFlag::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current record");
            signal_cancel.cancel();
        }
    });

    let report = catalog.run_backfill(&mut source, limit, &cancel).await?;
    println!(
        "backfill {:?}: {} processed, {} indexed, {} skipped, {} duplicates, position {}",
        report.status,
        report.processed,
        report.indexed,
        report.skipped,
        report.duplicates,
        report.final_position
    );
    if let Some(message) = &report.error_message {
        println!("error: {}", message);
    }
    Ok(())
}

/// One line of a replay file
#[derive(Debug, Deserialize)]
struct ReplayLine {
    position: RecordId,
    #[serde(default)]
    caption: Option<String>,
    file_name: String,
    file_size: u64,
}

/// Announcement source over a JSONL replay file, loaded up front and
/// served in position order
struct JsonlSource {
    announcements: Vec<(RecordId, RawAnnouncement)>,
}

impl JsonlSource {
    async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut announcements = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: ReplayLine =
                serde_json::from_str(line).map_err(|e| CatalogError::Validation {
                    field: "replay".to_string(),
                    reason: format!("line {}: {}", number + 1, e),
                })?;
            announcements.push((
                parsed.position,
                RawAnnouncement {
                    caption: parsed.caption,
                    file_name: parsed.file_name,
                    file_size: parsed.file_size,
                },
            ));
        }
        announcements.sort_by_key(|(position, _)| *position);
        Ok(Self { announcements })
    }

    fn len(&self) -> usize {
        self.announcements.len()
    }
}

#[async_trait]
impl AnnouncementSource for JsonlSource {
    fn name(&self) -> &str {
        "jsonl-replay"
    }

    async fn fetch_after(
        &mut self,
        after: RecordId,
        limit: usize,
    ) -> Result<Vec<(RecordId, RawAnnouncement)>> {
        Ok(self
            .announcements
            .iter()
            .filter(|(position, _)| *position > after)
            .take(limit)
            .cloned()
            .collect())
    }
}
