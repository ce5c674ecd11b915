use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use paperfetch_core::{Config, SearchFilters, SqliteStore, config_file};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod output;

use output::ColorMode;

/// Cached, rate-limited search against the Semantic Scholar Graph API
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log debug output to stderr (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the durable SQLite cache
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for papers, serving repeated queries from cache
    Search {
        /// Free-text query
        query: String,

        /// Number of results to request
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Publication year or range, e.g. 2019 or 2019-2023
        #[arg(long)]
        year: Option<String>,

        /// Comma-separated venues
        #[arg(long, value_delimiter = ',')]
        venue: Vec<String>,

        /// Comma-separated fields of study
        #[arg(long, value_delimiter = ',')]
        field: Vec<String>,

        /// Only papers with an open-access PDF
        #[arg(long)]
        open_access: bool,

        /// Minimum citation count
        #[arg(long)]
        min_citations: Option<u32>,

        /// Provider sort expression, e.g. citationCount:desc
        #[arg(long)]
        sort: Option<String>,

        /// Run the same search N times in this process
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Semantic Scholar API key
        #[arg(long)]
        s2_api_key: Option<String>,
    },

    /// Delete every entry in the durable cache
    Purge,

    /// Show durable cache row counts
    Stats,

    /// Write the resolved settings to a config file (API key excluded)
    InitConfig {
        /// Target file [default: <config_dir>/paperfetch/config.toml]
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Resolve configuration: CLI flags > env vars > config file > defaults
    let mut config = Config::default();
    config.apply_file(&config_file::load_config());
    config.apply_env();
    if let Some(path) = cli.cache_path {
        config.cache_path = Some(path);
    }
    tracing::debug!(?config, "resolved configuration");

    let color = ColorMode(!cli.no_color);
    let mut out = std::io::stdout().lock();

    match cli.command {
        Command::Search {
            query,
            limit,
            year,
            venue,
            field,
            open_access,
            min_citations,
            sort,
            repeat,
            json,
            s2_api_key,
        } => {
            if let Some(key) = s2_api_key {
                config.s2_api_key = Some(key);
            }
            if sort.is_some() {
                config.sort = sort;
            }
            let filters = SearchFilters {
                year,
                venues: venue,
                fields_of_study: field,
                open_access_only: open_access,
                min_citation_count: min_citations,
                ..Default::default()
            };
            search(&mut out, &config, &query, limit, &filters, repeat, json, color).await
        }
        Command::Purge => {
            let store = open_store(&config)?;
            store.clear().await?;
            output::print_purged(&mut out, store.path(), color)?;
            Ok(())
        }
        Command::Stats => {
            let store = open_store(&config)?;
            let (entries, papers) = store.counts().await?;
            output::print_store_counts(&mut out, store.path(), entries, papers, color)?;
            Ok(())
        }
        Command::InitConfig { path, force } => {
            let target = path.clone().or_else(config_file::config_path);
            if let Some(ref target) = target
                && target.exists()
                && !force
            {
                anyhow::bail!("{} already exists; pass --force to overwrite", target.display());
            }
            let written = config_file::save_config(&config.to_config_file(), path.as_deref())?;
            output::print_config_written(&mut out, &written, color)?;
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn search(
    out: &mut dyn Write,
    config: &Config,
    query: &str,
    limit: usize,
    filters: &SearchFilters,
    repeat: usize,
    json: bool,
    color: ColorMode,
) -> anyhow::Result<()> {
    let orch = paperfetch_core::build_orchestrator(config);

    for run in 1..=repeat.max(1) {
        let start = Instant::now();
        let result = orch.search_with_filters(query, limit, filters).await;
        let elapsed = start.elapsed();

        if json {
            serde_json::to_writer_pretty(&mut *out, &result)?;
            writeln!(out)?;
        } else {
            if repeat > 1 {
                output::print_run_header(out, run, repeat, color)?;
            }
            output::print_result(out, &result, elapsed, color)?;
        }
    }

    if !json {
        output::print_cache_stats(out, &orch.get_cache_stats(), color)?;
    }
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let path = config
        .cache_path
        .as_ref()
        .context("no durable cache configured; pass --cache-path or set PAPERFETCH_CACHE_PATH")?;
    SqliteStore::open(path)
        .with_context(|| format!("failed to open cache database at {}", path.display()))
}
