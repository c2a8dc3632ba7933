use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use fis_ingest::{
    Config, Discipline, DiskCache, HttpFetcher, Orchestrator, RunParams, RunSummary, SqliteStore,
};

/// Ingest FIS alpine points lists and race results into SQLite
#[derive(Parser, Debug)]
#[command(name = "fis-ingest", version, about)]
struct Cli {
    /// SQLite database path (overrides FIS_DATABASE_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Points-list cache directory (overrides FIS_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest published points lists
    Points(PointsArgs),
    /// Discover races and scrape their results
    Races(RacesArgs),
}

#[derive(Args, Debug)]
struct PointsArgs {
    /// Ingest exactly this list id (re-ingests even if stored)
    #[arg(long)]
    list_id: Option<String>,

    /// Season code, e.g. 2025 for 2024/25
    #[arg(long)]
    season: Option<u16>,

    /// Lists valid on or after this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    start_date: Option<NaiveDate>,

    /// Lists valid on or before this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    end_date: Option<NaiveDate>,

    /// Re-ingest lists already stored
    #[arg(long)]
    all: bool,

    /// Include season base lists
    #[arg(long)]
    include_base: bool,
}

#[derive(Args, Debug)]
struct RacesArgs {
    /// Season code; defaults to the current season
    #[arg(long)]
    season: Option<u16>,

    /// Category code, repeatable, in priority order (WC, EC, FIS, ...)
    #[arg(long = "category", short = 'c')]
    categories: Vec<String>,

    /// Discipline code or name (DH, SL, GS, SG, AC)
    #[arg(long, value_parser = parse_discipline)]
    discipline: Option<Discipline>,

    /// Scrape a single race by id, skipping discovery
    #[arg(long)]
    race_id: Option<String>,

    #[arg(long, value_parser = parse_date)]
    start_date: Option<NaiveDate>,

    #[arg(long, value_parser = parse_date)]
    end_date: Option<NaiveDate>,

    /// List candidates without scraping
    #[arg(long)]
    discover_only: bool,
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_discipline(raw: &str) -> std::result::Result<Discipline, String> {
    Discipline::parse(raw).ok_or_else(|| format!("unknown discipline: {raw}"))
}

fn init_logging(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "info,fis_ingest=debug",
        (false, _) => "info,fis_ingest=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Run aborted: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let cache = DiskCache::open(config.cache_dir.clone())?;
    let fetcher = HttpFetcher::new(&config)?;
    let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

    match cli.command {
        Command::Points(args) => {
            println!("📋 FIS points lists → {}", config.database_path.display());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            let params = RunParams {
                season: args.season,
                start_date: args.start_date,
                end_date: args.end_date,
                points_list_id: args.list_id,
                include_base_lists: args.include_base,
                new_lists_only: !args.all,
                ..Default::default()
            };
            let summary = orchestrator.run_points_lists(&params)?;
            print_summary("lists", &summary);
        }
        Command::Races(args) => {
            println!("🏁 FIS race results → {}", config.database_path.display());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            let params = RunParams {
                season: args.season,
                categories: args.categories,
                start_date: args.start_date,
                end_date: args.end_date,
                discipline: args.discipline,
                race_id: args.race_id,
                discover_only: args.discover_only,
                ..Default::default()
            };
            let summary = orchestrator.run_races(&params)?;
            print_summary("races", &summary);
        }
    }

    Ok(())
}

fn print_summary(items: &str, summary: &RunSummary) {
    if summary.discovered > 0 || !summary.per_category.is_empty() {
        println!("\n🔭 Discovered {} races", summary.discovered);
        for (category, count) in &summary.per_category {
            println!("   {:<5} {}", category, count);
        }
    }

    println!(
        "\n📊 {}: {} created, {} updated, {} skipped, {} failed",
        items, summary.created, summary.updated, summary.skipped, summary.failed
    );
    println!(
        "   rows: {} created, {} updated, {} unchanged, {} malformed",
        summary.rows.created, summary.rows.updated, summary.rows.skipped, summary.rows.failed
    );

    if !summary.statuses.is_empty() {
        println!("\n🏷️  By status:");
        for (status, count) in &summary.statuses {
            println!("   {:<18} {}", status.label(), count);
        }
    }

    if !summary.identity_conflicts.is_empty() {
        println!("\n⚠️  Identity conflicts ({}):", summary.identity_conflicts.len());
        for (item, reason) in &summary.identity_conflicts {
            println!("   {} → {}", item, reason);
        }
    }

    if !summary.failures.is_empty() {
        println!("\n❌ Failures ({}):", summary.failures.len());
        for (item, reason) in &summary.failures {
            println!("   {} → {}", item, reason);
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if summary.cancelled {
        println!("⏹️  Run cancelled before all items were processed");
    } else {
        println!("✅ Run complete");
    }
}
