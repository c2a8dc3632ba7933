// FIS Ingest - Core Library
// Exposes all modules for use in the CLI and tests

pub mod cache;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod fetch;
mod html;
pub mod identity;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod points_list;
pub mod race_results;

// Re-export commonly used types
pub use cache::{DiskCache, FileCache, MemoryCache};
pub use config::Config;
pub use db::{setup_database, Event, SqliteStore, Store};
pub use discovery::{
    merge_candidates, parse_listing, season_for, DiscoveryFilter, DiscoveryReport, RaceCandidate,
    RaceDiscovery, CATEGORIES,
};
pub use error::{IngestError, ParseError, Result};
pub use fetch::{Fetcher, HttpFetcher, StaticFetcher};
pub use identity::IdentityResolver;
pub use models::{
    Athlete, AthleteAttrs, AthletePointsRecord, CourseDetails, Discipline, DisciplineScore,
    Gender, PointsListRef, Race, RaceResult, UpsertOutcome,
};
pub use orchestrator::{current_season, Orchestrator, RunParams, RunSummary};
pub use parser::{parse_points_list, ParsedRow};
pub use points_list::{
    fetch_catalogue, filter_by_validity, parse_points_list_index, IngestOutcome,
    PointsListIngestor,
};
pub use race_results::{
    parse_race_page, race_points, RacePage, RaceResultScraper, ScrapeOutcome, ScrapeStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
