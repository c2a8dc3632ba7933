// 🎛️ Ingestion Orchestrator
//
// Drives one run: a single points list, a season of lists, discovery plus
// scraping, or a single race. Items are processed sequentially and in
// isolation. Only a storage failure aborts the run.

use crate::cache::FileCache;
use crate::config::Config;
use crate::db::Store;
use crate::discovery::{season_for, DiscoveryFilter, RaceDiscovery};
use crate::error::{IngestError, Result};
use crate::fetch::Fetcher;
use crate::models::{Discipline, PointsListRef, UpsertOutcome};
use crate::points_list::{fetch_catalogue, filter_by_validity, IngestOutcome, PointsListIngestor};
use crate::race_results::{RaceResultScraper, ScrapeOutcome, ScrapeStatus};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Season of today's date
pub fn current_season() -> u16 {
    season_for(Local::now().date_naive())
}

// ============================================================================
// RUN PARAMETERS
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunParams {
    /// Season code, e.g. 2025 for 2024/25; defaults to the current season
    pub season: Option<u16>,
    /// Category filter in priority order; empty means every category
    pub categories: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub discipline: Option<Discipline>,
    /// Scrape exactly this race, skipping discovery
    pub race_id: Option<String>,
    pub discover_only: bool,
    /// Ingest exactly this points list
    pub points_list_id: Option<String>,
    pub include_base_lists: bool,
    /// Skip lists already stored
    pub new_lists_only: bool,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            season: None,
            categories: Vec::new(),
            start_date: None,
            end_date: None,
            discipline: None,
            race_id: None,
            discover_only: false,
            points_list_id: None,
            include_base_lists: false,
            new_lists_only: true,
        }
    }
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Items (lists or races) first stored by this run
    pub created: usize,
    /// Items whose stored content changed
    pub updated: usize,
    /// Items already up to date, or out of scope (no results, unsupported)
    pub skipped: usize,
    /// Items that could not be ingested
    pub failed: usize,
    /// Row-level totals across all items
    pub rows: IngestOutcome,
    /// Race runs: items per scrape status
    pub statuses: BTreeMap<ScrapeStatus, usize>,
    /// Race runs: candidates attributed to each requested category
    pub per_category: BTreeMap<String, usize>,
    pub discovered: usize,
    /// (item, reason) for failed items
    pub failures: Vec<(String, String)>,
    /// (item, reason) for identity conflicts, kept apart from other failures
    pub identity_conflicts: Vec<(String, String)>,
    pub cancelled: bool,
}

impl RunSummary {
    fn record_list(&mut self, outcome: &IngestOutcome) {
        self.rows.created += outcome.created;
        self.rows.updated += outcome.updated;
        self.rows.skipped += outcome.skipped;
        self.rows.failed += outcome.failed;

        if outcome.created > 0 {
            self.created += 1;
        } else if outcome.updated > 0 {
            self.updated += 1;
        } else {
            self.skipped += 1;
        }
    }

    fn record_scrape(&mut self, outcome: &ScrapeOutcome) {
        *self.statuses.entry(outcome.status).or_insert(0) += 1;
        self.rows.created += outcome.created;
        self.rows.updated += outcome.updated;
        self.rows.skipped += outcome.unchanged;
        self.rows.failed += outcome.skipped_rows;

        match outcome.status {
            ScrapeStatus::FetchFailed => {
                self.failed += 1;
                self.failures.push((
                    outcome.race_id.clone(),
                    outcome.detail.clone().unwrap_or_else(|| "fetch failed".to_string()),
                ));
            }
            ScrapeStatus::UnsupportedFormat => self.skipped += 1,
            ScrapeStatus::Completed | ScrapeStatus::NoResults => match outcome.race {
                Some(UpsertOutcome::Created) => self.created += 1,
                _ if outcome.changed() => self.updated += 1,
                _ => self.skipped += 1,
            },
        }
    }

    /// Record an item-level error; storage errors are handed back as fatal.
    fn record_error(&mut self, item: &str, err: IngestError) -> Result<()> {
        if err.is_fatal() {
            error!(item, error = %err, "storage unavailable; aborting run");
            return Err(err);
        }

        self.failed += 1;
        if err.is_identity_conflict() {
            warn!(item, error = %err, "identity conflict");
            self.identity_conflicts.push((item.to_string(), err.to_string()));
        } else {
            warn!(item, kind = err.kind(), error = %err, "item failed");
            self.failures.push((item.to_string(), err.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator<'a, S: Store, F: Fetcher, C: FileCache> {
    store: &'a S,
    fetcher: &'a F,
    cache: &'a C,
    config: &'a Config,
    cancel: Arc<AtomicBool>,
}

impl<'a, S: Store, F: Fetcher, C: FileCache> Orchestrator<'a, S, F, C> {
    pub fn new(store: &'a S, fetcher: &'a F, cache: &'a C, config: &'a Config) -> Self {
        Self {
            store,
            fetcher,
            cache,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the run before the next item when set
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self, summary: &mut RunSummary) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            if !summary.cancelled {
                info!("run cancelled; stopping before next item");
            }
            summary.cancelled = true;
        }
        summary.cancelled
    }

    // ------------------------------------------------------------------------
    // Points lists
    // ------------------------------------------------------------------------

    pub fn run_points_lists(&self, params: &RunParams) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        let catalogue = match fetch_catalogue(self.fetcher, self.config) {
            Ok(catalogue) => catalogue,
            Err(e) => {
                summary.record_error("points-list catalogue", e)?;
                return Ok(summary);
            }
        };

        let lists = match self.select_lists(catalogue, params, &mut summary)? {
            Some(lists) => lists,
            None => return Ok(summary),
        };
        info!(lists = lists.len(), "points lists selected");

        let ingestor = PointsListIngestor::new(self.store, self.fetcher, self.cache, self.config);
        for list in &lists {
            if self.cancelled(&mut summary) {
                break;
            }
            match ingestor.ingest(list) {
                Ok(outcome) => summary.record_list(&outcome),
                Err(e) => summary.record_error(&list.name, e)?,
            }
        }

        Ok(summary)
    }

    fn select_lists(
        &self,
        catalogue: Vec<PointsListRef>,
        params: &RunParams,
        summary: &mut RunSummary,
    ) -> Result<Option<Vec<PointsListRef>>> {
        let season = params.season.map(|s| s.to_string());
        let in_season = |list: &PointsListRef| season.as_ref().map_or(true, |s| &list.season == s);

        if let Some(list_id) = &params.points_list_id {
            let found: Vec<PointsListRef> = catalogue
                .into_iter()
                .filter(|l| &l.list_id == list_id && in_season(l))
                .take(1)
                .collect();
            if found.is_empty() {
                summary.failed += 1;
                summary.failures.push((
                    format!("points list {}", list_id),
                    "not found in catalogue".to_string(),
                ));
                return Ok(None);
            }
            return Ok(Some(found));
        }

        let mut lists: Vec<PointsListRef> = catalogue
            .into_iter()
            .filter(|l| in_season(l))
            .filter(|l| params.include_base_lists || !l.is_base_list())
            .collect();

        if params.start_date.is_some() || params.end_date.is_some() {
            lists = filter_by_validity(lists, params.start_date, params.end_date);
        }

        if params.new_lists_only {
            let mut fresh = Vec::with_capacity(lists.len());
            for list in lists {
                if self.store.points_list_exists(&list)? {
                    summary.skipped += 1;
                } else {
                    fresh.push(list);
                }
            }
            lists = fresh;
        }

        // Oldest first so revisions land after the lists they revise
        lists.sort_by(|a, b| {
            (a.valid_from, &a.season, &a.list_id).cmp(&(b.valid_from, &b.season, &b.list_id))
        });
        Ok(Some(lists))
    }

    // ------------------------------------------------------------------------
    // Races
    // ------------------------------------------------------------------------

    pub fn run_races(&self, params: &RunParams) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let scraper = RaceResultScraper::new(self.store, self.fetcher, self.config);

        if let Some(race_id) = &params.race_id {
            summary.discovered = 1;
            if !params.discover_only {
                self.scrape_one(&scraper, race_id, &[], &mut summary)?;
            }
            return Ok(summary);
        }

        let filter = DiscoveryFilter {
            season: params.season.unwrap_or_else(current_season),
            categories: params.categories.clone(),
            start_date: params.start_date,
            end_date: params.end_date,
            discipline: params.discipline,
        };
        let report = RaceDiscovery::new(self.fetcher, self.config).discover(&filter);

        summary.discovered = report.candidates.len();
        summary.per_category = report.per_category;
        // An unreachable listing is a failed item of the run
        for (url, reason) in report.failed_listings {
            summary.failed += 1;
            summary.failures.push((url, reason));
        }

        if params.discover_only {
            for candidate in &report.candidates {
                info!(
                    race_id = %candidate.race_id,
                    category = %candidate.category,
                    url = %self.config.race_results_url(&candidate.race_id),
                    "discovered race"
                );
            }
            return Ok(summary);
        }

        for candidate in &report.candidates {
            if self.cancelled(&mut summary) {
                break;
            }
            self.scrape_one(&scraper, &candidate.race_id, &candidate.categories, &mut summary)?;
        }

        Ok(summary)
    }

    fn scrape_one(
        &self,
        scraper: &RaceResultScraper<'_, S, F>,
        race_id: &str,
        categories: &[String],
        summary: &mut RunSummary,
    ) -> Result<()> {
        match scraper.scrape(race_id, categories) {
            Ok(outcome) => {
                summary.record_scrape(&outcome);
                Ok(())
            }
            Err(e) => summary.record_error(&format!("race {}", race_id), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::SqliteStore;
    use crate::fetch::StaticFetcher;

    const CATALOGUE: &str = r#"<html><body>
<div class="container g-xs-24">
  <span class="link__text">21st FIS points list 2024/25</span>
  <div>17-04-2025</div><div>30-04-2025</div>
  <a onclick="fct_export_fispointslist_xlsx('AL','2025','412')">xlsx</a>
</div>
<div class="container g-xs-24">
  <span class="link__text">22nd FIS points list 2024/25</span>
  <div>01-05-2025</div><div>31-05-2025</div>
  <a onclick="fct_export_fispointslist_xlsx('AL','2025','413')">xlsx</a>
</div>
<div class="container g-xs-24">
  <span class="link__text">Base List 2025</span>
  <a onclick="fct_export_fispointslist_xlsx('AL','2025','')">xlsx</a>
</div>
</body></html>"#;

    const LIST_CSV: &str = "Competitorid,Birthyear,GSpoints,GSpos,GSSta\n1,1997,0.00,1,\n2,1998,5.00,2,*\n";

    fn points_fetcher(config: &Config) -> StaticFetcher {
        StaticFetcher::new()
            .with_page(config.points_lists_url(), CATALOGUE)
            .with_page(config.points_list_export_url("AL", "2025", "412"), LIST_CSV)
            .with_page(
                config.points_list_export_url("AL", "2025", "413"),
                LIST_CSV.replace("5.00,2,*", "4.50,2,C"),
            )
    }

    #[test]
    fn test_points_run_isolates_failures_and_skips_known_lists() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = points_fetcher(&config);
        fetcher.remove(&config.points_list_export_url("AL", "2025", "412"));
        let cache = MemoryCache::new();
        let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

        let summary = orchestrator.run_points_lists(&RunParams::default()).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "21st FIS points list 2024/25");
        assert_eq!(summary.rows.created, 2);

        // Second run: 413 already stored, 412 now reachable
        fetcher.insert(config.points_list_export_url("AL", "2025", "412"), LIST_CSV);
        let summary = orchestrator.run_points_lists(&RunParams::default()).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);

        println!("✅ Points run isolation test PASSED");
    }

    #[test]
    fn test_single_list_and_unknown_list() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = points_fetcher(&config);
        let cache = MemoryCache::new();
        let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

        let params = RunParams {
            points_list_id: Some("413".to_string()),
            ..Default::default()
        };
        let summary = orchestrator.run_points_lists(&params).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(store.count_rows("points_lists").unwrap(), 1);

        // Explicit list id re-ingests even when stored
        let summary = orchestrator.run_points_lists(&params).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.rows.skipped, 2);

        let missing = RunParams {
            points_list_id: Some("999".to_string()),
            ..Default::default()
        };
        let summary = orchestrator.run_points_lists(&missing).unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_catalogue_unreachable_still_reports() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = StaticFetcher::new();
        let cache = MemoryCache::new();
        let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

        let summary = orchestrator.run_points_lists(&RunParams::default()).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].0, "points-list catalogue");
    }

    #[test]
    fn test_cancelled_run_processes_nothing() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = points_fetcher(&config);
        let cache = MemoryCache::new();
        let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

        orchestrator.cancel_handle().store(true, Ordering::SeqCst);
        let summary = orchestrator.run_points_lists(&RunParams::default()).unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.created, 0);
        assert_eq!(store.count_rows("points_lists").unwrap(), 0);
    }

    fn calendar(ids: &[&str]) -> String {
        let rows: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<a class="table-row" href="/DB/general/results.html?sectorcode=AL&amp;raceid={id}"><div class="timezone-date" data-date="2025-01-11"></div></a>"#
                )
            })
            .collect();
        format!("<html><body>{rows}</body></html>")
    }

    fn result_page(kind: &str, rows: &str) -> String {
        format!(
            r#"<html><head><title>Results - Adelboden (SUI)</title></head><body>
<div class="timezone-date" data-date="2025-01-11"></div>
<div class="event-header__kind">{kind}</div>
<div id="events-info-results" class="table__body">{rows}</div>
</body></html>"#
        )
    }

    const WINNER: &str = r#"<a class="table-row" href="/athlete?competitorid=107303"><div class="g-row container"><div class="g-row justify-sb"><div>1</div><div class="justify-left bold">ODERMATT Marco</div><div class="justify-right bold hidden-xs">1:10.00</div><div class="g-lg-2 g-md-2 g-sm-2 g-xs-3 justify-right">0.00</div></div></div></a>"#;

    #[test]
    fn test_race_run_breaks_down_statuses() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = StaticFetcher::new()
            .with_page(config.calendar_url(2025, "WC"), calendar(&["1", "2", "3"]))
            .with_page(config.calendar_url(2025, "EC"), calendar(&["1", "4", "5"]))
            .with_page(config.race_results_url("1"), result_page("Men's Giant Slalom", WINNER))
            .with_page(config.race_results_url("2"), result_page("Women's Slalom", ""))
            .with_page(config.race_results_url("3"), result_page("Mixed Team Parallel", ""))
            .with_page(config.race_results_url("5"), "<html>down for maintenance</html>");
        let cache = MemoryCache::new();
        let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

        let params = RunParams {
            season: Some(2025),
            categories: vec!["WC".to_string(), "EC".to_string()],
            ..Default::default()
        };
        let summary = orchestrator.run_races(&params).unwrap();

        assert_eq!(summary.discovered, 5);
        assert_eq!(summary.per_category["WC"], 3);
        assert_eq!(summary.per_category["EC"], 3);
        assert_eq!(summary.statuses[&ScrapeStatus::Completed], 1);
        assert_eq!(summary.statuses[&ScrapeStatus::NoResults], 1);
        assert_eq!(summary.statuses[&ScrapeStatus::UnsupportedFormat], 1);
        assert_eq!(summary.statuses[&ScrapeStatus::FetchFailed], 1);
        // Race 5 has no event header
        assert_eq!(summary.failed, 2);
        assert_eq!(store.count_rows("races").unwrap(), 2);

        let race = store.get_race_by_external_id("1").unwrap().unwrap();
        assert_eq!(race.category.as_deref(), Some("WC"));
        assert_eq!(
            store.get_race_categories(&race.key).unwrap(),
            vec!["EC".to_string(), "WC".to_string()]
        );

        // Second run converges: nothing new
        let again = orchestrator.run_races(&params).unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.updated, 0);
        assert_eq!(store.count_rows("race_results").unwrap(), 1);

        println!("✅ Race run summary test PASSED");
    }

    #[test]
    fn test_discover_only_writes_nothing() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = StaticFetcher::new()
            .with_page(config.calendar_url(2025, "WC"), calendar(&["1", "2"]));
        let cache = MemoryCache::new();
        let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

        let params = RunParams {
            season: Some(2025),
            categories: vec!["WC".to_string(), "EC".to_string()],
            discover_only: true,
            ..Default::default()
        };
        let summary = orchestrator.run_races(&params).unwrap();

        assert_eq!(summary.discovered, 2);
        // EC listing unreachable
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, config.calendar_url(2025, "EC"));
        assert!(summary.statuses.is_empty());
        assert_eq!(store.count_rows("races").unwrap(), 0);
        assert_eq!(fetcher.hits(&config.race_results_url("1")), 0);
    }

    #[test]
    fn test_single_race_by_id() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = StaticFetcher::new()
            .with_page(config.race_results_url("1"), result_page("Men's Giant Slalom", WINNER));
        let cache = MemoryCache::new();
        let orchestrator = Orchestrator::new(&store, &fetcher, &cache, &config);

        let params = RunParams {
            race_id: Some("1".to_string()),
            ..Default::default()
        };
        let summary = orchestrator.run_races(&params).unwrap();

        assert_eq!(summary.created, 1);
        assert_eq!(summary.statuses[&ScrapeStatus::Completed], 1);
        assert_eq!(store.count_rows("race_results").unwrap(), 1);
    }
}
