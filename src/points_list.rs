// 📋 Points List Ingestor
//
// Catalogue parsing plus fetch-or-cache, parse, identity resolution and
// idempotent persistence for one published points list.

use crate::cache::FileCache;
use crate::config::Config;
use crate::db::{Event, Store};
use crate::error::{IngestError, Result};
use crate::fetch::Fetcher;
use crate::html::{normalize_space, selector, text_of};
use crate::identity::{IdentityResolver, POINTS_LIST};
use crate::models::{AthletePointsRecord, PointsListRef, UpsertOutcome};
use crate::parser::parse_points_list;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ============================================================================
// CATALOGUE
// ============================================================================

static EXPORT_PARAMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"fct_export_fispointslist_\w+\('(\w+)','(\d{4})','(\d*)'\)").expect("valid regex")
});
static LIST_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+\w*\s+FIS points list\s+\d{4}.\d{2})").expect("valid regex"));
static BASE_LIST_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(Internal Base list|Base List)\s+(\d{4})").expect("valid regex"));
static DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{2}-\d{2}-\d{4}").expect("valid regex"));

/// Parse the published catalogue page into list references.
///
/// Base lists are returned too; they carry no validity window. Rows without an
/// export link are ignored.
pub fn parse_points_list_index(html: &str) -> Vec<PointsListRef> {
    let document = Html::parse_document(html);
    let row_selector = selector("div.container.g-xs-24");
    let export_link = selector("a[onclick*='fct_export_fispointslist']");
    let mut lists = Vec::new();

    for row in document.select(&row_selector) {
        let Some(params) = row
            .select(&export_link)
            .filter_map(|a| a.value().attr("onclick"))
            .find_map(|onclick| EXPORT_PARAMS.captures(onclick))
        else {
            continue;
        };

        let text = text_of(row);

        let (name, valid_from, valid_to) = if let Some(m) = LIST_NAME.find(&text) {
            let mut dates = DATE
                .find_iter(&text[m.end()..])
                .filter_map(|d| NaiveDate::parse_from_str(d.as_str(), "%d-%m-%Y").ok());
            (normalize_space(m.as_str()), dates.next(), dates.next())
        } else if let Some(c) = BASE_LIST_NAME.captures(&text) {
            (format!("{} {}", &c[1], &c[2]), None, None)
        } else {
            debug!("catalogue row without a recognizable title");
            continue;
        };

        lists.push(PointsListRef {
            sector: params[1].to_string(),
            season: params[2].to_string(),
            list_id: params[3].to_string(),
            name,
            valid_from,
            valid_to,
        });
    }

    lists
}

/// Keep lists valid on any day of `[start, end]`; base lists never match.
pub fn filter_by_validity(
    lists: Vec<PointsListRef>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<PointsListRef> {
    lists
        .into_iter()
        .filter(|list| list.overlaps(start, end))
        .collect()
}

/// Fetch and parse the catalogue page
pub fn fetch_catalogue<F: Fetcher>(fetcher: &F, config: &Config) -> Result<Vec<PointsListRef>> {
    let url = config.points_lists_url();
    let body = fetcher.fetch(&url)?;
    let html = String::from_utf8_lossy(&body);
    let lists = parse_points_list_index(&html);
    info!(count = lists.len(), "points-list catalogue loaded");
    Ok(lists)
}

// ============================================================================
// INGESTOR
// ============================================================================

/// Per-list row counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub created: usize,
    pub updated: usize,
    /// Rows identical to what is already stored
    pub skipped: usize,
    /// Malformed rows
    pub failed: usize,
}

impl IngestOutcome {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.skipped += 1,
        }
    }
}

pub struct PointsListIngestor<'a, S: Store, F: Fetcher, C: FileCache> {
    store: &'a S,
    fetcher: &'a F,
    cache: &'a C,
    config: &'a Config,
}

impl<'a, S: Store, F: Fetcher, C: FileCache> PointsListIngestor<'a, S, F, C> {
    pub fn new(store: &'a S, fetcher: &'a F, cache: &'a C, config: &'a Config) -> Self {
        Self {
            store,
            fetcher,
            cache,
            config,
        }
    }

    /// Ingest one list. All rows are committed together or not at all.
    pub fn ingest(&self, list: &PointsListRef) -> Result<IngestOutcome> {
        let bytes = self.load(list)?;
        let rows = parse_points_list(&bytes)?;

        let outcome = self.store.atomic(|store| {
            let resolver = IdentityResolver::new(store);
            let (list_key, _) = resolver.resolve(POINTS_LIST, &list.external_id())?;
            store.upsert_points_list(&list_key, list)?;

            let mut outcome = IngestOutcome::default();
            for row in rows {
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        warn!(list_id = %list.external_id(), error = %e, "skipping malformed row");
                        outcome.failed += 1;
                        continue;
                    }
                };

                let (athlete_key, _) = resolver.resolve_athlete(&row.athlete)?;
                let record = AthletePointsRecord {
                    athlete_key,
                    list_key: list_key.clone(),
                    calculation_date: row.calculation_date,
                    ski_club: row.athlete.ski_club.clone(),
                    scores: row.scores,
                };
                outcome.record(store.upsert_athlete_points(&record)?);
            }

            store.insert_event(&Event::new(
                "points_list_ingested",
                "points_list",
                &list.external_id(),
                serde_json::to_value(outcome).unwrap_or_default(),
                "points_list_ingestor",
            ))?;
            Ok(outcome)
        })?;

        info!(
            list_id = %list.external_id(),
            name = %list.name,
            created = outcome.created,
            updated = outcome.updated,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "points list ingested"
        );
        Ok(outcome)
    }

    /// Return list content that at least has a readable header.
    ///
    /// A cached artifact that cannot be read or parsed is deleted and fetched
    /// again exactly once.
    fn load(&self, list: &PointsListRef) -> Result<Vec<u8>> {
        let key = list.cache_key();

        if !self.cache.exists(&key) {
            let bytes = self.fetch_and_cache(list, &key)?;
            let invalid = parse_points_list(&bytes).err();
            return match invalid {
                None => Ok(bytes),
                Some(e) => {
                    self.cache.delete(&key)?;
                    Err(e.into())
                }
            };
        }

        let cached = self.cache.read(&key);
        let reason = match cached {
            Ok(bytes) => match parse_points_list(&bytes).err() {
                None => {
                    debug!(key = %key, "using cached points list");
                    return Ok(bytes);
                }
                Some(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        warn!(key = %key, reason = %reason, "cached points list corrupted; re-fetching");
        self.cache.delete(&key)?;

        let bytes = self.fetch_and_cache(list, &key)?;
        if let Some(e) = parse_points_list(&bytes).err() {
            self.cache.delete(&key)?;
            return Err(IngestError::CacheCorrupted {
                key,
                reason: e.to_string(),
            });
        }
        Ok(bytes)
    }

    fn fetch_and_cache(&self, list: &PointsListRef, key: &str) -> Result<Vec<u8>> {
        let url = self
            .config
            .points_list_export_url(&list.sector, &list.season, &list.list_id);
        let bytes = self.fetcher.fetch(&url)?;
        self.cache.write(key, &bytes)?;
        debug!(key, bytes = bytes.len(), "points list fetched");
        Ok(bytes)
    }
}
