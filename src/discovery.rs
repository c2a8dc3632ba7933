// 🔭 Race Discovery
//
// Enumerates race ids from one calendar listing per requested category and
// merges them by race id. Discovery never touches result rows and does not
// judge supportability; unsupported shapes are classified by the scraper.

use crate::config::Config;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::html::{first_text, selector};
use crate::models::Discipline;
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Category codes published in the calendar, in default crawl order
pub const CATEGORIES: [&str; 16] = [
    "WC", "EC", "FIS", "NC", "NJC", "UNI", "CIT", "ENL", "ANC", "FEC", "NAC", "SAC", "JUN", "YOG",
    "WSC", "OWG",
];

/// Category code for a category name as printed on result pages, e.g.
/// "World Cup" → WC. Codes pass through unchanged.
pub fn category_code(label: &str) -> Option<&'static str> {
    let lower = label.trim().to_lowercase();
    if let Some(code) = CATEGORIES.iter().copied().find(|c| c.eq_ignore_ascii_case(&lower)) {
        return Some(code);
    }

    const NAMES: [(&str, &str); 15] = [
        ("youth olympic", "YOG"),
        ("olympic winter games", "OWG"),
        ("world ski championships", "WSC"),
        ("world championships", "WSC"),
        ("world cup", "WC"),
        ("european cup", "EC"),
        ("nor-am", "NAC"),
        ("south american cup", "SAC"),
        ("far east cup", "FEC"),
        ("australia new zealand", "ANC"),
        ("entry league", "ENL"),
        ("national junior", "NJC"),
        ("national championships", "NC"),
        ("universiade", "UNI"),
        ("citizen", "CIT"),
    ];
    NAMES
        .iter()
        .find(|(name, _)| lower.contains(name))
        .map(|(_, code)| *code)
        .or_else(|| lower.contains("junior").then_some("JUN"))
}

static RACE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"raceid=(\d+)").expect("valid regex"));
static EVENT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"eventid=(\d+)").expect("valid regex"));

/// Season containing `date`; a new season starts on 1 July
pub fn season_for(date: NaiveDate) -> u16 {
    let year = u16::try_from(date.year()).unwrap_or(0);
    if date.month() >= 7 {
        year + 1
    } else {
        year
    }
}

// ============================================================================
// LISTING PARSE
// ============================================================================

/// One race row as printed in a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRace {
    pub race_id: String,
    pub date: Option<NaiveDate>,
    pub discipline_hint: Option<String>,
}

/// A calendar or event page: race rows plus links to event pages that list
/// their races separately.
#[derive(Debug, Default)]
pub struct Listing {
    pub races: Vec<ListedRace>,
    pub event_urls: Vec<String>,
}

pub fn parse_listing(html: &str, base_url: &str) -> Listing {
    let document = Html::parse_document(html);
    let links = selector("a[href]");
    let date = selector("div.timezone-date[data-date]");
    let discipline = selector("div.race-discipline, div.discipline");

    let mut listing = Listing::default();
    for link in document.select(&links) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };

        if let Some(caps) = RACE_ID.captures(href) {
            let race_id = caps[1].to_string();
            if listing.races.iter().any(|r| r.race_id == race_id) {
                continue;
            }
            listing.races.push(ListedRace {
                race_id,
                date: link
                    .select(&date)
                    .next()
                    .and_then(|d| d.value().attr("data-date"))
                    .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok()),
                discipline_hint: first_text(link, &discipline),
            });
        } else if EVENT_ID.is_match(href) {
            let url = absolute_url(base_url, href);
            if !listing.event_urls.contains(&url) {
                listing.event_urls.push(url);
            }
        }
    }

    listing
}

fn absolute_url(base_url: &str, href: &str) -> String {
    let href = href.replace("&amp;", "&");
    if href.starts_with("http://") || href.starts_with("https://") {
        href
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

// ============================================================================
// MERGE
// ============================================================================

/// A race found by discovery, merged across categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceCandidate {
    pub race_id: String,
    /// First category, in requested order, that listed the race
    pub category: String,
    /// Every category that listed the race
    pub categories: Vec<String>,
    pub date: Option<NaiveDate>,
    pub discipline_hint: Option<String>,
}

impl RaceCandidate {
    pub fn discipline(&self) -> Option<Discipline> {
        self.discipline_hint.as_deref().and_then(Discipline::parse)
    }
}

/// Merge per-category listings by race id.
///
/// `listings` must be in requested category order: that order decides the
/// canonical category. Candidate order is first-seen order.
pub fn merge_candidates(listings: Vec<(String, Vec<ListedRace>)>) -> Vec<RaceCandidate> {
    let mut merged: Vec<RaceCandidate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (category, races) in listings {
        for race in races {
            match index.get(&race.race_id) {
                Some(&i) => {
                    let candidate = &mut merged[i];
                    if !candidate.categories.contains(&category) {
                        candidate.categories.push(category.clone());
                    }
                    candidate.date = candidate.date.or(race.date);
                    if candidate.discipline_hint.is_none() {
                        candidate.discipline_hint = race.discipline_hint;
                    }
                }
                None => {
                    index.insert(race.race_id.clone(), merged.len());
                    merged.push(RaceCandidate {
                        race_id: race.race_id,
                        category: category.clone(),
                        categories: vec![category.clone()],
                        date: race.date,
                        discipline_hint: race.discipline_hint,
                    });
                }
            }
        }
    }

    merged
}

// ============================================================================
// DISCOVERY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub season: u16,
    /// Requested categories in priority order; empty means all of `CATEGORIES`
    pub categories: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub discipline: Option<Discipline>,
}

impl DiscoveryFilter {
    fn requested_categories(&self) -> Vec<String> {
        let mut seen = Vec::new();
        let source: Vec<String> = if self.categories.is_empty() {
            CATEGORIES.iter().map(|c| c.to_string()).collect()
        } else {
            self.categories.iter().map(|c| c.trim().to_uppercase()).collect()
        };
        for category in source {
            if !category.is_empty() && !seen.contains(&category) {
                seen.push(category);
            }
        }
        seen
    }

    /// Candidates with an unknown date or discipline are kept.
    fn accepts(&self, candidate: &RaceCandidate) -> bool {
        if let Some(date) = candidate.date {
            if self.start_date.is_some_and(|start| date < start) {
                return false;
            }
            if self.end_date.is_some_and(|end| date > end) {
                return false;
            }
        }
        match (self.discipline, candidate.discipline()) {
            (Some(wanted), Some(found)) => wanted == found,
            _ => true,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DiscoveryReport {
    pub candidates: Vec<RaceCandidate>,
    /// Races attributed to each requested category after filtering
    pub per_category: BTreeMap<String, usize>,
    /// Listing pages that could not be fetched: (url, reason)
    pub failed_listings: Vec<(String, String)>,
}

pub struct RaceDiscovery<'a, F: Fetcher> {
    fetcher: &'a F,
    config: &'a Config,
}

impl<'a, F: Fetcher> RaceDiscovery<'a, F> {
    pub fn new(fetcher: &'a F, config: &'a Config) -> Self {
        Self { fetcher, config }
    }

    /// Enumerate candidates. Unreachable listings are recorded, never fatal.
    pub fn discover(&self, filter: &DiscoveryFilter) -> DiscoveryReport {
        let categories = filter.requested_categories();
        let mut report = DiscoveryReport::default();
        let mut listings = Vec::with_capacity(categories.len());

        for category in &categories {
            let url = self.config.calendar_url(filter.season, category);
            let races = match self.category_races(&url, &mut report) {
                Ok(races) => races,
                Err(e) => {
                    warn!(category = %category, error = %e, "calendar listing unavailable");
                    report.failed_listings.push((url, e.to_string()));
                    Vec::new()
                }
            };
            debug!(category = %category, races = races.len(), "calendar listing parsed");
            listings.push((category.clone(), races));
        }

        report.candidates = merge_candidates(listings)
            .into_iter()
            .filter(|c| filter.accepts(c))
            .collect();

        for category in &categories {
            let count = report
                .candidates
                .iter()
                .filter(|c| c.categories.contains(category))
                .count();
            report.per_category.insert(category.clone(), count);
        }

        info!(
            season = filter.season,
            candidates = report.candidates.len(),
            "discovery finished"
        );
        report
    }

    fn category_races(&self, url: &str, report: &mut DiscoveryReport) -> Result<Vec<ListedRace>> {
        let body = self.fetcher.fetch(url)?;
        let listing = parse_listing(&String::from_utf8_lossy(&body), &self.config.base_url);
        let mut races = listing.races;

        for event_url in listing.event_urls {
            match self.fetcher.fetch(&event_url) {
                Ok(body) => {
                    let event =
                        parse_listing(&String::from_utf8_lossy(&body), &self.config.base_url);
                    for race in event.races {
                        if !races.iter().any(|r| r.race_id == race.race_id) {
                            races.push(race);
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %event_url, error = %e, "event page unavailable");
                    report.failed_listings.push((event_url, e.to_string()));
                }
            }
        }

        Ok(races)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StaticFetcher;

    fn listing_page(rows: &[(&str, &str, &str)]) -> String {
        let rows: String = rows
            .iter()
            .map(|(id, date, discipline)| {
                format!(
                    r#"<a class="table-row" href="https://www.fis-ski.com/DB/general/results.html?sectorcode=AL&amp;raceid={id}">
                         <div class="timezone-date" data-date="{date}">{date}</div>
                         <div class="race-discipline">{discipline}</div>
                       </a>"#
                )
            })
            .collect();
        format!("<html><body><div class=\"tbody\">{rows}</div></body></html>")
    }

    #[test]
    fn test_category_code_from_page_names() {
        assert_eq!(category_code("World Cup"), Some("WC"));
        assert_eq!(category_code("Nor-Am Cup"), Some("NAC"));
        assert_eq!(category_code("National Junior Championships"), Some("NJC"));
        assert_eq!(category_code("World Junior Championships"), Some("JUN"));
        assert_eq!(category_code("fis"), Some("FIS"));
        assert_eq!(category_code("Training"), None);
    }

    #[test]
    fn test_season_boundary() {
        assert_eq!(season_for(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()), 2024);
        assert_eq!(season_for(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()), 2025);
    }

    #[test]
    fn test_parse_listing_rows() {
        let html = listing_page(&[
            ("122805", "2025-01-11", "Giant Slalom"),
            ("122806", "2025-01-12", "Slalom"),
        ]);
        let listing = parse_listing(&html, "https://www.fis-ski.com");

        assert_eq!(listing.races.len(), 2);
        assert_eq!(listing.races[0].race_id, "122805");
        assert_eq!(listing.races[0].date, NaiveDate::from_ymd_opt(2025, 1, 11));
        assert_eq!(listing.races[0].discipline_hint.as_deref(), Some("Giant Slalom"));
        assert!(listing.event_urls.is_empty());
    }

    #[test]
    fn test_merge_keeps_all_categories_and_first_as_canonical() {
        let shared = ListedRace {
            race_id: "1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 1, 11),
            discipline_hint: Some("Slalom".to_string()),
        };
        let only_nc = ListedRace {
            race_id: "2".to_string(),
            date: None,
            discipline_hint: None,
        };

        let merged = merge_candidates(vec![
            ("EC".to_string(), vec![shared.clone()]),
            ("NC".to_string(), vec![only_nc, shared]),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].race_id, "1");
        assert_eq!(merged[0].category, "EC");
        assert_eq!(merged[0].categories, vec!["EC".to_string(), "NC".to_string()]);
        assert_eq!(merged[1].category, "NC");
    }

    #[test]
    fn test_discover_attributes_shared_race_to_every_category() {
        let config = Config::default();
        let fetcher = StaticFetcher::new()
            .with_page(
                config.calendar_url(2025, "EC"),
                listing_page(&[
                    ("1", "2025-01-11", "Slalom"),
                    ("2", "2025-01-12", "Team Parallel"),
                ]),
            )
            .with_page(
                config.calendar_url(2025, "NC"),
                listing_page(&[("1", "2025-01-11", "Slalom"), ("3", "2025-02-01", "Downhill")]),
            );
        let discovery = RaceDiscovery::new(&fetcher, &config);

        let report = discovery.discover(&DiscoveryFilter {
            season: 2025,
            categories: vec!["EC".to_string(), "NC".to_string()],
            ..Default::default()
        });

        let ids: Vec<&str> = report.candidates.iter().map(|c| c.race_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(report.candidates[0].category, "EC");
        assert_eq!(report.per_category["EC"], 2);
        assert_eq!(report.per_category["NC"], 2);
        assert!(report.failed_listings.is_empty());

        // Requested order decides the canonical category
        let reversed = discovery.discover(&DiscoveryFilter {
            season: 2025,
            categories: vec!["NC".to_string(), "EC".to_string()],
            ..Default::default()
        });
        assert_eq!(reversed.candidates[0].category, "NC");

        println!("✅ Discovery dedup test PASSED");
    }

    #[test]
    fn test_filters_and_unreachable_listing() {
        let config = Config::default();
        let fetcher = StaticFetcher::new().with_page(
            config.calendar_url(2025, "FIS"),
            listing_page(&[
                ("1", "2024-12-01", "Slalom"),
                ("2", "2025-01-12", "Slalom"),
                ("3", "2025-01-13", "Giant Slalom"),
                ("4", "2025-01-14", "Team Parallel"),
            ]),
        );
        let discovery = RaceDiscovery::new(&fetcher, &config);

        let report = discovery.discover(&DiscoveryFilter {
            season: 2025,
            categories: vec!["fis".to_string(), "WC".to_string()],
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1),
            end_date: None,
            discipline: Some(Discipline::Slalom),
        });

        // Unknown discipline hints are not filtered out at discovery
        let ids: Vec<&str> = report.candidates.iter().map(|c| c.race_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "4"]);
        assert_eq!(report.per_category["WC"], 0);
        assert_eq!(report.failed_listings.len(), 1);
    }

    #[test]
    fn test_event_pages_are_followed() {
        let config = Config::default();
        let calendar = r#"<html><body>
            <a class="bold" href="https://www.fis-ski.com/DB/general/event-details.html?sectorcode=AL&amp;eventid=5001">Adelboden</a>
        </body></html>"#;
        let event_url =
            "https://www.fis-ski.com/DB/general/event-details.html?sectorcode=AL&eventid=5001";
        let fetcher = StaticFetcher::new()
            .with_page(config.calendar_url(2025, "WC"), calendar)
            .with_page(event_url, listing_page(&[("122805", "2025-01-11", "Giant Slalom")]));
        let discovery = RaceDiscovery::new(&fetcher, &config);

        let report = discovery.discover(&DiscoveryFilter {
            season: 2025,
            categories: vec!["WC".to_string()],
            ..Default::default()
        });

        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].race_id, "122805");
        assert_eq!(report.candidates[0].discipline(), Some(Discipline::GiantSlalom));
    }
}
