// 🏁 Race Result Scraper
//
// One race at a time: fetch the result page, classify its format, extract
// finisher and non-finisher rows, then upsert the race and its results in a
// single transaction. Re-scraping converges to the page content.

use crate::config::Config;
use crate::db::{Event, Store};
use crate::discovery::category_code;
use crate::error::{IngestError, ParseError, Result};
use crate::fetch::Fetcher;
use crate::html::{first_text, normalize_space, selector, text_of};
use crate::identity::{IdentityResolver, RACE};
use crate::models::{
    AthleteAttrs, CourseDetails, Discipline, Gender, Race, RaceResult, UpsertOutcome,
};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

static COMPETITOR_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"competitorid=(\d+)").expect("valid regex"));
static CODEX_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"competitionCodex"?\s*:\s*"?(\d+)"#).expect("valid regex"));
static CODEX_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"CODEX:\s*(\d+)").expect("valid regex"));
static KIND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(Men's|Women's|Ladies')\s+(.+)$").expect("valid regex"));
static LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?)\s*\(([A-Z]{3})\)").expect("valid regex"));
static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").expect("valid regex"));

/// Event shapes this pipeline does not ingest
const UNSUPPORTED_KINDS: [&str; 4] = ["team", "parallel", "city event", "relay"];

/// Exact class list of the published-points cell in finisher rows
const POINTS_CELL_CLASS: &str = "g-lg-2 g-md-2 g-sm-2 g-xs-3 justify-right";

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScrapeStatus {
    Completed,
    NoResults,
    UnsupportedFormat,
    FetchFailed,
}

impl ScrapeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ScrapeStatus::Completed => "Completed",
            ScrapeStatus::NoResults => "NoResults",
            ScrapeStatus::UnsupportedFormat => "UnsupportedFormat",
            ScrapeStatus::FetchFailed => "FetchFailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub race_id: String,
    pub status: ScrapeStatus,
    pub discipline: Option<Discipline>,
    /// Result rows stored for the race after this scrape
    pub persisted_results: usize,
    /// Malformed rows left out
    pub skipped_rows: usize,
    pub race: Option<UpsertOutcome>,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Stale rows removed because the athlete is no longer on the page
    pub pruned: usize,
    /// Why the page was not ingested (unsupported shape, fetch failure)
    pub detail: Option<String>,
}

impl ScrapeOutcome {
    fn new(race_id: &str, status: ScrapeStatus) -> Self {
        Self {
            race_id: race_id.to_string(),
            status,
            discipline: None,
            persisted_results: 0,
            skipped_rows: 0,
            race: None,
            created: 0,
            updated: 0,
            unchanged: 0,
            pruned: 0,
            detail: None,
        }
    }

    /// True when this scrape changed stored state
    pub fn changed(&self) -> bool {
        matches!(self.race, Some(UpsertOutcome::Created | UpsertOutcome::Updated))
            || self.created > 0
            || self.updated > 0
            || self.pruned > 0
    }
}

// ============================================================================
// PAGE PARSE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaceHeader {
    pub name: Option<String>,
    pub codex: Option<String>,
    pub date: Option<NaiveDate>,
    /// Event kind as printed, e.g. "Men's Giant Slalom"
    pub kind: Option<String>,
    pub gender: Option<Gender>,
    pub discipline_label: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub nation: Option<String>,
    pub course: CourseDetails,
}

impl RaceHeader {
    pub fn discipline(&self) -> Option<Discipline> {
        self.discipline_label.as_deref().and_then(Discipline::parse)
    }

    /// Reason the event shape is out of scope, if it is
    pub fn unsupported_reason(&self) -> Option<String> {
        let kind = self.kind.as_deref().unwrap_or_default();
        let lower = kind.to_lowercase();
        if UNSUPPORTED_KINDS.iter().any(|k| lower.contains(k)) {
            return Some(format!("unsupported event kind: {}", kind));
        }
        if self.discipline().is_none() {
            return Some(format!("unrecognized discipline: {}", kind));
        }
        None
    }
}

/// One result row as printed
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub competitor_id: String,
    pub name: String,
    pub nation: Option<String>,
    pub rank: Option<u32>,
    /// DNF1, DSQ2, ... for non-finishers
    pub status: Option<String>,
    pub run1_time: Option<f64>,
    pub run2_time: Option<f64>,
    pub racer_time: Option<f64>,
    pub points: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RacePage {
    pub header: RaceHeader,
    pub finishers: Vec<ResultRow>,
    pub non_finishers: Vec<ResultRow>,
    pub skipped_rows: usize,
}

impl RacePage {
    pub fn is_empty(&self) -> bool {
        self.finishers.is_empty() && self.non_finishers.is_empty()
    }

    /// (winning time, race penalty) taken from the winner's row
    pub fn winner(&self) -> (Option<f64>, Option<f64>) {
        self.finishers
            .first()
            .map(|w| (w.racer_time, w.points))
            .unwrap_or((None, None))
    }

    /// Every listed athlete except those who did not start the first run
    pub fn total_starters(&self) -> u32 {
        let dns = self
            .non_finishers
            .iter()
            .filter(|r| r.status.as_deref() == Some("DNS1"))
            .count();
        (self.finishers.len() + self.non_finishers.len() - dns) as u32
    }
}

/// Parse a result page. Rows are read only from a well-formed header.
pub fn parse_race_page(html: &str) -> std::result::Result<RacePage, ParseError> {
    let document = Html::parse_document(html);
    let header = parse_header(&document, html);

    if header.kind.is_none() {
        return Err(ParseError::document("result page has no event header"));
    }

    let mut page = RacePage {
        header,
        ..Default::default()
    };

    let bodies = selector("div.table__body");
    let rows = selector("a.table-row");

    for body in document.select(&bodies) {
        let is_finishers = body.value().id() == Some("events-info-results");
        let status = if is_finishers {
            None
        } else {
            let heading = body
                .prev_siblings()
                .find_map(ElementRef::wrap)
                .map(text_of)
                .unwrap_or_default();
            match result_status(&heading) {
                Some(status) => Some(status),
                None => {
                    debug!(heading = %heading, "ignoring table without a result status");
                    continue;
                }
            }
        };

        for row in body.select(&rows) {
            match parse_result_row(row, status.clone()) {
                Some(parsed) if is_finishers => page.finishers.push(parsed),
                Some(parsed) => page.non_finishers.push(parsed),
                None => page.skipped_rows += 1,
            }
        }
    }

    Ok(page)
}

fn parse_header(document: &Html, raw: &str) -> RaceHeader {
    let root = document.root_element();
    let mut header = RaceHeader {
        name: first_text(root, &selector("title")).and_then(|t| {
            t.split_once("Results -")
                .map(|(_, name)| name.trim().to_string())
                .filter(|n| !n.is_empty())
        }),
        codex: CODEX_SCRIPT
            .captures(raw)
            .or_else(|| CODEX_TEXT.captures(raw))
            .map(|c| c[1].to_string()),
        date: document
            .select(&selector("div.timezone-date[data-date]"))
            .next()
            .and_then(|d| d.value().attr("data-date"))
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok()),
        kind: first_text(root, &selector("div.event-header__kind")),
        category: first_text(root, &selector("div.event-header__subtitle")),
        course: parse_course_details(document),
        ..Default::default()
    };

    if let Some(kind) = header.kind.as_deref() {
        match KIND.captures(kind) {
            Some(c) => {
                header.gender = Gender::from_label(&c[1]);
                header.discipline_label = Some(c[2].trim().to_string());
            }
            None => header.discipline_label = Some(kind.to_string()),
        }
    }

    if let Some(heading) = first_text(root, &selector("h1.heading")) {
        match LOCATION.captures(&heading) {
            Some(c) => {
                header.location = Some(c[1].trim().to_string());
                header.nation = Some(c[2].to_string());
            }
            None => header.location = Some(heading),
        }
    }

    header
}

/// Course details from the "More information" sections: altitudes, length and
/// homologation from "Technical data", gate counts from the run sections
/// ("1st Run", "2nd Run", or "Course" for single-run events).
fn parse_course_details(document: &Html) -> CourseDetails {
    let sections = selector("section.section_more-info");
    let heading = selector("h3.heading_l3");
    let rows = selector(".table-row");
    let label = selector("div.justify-left.bold");
    let value = selector("div.justify-right");
    let run_value = selector("div.justify-left:not(.bold)");

    let mut course = CourseDetails::default();
    for section in document.select(&sections) {
        let Some(title) = first_text(section, &heading) else {
            continue;
        };

        if title == "Technical data" {
            for row in section.select(&rows) {
                let (Some(label), Some(value)) = (first_text(row, &label), first_text(row, &value))
                else {
                    continue;
                };
                let number = || {
                    FIRST_NUMBER
                        .captures(&value)
                        .and_then(|c| c[1].parse::<i32>().ok())
                };
                match label.as_str() {
                    "Start Altitude" => course.start_altitude = number(),
                    "Finish Altitude" => course.finish_altitude = number(),
                    "Length" => course.length = number(),
                    "Homologation Number" => course.homologation = Some(value.clone()),
                    _ => {}
                }
            }
            continue;
        }

        let second_run = title.contains("2nd Run");
        if !second_run && !title.contains("1st Run") && !title.contains("Course") {
            continue;
        }

        for row in section.select(&rows) {
            let (Some(label), Some(value)) = (first_text(row, &label), first_text(row, &run_value))
            else {
                continue;
            };
            let Ok(count) = value.parse::<i32>() else {
                continue;
            };
            let slot = match (label.as_str(), second_run) {
                ("Number of Gates", false) => &mut course.gates1,
                ("Turning Gates", false) => &mut course.turning_gates1,
                ("Number of Gates", true) => &mut course.gates2,
                ("Turning Gates", true) => &mut course.turning_gates2,
                _ => continue,
            };
            // First section wins when a page repeats the run table
            if slot.is_none() {
                *slot = Some(count);
            }
        }
    }
    course
}

/// Map a non-finisher table heading to a status code, e.g. "Did not finish 1st run" → DNF1
pub fn result_status(heading: &str) -> Option<String> {
    let text = heading.to_lowercase();
    let run = if text.contains("2nd run") {
        "2"
    } else if text.contains("1st run") {
        "1"
    } else {
        ""
    };

    let code = if text.contains("disqualified") {
        "DSQ"
    } else if text.contains("did not finish") {
        "DNF"
    } else if text.contains("did not start") {
        "DNS"
    } else if text.contains("did not qualify") {
        "DNQ"
    } else if text.contains("not permitted to start") {
        "NPS"
    } else {
        return None;
    };

    Some(format!("{code}{run}"))
}

/// `None` when the row cannot be attributed: no competitor id, or a finisher without a rank.
fn parse_result_row(row: ElementRef<'_>, status: Option<String>) -> Option<ResultRow> {
    let href = row.value().attr("href").unwrap_or_default();
    let competitor_id = COMPETITOR_ID.captures(href)?[1].to_string();

    let rank = row
        .select(&selector("div.g-row.justify-sb > div"))
        .next()
        .map(text_of)
        .and_then(|t| t.parse::<u32>().ok());
    if status.is_none() && rank.is_none() {
        return None;
    }

    let times: Vec<Option<f64>> = row
        .select(&selector("div.justify-right.bold.hidden-xs"))
        .map(|d| parse_time(&text_of(d)))
        .collect();

    let points = if status.is_none() {
        row.select(&selector("div"))
            .find(|d| {
                d.value()
                    .attr("class")
                    .map(normalize_space)
                    .is_some_and(|c| c == POINTS_CELL_CLASS)
            })
            .and_then(|d| text_of(d).parse::<f64>().ok())
    } else {
        None
    };

    Some(ResultRow {
        competitor_id,
        name: first_text(row, &selector("div.justify-left.bold")).unwrap_or_default(),
        nation: first_text(row, &selector("span.country__name-short")),
        rank: if status.is_none() { rank } else { None },
        status,
        run1_time: times.first().copied().flatten(),
        run2_time: if times.len() > 1 { times[1] } else { None },
        racer_time: times.last().copied().flatten(),
        points,
    })
}

/// `1:23.45` or `58.12`; `-` and empty are absent
pub fn parse_time(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return None;
    }
    match raw.split_once(':') {
        Some((minutes, seconds)) => {
            let minutes: f64 = minutes.trim().parse().ok()?;
            let seconds: f64 = seconds.trim().parse().ok()?;
            Some(minutes * 60.0 + seconds)
        }
        None => raw.parse().ok(),
    }
}

/// Points for a finishing time: F * (time / winning time - 1), two decimals
pub fn race_points(discipline: Discipline, time: f64, win_time: f64) -> Option<f64> {
    if win_time <= 0.0 || time <= 0.0 {
        return None;
    }
    let points = discipline.f_value() * (time / win_time - 1.0);
    Some((points * 100.0).round() / 100.0)
}

// ============================================================================
// SCRAPER
// ============================================================================

pub struct RaceResultScraper<'a, S: Store, F: Fetcher> {
    store: &'a S,
    fetcher: &'a F,
    config: &'a Config,
}

impl<'a, S: Store, F: Fetcher> RaceResultScraper<'a, S, F> {
    pub fn new(store: &'a S, fetcher: &'a F, config: &'a Config) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    /// Scrape one race.
    ///
    /// `categories` are the listings the race was discovered under, canonical
    /// first; empty when scraping a single race by id.
    pub fn scrape(&self, race_id: &str, categories: &[String]) -> Result<ScrapeOutcome> {
        let url = self.config.race_results_url(race_id);
        let body = match self.fetcher.fetch(&url) {
            Ok(body) => body,
            Err(e @ IngestError::FetchFailed { .. }) => {
                warn!(race_id, error = %e, "result page unavailable");
                let mut outcome = ScrapeOutcome::new(race_id, ScrapeStatus::FetchFailed);
                outcome.detail = Some(e.to_string());
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };

        let page = parse_race_page(&String::from_utf8_lossy(&body))?;
        let discipline = page.header.discipline();

        if let Some(reason) = page.header.unsupported_reason() {
            info!(race_id, reason = %reason, "skipping unsupported event");
            let mut outcome = ScrapeOutcome::new(race_id, ScrapeStatus::UnsupportedFormat);
            outcome.discipline = discipline;
            outcome.detail = Some(reason);
            return Ok(outcome);
        }

        let (Some(discipline), Some(date)) = (discipline, page.header.date) else {
            return Err(ParseError::document("result page has no race date").into());
        };

        // Non-finisher tables alone are not a result list
        let status = if page.finishers.is_empty() {
            ScrapeStatus::NoResults
        } else {
            ScrapeStatus::Completed
        };

        let mut outcome = self.store.atomic(|store| {
            persist(store, race_id, categories, &page, discipline, date, status)
        })?;
        outcome.skipped_rows = page.skipped_rows;

        if outcome.skipped_rows > 0 {
            warn!(race_id, skipped = outcome.skipped_rows, "skipped malformed result rows");
        }
        info!(
            race_id,
            status = status.label(),
            discipline = discipline.code(),
            results = outcome.persisted_results,
            "race scraped"
        );
        Ok(outcome)
    }
}

fn persist<S: Store>(
    store: &S,
    race_id: &str,
    categories: &[String],
    page: &RacePage,
    discipline: Discipline,
    date: NaiveDate,
    status: ScrapeStatus,
) -> Result<ScrapeOutcome> {
    let resolver = IdentityResolver::new(store);
    let (race_key, _) = resolver.resolve(RACE, race_id)?;
    let header = &page.header;

    // Without discovery, the subtitle supplies the category if it names a known one
    let observed: Vec<String> = if categories.is_empty() {
        header
            .category
            .as_deref()
            .and_then(category_code)
            .map(|code| vec![code.to_string()])
            .unwrap_or_default()
    } else {
        categories.to_vec()
    };
    let (win_time, penalty) = page.winner();

    let race = Race {
        key: race_key.clone(),
        race_id: race_id.to_string(),
        codex: header.codex.clone(),
        date,
        discipline,
        gender: header.gender,
        category: observed.first().cloned(),
        name: header.name.clone(),
        location: header.location.clone(),
        nation: header.nation.clone(),
        win_time,
        penalty,
        total_starters: Some(page.total_starters()),
        total_finishers: Some(page.finishers.len() as u32),
        has_results: status == ScrapeStatus::Completed,
        course: header.course.clone(),
    };

    let mut outcome = ScrapeOutcome::new(race_id, status);
    outcome.discipline = Some(discipline);
    outcome.race = Some(store.upsert_race(&race)?);
    store.add_race_categories(&race_key, &observed)?;

    let rows: Vec<&ResultRow> = if status == ScrapeStatus::Completed {
        page.finishers.iter().chain(&page.non_finishers).collect()
    } else {
        Vec::new()
    };

    let mut kept = Vec::new();
    for row in rows {
        let (athlete_key, _) = resolver.resolve_athlete(&AthleteAttrs {
            competitor_id: row.competitor_id.clone(),
            name: row.name.clone(),
            nation_code: row.nation.clone(),
            gender: header.gender,
            ..Default::default()
        })?;

        let result = RaceResult {
            athlete_key: athlete_key.clone(),
            race_key: race_key.clone(),
            rank: row.rank,
            status: row.status.clone(),
            run1_time: row.run1_time,
            run2_time: row.run2_time,
            racer_time: row.racer_time,
            points: row.points,
            race_points: match (row.status.is_none(), row.racer_time, win_time) {
                (true, Some(time), Some(win)) => race_points(discipline, time, win),
                _ => None,
            },
            penalty,
            win_time,
        };

        match store.upsert_race_result(&result)? {
            UpsertOutcome::Created => outcome.created += 1,
            UpsertOutcome::Updated => outcome.updated += 1,
            UpsertOutcome::Unchanged => outcome.unchanged += 1,
        }
        kept.push(athlete_key);
    }

    outcome.pruned = store.prune_race_results(&race_key, &kept)?;
    kept.sort();
    kept.dedup();
    outcome.persisted_results = kept.len();

    store.insert_event(&Event::new(
        "race_scraped",
        "race",
        race_id,
        serde_json::json!({
            "status": status.label(),
            "discipline": discipline.code(),
            "created": outcome.created,
            "updated": outcome.updated,
            "unchanged": outcome.unchanged,
            "pruned": outcome.pruned,
        }),
        "race_result_scraper",
    ))?;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::fetch::StaticFetcher;

    fn finisher(rank: u32, id: &str, name: &str, run1: &str, run2: &str, total: &str, points: &str) -> String {
        format!(
            r#"<a class="table-row" href="https://www.fis-ski.com/DB/general/athlete-biography.html?sectorcode=AL&amp;competitorid={id}&amp;type=result">
  <div class="g-row container">
    <div class="g-row justify-sb">
      <div class="g-lg-1 g-md-1 g-sm-1 g-xs-2 justify-right pr-1 bold">{rank}</div>
      <div class="g-lg-2 g-md-2 g-sm-2 hidden-xs justify-right gray pr-1">51234</div>
      <div class="g-lg-8 g-md-8 g-sm-6 g-xs-11 justify-left bold">{name}</div>
      <div class="g-lg-1 g-md-1 hidden-sm-down justify-left"><span class="country__name-short">SUI</span></div>
      <div class="g-lg-2 g-md-2 g-sm-2 justify-right bold hidden-xs">{run1}</div>
      <div class="g-lg-2 g-md-2 g-sm-2 justify-right bold hidden-xs">{run2}</div>
      <div class="g-lg-2 g-md-2 g-sm-2 justify-right bold hidden-xs">{total}</div>
      <div class="g-lg-2 g-md-2 g-sm-2 g-xs-3 justify-right">{points}</div>
    </div>
  </div>
</a>"#
        )
    }

    fn non_finisher(id: &str, name: &str) -> String {
        format!(
            r#"<a class="table-row" href="https://www.fis-ski.com/DB/general/athlete-biography.html?competitorid={id}">
  <div class="g-row container"><div class="g-row justify-sb">
    <div class="g-lg-1 justify-right bold"></div>
    <div class="g-lg-8 justify-left bold">{name}</div>
    <div class="g-lg-1"><span class="country__name-short">AUT</span></div>
  </div></div>
</a>"#
        )
    }

    fn page(kind: &str, finishers: &[String], dnf1: &[String], dns1: &[String]) -> String {
        format!(
            r#"<html><head><title>Men's Giant Slalom Results - Adelboden (SUI)</title>
<script>var data = {{"competitionCodex":"0012"}};</script></head>
<body>
<div class="event-header">
  <div class="timezone-date" data-date="2025-01-11">11 Jan 2025</div>
  <div class="event-header__kind">{kind}</div>
  <div class="event-header__subtitle">World Cup</div>
</div>
<h1 class="heading heading_l2">Adelboden (SUI)</h1>
<section class="section_more-info">
  <h3 class="heading heading_l3">Technical data</h3>
  <div class="table-row"><div class="justify-left bold">Start Altitude</div><div class="justify-right">1730m</div></div>
  <div class="table-row"><div class="justify-left bold">Finish Altitude</div><div class="justify-right">1355m</div></div>
  <div class="table-row"><div class="justify-left bold">Homologation Number</div><div class="justify-right">12345/01/22</div></div>
</section>
<section class="section_more-info">
  <h3 class="heading heading_l3">1st Run</h3>
  <div class="table-row"><div class="justify-left bold">Number of Gates</div><div class="justify-left">58</div></div>
  <div class="table-row"><div class="justify-left bold">Turning Gates</div><div class="justify-left">56</div></div>
</section>
<section class="section_more-info">
  <h3 class="heading heading_l3">2nd Run</h3>
  <div class="table-row"><div class="justify-left bold">Number of Gates</div><div class="justify-left">54</div></div>
  <div class="table-row"><div class="justify-left bold">Turning Gates</div><div class="justify-left">53</div></div>
</section>
<div class="table">
  <div id="events-info-results" class="table__body">{finishers}</div>
  <div class="table__head">Did not finish 1st run</div>
  <div class="table__body">{dnf1}</div>
  <div class="table__head">Did not start 1st run</div>
  <div class="table__body">{dns1}</div>
</div>
</body></html>"#,
            finishers = finishers.concat(),
            dnf1 = dnf1.concat(),
            dns1 = dns1.concat(),
        )
    }

    fn standard_page() -> String {
        page(
            "Men's Giant Slalom",
            &[
                finisher(1, "107303", "ODERMATT Marco", "1:13.50", "1:10.00", "2:23.50", "0.00"),
                finisher(2, "200001", "MEILLARD Loic", "1:14.00", "1:10.93", "2:24.93", "9.95"),
            ],
            &[non_finisher("300001", "FELLER Manuel")],
            &[non_finisher("400001", "BRAATHEN Lucas")],
        )
    }

    #[test]
    fn test_result_status_codes() {
        assert_eq!(result_status("Did not finish 1st run").as_deref(), Some("DNF1"));
        assert_eq!(result_status("Disqualified 2nd run").as_deref(), Some("DSQ2"));
        assert_eq!(result_status("Not permitted to start").as_deref(), Some("NPS"));
        assert_eq!(result_status("Results"), None);
    }

    #[test]
    fn test_course_gates_single_run() {
        let html = r#"<html><body>
<div class="timezone-date" data-date="2025-01-10"></div>
<div class="event-header__kind">Men's Downhill</div>
<section class="section_more-info">
  <h3 class="heading heading_l3">Course</h3>
  <div class="table-row"><div class="justify-left bold">Number of Gates</div><div class="justify-left">32</div></div>
  <div class="table-row"><div class="justify-left bold">Turning Gates</div><div class="justify-left">32</div></div>
  <div class="table-row"><div class="justify-left bold">Course Setter</div><div class="justify-left">DOE John</div></div>
</section>
</body></html>"#;

        let course = parse_race_page(html).unwrap().header.course;
        assert_eq!(course.gates1, Some(32));
        assert_eq!(course.turning_gates1, Some(32));
        assert_eq!(course.gates2, None);
        assert_eq!(course.start_altitude, None);
    }

    #[test]
    fn test_time_and_race_points() {
        assert_eq!(parse_time("1:13.50"), Some(73.5));
        assert_eq!(parse_time("58.12"), Some(58.12));
        assert_eq!(parse_time("-"), None);
        assert_eq!(parse_time("DNF"), None);

        assert_eq!(race_points(Discipline::GiantSlalom, 143.5, 143.5), Some(0.0));
        // 1010 * (144.93 / 143.5 - 1) = 10.0648...
        assert_eq!(race_points(Discipline::GiantSlalom, 144.93, 143.5), Some(10.06));
        assert_eq!(race_points(Discipline::Slalom, 100.0, 0.0), None);
    }

    #[test]
    fn test_parse_standard_page() {
        let page = parse_race_page(&standard_page()).unwrap();
        let header = &page.header;

        assert_eq!(header.name.as_deref(), Some("Adelboden (SUI)"));
        assert_eq!(header.codex.as_deref(), Some("0012"));
        assert_eq!(header.date, NaiveDate::from_ymd_opt(2025, 1, 11));
        assert_eq!(header.gender, Some(Gender::Male));
        assert_eq!(header.discipline(), Some(Discipline::GiantSlalom));
        assert_eq!(header.category.as_deref(), Some("World Cup"));
        assert_eq!(header.location.as_deref(), Some("Adelboden"));
        assert_eq!(header.nation.as_deref(), Some("SUI"));
        assert_eq!(header.course.start_altitude, Some(1730));
        assert_eq!(header.course.finish_altitude, Some(1355));
        assert_eq!(header.course.homologation.as_deref(), Some("12345/01/22"));
        assert_eq!(header.course.gates1, Some(58));
        assert_eq!(header.course.turning_gates1, Some(56));
        assert_eq!(header.course.gates2, Some(54));
        assert_eq!(header.course.turning_gates2, Some(53));

        assert_eq!(page.finishers.len(), 2);
        let winner = &page.finishers[0];
        assert_eq!(winner.rank, Some(1));
        assert_eq!(winner.competitor_id, "107303");
        assert_eq!(winner.name, "ODERMATT Marco");
        assert_eq!(winner.nation.as_deref(), Some("SUI"));
        assert_eq!(winner.run1_time, Some(73.5));
        assert_eq!(winner.run2_time, Some(70.0));
        assert_eq!(winner.racer_time, Some(143.5));
        assert_eq!(winner.points, Some(0.0));

        assert_eq!(page.non_finishers.len(), 2);
        assert_eq!(page.non_finishers[0].status.as_deref(), Some("DNF1"));
        assert_eq!(page.non_finishers[1].status.as_deref(), Some("DNS1"));
        assert_eq!(page.non_finishers[0].rank, None);

        assert_eq!(page.winner(), (Some(143.5), Some(0.0)));
        assert_eq!(page.total_starters(), 3);

        println!("✅ Race page parse test PASSED");
    }

    #[test]
    fn test_scrape_twice_is_idempotent() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher =
            StaticFetcher::new().with_page(config.race_results_url("122805"), standard_page());
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);
        let categories = vec!["WC".to_string()];

        let first = scraper.scrape("122805", &categories).unwrap();
        assert_eq!(first.status, ScrapeStatus::Completed);
        assert_eq!(first.discipline, Some(Discipline::GiantSlalom));
        assert_eq!(first.persisted_results, 4);
        assert_eq!(first.created, 4);
        assert_eq!(first.race, Some(UpsertOutcome::Created));

        let race = store.get_race_by_external_id("122805").unwrap().unwrap();
        let before = store.get_race_results(&race.key).unwrap();

        let second = scraper.scrape("122805", &categories).unwrap();
        assert_eq!(second.persisted_results, 4);
        assert_eq!(second.unchanged, 4);
        assert_eq!(second.race, Some(UpsertOutcome::Unchanged));
        assert!(!second.changed());

        let after = store.get_race_results(&race.key).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.count_rows("race_results").unwrap(), 4);
        assert_eq!(store.count_rows("races").unwrap(), 1);

        assert_eq!(race.win_time, Some(143.5));
        assert_eq!(race.penalty, Some(0.0));
        assert_eq!(race.total_finishers, Some(2));
        assert_eq!(race.total_starters, Some(3));
        assert_eq!(race.category.as_deref(), Some("WC"));
        assert!(race.has_results);

        let runner_up = after.iter().find(|r| r.rank == Some(2)).unwrap();
        assert_eq!(runner_up.race_points, Some(10.06));
        assert_eq!(runner_up.points, Some(9.95));

        println!("✅ Race scrape idempotence test PASSED");
    }

    #[test]
    fn test_rescrape_prunes_and_updates() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let url = config.race_results_url("122805");
        let fetcher = StaticFetcher::new().with_page(url.clone(), standard_page());
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);

        scraper.scrape("122805", &[]).unwrap();

        // Corrected page: runner-up disqualified, DNF athlete removed
        let corrected = page(
            "Men's Giant Slalom",
            &[finisher(1, "107303", "ODERMATT Marco", "1:13.50", "1:10.00", "2:23.50", "0.00")],
            &[non_finisher("200001", "MEILLARD Loic")],
            &[non_finisher("400001", "BRAATHEN Lucas")],
        );
        fetcher.insert(url, corrected);

        let outcome = scraper.scrape("122805", &[]).unwrap();
        assert_eq!(outcome.pruned, 1);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.persisted_results, 3);

        let race = store.get_race_by_external_id("122805").unwrap().unwrap();
        let results = store.get_race_results(&race.key).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.rank != Some(2)));
        // Without discovery the subtitle "World Cup" is stored as its code
        assert_eq!(race.category.as_deref(), Some("WC"));
        assert_eq!(store.get_race_categories(&race.key).unwrap(), vec!["WC".to_string()]);
    }

    #[test]
    fn test_scrape_by_id_then_discovered_keeps_one_vocabulary() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let training = standard_page().replace(
            r#"<div class="event-header__subtitle">World Cup</div>"#,
            r#"<div class="event-header__subtitle">Training</div>"#,
        );
        let fetcher = StaticFetcher::new().with_page(config.race_results_url("122805"), training);
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);

        // Unknown subtitle: no category until discovery supplies one
        scraper.scrape("122805", &[]).unwrap();
        let race = store.get_race_by_external_id("122805").unwrap().unwrap();
        assert_eq!(race.category, None);
        assert!(store.get_race_categories(&race.key).unwrap().is_empty());

        scraper
            .scrape("122805", &["EC".to_string(), "NC".to_string()])
            .unwrap();
        let race = store.get_race_by_external_id("122805").unwrap().unwrap();
        assert_eq!(race.category.as_deref(), Some("EC"));
        assert_eq!(
            store.get_race_categories(&race.key).unwrap(),
            vec!["EC".to_string(), "NC".to_string()]
        );

        // Known subtitle stored first, then discovery under the same code
        let fetcher =
            StaticFetcher::new().with_page(config.race_results_url("9001"), standard_page());
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);
        scraper.scrape("9001", &[]).unwrap();
        scraper.scrape("9001", &["WC".to_string()]).unwrap();

        let race = store.get_race_by_external_id("9001").unwrap().unwrap();
        assert_eq!(race.category.as_deref(), Some("WC"));
        assert_eq!(store.get_race_categories(&race.key).unwrap(), vec!["WC".to_string()]);
    }

    #[test]
    fn test_non_finishers_only_is_no_results() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let url = config.race_results_url("8");
        let fetcher = StaticFetcher::new().with_page(url.clone(), standard_page());
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);

        let first = scraper.scrape("8", &[]).unwrap();
        assert_eq!(first.persisted_results, 4);

        // Every athlete now listed as DNF or DNS: nothing to keep
        let dnf_only = page(
            "Men's Giant Slalom",
            &[],
            &[non_finisher("300001", "FELLER Manuel")],
            &[non_finisher("400001", "BRAATHEN Lucas")],
        );
        fetcher.insert(url, dnf_only);

        let outcome = scraper.scrape("8", &[]).unwrap();
        assert_eq!(outcome.status, ScrapeStatus::NoResults);
        assert_eq!(outcome.persisted_results, 0);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.pruned, 4);

        let race = store.get_race_by_external_id("8").unwrap().unwrap();
        assert!(!race.has_results);
        assert_eq!(race.total_finishers, Some(0));
        assert_eq!(race.win_time, None);
        assert!(store.get_race_results(&race.key).unwrap().is_empty());

        println!("✅ Non-finisher-only page test PASSED");
    }

    #[test]
    fn test_no_results_page() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = StaticFetcher::new()
            .with_page(config.race_results_url("9"), page("Women's Slalom", &[], &[], &[]));
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);

        let outcome = scraper.scrape("9", &["FIS".to_string()]).unwrap();
        assert_eq!(outcome.status, ScrapeStatus::NoResults);
        assert_eq!(outcome.persisted_results, 0);
        assert_eq!(store.count_rows("race_results").unwrap(), 0);

        let race = store.get_race_by_external_id("9").unwrap().unwrap();
        assert!(!race.has_results);
        assert_eq!(race.gender, Some(Gender::Female));
    }

    #[test]
    fn test_unsupported_format_writes_nothing() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let team = page(
            "Mixed Team Parallel",
            &[finisher(1, "107303", "SUI I", "", "", "", "")],
            &[],
            &[],
        );
        let fetcher = StaticFetcher::new().with_page(config.race_results_url("77"), team);
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);

        let outcome = scraper.scrape("77", &[]).unwrap();
        assert_eq!(outcome.status, ScrapeStatus::UnsupportedFormat);
        assert!(outcome.detail.unwrap().contains("Team Parallel"));
        assert_eq!(store.count_rows("races").unwrap(), 0);
        assert_eq!(store.count_rows("race_results").unwrap(), 0);
        assert_eq!(store.count_rows("athletes").unwrap(), 0);
    }

    #[test]
    fn test_malformed_row_skipped_not_fatal() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let broken = r#"<a class="table-row" href="/no-competitor"><div class="g-row justify-sb"><div>3</div></div></a>"#;
        let html = page(
            "Men's Super G",
            &[
                finisher(1, "107303", "ODERMATT Marco", "1:13.50", "", "1:13.50", "0.00"),
                broken.to_string(),
            ],
            &[],
            &[],
        );
        let fetcher = StaticFetcher::new().with_page(config.race_results_url("5"), html);
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);

        let outcome = scraper.scrape("5", &[]).unwrap();
        assert_eq!(outcome.status, ScrapeStatus::Completed);
        assert_eq!(outcome.discipline, Some(Discipline::SuperG));
        assert_eq!(outcome.persisted_results, 1);
        assert_eq!(outcome.skipped_rows, 1);
    }

    #[test]
    fn test_fetch_failure_and_broken_page() {
        let config = Config::default();
        let store = SqliteStore::open_in_memory().unwrap();
        let fetcher = StaticFetcher::new()
            .with_page(config.race_results_url("2"), "<html><body>Access denied</body></html>");
        let scraper = RaceResultScraper::new(&store, &fetcher, &config);

        let missing = scraper.scrape("1", &[]).unwrap();
        assert_eq!(missing.status, ScrapeStatus::FetchFailed);
        assert!(missing.detail.is_some());

        let err = scraper.scrape("2", &[]).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        assert_eq!(store.count_rows("races").unwrap(), 0);
    }
}
