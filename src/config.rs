use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub cache_dir: PathBuf,
    pub fetch_timeout: Duration,
    pub user_agent: String,
    /// Public site (points-list catalogue, calendar listings)
    pub base_url: String,
    /// Data host (CSV exports, result pages)
    pub data_url: String,
    /// Sector code, "AL" for alpine skiing
    pub sector: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("fis.db"),
            cache_dir: PathBuf::from("data/points_lists"),
            fetch_timeout: Duration::from_secs(30),
            user_agent: format!("fis-ingest/{}", env!("CARGO_PKG_VERSION")),
            base_url: "https://www.fis-ski.com".to_string(),
            data_url: "https://data.fis-ski.com".to_string(),
            sector: "AL".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Config::default();

        Ok(Self {
            database_path: env::var("FIS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            cache_dir: env::var("FIS_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            fetch_timeout: match env::var("FIS_FETCH_TIMEOUT_SECS") {
                Ok(raw) => Duration::from_secs(
                    raw.parse()
                        .context("FIS_FETCH_TIMEOUT_SECS must be a whole number of seconds")?,
                ),
                Err(_) => defaults.fetch_timeout,
            },
            user_agent: env::var("FIS_USER_AGENT").unwrap_or(defaults.user_agent),
            base_url: env::var("FIS_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            data_url: env::var("FIS_DATA_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.data_url),
            sector: env::var("FIS_SECTOR").unwrap_or(defaults.sector),
        })
    }

    pub fn points_lists_url(&self) -> String {
        format!("{}/DB/alpine-skiing/fis-points-lists.html", self.base_url)
    }

    /// CSV export for one list; `list_id` empty means the season's base list
    pub fn points_list_export_url(&self, sector: &str, season: &str, list_id: &str) -> String {
        let mut url = format!(
            "{}/fis_athletes/ajax/fispointslistfunctions/export_fispointslist.html?export_csv=true&sectorcode={}&seasoncode={}",
            self.data_url,
            urlencoding::encode(sector),
            urlencoding::encode(season)
        );
        if !list_id.is_empty() {
            url.push_str("&listid=");
            url.push_str(&urlencoding::encode(list_id));
        }
        url
    }

    /// Calendar listing for one season and category
    pub fn calendar_url(&self, season: u16, category: &str) -> String {
        let season_month = format!("X-{}", season);
        format!(
            "{}/DB/alpine-skiing/calendar-results.html?eventselection=&place=&sectorcode={}&seasoncode={}&categorycode={}&disciplinecode=&gendercode=&racedate=&racecodex=&nationcode=&seasonmonth={}&saveselection=-1&seasonselection=",
            self.base_url,
            urlencoding::encode(&self.sector),
            season,
            urlencoding::encode(category),
            urlencoding::encode(&season_month)
        )
    }

    pub fn race_results_url(&self, race_id: &str) -> String {
        format!(
            "{}/DB/general/results.html?sectorcode={}&raceid={}",
            self.base_url,
            urlencoding::encode(&self.sector),
            urlencoding::encode(race_id)
        )
    }
}
