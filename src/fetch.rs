// 🌐 Remote fetch collaborator
//
// No caching and no retries here: that policy belongs to the ingestors.

use crate::config::Config;
use crate::error::{IngestError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

pub trait Fetcher: Send + Sync {
    /// Fetch the body at `url`; a timeout is reported like any other failure.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher with a per-request timeout
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| IngestError::fetch("<client>", e))?;

        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "fetching");

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| IngestError::fetch(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::fetch(url, format!("HTTP {}", status)));
        }

        let body = response.bytes().map_err(|e| IngestError::fetch(url, e))?;
        Ok(body.to_vec())
    }
}

/// In-memory fetcher serving canned bodies; unknown URLs fail like a 404.
///
/// Used for offline replays and tests. Counts requests per URL.
#[derive(Default)]
pub struct StaticFetcher {
    pages: Mutex<HashMap<String, Vec<u8>>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(url.into(), body.into());
        }
    }

    pub fn remove(&self, url: &str) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.remove(url);
        }
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits
            .lock()
            .map(|hits| hits.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Fetcher for StaticFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Ok(mut hits) = self.hits.lock() {
            *hits.entry(url.to_string()).or_insert(0) += 1;
        }

        let pages = self
            .pages
            .lock()
            .map_err(|_| IngestError::fetch(url, "fetcher lock poisoned"))?;

        pages
            .get(url)
            .cloned()
            .ok_or_else(|| IngestError::fetch(url, "HTTP 404 Not Found"))
    }
}
