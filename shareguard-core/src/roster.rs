//! C4 — Roster cache.
//!
//! Polls the external control panel on `T_roster` (default 60s) through an
//! injected `PanelFetcher`, then atomically swaps the full snapshot via
//! `arc_swap::ArcSwap` (spec.md §9's design note: this is the teacher's
//! pattern for lock-free snapshot reads). On fetch failure the last good
//! snapshot is retained and `panel_loaded` flips false (spec.md §4.4, §7).

use crate::error::{DetectError, Result};
use crate::model::RosterEntry;
use crate::secret::Secret;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    pub entries: HashMap<String, RosterEntry>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub panel_loaded: bool,
}

/// The core contract C4 consumes: auth, pagination headers, and transport
/// are entirely the fetcher's responsibility (spec.md §4.4).
#[async_trait]
pub trait PanelFetcher: Send + Sync {
    async fn fetch_page(&self, start: u32, size: u32) -> Result<Vec<RosterEntry>>;
}

/// Never returns any roster entries; used when `PANEL_URL` validation has
/// already failed fast at startup and in unit tests that seed the
/// snapshot directly.
pub struct NullPanelFetcher;

#[async_trait]
impl PanelFetcher for NullPanelFetcher {
    async fn fetch_page(&self, _start: u32, _size: u32) -> Result<Vec<RosterEntry>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawRosterEntry {
    email: String,
    #[serde(default)]
    device_limit: u32,
    #[serde(default)]
    telegram_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct RosterPage {
    #[serde(default)]
    users: Vec<RawRosterEntry>,
}

/// Paginates `start`/`size` against the panel's roster endpoint, modeled
/// on `OrchestratorClient` in the teacher's orchestrator.rs.
pub struct HttpPanelFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Secret<String>,
}

impl HttpPanelFetcher {
    pub fn new(base_url: String, token: Secret<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectError::Roster(e.to_string()))?;
        Ok(Self { client, base_url, token })
    }
}

#[async_trait]
impl PanelFetcher for HttpPanelFetcher {
    async fn fetch_page(&self, start: u32, size: u32) -> Result<Vec<RosterEntry>> {
        let url = format!(
            "{}/api/users?start={}&size={}",
            self.base_url.trim_end_matches('/'),
            start,
            size
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| DetectError::Roster(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DetectError::Roster(format!(
                "panel returned HTTP {}",
                response.status()
            )));
        }

        let page: RosterPage = response
            .json()
            .await
            .map_err(|e| DetectError::Roster(e.to_string()))?;

        Ok(page
            .users
            .into_iter()
            .map(|raw| RosterEntry {
                email: raw.email,
                device_limit: raw.device_limit,
                telegram_id: raw.telegram_id,
                description: raw.description,
                whitelisted: false,
                stale: false,
            })
            .collect())
    }
}

pub struct RosterCache {
    snapshot: ArcSwap<RosterSnapshot>,
    fetcher: Arc<dyn PanelFetcher>,
    page_size: u32,
    whitelist: HashSet<String>,
}

impl RosterCache {
    pub fn new(fetcher: Arc<dyn PanelFetcher>, page_size: u32, whitelist: HashSet<String>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RosterSnapshot::default()),
            fetcher,
            page_size: page_size.max(1),
            whitelist,
        }
    }

    /// Readers take a reference to the immutable snapshot without locking
    /// (spec.md §5).
    pub fn current(&self) -> Arc<RosterSnapshot> {
        self.snapshot.load_full()
    }

    /// Full paginated refresh. Entries missing from this pull are marked
    /// `stale` rather than deleted immediately; an entry already `stale`
    /// that is still missing is dropped (spec.md §3 Lifecycle).
    #[instrument(skip(self))]
    pub async fn refresh(&self) {
        let previous = self.snapshot.load_full();
        let mut fetched: HashMap<String, RosterEntry> = HashMap::new();
        let mut start = 0u32;

        loop {
            match self.fetcher.fetch_page(start, self.page_size).await {
                Ok(page) => {
                    if page.is_empty() {
                        break;
                    }
                    let got = page.len() as u32;
                    for entry in page {
                        fetched.insert(entry.email.clone(), entry);
                    }
                    start += got;
                    if got < self.page_size {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "panel roster fetch failed; retaining last snapshot");
                    counter!("shareguard_roster_fetch_failures_total", 1);
                    let mut retained = (*previous).clone();
                    retained.panel_loaded = false;
                    self.snapshot.store(Arc::new(retained));
                    return;
                }
            }
        }

        let mut entries = HashMap::with_capacity(fetched.len());
        for (email, mut entry) in fetched {
            entry.whitelisted = entry.whitelisted || self.whitelist.contains(&email);
            entry.stale = false;
            entries.insert(email, entry);
        }
        for (email, old) in previous.entries.iter() {
            if entries.contains_key(email) {
                continue;
            }
            if old.stale {
                continue; // missing two pulls running: drop
            }
            let mut marked = old.clone();
            marked.stale = true;
            entries.insert(email.clone(), marked);
        }

        info!(users = entries.len(), "panel roster refreshed");
        gauge!("shareguard_roster_users", entries.len() as f64);
        self.snapshot.store(Arc::new(RosterSnapshot {
            entries,
            loaded_at: Some(Utc::now()),
            panel_loaded: true,
        }));
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }

    /// Test helper: seed a snapshot directly instead of fetching over HTTP.
    #[doc(hidden)]
    pub fn set_entries_for_test(&self, entries: HashMap<String, RosterEntry>) {
        self.snapshot.store(Arc::new(RosterSnapshot {
            entries,
            loaded_at: Some(Utc::now()),
            panel_loaded: true,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher {
        pages: std::sync::Mutex<Vec<Vec<RosterEntry>>>,
    }

    #[async_trait]
    impl PanelFetcher for StaticFetcher {
        async fn fetch_page(&self, start: u32, _size: u32) -> Result<Vec<RosterEntry>> {
            if start == 0 {
                Ok(self.pages.lock().unwrap().first().cloned().unwrap_or_default())
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn entry(email: &str, limit: u32) -> RosterEntry {
        RosterEntry {
            email: email.to_string(),
            device_limit: limit,
            telegram_id: None,
            description: None,
            whitelisted: false,
            stale: false,
        }
    }

    #[tokio::test]
    async fn refresh_populates_snapshot() {
        let fetcher = Arc::new(StaticFetcher { pages: std::sync::Mutex::new(vec![vec![entry("alice@x", 2)]]) });
        let cache = RosterCache::new(fetcher, 50, HashSet::new());
        cache.refresh().await;
        let snapshot = cache.current();
        assert!(snapshot.panel_loaded);
        assert_eq!(snapshot.entries.get("alice@x").unwrap().device_limit, 2);
    }

    #[tokio::test]
    async fn missing_entry_is_marked_stale_then_dropped() {
        let empty_fetcher = Arc::new(StaticFetcher { pages: std::sync::Mutex::new(vec![vec![]]) });
        let cache = RosterCache::new(empty_fetcher, 50, HashSet::new());
        cache.set_entries_for_test(HashMap::from([("alice@x".to_string(), entry("alice@x", 2))]));

        cache.refresh().await;
        let snapshot = cache.current();
        assert!(snapshot.entries.get("alice@x").unwrap().stale);

        cache.refresh().await;
        let snapshot = cache.current();
        assert!(!snapshot.entries.contains_key("alice@x"));
    }

    #[tokio::test]
    async fn whitelist_set_forces_whitelisted_flag() {
        let fetcher = Arc::new(StaticFetcher { pages: std::sync::Mutex::new(vec![vec![entry("alice@x", 2)]]) });
        let cache = RosterCache::new(fetcher, 50, HashSet::from(["alice@x".to_string()]));
        cache.refresh().await;
        assert!(cache.current().entries.get("alice@x").unwrap().whitelisted);
    }
}
