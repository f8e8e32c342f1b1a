//! Banlist persistence sink.
//!
//! The spec describes only a logical relation (spec.md §6):
//! `banlist(email PRIMARY KEY, first_banlisted_at, last_seen_banlisted_at,
//! reason)`. `FilePersist` is the concrete stand-in shipped with this
//! crate: an append-only JSON-lines store with an in-memory index,
//! flushed synchronously on every mutation, modeled on the teacher's
//! `config.rs` `save_to_file` (serde + `std::fs::write`) pattern.

use crate::error::{DetectError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanlistRecord {
    pub email: String,
    pub first_banlisted_at: DateTime<Utc>,
    pub last_seen_banlisted_at: DateTime<Utc>,
    pub reason_snapshot: String,
}

#[async_trait]
pub trait PersistSink: Send + Sync {
    async fn load_all(&self) -> Result<Vec<BanlistRecord>>;
    /// Idempotent: re-promoting an already-listed user updates
    /// `last_seen_banlisted_at` (and `reason_snapshot`) only, never
    /// `first_banlisted_at` (spec.md §3 invariant 5).
    async fn upsert(&self, email: &str, now: DateTime<Utc>, reason: &str) -> Result<()>;
    async fn delete(&self, email: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

pub struct NullPersist;

#[async_trait]
impl PersistSink for NullPersist {
    async fn load_all(&self) -> Result<Vec<BanlistRecord>> {
        Ok(Vec::new())
    }
    async fn upsert(&self, _email: &str, _now: DateTime<Utc>, _reason: &str) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _email: &str) -> Result<()> {
        Ok(())
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FilePersist {
    path: PathBuf,
    index: Mutex<HashMap<String, BanlistRecord>>,
}

impl FilePersist {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut index = HashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<BanlistRecord>(line) {
                        Ok(record) => {
                            index.insert(record.email.clone(), record);
                        }
                        Err(e) => warn!(error = %e, "skipping malformed banlist record on load"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DetectError::from(e)),
        }

        info!(path = %path.display(), records = index.len(), "loaded banlist store");
        Ok(Self { path, index: Mutex::new(index) })
    }

    async fn flush(&self, index: &HashMap<String, BanlistRecord>) -> Result<()> {
        let mut buf = String::new();
        for record in index.values() {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        tokio::fs::write(&self.path, buf).await.map_err(DetectError::from)
    }
}

#[async_trait]
impl PersistSink for FilePersist {
    async fn load_all(&self) -> Result<Vec<BanlistRecord>> {
        Ok(self.index.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, email: &str, now: DateTime<Utc>, reason: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        index
            .entry(email.to_string())
            .and_modify(|record| {
                record.last_seen_banlisted_at = now;
                record.reason_snapshot = reason.to_string();
            })
            .or_insert_with(|| BanlistRecord {
                email: email.to_string(),
                first_banlisted_at: now,
                last_seen_banlisted_at: now,
                reason_snapshot: reason.to_string(),
            });
        self.flush(&index).await
    }

    async fn delete(&self, email: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        index.remove(email);
        self.flush(&index).await
    }

    async fn clear(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        index.clear();
        self.flush(&index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[tokio::test]
    async fn upsert_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banlist.jsonl");

        {
            let store = FilePersist::open(&path).await.unwrap();
            store.upsert("alice@x", t(0), "sustained violation").await.unwrap();
        }

        let reopened = FilePersist::open(&path).await.unwrap();
        let records = reopened.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].email, "alice@x");
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_first_banlisted_at_updates_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banlist.jsonl");
        let store = FilePersist::open(&path).await.unwrap();

        store.upsert("alice@x", t(0), "first").await.unwrap();
        store.upsert("alice@x", t(100), "second").await.unwrap();

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_banlisted_at, t(0));
        assert_eq!(records[0].last_seen_banlisted_at, t(100));
        assert_eq!(records[0].reason_snapshot, "second");
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banlist.jsonl");
        let store = FilePersist::open(&path).await.unwrap();
        store.upsert("alice@x", t(0), "violation").await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
