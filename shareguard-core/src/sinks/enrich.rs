//! ISP enrichment sink.
//!
//! Optional, read-only lookups attached to observations in the query API
//! (spec.md §4.7, §8 Non-goals: enrichment never feeds classification).
//! `CachedEnrich` wraps an injected lookup closure with an `lru::LruCache`
//! keyed by IP so repeat lookups within a session never leave the process.

use async_trait::async_trait;
use futures::future::BoxFuture;
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait EnrichSink: Send + Sync {
    async fn lookup_isp(&self, ip: IpAddr) -> Option<String>;
}

pub struct NullEnrich;

#[async_trait]
impl EnrichSink for NullEnrich {
    async fn lookup_isp(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

pub type LookupFn = Arc<dyn Fn(IpAddr) -> BoxFuture<'static, Option<String>> + Send + Sync>;

pub struct CachedEnrich {
    cache: Mutex<LruCache<IpAddr, Option<String>>>,
    lookup: LookupFn,
}

impl CachedEnrich {
    pub fn new(capacity: usize, lookup: LookupFn) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self { cache: Mutex::new(LruCache::new(capacity)), lookup }
    }
}

#[async_trait]
impl EnrichSink for CachedEnrich {
    async fn lookup_isp(&self, ip: IpAddr) -> Option<String> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&ip) {
                return hit.clone();
            }
        }

        let result = (self.lookup)(ip).await;
        let mut cache = self.cache.lock().await;
        cache.put(ip, result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn repeated_lookup_hits_cache_not_the_backing_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let sink = CachedEnrich::new(
            10,
            Arc::new(move |_ip| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Some("Example ISP".to_string())
                })
            }),
        );

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(sink.lookup_isp(ip).await, Some("Example ISP".to_string()));
        assert_eq!(sink.lookup_isp(ip).await, Some("Example ISP".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_enrich_always_returns_none() {
        let sink = NullEnrich;
        assert_eq!(sink.lookup_isp("10.0.0.1".parse().unwrap()).await, None);
    }
}
