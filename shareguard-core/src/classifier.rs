//! C3 — Classifier.
//!
//! Runs on a fixed tick (`T_cls`, default 1s) implementing the staged
//! state machine: concurrent-window overflow -> trigger accumulator ->
//! violator -> banlist. The tick takes the tracker's write lock for its
//! whole scan and only dispatches to sinks after releasing it, so no
//! lock is held across a suspension that performs external I/O.

use crate::config::ClassifierConfig;
use crate::model::Stage;
use crate::roster::RosterCache;
use crate::sinks::{NotifySink, PersistSink};
use crate::tracker::{recent_ip_count, UserTracker};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

/// Domain events emitted by the classifier and fanned out to every
/// present sink; the classifier never branches on sink presence because
/// absent sinks are no-op implementations.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    ViolatorOnset {
        email: String,
        observed_ips: usize,
        limit: u32,
        at: DateTime<Utc>,
    },
    ViolatorCleared {
        email: String,
        at: DateTime<Utc>,
    },
    BanlistAdded {
        email: String,
        at: DateTime<Utc>,
    },
    BanlistCleared {
        email: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn email(&self) -> &str {
        match self {
            DomainEvent::ViolatorOnset { email, .. }
            | DomainEvent::ViolatorCleared { email, .. }
            | DomainEvent::BanlistAdded { email, .. }
            | DomainEvent::BanlistCleared { email, .. } => email,
        }
    }

    fn message(&self) -> String {
        match self {
            DomainEvent::ViolatorOnset { email, observed_ips, limit, .. } => format!(
                "ShareGuard: {email} became a violator ({observed_ips} concurrent IPs, limit {limit})"
            ),
            DomainEvent::ViolatorCleared { email, .. } => {
                format!("ShareGuard: {email} cleared violator status")
            }
            DomainEvent::BanlistAdded { email, .. } => {
                format!("ShareGuard: {email} was added to the banlist")
            }
            DomainEvent::BanlistCleared { email, .. } => {
                format!("ShareGuard: {email} was removed from the banlist")
            }
        }
    }
}

pub struct Classifier {
    config: ClassifierConfig,
    tracker: Arc<UserTracker>,
    roster: Arc<RosterCache>,
    persist: Arc<dyn PersistSink>,
    notify: Arc<dyn NotifySink>,
    whitelist: HashSet<String>,
}

impl Classifier {
    pub fn new(
        config: ClassifierConfig,
        tracker: Arc<UserTracker>,
        roster: Arc<RosterCache>,
        persist: Arc<dyn PersistSink>,
        notify: Arc<dyn NotifySink>,
        whitelist: HashSet<String>,
    ) -> Self {
        Self {
            config,
            tracker,
            roster,
            persist,
            notify,
            whitelist,
        }
    }

    /// Hydrate the banlisted set from the persist sink's `LoadAll()` at
    /// startup: a banlisted user is retained across restarts even with
    /// zero current observations.
    pub async fn hydrate_banlist(&self) -> crate::error::Result<usize> {
        let records = self.persist.load_all().await?;
        let mut users = self.tracker.users.write().await;
        let count = records.len();
        for record in records {
            let state = users.entry(record.email.clone()).or_default();
            state.banlisted_since.get_or_insert(record.first_banlisted_at);
        }
        info!(banlisted = count, "hydrated banlist from persist sink");
        Ok(count)
    }

    /// Background loop driving the tick on `ClassifierConfig::tick_seconds`.
    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.tick_seconds.max(1));
        loop {
            self.tick(Utc::now()).await;
            sleep(period).await;
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) {
        let roster = self.roster.current();
        let window = Duration::from_secs(self.config.classifier_window_seconds());
        let period = chrono::Duration::seconds(self.config.trigger_period_seconds as i64);
        let banlist_threshold = chrono::Duration::seconds(self.config.banlist_threshold_seconds as i64);
        let hysteresis = self.config.clear_hysteresis_ticks.max(1);

        let mut events = Vec::new();
        {
            let mut users = self.tracker.users.write().await;
            for (email, state) in users.iter_mut() {
                let roster_entry = roster.entries.get(email);
                let whitelisted = self.whitelist.contains(email)
                    || roster_entry.map(|e| e.whitelisted).unwrap_or(false);
                let device_limit = roster_entry.map(|e| e.device_limit);

                if whitelisted || device_limit == Some(0) {
                    if state.violator_since.take().is_some() {
                        events.push(DomainEvent::ViolatorCleared { email: email.clone(), at: now });
                    }
                    state.trigger_times.clear();
                    state.sub_limit_streak = 0;
                    continue;
                }

                let observed = recent_ip_count(state, window, now);
                let over_limit = match device_limit {
                    Some(limit) => observed as u32 > limit,
                    None => false, // unknown user: treated as unlimited
                };

                if over_limit {
                    let limit = device_limit.expect("over_limit implies a known limit");
                    state.sub_limit_streak = 0;
                    state.trigger_times.push(now);
                    state.trigger_times.retain(|t| now - *t <= period);

                    if state.trigger_times.len() as u32 >= self.config.trigger_count
                        && state.violator_since.is_none()
                    {
                        state.violator_since = Some(now);
                        events.push(DomainEvent::ViolatorOnset {
                            email: email.clone(),
                            observed_ips: observed,
                            limit,
                            at: now,
                        });
                    }

                    if let Some(violator_since) = state.violator_since {
                        if state.banlisted_since.is_none() && now - violator_since >= banlist_threshold {
                            state.banlisted_since = Some(now);
                            events.push(DomainEvent::BanlistAdded { email: email.clone(), at: now });
                        }
                    }
                } else {
                    state.sub_limit_streak += 1;
                    if state.sub_limit_streak >= hysteresis {
                        if state.violator_since.take().is_some() {
                            events.push(DomainEvent::ViolatorCleared { email: email.clone(), at: now });
                        }
                        state.trigger_times.clear();
                    }
                }
            }
        }

        self.dispatch(events).await;
    }

    async fn dispatch(&self, events: Vec<DomainEvent>) {
        for event in events {
            match &event {
                DomainEvent::BanlistAdded { email, at } => {
                    if let Err(e) = self.persist_with_retry(|| async {
                        self.persist.upsert(email, *at, "sustained concurrent-IP violation").await
                    }).await {
                        warn!(email = %email, error = %e, "banlist persist failed after retries; in-memory promotion retained");
                        counter!("shareguard_persist_failures_total", 1);
                    }
                    counter!("shareguard_banlist_additions_total", 1);
                }
                DomainEvent::ViolatorOnset { .. } => counter!("shareguard_violator_onsets_total", 1),
                DomainEvent::ViolatorCleared { .. } => counter!("shareguard_violator_cleared_total", 1),
                DomainEvent::BanlistCleared { .. } => {}
            }
            self.notify.send(event.message()).await;
        }
    }

    /// Three attempts with exponential backoff: sink failure never
    /// reverts the in-memory promotion that already happened.
    async fn persist_with_retry<F, Fut>(&self, mut op: F) -> crate::error::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<()>>,
    {
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=3 {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < 3 => {
                    warn!(attempt, error = %e, "persist sink failed, retrying");
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns by attempt 3")
    }

    /// Admin path (`POST /api/banlist/clear`): clear all banlist entries
    /// and emit one `BanlistCleared` per affected email.
    /// The classifier does not auto-unban; this is the only clearing path.
    pub async fn clear_banlist(&self) -> crate::error::Result<Vec<String>> {
        let now = Utc::now();
        let cleared: Vec<String> = {
            let mut users = self.tracker.users.write().await;
            users
                .iter_mut()
                .filter_map(|(email, state)| {
                    if state.banlisted_since.take().is_some() {
                        state.trigger_times.clear();
                        state.violator_since = None;
                        Some(email.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };

        self.persist.clear().await?;

        for email in &cleared {
            self.notify
                .send(DomainEvent::BanlistCleared { email: email.clone(), at: now }.message())
                .await;
        }
        Ok(cleared)
    }
}

impl ClassifierConfig {
    fn classifier_window_seconds(&self) -> u64 {
        self.concurrent_window_seconds
    }
}
