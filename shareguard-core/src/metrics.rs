//! Metric name registration, following the teacher's `describe_counter!`/
//! `describe_gauge!` pattern in main.rs. Call [`describe_all`] once at
//! startup so the Prometheus exporter always advertises HELP text even
//! before the first observation.

use metrics::{describe_counter, describe_gauge};

pub fn describe_all() {
    describe_counter!("shareguard_ingest_accepted_total", "Access-log lines successfully parsed and recorded");
    describe_counter!("shareguard_ingest_rejected_total", "Access-log lines rejected, labeled by reason");
    describe_counter!("shareguard_violator_onsets_total", "Users newly promoted to violator stage");
    describe_counter!("shareguard_violator_cleared_total", "Users whose violator stage cleared via hysteresis");
    describe_counter!("shareguard_banlist_additions_total", "Users newly added to the banlist");
    describe_counter!("shareguard_persist_failures_total", "Persist sink upsert attempts that failed after retries");
    describe_counter!("shareguard_roster_fetch_failures_total", "Panel roster refresh attempts that failed");

    describe_gauge!("shareguard_users_tracked", "Distinct emails currently tracked");
    describe_gauge!("shareguard_shared_ip_keys", "Distinct IPs currently shared by more than one user");
    describe_gauge!("shareguard_roster_users", "Entries in the most recently loaded roster snapshot");
    describe_gauge!("shareguard_ingest_rejected_last_connection", "Rejected lines on the most recently closed ingest connection");
}
