//! Black-box integration tests for the ShareGuard detection engine.
//!
//! Spins up the ingest TCP listener and the query API router against
//! ephemeral ports/in-process requests, wires a seeded roster and no-op
//! sinks, and drives a collector-shaped TCP client the way a real
//! collector would — mirroring the teacher's
//! `mitigation-node/tests/integration_tests.rs` shape (helper functions,
//! ephemeral ports, `tokio::spawn` server tasks) but exercising this
//! crate's ingest -> tracker -> classifier -> query API pipeline end to
//! end (spec.md §8 scenarios).

use axum::body::Body;
use axum::http::{header::AUTHORIZATION, Request, StatusCode};
use chrono::Utc;
use shareguard_core::api::{self, ApiState};
use shareguard_core::classifier::Classifier;
use shareguard_core::config::ClassifierConfig;
use shareguard_core::ingest::{ConnectedNodes, IngestServer};
use shareguard_core::model::RosterEntry;
use shareguard_core::roster::{NullPanelFetcher, RosterCache};
use shareguard_core::secret::Secret;
use shareguard_core::sinks::{NullEnrich, NullNotify, NullPersist};
use shareguard_core::tracker::UserTracker;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

const TOKEN: &str = "test-api-token";

/// Reserve an ephemeral port the way the teacher's `get_available_port`
/// helper does, then hand the address to a server constructed separately
/// (`IngestServer::new` takes an address, not a pre-bound listener).
async fn available_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

struct Harness {
    tracker: Arc<UserTracker>,
    roster: Arc<RosterCache>,
    classifier: Arc<Classifier>,
    ingest_addr: std::net::SocketAddr,
    api: axum::Router,
}

async fn harness(device_limit: u32) -> Harness {
    let tracker = Arc::new(UserTracker::new(200));
    let roster = Arc::new(RosterCache::new(Arc::new(NullPanelFetcher), 200, HashSet::new()));
    roster.set_entries_for_test(HashMap::from([(
        "alice@example.com".to_string(),
        RosterEntry {
            email: "alice@example.com".to_string(),
            device_limit,
            telegram_id: None,
            description: None,
            whitelisted: false,
            stale: false,
        },
    )]));

    let classifier = Arc::new(Classifier::new(
        ClassifierConfig {
            tick_seconds: 1,
            concurrent_window_seconds: 2,
            trigger_period_seconds: 30,
            trigger_count: 5,
            banlist_threshold_seconds: 300,
            clear_hysteresis_ticks: 1,
        },
        Arc::clone(&tracker),
        Arc::clone(&roster),
        Arc::new(NullPersist),
        Arc::new(NullNotify),
        HashSet::new(),
    ));

    let nodes = Arc::new(ConnectedNodes::new());
    let ingest_addr = available_addr().await;
    let requests_seen = Arc::new(AtomicU64::new(0));
    let ingest = Arc::new(IngestServer::with_counter(
        ingest_addr,
        16 * 1024,
        Duration::from_secs(5),
        false,
        Arc::clone(&tracker),
        Arc::clone(&nodes),
        Arc::clone(&requests_seen),
    ));
    tokio::spawn(Arc::clone(&ingest).run());
    // give the accept loop a moment to bind before any client connects
    tokio::time::sleep(Duration::from_millis(20)).await;

    let api_state = ApiState {
        tracker: Arc::clone(&tracker),
        roster: Arc::clone(&roster),
        classifier: Arc::clone(&classifier),
        nodes,
        persist: Arc::new(NullPersist),
        enrich: Arc::new(NullEnrich),
        api_token: Secret::new(TOKEN.to_string()),
        concurrent_window: Duration::from_secs(2),
        requests_seen,
    };
    let api = api::router(api_state, false);

    Harness { tracker, roster, classifier, ingest_addr, api }
}

async fn send_line(addr: std::net::SocketAddr, node: &str, ip: &str, email: &str) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let line = format!(
        "{node}|2026/07/28 10:00:00 from {ip}:54321 accept tcp:example.com:443 email: {email}\n"
    );
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    // leave the connection open briefly so the record is read before drop
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn get(api: &axum::Router, path: &str) -> (StatusCode, serde_json::Value) {
    let response = api
        .clone()
        .oneshot(
            Request::builder()
                .uri(path)
                .header(AUTHORIZATION, format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn benign_traffic_stays_clean_and_counts_distinct_ips() {
    let h = harness(2).await;
    send_line(h.ingest_addr, "node-a", "10.0.0.1", "alice@example.com").await;
    send_line(h.ingest_addr, "node-a", "10.0.0.2", "alice@example.com").await;

    h.classifier.tick(Utc::now()).await;

    let (status, body) = get(&h.api, "/api/users").await;
    assert_eq!(status, StatusCode::OK);
    let alice = body.as_array().unwrap().iter().find(|u| u["email"] == "alice@example.com").unwrap();
    assert_eq!(alice["stage"], "clean");
    assert_eq!(alice["observed_ips"], 2);
}

#[tokio::test]
async fn sustained_overflow_promotes_to_violator_then_banlist() {
    let h = harness(2).await;
    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
        send_line(h.ingest_addr, "node-a", ip, "alice@example.com").await;
    }

    let mut now = Utc::now();
    for _ in 0..5 {
        h.classifier.tick(now).await;
        now += chrono::Duration::seconds(1);
    }

    let (_, violators) = get(&h.api, "/api/violators").await;
    let alice = violators.as_array().unwrap().iter().find(|u| u["email"] == "alice@example.com");
    assert!(alice.is_some(), "alice should be a violator after 5 ticks over the limit");

    now += chrono::Duration::seconds(300);
    h.classifier.tick(now).await;

    let (_, banlist_via_users) = get(&h.api, "/api/users").await;
    let alice = banlist_via_users.as_array().unwrap().iter().find(|u| u["email"] == "alice@example.com").unwrap();
    assert_eq!(alice["stage"], "banlisted");
}

#[tokio::test]
async fn unauthenticated_request_is_rejected_before_touching_state() {
    let h = harness(2).await;
    let response = h
        .api
        .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn shared_ip_view_lists_both_emails_regardless_of_stage() {
    let h = harness(2).await;
    send_line(h.ingest_addr, "node-a", "10.0.0.9", "alice@example.com").await;
    send_line(h.ingest_addr, "node-b", "10.0.0.9", "bob@example.com").await;

    let (status, body) = get(&h.api, "/api/shared_ips").await;
    assert_eq!(status, StatusCode::OK);
    let entry = body.as_array().unwrap().iter().find(|e| e["ip"] == "10.0.0.9").unwrap();
    let emails: Vec<&str> = entry["emails"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    assert!(emails.contains(&"alice@example.com"));
    assert!(emails.contains(&"bob@example.com"));
}

#[tokio::test]
async fn whitelisted_user_never_leaves_clean_under_flood() {
    let h = harness(2).await;
    h.roster.set_entries_for_test(HashMap::from([(
        "alice@example.com".to_string(),
        RosterEntry {
            email: "alice@example.com".to_string(),
            device_limit: 2,
            telegram_id: None,
            description: None,
            whitelisted: true,
            stale: false,
        },
    )]));

    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"] {
        send_line(h.ingest_addr, "node-a", ip, "alice@example.com").await;
    }
    let mut now = Utc::now();
    for _ in 0..10 {
        h.classifier.tick(now).await;
        now += chrono::Duration::seconds(1);
    }

    let (_, body) = get(&h.api, "/api/users").await;
    let alice = body.as_array().unwrap().iter().find(|u| u["email"] == "alice@example.com").unwrap();
    assert_eq!(alice["stage"], "clean");
    let _ = h.tracker.user_count().await; // sanity: harness state still reachable
}

#[tokio::test]
async fn stats_requests_seen_counts_ingested_lines_not_api_calls() {
    let h = harness(2).await;
    send_line(h.ingest_addr, "node-a", "10.0.0.1", "alice@example.com").await;
    send_line(h.ingest_addr, "node-a", "10.0.0.2", "alice@example.com").await;

    // Several authenticated API calls before checking stats: if
    // `requests_seen` were still counting API calls, this would inflate it.
    let _ = get(&h.api, "/api/users").await;
    let _ = get(&h.api, "/api/violators").await;
    let (status, body) = get(&h.api, "/api/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requests_seen"], 2);
}
