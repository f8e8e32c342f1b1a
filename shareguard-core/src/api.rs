//! C6 — Query API.
//!
//! Read-only HTTP surface over the tracker, roster and banlist, gated by a
//! single shared bearer token. The auth middleware checks one fixed token
//! against every request before any handler runs.

use crate::classifier::Classifier;
use crate::ingest::ConnectedNodes;
use crate::model::Stage;
use crate::roster::RosterCache;
use crate::secret::Secret;
use crate::sinks::{EnrichSink, PersistSink};
use crate::tracker::{recent_ip_count, UserTracker};
use axum::extract::{Path, State};
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{extract::Request, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Clone)]
pub struct ApiState {
    pub tracker: Arc<UserTracker>,
    pub roster: Arc<RosterCache>,
    pub classifier: Arc<Classifier>,
    pub nodes: Arc<ConnectedNodes>,
    pub persist: Arc<dyn PersistSink>,
    pub enrich: Arc<dyn EnrichSink>,
    pub api_token: Secret<String>,
    pub concurrent_window: Duration,
    /// Total access-log lines accepted by the ingest server (C5), shared
    /// with `IngestServer` so `GET /api/stats` reports domain traffic
    /// volume rather than query-API call volume.
    pub requests_seen: Arc<AtomicU64>,
}

async fn auth_middleware(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match auth_header {
        Some(auth) if auth.starts_with("Bearer ") => {
            if &auth[7..] == state.api_token.expose_secret().as_str() {
                Ok(next.run(request).await)
            } else {
                warn!("invalid query API token provided");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

pub fn router(state: ApiState, cors_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/users", get(get_users))
        .route("/api/violators", get(get_violators))
        .route("/api/banlist", get(get_banlist))
        .route("/api/banlist/clear", post(post_banlist_clear))
        .route("/api/user/:email", get(get_user_detail))
        .route("/api/nodes", get(get_nodes))
        .route("/api/shared_ips", get(get_shared_ips))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    if cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

#[derive(Serialize)]
struct StatsResponse {
    users_tracked: usize,
    violators: usize,
    roster_users: usize,
    roster_panel_loaded: bool,
    roster_loaded_at: Option<DateTime<Utc>>,
    connected_nodes: usize,
    requests_seen: u64,
}

async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let roster = state.roster.current();
    Json(StatsResponse {
        users_tracked: state.tracker.user_count().await,
        violators: state.tracker.violator_count().await,
        roster_users: roster.entries.len(),
        roster_panel_loaded: roster.panel_loaded,
        roster_loaded_at: roster.loaded_at,
        connected_nodes: state.nodes.snapshot().await.len(),
        requests_seen: state.requests_seen.load(Ordering::Relaxed),
    })
}

#[derive(Serialize)]
struct UserSummary {
    email: String,
    stage: Stage,
    observed_ips: usize,
    device_limit: Option<u32>,
}

async fn get_users(State(state): State<ApiState>) -> Json<Vec<UserSummary>> {
    Json(summarize_users(&state, None).await)
}

async fn get_violators(State(state): State<ApiState>) -> Json<Vec<UserSummary>> {
    Json(summarize_users(&state, Some(&[Stage::Violator, Stage::Banlisted])).await)
}

async fn summarize_users(state: &ApiState, filter: Option<&[Stage]>) -> Vec<UserSummary> {
    let now = Utc::now();
    let roster = state.roster.current();
    let users = state.tracker.users.read().await;
    users
        .iter()
        .filter(|(_, user_state)| match filter {
            Some(stages) => stages.contains(&user_state.stage()),
            None => true,
        })
        .map(|(email, user_state)| UserSummary {
            email: email.clone(),
            stage: user_state.stage(),
            observed_ips: recent_ip_count(user_state, state.concurrent_window, now),
            device_limit: roster.entries.get(email).map(|e| e.device_limit),
        })
        .collect()
}

#[derive(Serialize)]
struct BanlistEntryResponse {
    email: String,
    first_banlisted_at: DateTime<Utc>,
    last_seen_banlisted_at: DateTime<Utc>,
    reason_snapshot: String,
}

async fn get_banlist(State(state): State<ApiState>) -> Result<Json<Vec<BanlistEntryResponse>>, StatusCode> {
    let records = state.persist.load_all().await.map_err(|e| {
        warn!(error = %e, "failed to load banlist");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| BanlistEntryResponse {
                email: r.email,
                first_banlisted_at: r.first_banlisted_at,
                last_seen_banlisted_at: r.last_seen_banlisted_at,
                reason_snapshot: r.reason_snapshot,
            })
            .collect(),
    ))
}

#[derive(Serialize)]
struct BanlistClearResponse {
    cleared: Vec<String>,
}

async fn post_banlist_clear(State(state): State<ApiState>) -> Result<Json<BanlistClearResponse>, StatusCode> {
    let cleared = state.classifier.clear_banlist().await.map_err(|e| {
        warn!(error = %e, "failed to clear banlist");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(BanlistClearResponse { cleared }))
}

#[derive(Serialize)]
struct ObservationResponse {
    ip: String,
    last_seen: DateTime<Utc>,
    node_id: String,
    isp: Option<String>,
}

#[derive(Serialize)]
struct UserDetailResponse {
    email: String,
    stage: Stage,
    observed_ips: usize,
    device_limit: Option<u32>,
    observations: Vec<ObservationResponse>,
    recent_requests: Vec<crate::model::RecentRequest>,
    trigger_count_in_window: usize,
    violator_since: Option<DateTime<Utc>>,
    banlisted_since: Option<DateTime<Utc>>,
}

async fn get_user_detail(
    State(state): State<ApiState>,
    Path(email): Path<String>,
) -> Result<Json<UserDetailResponse>, StatusCode> {
    let now = Utc::now();
    let roster = state.roster.current();
    let users = state.tracker.users.read().await;
    let user_state = users.get(&email).ok_or(StatusCode::NOT_FOUND)?;

    let mut observations = Vec::with_capacity(user_state.observations.len());
    for obs in user_state.observations.values() {
        let isp = state.enrich.lookup_isp(obs.ip).await;
        observations.push(ObservationResponse {
            ip: obs.ip.to_string(),
            last_seen: obs.last_seen,
            node_id: obs.node_id.clone(),
            isp,
        });
    }

    Ok(Json(UserDetailResponse {
        email: email.clone(),
        stage: user_state.stage(),
        observed_ips: recent_ip_count(user_state, state.concurrent_window, now),
        device_limit: roster.entries.get(&email).map(|e| e.device_limit),
        observations,
        recent_requests: user_state.recent_requests.iter().cloned().collect(),
        trigger_count_in_window: user_state.trigger_times.len(),
        violator_since: user_state.violator_since,
        banlisted_since: user_state.banlisted_since,
    }))
}

#[derive(Serialize)]
struct NodeResponse {
    node_id: String,
    addr: String,
    last_seen: DateTime<Utc>,
}

async fn get_nodes(State(state): State<ApiState>) -> Json<Vec<NodeResponse>> {
    let nodes = state.nodes.snapshot().await;
    Json(
        nodes
            .into_iter()
            .map(|(node_id, conn)| NodeResponse {
                node_id,
                addr: conn.addr.to_string(),
                last_seen: conn.last_seen,
            })
            .collect(),
    )
}

#[derive(Serialize)]
struct SharedIpResponse {
    ip: String,
    emails: Vec<String>,
}

async fn get_shared_ips(State(state): State<ApiState>) -> Json<Vec<SharedIpResponse>> {
    let shared: HashMap<_, _> = state.tracker.shared_ips().await;
    Json(
        shared
            .into_iter()
            .map(|(ip, emails)| SharedIpResponse { ip: ip.to_string(), emails })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::config::ClassifierConfig;
    use crate::roster::NullPanelFetcher;
    use crate::sinks::{NullEnrich, NullNotify, NullPersist};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::collections::HashSet;
    use tower::ServiceExt;

    fn state() -> ApiState {
        let tracker = Arc::new(UserTracker::new(200));
        let roster = Arc::new(RosterCache::new(Arc::new(NullPanelFetcher), 200, HashSet::new()));
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
        ApiState {
            tracker,
            roster,
            classifier,
            nodes: Arc::new(ConnectedNodes::new()),
            persist: Arc::new(NullPersist),
            enrich: Arc::new(NullEnrich),
            api_token: Secret::new("test-token".to_string()),
            concurrent_window: Duration::from_secs(2),
            requests_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    #[tokio::test]
    async fn missing_auth_header_is_rejected() {
        let app = router(state(), false);
        let response = app
            .oneshot(HttpRequest::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_reaches_stats_endpoint() {
        let app = router(state(), false);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/stats")
                    .header(AUTHORIZATION, "Bearer test-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_user_detail_returns_404() {
        let app = router(state(), false);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/user/ghost@example.com")
                    .header(AUTHORIZATION, "Bearer test-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
