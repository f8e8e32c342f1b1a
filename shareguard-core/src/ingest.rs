//! C5 — Ingest server.
//!
//! A `TcpListener` accept loop with one task per collector connection.
//! This server never writes back — it reads newline-framed
//! `NODE_NAME|RAW_LINE` records, parses and tags them, and feeds the
//! tracker.

use crate::model::Event;
use crate::parser::{self, RejectReason};
use crate::tracker::UserTracker;
use chrono::Utc;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Last time a named collector node sent a line, surfaced by `GET /api/nodes`.
#[derive(Debug, Clone, Copy)]
pub struct NodeConnection {
    pub addr: SocketAddr,
    pub last_seen: chrono::DateTime<Utc>,
}

#[derive(Default)]
pub struct ConnectedNodes {
    inner: RwLock<HashMap<String, NodeConnection>>,
}

impl ConnectedNodes {
    pub fn new() -> Self {
        Self::default()
    }

    async fn touch(&self, node_id: &str, addr: SocketAddr) {
        let mut nodes = self.inner.write().await;
        nodes.insert(
            node_id.to_string(),
            NodeConnection { addr, last_seen: Utc::now() },
        );
    }

    async fn remove(&self, node_id: &str, addr: SocketAddr) {
        let mut nodes = self.inner.write().await;
        if let Some(existing) = nodes.get(node_id) {
            if existing.addr == addr {
                nodes.remove(node_id);
            }
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, NodeConnection> {
        self.inner.read().await.clone()
    }
}

pub struct IngestServer {
    listen_addr: SocketAddr,
    max_line_bytes: usize,
    idle_timeout: Duration,
    subnet_grouping: bool,
    tracker: Arc<UserTracker>,
    nodes: Arc<ConnectedNodes>,
    /// Total access-log lines successfully parsed and recorded, shared with
    /// the query API's `GET /api/stats` (`requests_seen`). This is a count
    /// of domain traffic, not of query-API calls.
    events_ingested: Arc<AtomicU64>,
}

fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Outcome of reading one newline-delimited record with a bounded buffer.
enum LineOutcome {
    Line(Vec<u8>),
    Eof,
    /// The record exceeded `max_line_bytes` before (or at) the terminating
    /// newline; the connection must be closed (spec.md §4.5, §6).
    Oversize,
}

/// Reads up to and including the next `\n`, never buffering more than
/// roughly `max_bytes` regardless of whether a newline ever arrives — a
/// peer that streams bytes with no newline is bounded the same as one
/// that sends an oversize single record (spec.md §4.5's "enforces a
/// per-line maximum size" is a proactive bound on the buffer, not just a
/// check performed after a full line has already been accumulated).
async fn read_line_bounded(
    reader: &mut BufReader<TcpStream>,
    max_bytes: usize,
) -> std::io::Result<LineOutcome> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() {
                LineOutcome::Eof
            } else {
                LineOutcome::Line(buf)
            });
        }

        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            let consumed = pos + 1;
            if buf.len() + consumed > max_bytes {
                reader.consume(consumed);
                return Ok(LineOutcome::Oversize);
            }
            buf.extend_from_slice(&available[..consumed]);
            reader.consume(consumed);
            return Ok(LineOutcome::Line(buf));
        }

        let consumed = available.len();
        buf.extend_from_slice(available);
        reader.consume(consumed);
        if buf.len() > max_bytes {
            return Ok(LineOutcome::Oversize);
        }
    }
}

impl IngestServer {
    pub fn new(
        listen_addr: SocketAddr,
        max_line_bytes: usize,
        idle_timeout: Duration,
        subnet_grouping: bool,
        tracker: Arc<UserTracker>,
        nodes: Arc<ConnectedNodes>,
    ) -> Self {
        Self::with_counter(
            listen_addr,
            max_line_bytes,
            idle_timeout,
            subnet_grouping,
            tracker,
            nodes,
            Arc::new(AtomicU64::new(0)),
        )
    }

    /// Like [`new`](Self::new), but shares `events_ingested` with a caller
    /// that also wants to read the running total (the query API's
    /// `GET /api/stats`).
    pub fn with_counter(
        listen_addr: SocketAddr,
        max_line_bytes: usize,
        idle_timeout: Duration,
        subnet_grouping: bool,
        tracker: Arc<UserTracker>,
        nodes: Arc<ConnectedNodes>,
        events_ingested: Arc<AtomicU64>,
    ) -> Self {
        Self {
            listen_addr,
            max_line_bytes,
            idle_timeout,
            subnet_grouping,
            tracker,
            nodes,
            events_ingested,
        }
    }

    pub fn events_ingested(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.events_ingested)
    }

    pub async fn run(self: Arc<Self>) -> crate::error::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "ingest server listening for collector connections");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept ingest connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    #[instrument(skip(self, stream), fields(%peer_addr))]
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!("collector connected");
        let mut reader = BufReader::new(stream);
        let mut node_id: Option<String> = None;
        let bytes_rejected = AtomicI64::new(0);

        loop {
            let read = tokio::time::timeout(
                self.idle_timeout,
                read_line_bounded(&mut reader, self.max_line_bytes),
            )
            .await;

            let raw_bytes = match read {
                Ok(Ok(LineOutcome::Eof)) => break,
                Ok(Ok(LineOutcome::Line(bytes))) => bytes,
                Ok(Ok(LineOutcome::Oversize)) => {
                    counter!("shareguard_ingest_rejected_total", 1, "reason" => "oversize");
                    warn!("oversize record, closing connection");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "ingest read error");
                    break;
                }
                Err(_) => {
                    debug!("collector idle timeout");
                    break;
                }
            };

            let line = String::from_utf8_lossy(&raw_bytes);
            let raw = line.trim_end_matches(['\n', '\r']);
            let Some((candidate_node, payload)) = raw.split_once('|') else {
                counter!("shareguard_ingest_rejected_total", 1, "reason" => "malformed");
                continue;
            };

            if node_id.as_deref() != Some(candidate_node) {
                if !is_valid_node_name(candidate_node) {
                    counter!("shareguard_ingest_rejected_total", 1, "reason" => "bad_node_name");
                    warn!(node = candidate_node, "invalid node name, closing connection");
                    break;
                }
                node_id = Some(candidate_node.to_string());
                self.nodes.touch(candidate_node, peer_addr).await;
            } else {
                self.nodes.touch(candidate_node, peer_addr).await;
            }

            match parser::parse_line_bounded(payload, self.max_line_bytes) {
                Ok(parsed) => {
                    let counting_ip = parser::canonicalize_ip(parsed.source_ip, self.subnet_grouping);
                    let event = Event {
                        node_id: candidate_node.to_string(),
                        observed_at: Utc::now(),
                        source_ip: parsed.source_ip,
                        email: parsed.email,
                        protocol: parsed.protocol,
                        destination: parsed.destination,
                        action: parsed.action,
                    };
                    self.tracker.record(&event, counting_ip).await;
                    self.events_ingested.fetch_add(1, Ordering::Relaxed);
                    counter!("shareguard_ingest_accepted_total", 1);
                }
                Err(reason) => {
                    bytes_rejected.fetch_add(1, Ordering::Relaxed);
                    counter!("shareguard_ingest_rejected_total", 1, "reason" => reject_label(reason));
                }
            }
        }

        if let Some(id) = node_id {
            self.nodes.remove(&id, peer_addr).await;
        }
        gauge!("shareguard_ingest_rejected_last_connection", bytes_rejected.load(Ordering::Relaxed) as f64);
        debug!("collector disconnected");
    }
}

fn reject_label(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::Empty => "empty",
        RejectReason::NoEmail => "no_email",
        RejectReason::Malformed => "malformed",
        RejectReason::Oversize => "oversize",
    }
}
