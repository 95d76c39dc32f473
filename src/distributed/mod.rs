//! Peer status aggregation and command relay.
//!
//! Every instance pushes its own program statuses to the configured peers
//! and pulls theirs. What we know about a peer is a cached view: it is never
//! authoritative and it goes stale instead of disappearing when the peer
//! stops answering.

mod http;

pub use self::http::HttpTransport;

use crate::configs::{is_valid_name, DistributedConfig, PeerConfig};
use crate::error::PeerError;
use crate::process::types::{Control, ProgramState, ProgramStatus};
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upper bound on peers that are not configured but pushed reports to us.
pub const MAX_REPORTED_PEERS: usize = 64;

/// Statuses of every program on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub programs: Vec<ProgramStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerView {
    pub peer: String,
    pub url: Option<String>,
    pub programs: Vec<ProgramStatus>,
    pub last_seen: Option<DateTime<Utc>>,
    pub stale: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStatus {
    pub node: String,
    pub programs: Vec<ProgramStatus>,
    pub peers: Vec<PeerView>,
}

/// How we talk to peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn fetch_status(&self, peer: &PeerConfig) -> Result<NodeStatus, PeerError>;

    async fn push_status(&self, peer: &PeerConfig, status: &NodeStatus) -> Result<(), PeerError>;

    async fn send_command(
        &self,
        peer: &PeerConfig,
        program: &str,
        control: Control,
    ) -> Result<ProgramState, PeerError>;
}

#[derive(Debug, Default)]
struct PeerEntry {
    programs: Vec<ProgramStatus>,
    last_seen: Option<DateTime<Utc>>,
    /// Order of the last status received, for eviction.
    sequence: u64,
    last_error: Option<String>,
}

pub struct Distributed {
    node_id: String,
    peers: Vec<PeerConfig>,
    publish_interval: Duration,
    stale_after: Duration,
    request_timeout: Duration,
    supervisor: Arc<Supervisor>,
    transport: Arc<dyn PeerTransport>,
    views: RwLock<HashMap<String, PeerEntry>>,
    received: AtomicU64,
}

impl Distributed {
    pub fn new(
        config: &DistributedConfig,
        supervisor: Arc<Supervisor>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            peers: config.peers.clone(),
            publish_interval: config.publish_interval,
            stale_after: config.stale_after,
            request_timeout: config.request_timeout,
            supervisor,
            transport,
            views: RwLock::new(HashMap::new()),
            received: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_status(&self) -> NodeStatus {
        NodeStatus {
            node: self.node_id.clone(),
            programs: self.supervisor.statuses(),
        }
    }

    /// Pushes local statuses to every peer. Failures are logged and recorded
    /// against the peer, never returned.
    #[instrument(skip(self))]
    pub async fn publish_local_statuses(&self) -> usize {
        let status = self.local_status();
        let results = join_all(self.peers.iter().map(|peer| {
            let status = &status;
            async move {
                let result = self
                    .bounded(&peer.id, self.transport.push_status(peer, status))
                    .await;
                (peer, result)
            }
        }))
        .await;

        let mut delivered = 0;
        for (peer, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(peer = %peer.id, %err, "Publishing statuses failed");
                    self.record_error(&peer.id, &err);
                }
            }
        }
        debug!(delivered, "Published statuses");
        delivered
    }

    #[instrument(skip(self))]
    pub async fn query_peer(&self, peer_id: &str) -> Result<PeerView, PeerError> {
        let peer = self.peer(peer_id)?;
        match self
            .bounded(&peer.id, self.transport.fetch_status(peer))
            .await
        {
            Ok(status) => {
                if status.node != peer.id {
                    debug!(reported = %status.node, "Peer reports a different node id");
                }
                self.record_status(&peer.id, status.programs);
            }
            Err(err) => {
                warn!(%err, "Querying peer failed");
                self.record_error(&peer.id, &err);
                return Err(err);
            }
        }
        self.view(&peer.id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))
    }

    /// Relays a command to a program hosted on a peer. The peer's own state
    /// machine decides whether it is accepted.
    #[instrument(skip(self))]
    pub async fn forward_command(
        &self,
        peer_id: &str,
        program: &str,
        control: Control,
    ) -> Result<ProgramState, PeerError> {
        let peer = self.peer(peer_id)?;
        // The name becomes a path segment on the peer.
        if !is_valid_name(program) {
            return Err(PeerError::InvalidProgram(program.to_string()));
        }
        let result = self
            .bounded(&peer.id, self.transport.send_command(peer, program, control))
            .await;
        match &result {
            Ok(state) => info!(%state, "Peer accepted command"),
            Err(err @ (PeerError::Unreachable { .. } | PeerError::Timeout { .. })) => {
                self.record_error(&peer.id, err)
            }
            Err(err) => info!(%err, "Peer rejected command"),
        }
        result
    }

    /// Stores a status report pushed by a peer. Reports claiming to be this
    /// node are dropped.
    pub fn receive_report(&self, status: NodeStatus) -> bool {
        if status.node == self.node_id {
            warn!("Ignoring status report carrying our own node id");
            return false;
        }
        debug!(peer = %status.node, programs = status.programs.len(), "Received status report");
        if !self.is_configured(&status.node) {
            self.make_room_for(&status.node);
        }
        self.record_status(&status.node, status.programs);
        true
    }

    /// Configured peers first, in configuration order, then peers only known
    /// from their reports.
    pub fn peer_views(&self) -> Vec<PeerView> {
        let views = self.views.read();
        let mut result: Vec<PeerView> = self
            .peers
            .iter()
            .map(|peer| self.render(&peer.id, views.get(&peer.id)))
            .collect();
        let mut extra: Vec<&String> = views.keys().filter(|id| !self.is_configured(id)).collect();
        extra.sort();
        result.extend(extra.into_iter().map(|id| self.render(id, views.get(id))));
        result
    }

    pub fn aggregated(&self) -> AggregatedStatus {
        AggregatedStatus {
            node: self.node_id.clone(),
            programs: self.supervisor.statuses(),
            peers: self.peer_views(),
        }
    }

    pub async fn refresh_peers(&self) {
        join_all(self.peers.iter().map(|peer| self.query_peer(&peer.id))).await;
    }

    /// Publishes and refreshes every `publish-interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.peers.is_empty() {
            info!("No peers configured");
            return;
        }
        let mut interval = tokio::time::interval(self.publish_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.publish_local_statuses().await;
                    self.refresh_peers().await;
                }
            }
        }
        info!("Peer sync stopped");
    }

    fn is_configured(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|peer| peer.id == peer_id)
    }

    /// Peers only known from their reports are capped; the one heard from
    /// least recently is forgotten first.
    fn make_room_for(&self, peer_id: &str) {
        let mut views = self.views.write();
        if views.contains_key(peer_id) {
            return;
        }
        let reported: Vec<(&String, u64)> = views
            .iter()
            .filter(|(id, _)| !self.is_configured(id))
            .map(|(id, entry)| (id, entry.sequence))
            .collect();
        if reported.len() < MAX_REPORTED_PEERS {
            return;
        }
        let oldest = reported
            .into_iter()
            .min_by_key(|(_, sequence)| *sequence)
            .map(|(id, _)| id.clone());
        if let Some(oldest) = oldest {
            debug!(peer = %oldest, "Forgetting unconfigured peer");
            views.remove(&oldest);
        }
    }

    fn peer(&self, peer_id: &str) -> Result<&PeerConfig, PeerError> {
        self.peers
            .iter()
            .find(|peer| peer.id == peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))
    }

    async fn bounded<T>(
        &self,
        peer_id: &str,
        request: impl Future<Output = Result<T, PeerError>>,
    ) -> Result<T, PeerError> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .unwrap_or_else(|_| {
                Err(PeerError::Timeout {
                    peer: peer_id.to_string(),
                })
            })
    }

    fn record_status(&self, peer_id: &str, programs: Vec<ProgramStatus>) {
        let mut views = self.views.write();
        let entry = views.entry(peer_id.to_string()).or_default();
        entry.programs = programs;
        entry.last_seen = Some(Utc::now());
        entry.sequence = self.received.fetch_add(1, Ordering::Relaxed);
        entry.last_error = None;
    }

    /// Keeps the last known programs; only the error is updated.
    fn record_error(&self, peer_id: &str, err: &PeerError) {
        let mut views = self.views.write();
        views.entry(peer_id.to_string()).or_default().last_error = Some(err.to_string());
    }

    fn view(&self, peer_id: &str) -> Option<PeerView> {
        let views = self.views.read();
        views.get(peer_id).map(|entry| self.render(peer_id, Some(entry)))
    }

    fn render(&self, peer_id: &str, entry: Option<&PeerEntry>) -> PeerView {
        let url = self
            .peers
            .iter()
            .find(|peer| peer.id == peer_id)
            .map(|peer| peer.url.clone());
        let last_seen = entry.and_then(|entry| entry.last_seen);
        let stale = match last_seen {
            Some(seen) => (Utc::now() - seen)
                .to_std()
                .map(|age| age > self.stale_after)
                .unwrap_or(false),
            None => true,
        };
        PeerView {
            peer: peer_id.to_string(),
            url,
            programs: entry.map(|entry| entry.programs.clone()).unwrap_or_default(),
            last_seen,
            stale,
            last_error: entry.and_then(|entry| entry.last_error.clone()),
        }
    }
}
