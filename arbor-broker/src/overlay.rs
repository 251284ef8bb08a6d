//! Overlay peer table and health tracking.
//!
//! The overlay owns one channel per directly connected peer: the parent (at
//! most one), child brokers, local modules and local clients. It tracks
//! per-peer liveness (torpidity), child subtree status, and per-kind traffic
//! counters surfaced by `overlay.stats`.
//!
//! Status semantics:
//! - `full`: the child's entire subtree is connected and responsive
//! - `partial`: part of the child's subtree has not joined yet or has gone
//!   offline in an orderly way
//! - `degraded`: part of the child's subtree is lost or torpid
//! - `offline`: child said goodbye and closed (orderly shutdown)
//! - `lost`: child channel closed without a goodbye (crash)
//!
//! Each broker aggregates the health of its own subtree from its children's
//! recorded statuses and reports changes upstream, so a parent's view of a
//! child folds in everything below that child. Torpidity is orthogonal to
//! status at the link level: a peer that produced no frame within the grace
//! window is torpid until its next frame arrives, and a torpid member makes
//! the subtree degraded while it lasts.

use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use tracing::{debug, trace, warn};

use arbor_core::error::ErrorCode;
use arbor_core::message::{Credential, Message, MsgKind};

/// Reserved peer-table key for the upstream parent. The parent's own uuid
/// never appears in route stacks processed here, so a local alias suffices.
pub(crate) const PARENT_KEY: &[u8] = b"#parent";

/// What a directly connected endpoint is to this broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Parent,
    Child,
    Module,
    Client,
}

impl PeerRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
            Self::Module => "module",
            Self::Client => "client",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "parent" => Some(Self::Parent),
            "child" => Some(Self::Child),
            "module" => Some(Self::Module),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

/// Aggregate health of a child subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtreeStatus {
    Full,
    Partial,
    Degraded,
    Offline,
    Lost,
}

impl SubtreeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Lost => "lost",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "full" => Some(Self::Full),
            "partial" => Some(Self::Partial),
            "degraded" => Some(Self::Degraded),
            "offline" => Some(Self::Offline),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }

    /// Lost and offline subtrees are gone for membership purposes.
    #[must_use]
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::Offline | Self::Lost)
    }

    /// The worse of two health readings: degraded beats partial beats full.
    const fn worsen(self, other: Self) -> Self {
        match (self, other) {
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            (Self::Partial, _) | (_, Self::Partial) => Self::Partial,
            _ => Self::Full,
        }
    }
}

/// A monitor notification: subtree status or torpidity changed.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub rank: u32,
    pub status: SubtreeStatus,
    pub torpid: bool,
}

/// A directly connected overlay endpoint.
#[derive(Debug)]
pub struct Peer {
    pub uuid: Bytes,
    pub role: PeerRole,
    pub rank: Option<u32>,
    pub cred: Credential,
    pub status: SubtreeStatus,
    pub torpid: bool,
    pub last_seen: Instant,
    pub last_sent: Instant,
    tx: Sender<Message>,
    /// Services this peer has sent requests to; drives disconnect synthesis.
    pub touched: HashSet<String>,
}

/// Message traffic counters, keyed by (kind, direction) plus outcome
/// counters for drops and losses.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub rx_request: u64,
    pub rx_response: u64,
    pub rx_event: u64,
    pub rx_control: u64,
    pub rx_keepalive: u64,
    pub tx_request: u64,
    pub tx_response: u64,
    pub tx_event: u64,
    pub tx_control: u64,
    pub tx_keepalive: u64,
    pub dropped_responses: u64,
    pub dropped_events: u64,
    pub errors_answered: u64,
    pub peer_lost: u64,
}

impl Counters {
    fn count_rx(&mut self, kind: MsgKind) {
        match kind {
            MsgKind::Request => self.rx_request += 1,
            MsgKind::Response => self.rx_response += 1,
            MsgKind::Event => self.rx_event += 1,
            MsgKind::Control => self.rx_control += 1,
            MsgKind::Keepalive => self.rx_keepalive += 1,
        }
    }

    fn count_tx(&mut self, kind: MsgKind) {
        match kind {
            MsgKind::Request => self.tx_request += 1,
            MsgKind::Response => self.tx_response += 1,
            MsgKind::Event => self.tx_event += 1,
            MsgKind::Control => self.tx_control += 1,
            MsgKind::Keepalive => self.tx_keepalive += 1,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "rx": {
                "request": self.rx_request,
                "response": self.rx_response,
                "event": self.rx_event,
                "control": self.rx_control,
                "keepalive": self.rx_keepalive,
            },
            "tx": {
                "request": self.tx_request,
                "response": self.tx_response,
                "event": self.tx_event,
                "control": self.tx_control,
                "keepalive": self.tx_keepalive,
            },
            "dropped_responses": self.dropped_responses,
            "dropped_events": self.dropped_events,
            "errors_answered": self.errors_answered,
            "peer_lost": self.peer_lost,
        })
    }
}

/// The overlay: peer table, health state and counters.
pub struct Overlay {
    uuid: Bytes,
    grace: Duration,
    peers: HashMap<Bytes, Peer>,
    has_parent: bool,
    /// Children the topology says this broker should have.
    expected_children: usize,
    /// Last aggregate health computed for this broker's own subtree.
    self_status: SubtreeStatus,
    pub counters: Counters,
    monitors: Vec<Sender<MonitorEvent>>,
}

impl Overlay {
    pub(crate) fn new(uuid: Bytes, grace: Duration, expected_children: usize) -> Self {
        Self {
            uuid,
            grace,
            peers: HashMap::new(),
            has_parent: false,
            expected_children,
            self_status: SubtreeStatus::Full,
            counters: Counters::default(),
            monitors: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn uuid(&self) -> &Bytes {
        &self.uuid
    }

    /// Register an external observer of child status and torpidity changes.
    pub fn monitor(&mut self) -> Receiver<MonitorEvent> {
        let (tx, rx) = flume::unbounded();
        self.monitors.push(tx);
        rx
    }

    fn notify_monitors(&mut self, event: &MonitorEvent) {
        self.monitors.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn add_peer(
        &mut self,
        uuid: Bytes,
        role: PeerRole,
        rank: Option<u32>,
        cred: Credential,
        tx: Sender<Message>,
    ) {
        debug!(uuid = %String::from_utf8_lossy(&uuid), role = role.as_str(), ?rank, "overlay: peer up");
        if role == PeerRole::Parent {
            self.has_parent = true;
        }
        let now = Instant::now();
        self.peers.insert(
            uuid.clone(),
            Peer {
                uuid,
                role,
                rank,
                cred,
                status: SubtreeStatus::Full,
                torpid: false,
                last_seen: now,
                last_sent: now,
                tx,
                touched: HashSet::new(),
            },
        );
    }

    pub(crate) fn remove_peer(&mut self, uuid: &[u8]) -> Option<Peer> {
        let peer = self.peers.remove(uuid)?;
        if peer.role == PeerRole::Parent {
            self.has_parent = false;
        }
        debug!(
            uuid = %String::from_utf8_lossy(uuid),
            role = peer.role.as_str(),
            "overlay: peer down"
        );
        Some(peer)
    }

    #[must_use]
    pub(crate) fn peer(&self, uuid: &[u8]) -> Option<&Peer> {
        self.peers.get(uuid)
    }

    pub(crate) fn peer_mut(&mut self, uuid: &[u8]) -> Option<&mut Peer> {
        self.peers.get_mut(uuid)
    }

    #[must_use]
    pub(crate) fn has_parent(&self) -> bool {
        self.has_parent
    }

    /// Live child peers (status not yet gone).
    #[must_use]
    pub(crate) fn child_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.role == PeerRole::Child && !p.status.is_gone())
            .count()
    }

    /// Enqueue a message toward `uuid`.
    ///
    /// # Errors
    ///
    /// `PeerUnreachable` if the peer is unknown or its channel is closed;
    /// the undelivered message comes back with the code.
    pub(crate) fn send_to(
        &mut self,
        uuid: &[u8],
        msg: Message,
    ) -> Result<(), (ErrorCode, Message)> {
        let kind = msg.kind();
        let Some(peer) = self.peers.get_mut(uuid) else {
            return Err((ErrorCode::PeerUnreachable, msg));
        };
        if let Err(failed) = peer.tx.send(msg) {
            return Err((ErrorCode::PeerUnreachable, failed.into_inner()));
        }
        peer.last_sent = Instant::now();
        self.counters.count_tx(kind);
        Ok(())
    }

    /// Enqueue a message to the parent.
    ///
    /// # Errors
    ///
    /// `PeerUnreachable` when there is no live parent channel.
    pub(crate) fn send_parent(&mut self, msg: Message) -> Result<(), (ErrorCode, Message)> {
        self.send_to(PARENT_KEY, msg)
    }

    /// Replicate an event to every child.
    pub(crate) fn broadcast_children(&mut self, msg: &Message) {
        let children: Vec<Bytes> = self
            .peers
            .values()
            .filter(|p| p.role == PeerRole::Child && !p.status.is_gone())
            .map(|p| p.uuid.clone())
            .collect();
        for uuid in children {
            if let Err((code, _)) = self.send_to(&uuid, msg.clone()) {
                trace!(code = %code, "overlay: child broadcast failed");
            }
        }
    }

    /// Record an inbound frame from `uuid`. Any frame clears torpidity.
    ///
    /// Returns the peer's rank if a child just stopped being torpid.
    pub(crate) fn note_inbound(&mut self, uuid: &[u8], kind: MsgKind) -> Option<u32> {
        self.counters.count_rx(kind);
        let mut cleared = None;
        let peer = self.peers.get_mut(uuid)?;
        peer.last_seen = Instant::now();
        if peer.torpid {
            peer.torpid = false;
            if peer.role == PeerRole::Child {
                if let Some(rank) = peer.rank {
                    cleared = Some(MonitorEvent { rank, status: peer.status, torpid: false });
                }
            }
        }
        let event = cleared?;
        debug!(rank = event.rank, "overlay: peer responsive again");
        let rank = event.rank;
        self.notify_monitors(&event);
        Some(rank)
    }

    /// Periodic torpidity sweep; call at most every `grace / 2`.
    ///
    /// Returns ranks of children that newly crossed the grace threshold.
    pub(crate) fn sweep(&mut self) -> Vec<u32> {
        let now = Instant::now();
        let grace = self.grace;
        let mut newly_torpid = Vec::new();
        let mut events = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.role != PeerRole::Child || peer.status.is_gone() || peer.torpid {
                continue;
            }
            if now.duration_since(peer.last_seen) >= grace {
                peer.torpid = true;
                if let Some(rank) = peer.rank {
                    warn!(rank, "overlay: peer is torpid");
                    newly_torpid.push(rank);
                    events.push(MonitorEvent { rank, status: peer.status, torpid: true });
                }
            }
        }
        for event in &events {
            self.notify_monitors(event);
        }
        newly_torpid
    }

    /// True when the upstream link has been send-idle long enough that a
    /// keepalive is due.
    #[must_use]
    pub(crate) fn parent_needs_keepalive(&self, idle: Duration) -> bool {
        self.peers
            .get(PARENT_KEY)
            .is_some_and(|p| p.last_sent.elapsed() >= idle)
    }

    /// Aggregate health of this broker's own subtree, folded from its
    /// children's recorded statuses: a lost or torpid member degrades it,
    /// an offline or not-yet-joined member makes it partial.
    #[must_use]
    pub(crate) fn compute_subtree_status(&self) -> SubtreeStatus {
        let mut agg = SubtreeStatus::Full;
        let mut live = 0usize;
        for peer in self.peers.values().filter(|p| p.role == PeerRole::Child) {
            let view = match peer.status {
                SubtreeStatus::Lost | SubtreeStatus::Degraded => SubtreeStatus::Degraded,
                SubtreeStatus::Offline | SubtreeStatus::Partial => SubtreeStatus::Partial,
                SubtreeStatus::Full if peer.torpid => SubtreeStatus::Degraded,
                SubtreeStatus::Full => SubtreeStatus::Full,
            };
            if !peer.status.is_gone() {
                live += 1;
            }
            agg = agg.worsen(view);
        }
        if live < self.expected_children {
            agg = agg.worsen(SubtreeStatus::Partial);
        }
        agg
    }

    /// Recompute the aggregate; `Some(new)` when it changed since the last
    /// refresh, so the caller knows to report upstream.
    pub(crate) fn refresh_subtree_status(&mut self) -> Option<SubtreeStatus> {
        let status = self.compute_subtree_status();
        if status == self.self_status {
            return None;
        }
        self.self_status = status;
        Some(status)
    }

    /// Mark a child subtree status, notifying monitors on change.
    pub(crate) fn mark_status(&mut self, uuid: &[u8], status: SubtreeStatus) {
        let mut event = None;
        if let Some(peer) = self.peers.get_mut(uuid) {
            if peer.status != status {
                peer.status = status;
                if status == SubtreeStatus::Lost {
                    self.counters.peer_lost += 1;
                }
                if let Some(rank) = peer.rank {
                    event = Some(MonitorEvent { rank, status, torpid: peer.torpid });
                }
            }
        }
        if let Some(event) = event {
            debug!(rank = event.rank, status = event.status.as_str(), "overlay: subtree status");
            self.notify_monitors(&event);
        }
    }

    /// The `overlay.stats` payload.
    #[must_use]
    pub(crate) fn stats_json(&self, epoch: u32) -> serde_json::Value {
        let peers: Vec<serde_json::Value> = self
            .peers
            .values()
            .map(|p| {
                serde_json::json!({
                    "uuid": String::from_utf8_lossy(&p.uuid),
                    "role": p.role.as_str(),
                    "rank": p.rank,
                    "status": p.status.as_str(),
                    "torpid": p.torpid,
                })
            })
            .collect();
        let mut stats = self.counters.to_json();
        stats["peers"] = serde_json::Value::Array(peers);
        stats["epoch"] = serde_json::json!(epoch);
        stats["subtree"] = serde_json::json!(self.compute_subtree_status().as_str());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay() -> Overlay {
        overlay_expecting(0)
    }

    fn overlay_expecting(children: usize) -> Overlay {
        Overlay::new(
            Bytes::from_static(b"broker-under-test"),
            Duration::from_millis(20),
            children,
        )
    }

    fn add_child(ov: &mut Overlay, uuid: &'static [u8], rank: u32) -> Receiver<Message> {
        let (tx, rx) = flume::unbounded();
        ov.add_peer(
            Bytes::from_static(uuid),
            PeerRole::Child,
            Some(rank),
            Credential::default(),
            tx,
        );
        rx
    }

    #[test]
    fn send_and_count() {
        let mut ov = overlay();
        let rx = add_child(&mut ov, b"child-1", 1);

        ov.send_to(b"child-1", Message::keepalive()).unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(ov.counters.tx_keepalive, 1);

        assert_eq!(
            ov.send_to(b"nobody", Message::keepalive()).unwrap_err().0,
            ErrorCode::PeerUnreachable
        );
    }

    #[test]
    fn closed_channel_is_unreachable() {
        let mut ov = overlay();
        let rx = add_child(&mut ov, b"child-1", 1);
        drop(rx);
        assert_eq!(
            ov.send_to(b"child-1", Message::keepalive()).unwrap_err().0,
            ErrorCode::PeerUnreachable
        );
    }

    #[test]
    fn torpidity_flips_and_clears() {
        let mut ov = overlay();
        let _rx = add_child(&mut ov, b"child-1", 1);
        let monitor = ov.monitor();

        // Nothing is torpid before the grace window passes.
        assert!(ov.sweep().is_empty());

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(ov.sweep(), vec![1]);
        let event = monitor.try_recv().unwrap();
        assert!(event.torpid);

        // A second sweep does not re-fire.
        assert!(ov.sweep().is_empty());

        // Any inbound frame clears the bit and notifies.
        assert_eq!(ov.note_inbound(b"child-1", MsgKind::Keepalive), Some(1));
        let event = monitor.try_recv().unwrap();
        assert!(!event.torpid);
    }

    #[test]
    fn lost_status_counts() {
        let mut ov = overlay();
        let _rx = add_child(&mut ov, b"child-1", 1);
        assert_eq!(ov.child_count(), 1);

        ov.mark_status(b"child-1", SubtreeStatus::Lost);
        assert_eq!(ov.counters.peer_lost, 1);
        assert_eq!(ov.child_count(), 0);

        // Re-marking the same status is not a second loss.
        ov.mark_status(b"child-1", SubtreeStatus::Lost);
        assert_eq!(ov.counters.peer_lost, 1);
    }

    #[test]
    fn broadcast_skips_gone_children() {
        let mut ov = overlay();
        let rx1 = add_child(&mut ov, b"child-1", 1);
        let rx2 = add_child(&mut ov, b"child-2", 2);
        ov.mark_status(b"child-2", SubtreeStatus::Offline);

        ov.broadcast_children(&Message::event("heartbeat.pulse"));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn stats_shape() {
        let mut ov = overlay();
        let _rx = add_child(&mut ov, b"child-1", 1);
        let stats = ov.stats_json(7);
        assert_eq!(stats["epoch"], 7);
        assert_eq!(stats["peers"].as_array().unwrap().len(), 1);
        assert_eq!(stats["peer_lost"], 0);
        assert_eq!(stats["subtree"], "full");
    }

    #[test]
    fn status_name_roundtrip() {
        for status in [
            SubtreeStatus::Full,
            SubtreeStatus::Partial,
            SubtreeStatus::Degraded,
            SubtreeStatus::Offline,
            SubtreeStatus::Lost,
        ] {
            assert_eq!(SubtreeStatus::from_name(status.as_str()), Some(status));
        }
        assert_eq!(SubtreeStatus::from_name("bogus"), None);
    }

    #[test]
    fn subtree_aggregation() {
        let mut ov = overlay_expecting(2);
        // Expected children have not joined yet.
        assert_eq!(ov.compute_subtree_status(), SubtreeStatus::Partial);

        let _rx1 = add_child(&mut ov, b"child-1", 1);
        let _rx2 = add_child(&mut ov, b"child-2", 2);
        assert_eq!(ov.compute_subtree_status(), SubtreeStatus::Full);

        // A child whose own subtree is partial makes ours partial.
        ov.mark_status(b"child-2", SubtreeStatus::Partial);
        assert_eq!(ov.compute_subtree_status(), SubtreeStatus::Partial);

        // A loss anywhere below dominates.
        ov.mark_status(b"child-1", SubtreeStatus::Lost);
        assert_eq!(ov.compute_subtree_status(), SubtreeStatus::Degraded);
    }

    #[test]
    fn torpid_child_degrades_subtree() {
        let mut ov = overlay_expecting(1);
        let _rx = add_child(&mut ov, b"child-1", 1);
        assert_eq!(ov.compute_subtree_status(), SubtreeStatus::Full);

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(ov.sweep(), vec![1]);
        assert_eq!(ov.compute_subtree_status(), SubtreeStatus::Degraded);

        ov.note_inbound(b"child-1", MsgKind::Keepalive);
        assert_eq!(ov.compute_subtree_status(), SubtreeStatus::Full);
    }

    #[test]
    fn refresh_reports_only_changes() {
        let mut ov = overlay_expecting(1);
        // Initial aggregate is full; an absent expected child is a change.
        assert_eq!(ov.refresh_subtree_status(), Some(SubtreeStatus::Partial));
        assert_eq!(ov.refresh_subtree_status(), None);

        let _rx = add_child(&mut ov, b"child-1", 1);
        assert_eq!(ov.refresh_subtree_status(), Some(SubtreeStatus::Full));
        assert_eq!(ov.refresh_subtree_status(), None);
    }
}
