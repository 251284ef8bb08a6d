//! Event sequencing and prefix subscriptions.
//!
//! Events published anywhere in the tree travel to the root, which stamps a
//! monotonically increasing sequence number (carried in the otherwise unused
//! matchtag field) and broadcasts down. Each broker delivers an event at
//! most once, dropping sequences it has already seen, so replicated fanout
//! cannot storm.
//!
//! Subscriptions are topic prefixes held in a sorted table: the match scan
//! walks forward and exits early once a prefix sorts past the topic.

use bytes::Bytes;
use smallvec::SmallVec;

#[derive(Debug, Clone)]
struct Subscription {
    prefix: String,
    /// Inline up to 4 peers without heap allocation (common low fanout).
    peers: SmallVec<[Bytes; 4]>,
}

/// Sorted prefix table of event subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    subs: Vec<Subscription>,
}

impl SubscriptionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, peer: Bytes, prefix: &str) {
        match self.subs.binary_search_by(|s| s.prefix.as_str().cmp(prefix)) {
            Ok(idx) => {
                let peers = &mut self.subs[idx].peers;
                if !peers.contains(&peer) {
                    peers.push(peer);
                }
            }
            Err(idx) => {
                let mut peers = SmallVec::<[Bytes; 4]>::new();
                peers.push(peer);
                self.subs.insert(
                    idx,
                    Subscription { prefix: prefix.to_owned(), peers },
                );
            }
        }
    }

    pub fn unsubscribe(&mut self, peer: &[u8], prefix: &str) {
        if let Ok(idx) = self.subs.binary_search_by(|s| s.prefix.as_str().cmp(prefix)) {
            let peers = &mut self.subs[idx].peers;
            if let Some(pos) = peers.iter().position(|p| p.as_ref() == peer) {
                peers.swap_remove(pos);
            }
            if peers.is_empty() {
                self.subs.remove(idx);
            }
        }
    }

    /// Remove `peer` from every prefix (used on disconnect).
    pub fn remove_peer(&mut self, peer: &[u8]) {
        let mut i = 0usize;
        while i < self.subs.len() {
            let peers = &mut self.subs[i].peers;
            if let Some(pos) = peers.iter().position(|p| p.as_ref() == peer) {
                peers.swap_remove(pos);
            }
            if peers.is_empty() {
                self.subs.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Peers subscribed to a prefix of `topic`, deduplicated.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> SmallVec<[Bytes; 8]> {
        let mut out: SmallVec<[Bytes; 8]> = SmallVec::new();
        for sub in &self.subs {
            // Sorted prefixes: once past the topic nothing later can match.
            if sub.prefix.as_str() > topic {
                break;
            }
            if topic.starts_with(&sub.prefix) {
                out.extend(sub.peers.iter().cloned());
            }
        }
        if out.len() > 1 {
            out.sort_unstable();
            out.dedup();
        }
        out
    }
}

/// Per-broker event state: sequence assignment (root) and dedup (everyone).
#[derive(Debug, Default)]
pub struct EventState {
    next_seq: u32,
    last_seq: u32,
    pub index: SubscriptionIndex,
}

impl EventState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root only: assign the next sequence number.
    pub fn stamp(&mut self) -> u32 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Dedup filter: true when `seq` has not been delivered here yet.
    pub fn accept(&mut self, seq: u32) -> bool {
        if seq <= self.last_seq {
            return false;
        }
        self.last_seq = seq;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &'static [u8]) -> Bytes {
        Bytes::from_static(id)
    }

    #[test]
    fn subscribe_and_match() {
        let mut idx = SubscriptionIndex::new();
        idx.subscribe(peer(b"a"), "heartbeat.");
        idx.subscribe(peer(b"b"), "heartbeat.pulse");
        idx.subscribe(peer(b"c"), "shutdown.");

        let m = idx.match_topic("heartbeat.pulse");
        assert_eq!(m.len(), 2);

        let m = idx.match_topic("shutdown.all");
        assert_eq!(m.as_slice(), &[peer(b"c")]);

        assert!(idx.match_topic("job.submit").is_empty());
    }

    #[test]
    fn nested_prefixes_dedup() {
        let mut idx = SubscriptionIndex::new();
        idx.subscribe(peer(b"a"), "");
        idx.subscribe(peer(b"a"), "heartbeat.");
        assert_eq!(idx.match_topic("heartbeat.pulse").len(), 1);
    }

    #[test]
    fn empty_prefix_matches_everything() {
        let mut idx = SubscriptionIndex::new();
        idx.subscribe(peer(b"a"), "");
        assert_eq!(idx.match_topic("anything.at.all").len(), 1);
    }

    #[test]
    fn remove_peer_cleans_entries() {
        let mut idx = SubscriptionIndex::new();
        idx.subscribe(peer(b"a"), "x.");
        idx.subscribe(peer(b"b"), "x.");
        idx.subscribe(peer(b"a"), "y.");
        idx.remove_peer(b"a");
        assert_eq!(idx.match_topic("x.1").as_slice(), &[peer(b"b")]);
        assert!(idx.match_topic("y.1").is_empty());
    }

    #[test]
    fn sequence_dedup() {
        let mut ev = EventState::new();
        assert_eq!(ev.stamp(), 1);
        assert_eq!(ev.stamp(), 2);

        assert!(ev.accept(1));
        assert!(!ev.accept(1)); // replicated duplicate
        assert!(ev.accept(2));
        assert!(!ev.accept(1)); // stale
    }
}
