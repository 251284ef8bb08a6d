//! Broker groups: eventually-consistent named membership sets.
//!
//! Each broker tracks membership for its TBON subtree; the full aggregate
//! lives at rank 0. Membership changes through join and leave requests,
//! which are restricted to the local broker so the recording rank is the
//! requesting rank. An operation on an unknown group creates it; groups are
//! never removed during a session.
//!
//! Contemporaneous joins and leaves are collected per broker for a short
//! window, reduced (same-direction updates union into one), forwarded
//! upstream as a single `groups.update`, then applied locally. The join
//! response is sent on enqueue, strictly before the update propagates.
//!
//! A client disconnect generates leaves for every group its cached join
//! request matches. A lost or offline child subtree generates leaves for
//! all of its ranks. Torpidity feeds the `broker.torpid` group at rank
//! granularity: a subtree root's torpid bit can clear independently of its
//! descendants.

use std::time::Duration;

use hashbrown::HashMap;
use serde_json::json;
use tracing::{debug, warn};

use arbor_core::error::ErrorCode;
use arbor_core::idset::IdSet;
use arbor_core::message::Message;

use crate::broker::{BrokerEvent, Core};
use crate::service::topic_method;

/// The group fed by overlay torpidity tracking.
pub const TORPID_GROUP: &str = "broker.torpid";
/// The group every broker joins when it reaches the run state.
pub const ONLINE_GROUP: &str = "broker.online";

/// One membership delta: ranks plus direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Update {
    pub ranks: IdSet,
    pub set: bool,
}

impl Update {
    pub(crate) fn to_json(&self) -> serde_json::Value {
        json!({ "ranks": self.ranks.encode(), "set": self.set })
    }

    pub(crate) fn from_json(v: &serde_json::Value) -> Option<Self> {
        let ranks = IdSet::decode(v.get("ranks")?.as_str()?).ok()?;
        let set = v.get("set")?.as_bool()?;
        Some(Self { ranks, set })
    }
}

/// Reduce a batch entry: same-direction updates union into one.
///
/// Mixed directions stay as-is; ordering matters there.
pub(crate) fn reduce_updates(updates: Vec<Update>) -> Vec<Update> {
    if updates.len() < 2 {
        return updates;
    }
    let set = updates[0].set;
    if updates.iter().any(|u| u.set != set) {
        return updates;
    }
    let mut ranks = IdSet::new();
    for u in &updates {
        ranks.union_with(&u.ranks);
    }
    vec![Update { ranks, set }]
}

/// Only one client can join a group per broker; its join request is cached
/// so a disconnect can force it back out.
#[derive(Default)]
struct Group {
    members: IdSet,
    join_request: Option<Message>,
    watchers: Vec<Message>,
}

/// The groups subsystem of one broker.
pub(crate) struct Groups {
    groups: HashMap<String, Group>,
    /// Accumulating batch, in arrival order per group.
    batch: Vec<(String, Vec<Update>)>,
    timer_armed: bool,
    /// Generation counter invalidating stale timer expiries.
    gen: u64,
    timeout: Duration,
    self_set: IdSet,
    /// Ranks currently tracked as torpid at this broker.
    torpid: IdSet,
}

impl Groups {
    pub(crate) fn new(rank: u32, timeout: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            batch: Vec::new(),
            timer_armed: false,
            gen: 0,
            timeout,
            self_set: IdSet::single(rank),
            torpid: IdSet::new(),
        }
    }

    pub(crate) fn handle(&mut self, core: &mut Core, msg: Message) {
        let method = topic_method(msg.topic()).to_owned();
        match method.as_str() {
            "join" => self.join(core, &msg),
            "leave" => self.leave(core, &msg),
            "get" => self.get(core, msg),
            "update" => self.update(core, &msg),
            "disconnect" => self.disconnect(core, &msg),
            other => {
                core.respond_err(
                    &msg,
                    ErrorCode::MethodNotFound,
                    &format!("unknown groups method '{other}'"),
                );
            }
        }
    }

    /// `groups.join {name}`: add this broker's rank. Responds before the
    /// membership change propagates.
    fn join(&mut self, core: &mut Core, msg: &Message) {
        let Some(name) = request_name(msg) else {
            core.respond_err(msg, ErrorCode::Protocol, "join needs a group name");
            return;
        };
        if !is_local(msg) {
            core.respond_err(msg, ErrorCode::Protocol, "groups.join is restricted to the local broker");
            return;
        }
        let rank = core.rank();
        let group = self.groups.entry(name.clone()).or_default();
        if group.join_request.is_some() {
            core.respond_err(
                msg,
                ErrorCode::AlreadyMember,
                &format!("rank {rank} is already a member of {name}"),
            );
            return;
        }
        group.join_request = Some(msg.clone());
        let update = Update { ranks: self.self_set.clone(), set: true };
        self.batch_append(core, &name, update);
        core.respond_ok(msg, None);
    }

    /// `groups.leave {name}`: drop this broker's rank.
    fn leave(&mut self, core: &mut Core, msg: &Message) {
        let Some(name) = request_name(msg) else {
            core.respond_err(msg, ErrorCode::Protocol, "leave needs a group name");
            return;
        };
        if !is_local(msg) {
            core.respond_err(msg, ErrorCode::Protocol, "groups.leave is restricted to the local broker");
            return;
        }
        let rank = core.rank();
        match self.groups.get_mut(&name) {
            Some(group) if group.join_request.is_some() => {
                group.join_request = None;
            }
            _ => {
                core.respond_err(
                    msg,
                    ErrorCode::NotMember,
                    &format!("rank {rank} is not a member of {name}"),
                );
                return;
            }
        }
        let update = Update { ranks: self.self_set.clone(), set: false };
        self.batch_append(core, &name, update);
        core.respond_ok(msg, None);
    }

    /// `groups.get {name}`: the authoritative aggregate, rank 0 only.
    /// Streaming requests watch the group until disconnect.
    fn get(&mut self, core: &mut Core, msg: Message) {
        let Some(name) = request_name(&msg) else {
            core.respond_err(&msg, ErrorCode::Protocol, "get needs a group name");
            return;
        };
        if core.rank() != 0 {
            core.respond_err(&msg, ErrorCode::Protocol, "groups.get is only available on rank 0");
            return;
        }
        let group = self.groups.entry(name).or_default();
        let members = group.members.encode();
        let streaming = msg.is_streaming();
        if streaming {
            group.watchers.push(msg.clone());
        }
        core.respond_ok(&msg, Some(json!({ "members": members })));
    }

    /// `groups.update {update}`: batched deltas from a downstream peer.
    /// Internal broker-to-broker RPC, no response expected.
    fn update(&mut self, core: &mut Core, msg: &Message) {
        let Some(obj) = msg.payload().and_then(|p| p.get("update")).and_then(|u| u.as_object())
        else {
            warn!("groups: malformed groups.update request");
            return;
        };
        let obj = obj.clone();
        for (name, entries) in &obj {
            let Some(entries) = entries.as_array() else {
                continue;
            };
            for entry in entries {
                match Update::from_json(entry) {
                    Some(update) => self.batch_append(core, name, update),
                    None => warn!(group = %name, "groups: undecodable batch update"),
                }
            }
        }
    }

    /// Synthetic disconnect: flush pending joins first, then force-leave
    /// every group whose cached join matches the disconnecting client, and
    /// drop its watchers.
    fn disconnect(&mut self, core: &mut Core, msg: &Message) {
        self.flush(core);
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names {
            let Some(group) = self.groups.get_mut(&name) else {
                continue;
            };
            let leaving = group
                .join_request
                .as_ref()
                .is_some_and(|req| msg.disconnect_match(req));
            if leaving {
                group.join_request = None;
            }
            group.watchers.retain(|w| !msg.disconnect_match(w));
            if leaving {
                debug!(group = %name, "groups: auto-leave on disconnect");
                let update = Update { ranks: self.self_set.clone(), set: false };
                self.batch_append(core, &name, update);
            }
        }
    }

    /// Subtree ranks went lost or offline: leave them out of every group
    /// whose membership intersects.
    pub(crate) fn subtree_loss(&mut self, core: &mut Core, ids: &IdSet) {
        self.flush(core);
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names {
            let Some(group) = self.groups.get(&name) else {
                continue;
            };
            let gone = group.members.intersect(ids);
            if !gone.is_empty() {
                debug!(group = %name, ranks = %gone, "groups: auto-leave on subtree loss");
                self.batch_append(core, &name, Update { ranks: gone, set: false });
            }
        }
    }

    /// Track one rank's torpidity in `broker.torpid`. Rank-granular: only a
    /// broker's immediate parent knows how responsive it really is, so the
    /// subtree is never bulk-marked.
    pub(crate) fn torpid_update(&mut self, core: &mut Core, rank: u32, torpid: bool) {
        let set = if torpid && !self.torpid.contains(rank) {
            true
        } else if !torpid && self.torpid.contains(rank) {
            false
        } else {
            return;
        };
        if set {
            self.torpid.insert(rank);
        } else {
            self.torpid.remove(rank);
        }
        self.batch_append(core, TORPID_GROUP, Update { ranks: IdSet::single(rank), set });
    }

    /// Append to the batch, arming the flush timer on first use.
    fn batch_append(&mut self, core: &mut Core, name: &str, update: Update) {
        match self.batch.iter_mut().find(|(n, _)| n == name) {
            Some((_, updates)) => updates.push(update),
            None => self.batch.push((name.to_owned(), vec![update])),
        }
        if !self.timer_armed {
            self.timer_armed = true;
            let gen = self.gen;
            let inbox = core.inbox();
            let timeout = self.timeout;
            compio::runtime::spawn(async move {
                compio::time::sleep(timeout).await;
                let _ = inbox.send(BrokerEvent::GroupsTimer { gen });
            })
            .detach();
        }
    }

    /// Timer expiry; stale generations are ignored.
    pub(crate) fn on_timer(&mut self, core: &mut Core, gen: u64) {
        if gen == self.gen && self.timer_armed {
            self.flush(core);
        }
    }

    /// Reduce, forward upstream, apply locally, notify watchers.
    pub(crate) fn flush(&mut self, core: &mut Core) {
        self.timer_armed = false;
        self.gen += 1;
        if self.batch.is_empty() {
            return;
        }
        let batch: Vec<(String, Vec<Update>)> = std::mem::take(&mut self.batch)
            .into_iter()
            .map(|(name, updates)| (name, reduce_updates(updates)))
            .collect();

        if core.rank() > 0 {
            let mut update_obj = serde_json::Map::new();
            for (name, updates) in &batch {
                let arr: Vec<serde_json::Value> = updates.iter().map(Update::to_json).collect();
                update_obj.insert(name.clone(), serde_json::Value::Array(arr));
            }
            let msg = Message::request("groups.update")
                .noresponse()
                .with_payload(json!({ "update": update_obj }));
            if let Err(e) = core.send_upstream(msg) {
                warn!(error = %e, "groups: error sending groups.update upstream");
            }
        }

        for (name, updates) in batch {
            let group = self.groups.entry(name.clone()).or_default();
            for update in updates {
                if update.set {
                    group.members.union_with(&update.ranks);
                } else {
                    group.members.subtract(&update.ranks);
                }
            }
            // Watchers observe every commit for the group, in batch order.
            let members = group.members.encode();
            let watchers = group.watchers.clone();
            for watcher in &watchers {
                core.respond_ok(watcher, Some(json!({ "members": members })));
            }
        }
    }

}

fn request_name(msg: &Message) -> Option<String> {
    msg.payload()?.get("name")?.as_str().map(str::to_owned)
}

/// A request is local when it traversed no other broker: at most the
/// originator's entry plus this broker's.
fn is_local(msg: &Message) -> bool {
    msg.route_len() <= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(s: &str) -> IdSet {
        IdSet::decode(s).unwrap()
    }

    #[test]
    fn update_json_roundtrip() {
        let update = Update { ranks: ids("0-2,5"), set: true };
        let decoded = Update::from_json(&update.to_json()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn update_json_rejects_garbage() {
        assert!(Update::from_json(&json!({ "ranks": "x-y", "set": true })).is_none());
        assert!(Update::from_json(&json!({ "set": true })).is_none());
        assert!(Update::from_json(&json!({ "ranks": "0" })).is_none());
    }

    #[test]
    fn reduce_same_direction() {
        let reduced = reduce_updates(vec![
            Update { ranks: ids("0"), set: true },
            Update { ranks: ids("1"), set: true },
            Update { ranks: ids("4-5"), set: true },
        ]);
        assert_eq!(reduced, vec![Update { ranks: ids("0-1,4-5"), set: true }]);
    }

    #[test]
    fn reduce_keeps_mixed_directions() {
        let mixed = vec![
            Update { ranks: ids("0"), set: true },
            Update { ranks: ids("0"), set: false },
        ];
        assert_eq!(reduce_updates(mixed.clone()), mixed);
    }

    #[test]
    fn reduce_single_passthrough() {
        let one = vec![Update { ranks: ids("3"), set: false }];
        assert_eq!(reduce_updates(one.clone()), one);
    }
}
