//! Message classification and next-hop selection.
//!
//! Every message entering the broker goes through [`Core::route`] in a
//! fixed order: responses follow their recorded route stack back down;
//! requests dispatch locally or push upstream; events climb to the root
//! and fan out; control and keepalive traffic is consumed in place.
//!
//! Route discipline: the originator's identifier is the bottom stack entry;
//! every broker that handles or forwards a request pushes its own uuid, and
//! pops it when the response comes back through. A response whose stack
//! cannot be followed is dropped and counted, never bounced.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use arbor_core::error::ErrorCode;
use arbor_core::message::{Message, MsgKind};

use crate::broker::Core;
use crate::overlay::PARENT_KEY;
use crate::service::{ServiceOwner, ServiceSwitch};

/// Route stacks beyond this depth indicate a routing loop or a pathological
/// topology; such requests are refused.
pub(crate) const MAX_HOPS: usize = 32;

/// What the router wants the broker to do with a classified message.
pub(crate) enum Dispatch {
    /// Fully handled inside the router.
    Done,
    /// Dispatch to a builtin service handler.
    Builtin(crate::service::BuiltinService, Message),
    /// Dispatch to a module's inbox.
    Module(std::sync::Arc<str>, Message),
    /// An event was delivered locally; the broker may run internal hooks.
    LocalEvent(Message),
}

impl Core {
    /// Classify one message. `from` names the peer it arrived from, if any.
    pub(crate) fn route(&mut self, msg: Message, from: Option<&[u8]>) -> Dispatch {
        match msg.kind() {
            MsgKind::Response => {
                self.route_response(msg);
                Dispatch::Done
            }
            MsgKind::Request => self.route_request(msg),
            MsgKind::Event => self.route_event(msg, from),
            MsgKind::Control => {
                self.route_control(&msg, from);
                Dispatch::Done
            }
            MsgKind::Keepalive => Dispatch::Done, // liveness noted at intake
        }
    }

    /// Rule 1: pop our route entry, then deliver locally or forward to the
    /// peer now on top. Unroutable responses are dropped and counted.
    fn route_response(&mut self, mut msg: Message) {
        let own = self.uuid.clone();
        if msg.route_top().map(Bytes::as_ref) != Some(own.as_ref()) {
            trace!(topic = %msg.topic(), "router: response does not name this broker");
            self.overlay.counters.dropped_responses += 1;
            return;
        }
        msg.route_pop();
        if msg.route_len() == 0 {
            self.deliver_pending(msg);
            return;
        }
        let next = msg.route_top().expect("non-empty stack").clone();
        if let Err((code, _)) = self.overlay.send_to(&next, msg) {
            trace!(code = %code, "router: response next hop unreachable");
            self.overlay.counters.dropped_responses += 1;
        }
    }

    /// A response bottomed out here: match it to a locally outstanding RPC.
    fn deliver_pending(&mut self, msg: Message) {
        let tag = msg.matchtag();
        let ends_stream = msg.error().is_some();
        let (delivered, streaming) = match self.pending.get(&tag) {
            Some(pending) => (pending.reply.send(msg).is_ok(), pending.streaming),
            None => {
                trace!(tag, "router: response without outstanding request");
                self.overlay.counters.dropped_responses += 1;
                return;
            }
        };
        if !delivered || !streaming || ends_stream {
            self.pending.remove(&tag);
        }
        if !delivered {
            self.overlay.counters.dropped_responses += 1;
        }
    }

    /// Rules 2 and 3: local dispatch or upstream push.
    fn route_request(&mut self, mut msg: Message) -> Dispatch {
        if msg.route_len() + 1 > MAX_HOPS || msg.route_contains(&self.uuid) {
            warn!(topic = %msg.topic(), hops = msg.route_len(), "router: too many hops");
            self.respond_err(&msg, ErrorCode::Protocol, "too many hops");
            return Dispatch::Done;
        }
        let service = msg.service().to_owned();
        match self.services.lookup(&service).cloned() {
            Some(entry) => {
                if !ServiceSwitch::authorize(&entry, msg.cred()) {
                    debug!(topic = %msg.topic(), userid = msg.cred().userid, "router: permission denied");
                    self.respond_err(&msg, ErrorCode::Permission, "access denied");
                    return Dispatch::Done;
                }
                let owner = entry.owner.clone();
                msg.route_push(self.uuid.clone());
                match owner {
                    ServiceOwner::Builtin(svc) => Dispatch::Builtin(svc, msg),
                    ServiceOwner::Module(name) => Dispatch::Module(name, msg),
                }
            }
            None if self.overlay.has_parent() => {
                msg.route_push(self.uuid.clone());
                if let Err((code, failed)) = self.overlay.send_parent(msg) {
                    self.respond_err(&failed, code, "upstream unreachable");
                }
                Dispatch::Done
            }
            None => {
                self.respond_err(
                    &msg,
                    ErrorCode::MethodNotFound,
                    &format!("unknown service '{service}'"),
                );
                Dispatch::Done
            }
        }
    }

    /// Rule 4: events climb to the root for sequencing, then replicate to
    /// children and local subscribers exactly once.
    fn route_event(&mut self, mut msg: Message, from: Option<&[u8]>) -> Dispatch {
        let from_parent = from == Some(PARENT_KEY);
        if !from_parent && self.overlay.has_parent() {
            // Local or child origin on a non-root rank: keep climbing.
            if self.overlay.send_parent(msg).is_err() {
                self.overlay.counters.dropped_events += 1;
            }
            return Dispatch::Done;
        }
        if from_parent {
            if !self.events.accept(msg.seq()) {
                self.overlay.counters.dropped_events += 1;
                return Dispatch::Done;
            }
        } else {
            // This broker is the root: stamp the sequence.
            let seq = self.events.stamp();
            msg.set_seq(seq);
            self.events.accept(seq);
        }
        self.overlay.broadcast_children(&msg);
        let subscribers = self.events.index.match_topic(msg.topic());
        for peer in subscribers {
            if let Err((code, _)) = self.overlay.send_to(&peer, msg.clone()) {
                trace!(code = %code, "router: event subscriber unreachable");
            }
        }
        Dispatch::LocalEvent(msg)
    }

    fn route_control(&mut self, msg: &Message, from: Option<&[u8]>) {
        match msg.topic() {
            // A child announcing orderly departure; its closure will be
            // offline, not lost.
            "overlay.goodbye" => {
                if let Some(from) = from {
                    self.overlay
                        .mark_status(from, crate::overlay::SubtreeStatus::Offline);
                }
            }
            // A child reporting its aggregated subtree health.
            "overlay.status" => {
                let Some(from) = from else {
                    return;
                };
                if !self
                    .overlay
                    .peer(from)
                    .is_some_and(|p| p.role == crate::overlay::PeerRole::Child)
                {
                    trace!("router: overlay.status from a non-child peer");
                    return;
                }
                let status = msg
                    .payload()
                    .and_then(|p| p.get("status"))
                    .and_then(serde_json::Value::as_str)
                    .and_then(crate::overlay::SubtreeStatus::from_name);
                if let Some(status) = status {
                    self.overlay.mark_status(from, status);
                }
            }
            other => trace!(topic = %other, "router: control consumed"),
        }
    }

    // ------------------------------------------------------------------
    // Response construction
    // ------------------------------------------------------------------

    /// Send a success response to `req` (no-op for fire-and-forget).
    pub(crate) fn respond_ok(&mut self, req: &Message, payload: Option<serde_json::Value>) {
        if req.is_noresponse() {
            return;
        }
        let mut rsp = Message::response_to(req);
        if let Some(payload) = payload {
            rsp = rsp.with_payload(payload);
        }
        self.respond(rsp);
    }

    /// Send a success response carrying raw bytes.
    pub(crate) fn respond_raw(&mut self, req: &Message, raw: Bytes) {
        if req.is_noresponse() {
            return;
        }
        self.respond(Message::response_to(req).with_raw(raw));
    }

    /// Send an error response. Empty `text` sends the bare code.
    pub(crate) fn respond_err(&mut self, req: &Message, code: ErrorCode, text: &str) {
        if req.is_noresponse() {
            return;
        }
        self.overlay.counters.errors_answered += 1;
        let text = if text.is_empty() { None } else { Some(text) };
        self.respond(Message::error_response_to(req, code, text));
    }

    /// A response we originate must carry our own route entry on top, like
    /// any handled request would. Router-level refusals (too many hops,
    /// permission, unknown service) answer before the request was pushed,
    /// so push here if needed.
    fn respond(&mut self, mut rsp: Message) {
        if rsp.route_top().map(Bytes::as_ref) != Some(self.uuid.as_ref()) {
            rsp.route_push(self.uuid.clone());
        }
        self.route_response(rsp);
    }

    /// Route a fully built response.
    pub(crate) fn send_response(&mut self, rsp: Message) {
        self.route_response(rsp);
    }

    /// Push our identifier and send toward the parent. Used for requests
    /// that must go upstream even though the service is registered locally
    /// (`groups.update`, `pmi.exchange`, `join.wait-ready`).
    pub(crate) fn send_upstream(&mut self, mut msg: Message) -> Result<(), ErrorCode> {
        msg.route_push(self.uuid.clone());
        self.overlay.send_parent(msg).map_err(|(code, _)| code)
    }
}
