//! PMI bootstrap exchange: tree-reduced dictionary union.
//!
//! Every rank contributes a key→string dictionary; every rank gets the
//! union back. Contributions gather up a k-ary reduction tree (the same
//! shape as the overlay): a broker merges its local contribution with one
//! request from each tree child, sends a single request to its parent, and
//! unwinds the aggregate down the cached reply paths once the root
//! completes.
//!
//! One exchange is in flight at a time; a local contribution arriving while
//! one runs is queued and starts the next exchange. On key collision the
//! last merge wins, which is stable within a single exchange because merge
//! order is local-then-children in arrival order.

use std::collections::VecDeque;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use arbor_core::error::ErrorCode;
use arbor_core::kary;
use arbor_core::message::Message;

use crate::broker::{BrokerEvent, Core};
use crate::overlay::PeerRole;

struct Session {
    dict: Map<String, Value>,
    child_requests: Vec<Message>,
    local_request: Option<Message>,
    parent_sent: bool,
    parent_done: bool,
    has_error: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            dict: Map::new(),
            child_requests: Vec::new(),
            local_request: None,
            parent_sent: false,
            parent_done: false,
            has_error: false,
        }
    }

    fn merge(&mut self, msg: &Message) -> bool {
        match msg.payload().and_then(Value::as_object) {
            Some(dict) => {
                for (k, v) in dict {
                    self.dict.insert(k.clone(), v.clone());
                }
                true
            }
            None => false,
        }
    }
}

/// Per-broker exchange coordinator.
pub(crate) struct PmiExchange {
    child_count: usize,
    session: Option<Session>,
    queued: VecDeque<Message>,
}

impl PmiExchange {
    pub(crate) fn new(k: u32, size: u32, rank: u32) -> Self {
        Self {
            child_count: kary::child_count(k, size, rank),
            session: None,
            queued: VecDeque::new(),
        }
    }

    /// Handle a `pmi.exchange` request from a local client or a tree child.
    pub(crate) fn handle(&mut self, core: &mut Core, msg: Message) {
        let from_child = msg
            .sender()
            .and_then(|uuid| core.overlay.peer(uuid))
            .is_some_and(|peer| peer.role == PeerRole::Child);
        if from_child {
            self.handle_child(core, msg);
        } else {
            self.handle_local(core, msg);
        }
    }

    fn handle_child(&mut self, core: &mut Core, msg: Message) {
        let session = self.session.get_or_insert_with(Session::new);
        if session.child_requests.len() == self.child_count {
            core.respond_err(&msg, ErrorCode::Protocol, "exchange received too many child requests");
            return;
        }
        if !session.merge(&msg) {
            core.respond_err(&msg, ErrorCode::Protocol, "exchange request lacks a dictionary");
            return;
        }
        session.child_requests.push(msg);
        self.process(core);
    }

    fn handle_local(&mut self, core: &mut Core, msg: Message) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.local_request.is_some())
        {
            // Serialize concurrent exchanges: this one waits its turn.
            debug!("pmi: exchange in flight, queueing");
            self.queued.push_back(msg);
            return;
        }
        let session = self.session.get_or_insert_with(Session::new);
        if !session.merge(&msg) {
            core.respond_err(&msg, ErrorCode::Protocol, "exchange request lacks a dictionary");
            return;
        }
        session.local_request = Some(msg);
        self.process(core);
    }

    /// The parent's aggregate (or failure) came back.
    pub(crate) fn on_parent_reply(&mut self, core: &mut Core, msg: &Message) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(err) = msg.error() {
            warn!(code = %err.code, "pmi: parent exchange failed");
            session.has_error = true;
        } else if let Some(aggregate) = msg.payload().and_then(Value::as_object) {
            // The root's dictionary is authoritative for the whole session.
            session.dict = aggregate.clone();
            session.parent_done = true;
        } else {
            session.has_error = true;
        }
        self.process(core);
    }

    fn process(&mut self, core: &mut Core) {
        let (gathered, has_error) = match &self.session {
            None => return,
            Some(s) => (
                s.local_request.is_some() && s.child_requests.len() >= self.child_count,
                s.has_error,
            ),
        };
        if has_error {
            self.finish(core, true);
            return;
        }
        // Awaiting self or child input?
        if !gathered {
            return;
        }
        if core.rank() > 0 {
            if !self.parent_sent() {
                if let Err(()) = self.send_parent_request(core) {
                    self.finish(core, true);
                    return;
                }
            }
            if !self.session.as_ref().is_some_and(|s| s.parent_done) {
                return;
            }
        }
        self.finish(core, false);
    }

    fn parent_sent(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.parent_sent)
    }

    fn send_parent_request(&mut self, core: &mut Core) -> Result<(), ()> {
        let Some(session) = self.session.as_mut() else {
            return Err(());
        };
        session.parent_sent = true;
        let (tag, reply) = core.rpc_register(false);
        let request = Message::request("pmi.exchange")
            .with_matchtag(tag)
            .with_payload(Value::Object(session.dict.clone()));
        if core.send_upstream(request).is_err() {
            warn!("pmi: error sending exchange request upstream");
            session.has_error = true;
            return Err(());
        }
        let inbox = core.inbox();
        compio::runtime::spawn(async move {
            if let Ok(msg) = reply.recv_async().await {
                let _ = inbox.send(BrokerEvent::PmiParentReply(msg));
            }
        })
        .detach();
        Ok(())
    }

    fn finish(&mut self, core: &mut Core, failed: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        let aggregate = Value::Object(session.dict);
        for req in &session.child_requests {
            if failed {
                core.respond_err(req, ErrorCode::Internal, "exchange failed");
            } else {
                core.respond_ok(req, Some(aggregate.clone()));
            }
        }
        if let Some(req) = &session.local_request {
            if failed {
                core.respond_err(req, ErrorCode::Internal, "exchange failed");
            } else {
                core.respond_ok(req, Some(aggregate));
            }
        }
        // A queued contribution starts the next exchange.
        if let Some(next) = self.queued.pop_front() {
            self.handle_local(core, next);
        }
    }
}
