//! Local client handle.
//!
//! A client is an ordinary overlay peer with role `client`: it connects to
//! a broker's endpoint, allocates matchtags for its requests, and reads
//! responses and events off a single receive channel. Demultiplexing is
//! the client's business: responses are paired by matchtag (buffered when
//! they arrive out of order), events queue separately.
//!
//! Dropping the handle disconnects; the broker then auto-leaves any groups
//! this client joined and cancels its streaming RPCs.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use tracing::trace;

use arbor_core::error::ErrorCode;
use arbor_core::message::{role, Credential, Message, MsgKind};

use crate::error::{BrokerError, Result};
use crate::link;
use crate::overlay::PeerRole;

/// Handle to one broker connection.
///
/// Single-task use: the handle is not `Sync` and expects to be driven from
/// one task, mirroring the broker's cooperative model.
pub struct Client {
    uuid: Bytes,
    cred: Credential,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    next_tag: Cell<u32>,
    /// Out-of-order responses, keyed by matchtag.
    buffered: RefCell<HashMap<u32, VecDeque<Message>>>,
    /// Matchtags whose RPC timed out; late responses are dropped.
    dead_tags: RefCell<HashSet<u32>>,
    events: RefCell<VecDeque<Message>>,
}

impl Client {
    /// Connect to a broker endpoint with the default (owner) credential.
    ///
    /// # Errors
    ///
    /// Fails when nothing is bound at `endpoint`.
    pub fn connect(endpoint: &str) -> Result<Self> {
        Self::connect_with(endpoint, Credential::new(0, role::OWNER | role::USER))
    }

    /// Connect with an explicit credential.
    ///
    /// # Errors
    ///
    /// Fails when nothing is bound at `endpoint`.
    pub fn connect_with(endpoint: &str, cred: Credential) -> Result<Self> {
        let uuid = link::new_uuid();
        let (tx, rx) = link::connect(endpoint, uuid.clone(), PeerRole::Client, None, cred)?;
        Ok(Self {
            uuid,
            cred,
            tx,
            rx,
            next_tag: Cell::new(0),
            buffered: RefCell::new(HashMap::new()),
            dead_tags: RefCell::new(HashSet::new()),
            events: RefCell::new(VecDeque::new()),
        })
    }

    #[must_use]
    pub fn uuid(&self) -> &Bytes {
        &self.uuid
    }

    fn alloc_tag(&self) -> u32 {
        let tag = self.next_tag.get().wrapping_add(1).max(1);
        self.next_tag.set(tag);
        tag
    }

    fn build_request(
        &self,
        topic: &str,
        payload: Option<serde_json::Value>,
        raw: Option<Bytes>,
        streaming: bool,
    ) -> (u32, Message) {
        let tag = self.alloc_tag();
        let mut msg = Message::request(topic)
            .with_matchtag(tag)
            .with_cred(self.cred);
        if let Some(payload) = payload {
            msg = msg.with_payload(payload);
        }
        if let Some(raw) = raw {
            msg = msg.with_raw(raw);
        }
        if streaming {
            msg = msg.streaming();
        }
        msg.route_push(self.uuid.clone());
        (tag, msg)
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| BrokerError::ChannelClosed("broker connection"))
    }

    /// One request, one response.
    ///
    /// # Errors
    ///
    /// Error responses surface as [`BrokerError::Rpc`].
    pub async fn request(
        &self,
        topic: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<Message> {
        let (tag, msg) = self.build_request(topic, payload, None, false);
        self.send(msg)?;
        BrokerError::check(self.recv_matching(tag).await?)
    }

    /// One request carrying raw bytes, one response.
    ///
    /// # Errors
    ///
    /// Error responses surface as [`BrokerError::Rpc`].
    pub async fn request_raw(&self, topic: &str, raw: impl Into<Bytes>) -> Result<Message> {
        let (tag, msg) = self.build_request(topic, None, Some(raw.into()), false);
        self.send(msg)?;
        BrokerError::check(self.recv_matching(tag).await?)
    }

    /// Like [`Client::request`] with a deadline. On expiry the matchtag is
    /// retired and any late response is dropped.
    ///
    /// # Errors
    ///
    /// `Timeout` on expiry; error responses surface as `Rpc`.
    pub async fn request_with_deadline(
        &self,
        topic: &str,
        payload: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<Message> {
        let (tag, msg) = self.build_request(topic, payload, None, false);
        self.send(msg)?;
        match compio::time::timeout(deadline, self.recv_matching(tag)).await {
            Ok(result) => BrokerError::check(result?),
            Err(_) => {
                self.dead_tags.borrow_mut().insert(tag);
                self.buffered.borrow_mut().remove(&tag);
                Err(BrokerError::Rpc { code: ErrorCode::Timeout, text: None })
            }
        }
    }

    /// Fire-and-forget request.
    ///
    /// # Errors
    ///
    /// Fails only when the connection is gone.
    pub fn send_noresponse(&self, topic: &str, payload: Option<serde_json::Value>) -> Result<()> {
        let (_, msg) = self.build_request(topic, payload, None, false);
        self.send(msg.noresponse())
    }

    /// Open a streaming RPC; pair with [`Client::next_streaming`].
    ///
    /// # Errors
    ///
    /// Fails only when the connection is gone.
    pub fn streaming(&self, topic: &str, payload: Option<serde_json::Value>) -> Result<u32> {
        let (tag, msg) = self.build_request(topic, payload, None, true);
        self.send(msg)?;
        Ok(tag)
    }

    /// Next response on a streaming RPC. `Ok(None)` is the normal stream
    /// end (`no-data`); other error responses surface as errors.
    ///
    /// # Errors
    ///
    /// Error responses other than `no-data` surface as `Rpc`.
    pub async fn next_streaming(&self, tag: u32) -> Result<Option<Message>> {
        let msg = self.recv_matching(tag).await?;
        match BrokerError::check(msg) {
            Ok(msg) => Ok(Some(msg)),
            Err(err) if err.is_stream_end() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Subscribe to an event topic prefix.
    ///
    /// # Errors
    ///
    /// Error responses surface as `Rpc`.
    pub async fn subscribe(&self, prefix: &str) -> Result<()> {
        self.request("event.subscribe", Some(serde_json::json!({ "topic": prefix })))
            .await
            .map(|_| ())
    }

    /// Next subscribed event.
    ///
    /// # Errors
    ///
    /// Fails when the connection closes.
    pub async fn next_event(&self) -> Result<Message> {
        if let Some(event) = self.events.borrow_mut().pop_front() {
            return Ok(event);
        }
        loop {
            let msg = self
                .rx
                .recv_async()
                .await
                .map_err(|_| BrokerError::ChannelClosed("broker connection"))?;
            let _ = self.sort_inbound(msg);
            if let Some(event) = self.events.borrow_mut().pop_front() {
                return Ok(event);
            }
        }
    }

    async fn recv_matching(&self, tag: u32) -> Result<Message> {
        if let Some(msg) = self
            .buffered
            .borrow_mut()
            .get_mut(&tag)
            .and_then(VecDeque::pop_front)
        {
            return Ok(msg);
        }
        loop {
            let msg = self
                .rx
                .recv_async()
                .await
                .map_err(|_| BrokerError::ChannelClosed("broker connection"))?;
            if msg.kind() == MsgKind::Response && msg.matchtag() == tag {
                if let Inbound::Match(msg) = self.sort_inbound_for(msg, Some(tag)) {
                    return Ok(msg);
                }
            } else {
                let _ = self.sort_inbound(msg);
            }
        }
    }

    fn sort_inbound(&self, msg: Message) -> Inbound {
        self.sort_inbound_for(msg, None)
    }

    /// File an inbound message: the wanted response, a buffered response,
    /// an event, or noise.
    fn sort_inbound_for(&self, mut msg: Message, want: Option<u32>) -> Inbound {
        match msg.kind() {
            MsgKind::Response => {
                // Match predicate: our uuid on top, then pop our entry.
                if msg.route_top().map(Bytes::as_ref) != Some(self.uuid.as_ref()) {
                    trace!("client: response does not name this client");
                    return Inbound::Other;
                }
                msg.route_pop();
                let tag = msg.matchtag();
                if self.dead_tags.borrow().contains(&tag) {
                    // Late response to a timed-out request.
                    return Inbound::Other;
                }
                if want == Some(tag) {
                    Inbound::Match(msg)
                } else {
                    self.buffered
                        .borrow_mut()
                        .entry(tag)
                        .or_default()
                        .push_back(msg);
                    Inbound::Other
                }
            }
            MsgKind::Event => {
                self.events.borrow_mut().push_back(msg);
                Inbound::Other
            }
            _ => Inbound::Other,
        }
    }
}

enum Inbound {
    Match(Message),
    Other,
}
