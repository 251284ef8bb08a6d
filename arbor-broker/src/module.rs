//! Module host: loadable services running as independent tasks.
//!
//! One module == one spawned task. The host and a module share nothing but a
//! channel pair: an inbox of messages dispatched to the module and an outbox
//! the host drains into the router. A module that wants threads is free to
//! spawn them behind that boundary.
//!
//! Lifecycle: `loading → running → finalizing → gone`. Clean exit is an EOF
//! marker on the outbox followed by channel closure; a closure without EOF
//! is a crash, and every request the module still owes is answered
//! `module-gone` by the host.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use tracing::trace;

use arbor_core::error::ErrorCode;
use arbor_core::message::{Credential, Message};

use crate::error::{BrokerError, Result};

/// A loadable broker module.
///
/// `run` is the module's whole life: consume the inbox, feed the outbox,
/// return on EOF. The module host synthesizes failure responses if `run`
/// exits while requests are outstanding.
#[async_trait]
pub trait BrokerModule: Send + 'static {
    /// Unique module name (also the default service name holder).
    fn name(&self) -> &str;

    /// Drive the module until EOF or failure.
    async fn run(self: Box<Self>, ctx: ModuleContext) -> Result<()>;
}

/// The module's half of the host/module channel pair, plus identity.
pub struct ModuleContext {
    name: Arc<str>,
    uuid: Bytes,
    rank: u32,
    size: u32,
    inbox: Receiver<Message>,
    outbox: Sender<Message>,
    next_tag: AtomicU32,
}

impl ModuleContext {
    pub(crate) fn new(
        name: Arc<str>,
        uuid: Bytes,
        rank: u32,
        size: u32,
        inbox: Receiver<Message>,
        outbox: Sender<Message>,
    ) -> Self {
        Self { name, uuid, rank, size, inbox, outbox, next_tag: AtomicU32::new(1) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn uuid(&self) -> &Bytes {
        &self.uuid
    }

    #[must_use]
    pub const fn rank(&self) -> u32 {
        self.rank
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// The raw inbox, for modules that multiplex it with other channels.
    pub(crate) fn inbox(&self) -> &Receiver<Message> {
        &self.inbox
    }

    /// Next message from the broker, or `None` on EOF / host shutdown.
    pub async fn recv(&self) -> Option<Message> {
        match self.inbox.recv_async().await {
            Ok(msg) if msg.is_eof() => None,
            Ok(msg) => Some(msg),
            Err(_) => None,
        }
    }

    /// Send a message to the router.
    ///
    /// # Errors
    ///
    /// Fails when the host side is gone.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.outbox
            .send(msg)
            .map_err(|_| BrokerError::ChannelClosed("module outbox"))
    }

    #[must_use]
    pub fn alloc_matchtag(&self) -> u32 {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        if tag == 0 {
            self.next_tag.fetch_add(1, Ordering::Relaxed)
        } else {
            tag
        }
    }

    /// Issue a request; the matching response arrives on the inbox.
    ///
    /// Returns the allocated matchtag so the caller can pair the response.
    ///
    /// # Errors
    ///
    /// Fails when the host side is gone.
    pub fn request(&self, topic: &str, payload: Option<serde_json::Value>) -> Result<u32> {
        let tag = self.alloc_matchtag();
        let mut msg = Message::request(topic)
            .with_matchtag(tag)
            .with_cred(Credential::owner(0));
        if let Some(payload) = payload {
            msg = msg.with_payload(payload);
        }
        msg.route_push(self.uuid.clone());
        self.send(msg)?;
        Ok(tag)
    }

    /// Respond with success, optionally carrying a structured payload.
    ///
    /// Fire-and-forget requests are acknowledged silently.
    ///
    /// # Errors
    ///
    /// Fails when the host side is gone.
    pub fn respond_ok(&self, req: &Message, payload: Option<serde_json::Value>) -> Result<()> {
        if req.is_noresponse() {
            return Ok(());
        }
        let mut rsp = Message::response_to(req);
        if let Some(payload) = payload {
            rsp = rsp.with_payload(payload);
        }
        self.send(rsp)
    }

    /// Respond with success carrying a raw payload.
    ///
    /// # Errors
    ///
    /// Fails when the host side is gone.
    pub fn respond_raw(&self, req: &Message, raw: Bytes) -> Result<()> {
        if req.is_noresponse() {
            return Ok(());
        }
        self.send(Message::response_to(req).with_raw(raw))
    }

    /// Respond with a wire error.
    ///
    /// # Errors
    ///
    /// Fails when the host side is gone.
    pub fn respond_err(&self, req: &Message, code: ErrorCode, text: &str) -> Result<()> {
        if req.is_noresponse() {
            return Ok(());
        }
        self.send(Message::error_response_to(req, code, Some(text)))
    }

    /// Signal clean end-of-life. The host answers a pending removal RPC only
    /// after seeing this.
    pub fn send_eof(&self) {
        let _ = self.outbox.send(Message::eof());
    }
}

/// Module lifecycle as the host sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Loading,
    Running,
    Finalizing,
    Gone,
}

impl ModuleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Gone => "gone",
        }
    }
}

/// Host-side record of a loaded module.
pub(crate) struct ModuleHandle {
    pub name: Arc<str>,
    pub uuid: Bytes,
    pub state: ModuleState,
    pub inbox_tx: Sender<Message>,
    /// Requests dispatched to the module that still owe a response.
    pub owed: Vec<Message>,
    /// Pending `module.remove` request, answered on EOF-confirmed exit.
    pub remove_request: Option<Message>,
    pub saw_eof: bool,
}

/// Registry of loaded modules.
#[derive(Default)]
pub(crate) struct ModuleHost {
    modules: HashMap<Arc<str>, ModuleHandle>,
    by_uuid: HashMap<Bytes, Arc<str>>,
}

impl ModuleHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, handle: ModuleHandle) {
        self.by_uuid.insert(handle.uuid.clone(), handle.name.clone());
        self.modules.insert(handle.name.clone(), handle);
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ModuleHandle> {
        self.modules.get_mut(name)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<ModuleHandle> {
        let handle = self.modules.remove(name)?;
        self.by_uuid.remove(&handle.uuid);
        Some(handle)
    }

    pub(crate) fn name_by_uuid(&self, uuid: &[u8]) -> Option<Arc<str>> {
        self.by_uuid.get(uuid).cloned()
    }

    /// Record a request the module now owes a response for.
    pub(crate) fn note_owed(&mut self, name: &str, req: &Message) {
        if req.matchtag() == 0 || req.is_noresponse() {
            return;
        }
        if let Some(handle) = self.modules.get_mut(name) {
            trace!(module = %name, matchtag = req.matchtag(), "module: owes response");
            handle.owed.push(req.clone());
        }
    }

    /// Clear the owed entry matching a response the module produced.
    pub(crate) fn settle_owed(&mut self, name: &str, rsp: &Message) {
        if let Some(handle) = self.modules.get_mut(name) {
            if let Some(pos) = handle.owed.iter().position(|req| {
                req.matchtag() == rsp.matchtag() && req.sender() == rsp.sender()
            }) {
                handle.owed.swap_remove(pos);
            }
        }
    }

    /// `module.list` payload.
    pub(crate) fn list_json(&self) -> serde_json::Value {
        let mods: Vec<serde_json::Value> = self
            .modules
            .values()
            .map(|handle| {
                serde_json::json!({
                    "name": handle.name.as_ref(),
                    "state": handle.state.as_str(),
                })
            })
            .collect();
        serde_json::json!({ "modules": mods })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str, uuid: &'static [u8]) -> (ModuleHandle, Receiver<Message>) {
        let (tx, rx) = flume::unbounded();
        (
            ModuleHandle {
                name: Arc::from(name),
                uuid: Bytes::from_static(uuid),
                state: ModuleState::Running,
                inbox_tx: tx,
                owed: Vec::new(),
                remove_request: None,
                saw_eof: false,
            },
            rx,
        )
    }

    #[test]
    fn owed_bookkeeping() {
        let mut host = ModuleHost::new();
        let (h, _rx) = handle("backing", b"mod-uuid-1");
        host.insert(h);

        let mut req = Message::request("content-backing.load").with_matchtag(5);
        req.route_push(Bytes::from_static(b"client-1"));
        host.note_owed("backing", &req);
        assert_eq!(host.get_mut("backing").unwrap().owed.len(), 1);

        // Fire-and-forget requests are not owed.
        let quiet = Message::request("content-backing.flush").noresponse();
        host.note_owed("backing", &quiet);
        assert_eq!(host.get_mut("backing").unwrap().owed.len(), 1);

        let rsp = Message::response_to(&req);
        host.settle_owed("backing", &rsp);
        assert!(host.get_mut("backing").unwrap().owed.is_empty());
    }

    #[test]
    fn uuid_lookup() {
        let mut host = ModuleHost::new();
        let (h, _rx) = handle("backing", b"mod-uuid-1");
        host.insert(h);
        assert_eq!(host.name_by_uuid(b"mod-uuid-1").as_deref(), Some("backing"));
        host.remove("backing");
        assert!(host.name_by_uuid(b"mod-uuid-1").is_none());
    }

    #[test]
    fn context_matchtags_skip_zero() {
        let (in_tx, in_rx) = flume::unbounded();
        let (out_tx, _out_rx) = flume::unbounded();
        drop(in_tx);
        let ctx = ModuleContext::new(
            Arc::from("m"),
            Bytes::from_static(b"u"),
            0,
            1,
            in_rx,
            out_tx,
        );
        let first = ctx.alloc_matchtag();
        assert_ne!(first, 0);
        assert_ne!(ctx.alloc_matchtag(), first);
    }
}
