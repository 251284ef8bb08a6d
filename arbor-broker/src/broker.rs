//! The broker: one event loop owning every subsystem.
//!
//! All dispatch, state-machine actions, timers and service handlers run on
//! a single cooperative loop draining one inbox of [`BrokerEvent`]s. Peer
//! pumps, module tasks, script threads and timer tasks only ever touch the
//! broker through that inbox, so no core data structure needs a lock.
//!
//! Life of a broker: construct, optionally queue modules, then `run()`.
//! Run binds the client/child endpoint through the builtin
//! `connector-local` module, connects the parent (non-root), starts the
//! sweep/keepalive/heartbeat timers, posts `start` to the state machine and
//! settles into the loop until the exit state unloads the connector.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use tracing::{debug, info, warn};

use arbor_core::config::BrokerConfig;
use arbor_core::error::ErrorCode;
use arbor_core::kary;
use arbor_core::message::{role, Credential, Message, MsgKind};

use crate::content::ContentRegistry;
use crate::error::Result;
use crate::events::EventState;
use crate::groups::{Groups, ONLINE_GROUP};
use crate::heartbeat::Heartbeat;
use crate::join::{Join, JOIN_TIMEOUT};
use crate::link::{self, LinkConnect};
use crate::module::{BrokerModule, ModuleContext, ModuleHandle, ModuleHost, ModuleState};
use crate::modules::connector::{Connector, CONNECTOR_NAME};
use crate::overlay::{Overlay, PeerRole, SubtreeStatus, PARENT_KEY};
use crate::pmi::PmiExchange;
use crate::router::Dispatch;
use crate::runat::Runat;
use crate::service::{topic_method, BuiltinService, ServiceSwitch};
use crate::shutdown::{Shutdown, SHUTDOWN_EVENT};
use crate::state_machine::{BrokerState, StateMachine};

/// Root grace: how long rank 0 waits in shutdown for its children.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Parent connect retry budget (children may start before their parent).
const CONNECT_RETRIES: u32 = 100;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// In-process endpoint name for a broker.
#[must_use]
pub fn endpoint_name(session: &str, rank: u32) -> String {
    format!("arbor-{session}-{rank}")
}

/// Everything that can wake the broker loop.
#[derive(Debug)]
pub(crate) enum BrokerEvent {
    /// A new peer connected through the connector.
    PeerConnected(LinkConnect),
    PeerRx { uuid: Bytes, msg: Message },
    PeerClosed { uuid: Bytes },
    ModuleRx { name: Arc<str>, msg: Message },
    ModuleEof { name: Arc<str> },
    ModuleClosed { name: Arc<str> },
    ScriptDone { name: String, rc: i32 },
    StatePost(String),
    RpcCancel { matchtag: u32 },
    GroupsTimer { gen: u64 },
    TorpidSweep,
    KeepaliveTick,
    HeartbeatTick,
    ShutdownGrace { gen: u64 },
    PmiParentReply(Message),
    Signal(i32),
}

pub(crate) struct PendingRpc {
    pub reply: Sender<Message>,
    pub streaming: bool,
}

/// Shared broker state the router and the service handlers operate on.
pub(crate) struct Core {
    pub cfg: BrokerConfig,
    pub uuid: Bytes,
    pub overlay: Overlay,
    pub services: ServiceSwitch,
    pub events: EventState,
    pub(crate) pending: HashMap<u32, PendingRpc>,
    next_tag: u32,
    inbox_tx: Sender<BrokerEvent>,
    pub exit_rc: i32,
}

impl Core {
    pub(crate) fn rank(&self) -> u32 {
        self.cfg.rank
    }

    pub(crate) fn inbox(&self) -> Sender<BrokerEvent> {
        self.inbox_tx.clone()
    }

    fn alloc_matchtag(&mut self) -> u32 {
        loop {
            self.next_tag = self.next_tag.wrapping_add(1);
            if self.next_tag != 0 && !self.pending.contains_key(&self.next_tag) {
                return self.next_tag;
            }
        }
    }

    /// Allocate a matchtag and a reply channel for a broker-originated RPC.
    pub(crate) fn rpc_register(&mut self, streaming: bool) -> (u32, Receiver<Message>) {
        let tag = self.alloc_matchtag();
        let (tx, rx) = flume::unbounded();
        self.pending.insert(tag, PendingRpc { reply: tx, streaming });
        (tag, rx)
    }

    pub(crate) fn rpc_cancel(&mut self, tag: u32) {
        self.pending.remove(&tag);
    }

    pub(crate) fn note_exit_rc(&mut self, rc: i32) {
        if rc > self.exit_rc {
            self.exit_rc = rc;
        }
    }
}

/// Handle for delivering signals into a running broker.
#[derive(Clone)]
pub struct BrokerControl {
    tx: Sender<BrokerEvent>,
}

impl BrokerControl {
    /// Translate a process signal into a script abort in the current stage.
    pub fn signal(&self, signum: i32) {
        let _ = self.tx.send(BrokerEvent::Signal(signum));
    }
}

/// One broker of a session.
pub struct Broker {
    core: Core,
    groups: Groups,
    sm: StateMachine,
    join: Join,
    shutdown: Shutdown,
    pmi: PmiExchange,
    content: ContentRegistry,
    modules: ModuleHost,
    runat: Runat,
    heartbeat: Heartbeat,
    inbox_rx: Receiver<BrokerEvent>,
    queued_modules: Vec<Box<dyn BrokerModule>>,
    shutdown_grace_gen: u64,
    stopping: bool,
}

impl Broker {
    /// Build a broker from its configuration.
    #[must_use]
    pub fn new(cfg: BrokerConfig) -> Self {
        let (inbox_tx, inbox_rx) = flume::unbounded();
        let uuid = link::new_uuid();
        let overlay = Overlay::new(
            uuid.clone(),
            cfg.torpid_grace(),
            kary::child_count(cfg.overlay.k, cfg.size, cfg.rank),
        );

        let mut services = ServiceSwitch::new();
        services.register_builtin("overlay", BuiltinService::Overlay, role::USER);
        services.register_builtin("groups", BuiltinService::Groups, role::USER);
        services.register_builtin("state-machine", BuiltinService::StateMachine, role::USER);
        services.register_builtin("join", BuiltinService::Join, 0);
        services.register_builtin("shutdown", BuiltinService::Shutdown, 0);
        services.register_builtin("content", BuiltinService::Content, 0);
        services.register_builtin("pmi", BuiltinService::Pmi, role::USER);
        services.register_builtin("event", BuiltinService::Event, role::USER);
        services.register_builtin("module", BuiltinService::Module, 0);
        services.register_builtin("service", BuiltinService::Service, 0);

        let mut runat = Runat::new();
        for (set, script) in [
            ("rc1", &cfg.state_machine.rc1_script),
            ("rc2", &cfg.state_machine.rc2_script),
            ("rc3", &cfg.state_machine.rc3_script),
            ("cleanup", &cfg.state_machine.cleanup_script),
        ] {
            if let Some(script) = script {
                runat.define(set, script);
            }
        }

        let groups = Groups::new(cfg.rank, cfg.batch_timeout());
        let pmi = PmiExchange::new(cfg.overlay.k, cfg.size, cfg.rank);

        Self {
            core: Core {
                uuid,
                overlay,
                services,
                events: EventState::new(),
                pending: HashMap::new(),
                next_tag: 0,
                inbox_tx,
                exit_rc: 0,
                cfg,
            },
            groups,
            sm: StateMachine::new(),
            join: Join::new(),
            shutdown: Shutdown::new(),
            pmi,
            content: ContentRegistry::new(),
            modules: ModuleHost::new(),
            runat,
            heartbeat: Heartbeat::new(),
            inbox_rx,
            queued_modules: Vec::new(),
            shutdown_grace_gen: 0,
            stopping: false,
        }
    }

    /// This broker's in-process endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        endpoint_name(&self.core.cfg.session, self.core.cfg.rank)
    }

    /// Handle for delivering signals from the wrapper.
    #[must_use]
    pub fn control(&self) -> BrokerControl {
        BrokerControl { tx: self.core.inbox() }
    }

    /// Queue a module to be spawned when the broker starts.
    pub fn load_module(&mut self, module: Box<dyn BrokerModule>) {
        self.queued_modules.push(module);
    }

    /// Run the broker to completion; returns the exit code.
    pub async fn run(mut self) -> i32 {
        if let Err(e) = self.startup() {
            warn!(error = %e, "broker: startup failed");
            return 1;
        }
        if self.core.cfg.rank > 0 {
            self.connect_parent().await;
        }
        self.start_timers();
        self.post_state("start");

        info!(
            rank = self.core.cfg.rank,
            size = self.core.cfg.size,
            uuid = %String::from_utf8_lossy(&self.core.uuid),
            "broker: running"
        );
        while !self.stopping {
            let Ok(ev) = self.inbox_rx.recv_async().await else {
                break;
            };
            self.handle_event(ev);
        }
        info!(rank = self.core.cfg.rank, rc = self.core.exit_rc, "broker: exiting");
        self.core.exit_rc
    }

    fn startup(&mut self) -> Result<()> {
        let connector = Connector::new(self.endpoint(), self.core.inbox())?;
        self.spawn_module(Box::new(connector));
        for module in std::mem::take(&mut self.queued_modules) {
            self.spawn_module(module);
        }
        Ok(())
    }

    async fn connect_parent(&mut self) {
        let Some(parent_rank) = kary::parent_of(self.core.cfg.overlay.k, self.core.cfg.rank)
        else {
            return;
        };
        let endpoint = endpoint_name(&self.core.cfg.session, parent_rank);
        let mut attempts = 0;
        loop {
            match link::connect(
                &endpoint,
                self.core.uuid.clone(),
                PeerRole::Child,
                Some(self.core.cfg.rank),
                Credential::owner(0),
            ) {
                Ok((tx, rx)) => {
                    self.core.overlay.add_peer(
                        Bytes::from_static(PARENT_KEY),
                        PeerRole::Parent,
                        Some(parent_rank),
                        Credential::owner(0),
                        tx,
                    );
                    self.spawn_peer_pump(Bytes::from_static(PARENT_KEY), rx);
                    debug!(parent_rank, "broker: parent connected");
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= CONNECT_RETRIES {
                        // The join action will fail and shut us down.
                        warn!(error = %e, "broker: parent connect failed");
                        return;
                    }
                    compio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn start_timers(&self) {
        let grace = self.core.cfg.torpid_grace();
        spawn_ticker(self.core.inbox(), grace / 2, || BrokerEvent::TorpidSweep);
        spawn_ticker(self.core.inbox(), grace / 4, || BrokerEvent::KeepaliveTick);
        if self.core.cfg.is_root() {
            let period = self.core.cfg.heartbeat_period();
            spawn_ticker(self.core.inbox(), period, || BrokerEvent::HeartbeatTick);
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    fn handle_event(&mut self, ev: BrokerEvent) {
        match ev {
            BrokerEvent::PeerConnected(conn) => self.handle_peer_connected(conn),
            BrokerEvent::PeerRx { uuid, msg } => self.handle_peer_rx(&uuid, msg),
            BrokerEvent::PeerClosed { uuid } => self.handle_peer_closed(&uuid),
            BrokerEvent::ModuleRx { name, msg } => {
                if msg.kind() == MsgKind::Response {
                    self.modules.settle_owed(&name, &msg);
                }
                self.dispatch(msg, None);
            }
            BrokerEvent::ModuleEof { name } => {
                if let Some(handle) = self.modules.get_mut(&name) {
                    handle.saw_eof = true;
                    handle.state = ModuleState::Finalizing;
                }
            }
            BrokerEvent::ModuleClosed { name } => self.finalize_module(&name),
            BrokerEvent::ScriptDone { name, rc } => {
                self.runat.finished(&name);
                if rc != 0 {
                    self.core.note_exit_rc(rc);
                }
                let event = if rc == 0 {
                    format!("{name}-success")
                } else {
                    format!("{name}-fail")
                };
                self.post_state(&event);
            }
            BrokerEvent::StatePost(event) => self.process_state_event(&event),
            BrokerEvent::RpcCancel { matchtag } => self.core.rpc_cancel(matchtag),
            BrokerEvent::GroupsTimer { gen } => self.groups.on_timer(&mut self.core, gen),
            BrokerEvent::TorpidSweep => {
                for rank in self.core.overlay.sweep() {
                    self.groups.torpid_update(&mut self.core, rank, true);
                }
                self.sync_subtree_status();
            }
            BrokerEvent::KeepaliveTick => {
                let idle = self.core.cfg.torpid_grace() / 4;
                if self.core.overlay.parent_needs_keepalive(idle) {
                    let _ = self.core.overlay.send_parent(Message::keepalive());
                }
            }
            BrokerEvent::HeartbeatTick => {
                if self.core.cfg.is_root() {
                    let pulse = self.heartbeat.pulse();
                    self.dispatch(pulse, None);
                }
            }
            BrokerEvent::ShutdownGrace { gen } => {
                if self.sm.state() == BrokerState::Shutdown && gen == self.shutdown_grace_gen {
                    warn!("broker: shutdown grace expired with children remaining");
                    self.post_state("children-timeout");
                }
            }
            BrokerEvent::PmiParentReply(msg) => self.pmi.on_parent_reply(&mut self.core, &msg),
            BrokerEvent::Signal(signum) => self.handle_signal(signum),
        }
    }

    fn handle_peer_connected(&mut self, conn: LinkConnect) {
        let role = conn.role;
        self.core
            .overlay
            .add_peer(conn.uuid.clone(), conn.role, conn.rank, conn.cred, conn.tx);
        self.spawn_peer_pump(conn.uuid, conn.rx);
        if role == PeerRole::Child {
            self.sync_subtree_status();
        }
    }

    fn spawn_peer_pump(&self, uuid: Bytes, rx: Receiver<Message>) {
        let inbox = self.core.inbox();
        compio::runtime::spawn(async move {
            while let Ok(msg) = rx.recv_async().await {
                if inbox
                    .send(BrokerEvent::PeerRx { uuid: uuid.clone(), msg })
                    .is_err()
                {
                    return;
                }
            }
            let _ = inbox.send(BrokerEvent::PeerClosed { uuid });
        })
        .detach();
    }

    fn handle_peer_rx(&mut self, uuid: &Bytes, msg: Message) {
        let cleared = self.core.overlay.note_inbound(uuid, msg.kind());
        if let Some(rank) = cleared {
            // The peer produced a frame, so it is no longer torpid.
            self.groups.torpid_update(&mut self.core, rank, false);
        }
        if msg.kind() == MsgKind::Request {
            if let Some(peer) = self.core.overlay.peer_mut(uuid) {
                if peer.role == PeerRole::Client {
                    peer.touched.insert(msg.service().to_owned());
                }
            }
        }
        // Controls (goodbye, child status reports) and cleared torpidity
        // can change our aggregate subtree health.
        let health_input = cleared.is_some() || msg.kind() == MsgKind::Control;
        self.dispatch(msg, Some(uuid.as_ref()));
        if health_input {
            self.sync_subtree_status();
        }
    }

    fn handle_peer_closed(&mut self, uuid: &Bytes) {
        let Some(peer) = self.core.overlay.peer(uuid) else {
            return;
        };
        let role = peer.role;
        let rank = peer.rank;
        let status = peer.status;
        let cred = peer.cred;
        match role {
            PeerRole::Client => {
                let touched: Vec<String> =
                    self.core.overlay.peer(uuid).map_or_else(Vec::new, |p| {
                        p.touched.iter().cloned().collect()
                    });
                self.core.events.index.remove_peer(uuid);
                self.core.overlay.remove_peer(uuid);
                for service in touched {
                    let mut disc = Message::request(format!("{service}.disconnect"))
                        .noresponse()
                        .with_cred(cred);
                    disc.route_push(uuid.clone());
                    self.dispatch(disc, None);
                }
            }
            PeerRole::Child => {
                // Without a goodbye this is a crash.
                if !status.is_gone() {
                    self.core.overlay.mark_status(uuid, SubtreeStatus::Lost);
                }
                if let Some(rank) = rank {
                    let ids = kary::subtree_ranks(
                        self.core.cfg.overlay.k,
                        self.core.cfg.size,
                        rank,
                    );
                    info!(rank, subtree = %ids, "broker: child subtree gone");
                    self.groups.subtree_loss(&mut self.core, &ids);
                }
                if self.sm.state() == BrokerState::Shutdown
                    && self.core.overlay.child_count() == 0
                {
                    self.post_state("children-complete");
                }
                self.sync_subtree_status();
            }
            PeerRole::Parent => {
                warn!("broker: parent connection lost");
                self.core.overlay.remove_peer(uuid);
                if self.sm.state() < BrokerState::Run {
                    self.post_state("parent-fail");
                } else {
                    self.request_shutdown();
                }
            }
            PeerRole::Module => {
                // Module lifecycle is tracked through its outbox forwarder.
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, msg: Message, from: Option<&[u8]>) {
        match self.core.route(msg, from) {
            Dispatch::Done => {}
            Dispatch::Builtin(svc, msg) => self.handle_builtin(svc, msg),
            Dispatch::Module(name, msg) => self.dispatch_module(&name, msg),
            Dispatch::LocalEvent(msg) => self.on_local_event(&msg),
        }
    }

    fn handle_builtin(&mut self, svc: BuiltinService, msg: Message) {
        match svc {
            BuiltinService::Overlay => self.handle_overlay(msg),
            BuiltinService::Groups => self.groups.handle(&mut self.core, msg),
            BuiltinService::StateMachine => self.handle_state_machine(msg),
            BuiltinService::Join => self.handle_join(msg),
            BuiltinService::Shutdown => self.handle_shutdown(msg),
            BuiltinService::Content => self.handle_content(msg),
            BuiltinService::Pmi => self.handle_pmi(msg),
            BuiltinService::Event => self.handle_event_service(msg),
            BuiltinService::Module => self.handle_module_service(msg),
            BuiltinService::Service => self.handle_service_service(msg),
        }
    }

    fn handle_overlay(&mut self, msg: Message) {
        match topic_method(msg.topic()) {
            "stats" => {
                let mut stats = self.core.overlay.stats_json(self.heartbeat.epoch());
                stats["content"] = serde_json::json!({
                    "backing": self.content.backing_name(),
                });
                self.core.respond_ok(&msg, Some(stats));
            }
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown overlay method '{other}'"),
            ),
        }
    }

    fn handle_state_machine(&mut self, msg: Message) {
        match topic_method(msg.topic()) {
            "monitor" => {
                let final_state = msg
                    .payload()
                    .and_then(|p| p.get("final"))
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|v| BrokerState::from_u32(v as u32))
                    .unwrap_or(BrokerState::Exit);
                for rsp in self.sm.subscribe(&msg, final_state) {
                    self.core.send_response(rsp);
                }
            }
            "disconnect" => self.sm.disconnect(&msg),
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown state-machine method '{other}'"),
            ),
        }
    }

    fn handle_join(&mut self, msg: Message) {
        let method = topic_method(msg.topic()).to_owned();
        match method.as_str() {
            "wait-ready" => {
                let state = self.sm.state();
                self.join.wait_ready(&mut self.core, state, msg);
            }
            "disconnect" => self.join.disconnect(&msg),
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown join method '{other}'"),
            ),
        }
    }

    fn handle_shutdown(&mut self, msg: Message) {
        let method = topic_method(msg.topic()).to_owned();
        match method.as_str() {
            "start" => {
                if self.shutdown.on_start(&mut self.core, msg) {
                    // shutdown.all reaches every rank, this one included;
                    // the local delivery hook drives the state machine.
                    self.dispatch(Message::event(SHUTDOWN_EVENT), None);
                }
            }
            "disconnect" => self.shutdown.disconnect(&msg),
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown shutdown method '{other}'"),
            ),
        }
    }

    fn handle_content(&mut self, msg: Message) {
        match topic_method(msg.topic()) {
            "register-backing" => self.content.register(&mut self.core, &self.modules, &msg),
            "unregister-backing" => self.content.unregister(&mut self.core, &self.modules, &msg),
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown content method '{other}'"),
            ),
        }
    }

    fn handle_pmi(&mut self, msg: Message) {
        let method = topic_method(msg.topic()).to_owned();
        match method.as_str() {
            "exchange" => self.pmi.handle(&mut self.core, msg),
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown pmi method '{other}'"),
            ),
        }
    }

    fn handle_event_service(&mut self, msg: Message) {
        let topic_arg = msg
            .payload()
            .and_then(|p| p.get("topic"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);
        match topic_method(msg.topic()) {
            "subscribe" => {
                let (Some(prefix), Some(sender)) = (topic_arg, msg.sender().cloned()) else {
                    self.core.respond_err(&msg, ErrorCode::Protocol, "subscribe needs a topic");
                    return;
                };
                self.core.events.index.subscribe(sender, &prefix);
                self.core.respond_ok(&msg, None);
            }
            "unsubscribe" => {
                let (Some(prefix), Some(sender)) = (topic_arg, msg.sender().cloned()) else {
                    self.core.respond_err(&msg, ErrorCode::Protocol, "unsubscribe needs a topic");
                    return;
                };
                self.core.events.index.unsubscribe(&sender, &prefix);
                self.core.respond_ok(&msg, None);
            }
            "publish" => {
                let Some(topic) = topic_arg else {
                    self.core.respond_err(&msg, ErrorCode::Protocol, "publish needs a topic");
                    return;
                };
                let mut event = Message::event(topic).with_cred(msg.cred());
                if let Some(inner) = msg.payload().and_then(|p| p.get("payload")) {
                    event = event.with_payload(inner.clone());
                }
                self.dispatch(event, None);
                self.core.respond_ok(&msg, None);
            }
            "disconnect" => {
                if let Some(sender) = msg.sender() {
                    self.core.events.index.remove_peer(sender);
                }
            }
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown event method '{other}'"),
            ),
        }
    }

    fn handle_module_service(&mut self, msg: Message) {
        let method = topic_method(msg.topic()).to_owned();
        match method.as_str() {
            "remove" => self.handle_module_remove(msg),
            "list" => {
                let list = self.modules.list_json();
                self.core.respond_ok(&msg, Some(list));
            }
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown module method '{other}'"),
            ),
        }
    }

    fn handle_module_remove(&mut self, msg: Message) {
        let Some(name) = msg
            .payload()
            .and_then(|p| p.get("name"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
        else {
            self.core.respond_err(&msg, ErrorCode::Protocol, "remove needs a module name");
            return;
        };
        if !self.modules.contains(&name) {
            self.core.respond_err(&msg, ErrorCode::NotFound, &format!("module '{name}' is not loaded"));
            return;
        }
        let handle = self.modules.get_mut(&name).expect("checked above");
        handle.state = ModuleState::Finalizing;
        handle.remove_request = Some(msg);
        // EOF on the inbox asks the module to wind down; the response waits
        // for the module's own EOF confirmation.
        let _ = handle.inbox_tx.send(Message::eof());
    }

    fn handle_service_service(&mut self, msg: Message) {
        let Some(module) = msg
            .sender()
            .and_then(|uuid| self.modules.name_by_uuid(uuid))
        else {
            self.core.respond_err(&msg, ErrorCode::Protocol, "service registration requires a module");
            return;
        };
        let Some(name) = msg
            .payload()
            .and_then(|p| p.get("name"))
            .and_then(serde_json::Value::as_str)
        else {
            self.core.respond_err(&msg, ErrorCode::Protocol, "service registration needs a name");
            return;
        };
        match topic_method(msg.topic()) {
            "add" => match self.core.services.register_module(name, module) {
                Ok(()) => self.core.respond_ok(&msg, None),
                Err(code) => self.core.respond_err(
                    &msg,
                    code,
                    &format!("service '{name}' is already registered"),
                ),
            },
            "remove" => match self.core.services.unregister_module(name, &module) {
                Ok(()) => self.core.respond_ok(&msg, None),
                Err(code) => self.core.respond_err(
                    &msg,
                    code,
                    &format!("service '{name}' is not registered to this module"),
                ),
            },
            other => self.core.respond_err(
                &msg,
                ErrorCode::MethodNotFound,
                &format!("unknown service method '{other}'"),
            ),
        }
    }

    fn dispatch_module(&mut self, name: &Arc<str>, msg: Message) {
        let (uuid, running) = match self.modules.get_mut(name) {
            Some(handle) => (handle.uuid.clone(), handle.state == ModuleState::Running),
            None => {
                self.core.respond_err(
                    &msg,
                    ErrorCode::ModuleGone,
                    &format!("module '{name}' is not loaded"),
                );
                return;
            }
        };
        if !running {
            self.core.respond_err(&msg, ErrorCode::ModuleGone, &format!("module '{name}' is shutting down"));
            return;
        }
        self.modules.note_owed(name, &msg);
        if let Err((_, failed)) = self.core.overlay.send_to(&uuid, msg) {
            self.modules.settle_owed(name, &Message::response_to(&failed));
            self.core.respond_err(&failed, ErrorCode::ModuleGone, &format!("module '{name}' exited"));
        }
    }

    /// Recompute this broker's aggregate subtree health and, when it
    /// changed, report it to the parent so the aggregation folds upward.
    fn sync_subtree_status(&mut self) {
        let Some(status) = self.core.overlay.refresh_subtree_status() else {
            return;
        };
        debug!(status = status.as_str(), "broker: subtree status changed");
        if self.core.overlay.has_parent() {
            let report = Message::control("overlay.status")
                .with_payload(serde_json::json!({ "status": status.as_str() }));
            let _ = self.core.overlay.send_parent(report);
        }
    }

    /// Internal hooks for events delivered on this rank.
    fn on_local_event(&mut self, msg: &Message) {
        match msg.topic() {
            SHUTDOWN_EVENT => self.request_shutdown(),
            crate::heartbeat::PULSE_EVENT => self.heartbeat.on_pulse(msg),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    fn spawn_module(&mut self, module: Box<dyn BrokerModule>) {
        let name: Arc<str> = Arc::from(module.name());
        let uuid = link::new_uuid();
        let (inbox_tx, inbox_rx) = flume::unbounded();
        let (outbox_tx, outbox_rx) = flume::unbounded();
        let ctx = ModuleContext::new(
            name.clone(),
            uuid.clone(),
            self.core.cfg.rank,
            self.core.cfg.size,
            inbox_rx,
            outbox_tx,
        );
        self.core.overlay.add_peer(
            uuid.clone(),
            PeerRole::Module,
            None,
            Credential::owner(0),
            inbox_tx.clone(),
        );
        self.modules.insert(ModuleHandle {
            name: name.clone(),
            uuid,
            state: ModuleState::Running,
            inbox_tx,
            owed: Vec::new(),
            remove_request: None,
            saw_eof: false,
        });

        // Outbox forwarder: EOF marker and closure become loop events.
        let inbox = self.core.inbox();
        let forward_name = name.clone();
        compio::runtime::spawn(async move {
            loop {
                match outbox_rx.recv_async().await {
                    Ok(msg) if msg.is_eof() => {
                        let _ = inbox.send(BrokerEvent::ModuleEof { name: forward_name.clone() });
                    }
                    Ok(msg) => {
                        if inbox
                            .send(BrokerEvent::ModuleRx { name: forward_name.clone(), msg })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = inbox.send(BrokerEvent::ModuleClosed { name: forward_name });
                        return;
                    }
                }
            }
        })
        .detach();

        info!(module = %name, "broker: module loaded");
        compio::runtime::spawn(async move {
            if let Err(e) = module.run(ctx).await {
                warn!(module = %name, error = %e, "broker: module failed");
            }
        })
        .detach();
    }

    /// The module's outbox closed: settle its debts and forget it.
    fn finalize_module(&mut self, name: &str) {
        let Some(handle) = self.modules.remove(name) else {
            return;
        };
        if !handle.saw_eof {
            warn!(module = %name, "broker: module exited without EOF");
        }
        for owed in &handle.owed {
            self.core
                .respond_err(owed, ErrorCode::ModuleGone, &format!("module '{name}' exited"));
        }
        for service in self.core.services.drop_module(name) {
            debug!(module = %name, service = %service, "broker: service dropped");
        }
        self.content.on_module_exit(name);
        self.core.overlay.remove_peer(&handle.uuid);
        if let Some(request) = handle.remove_request {
            self.core.respond_ok(&request, None);
        }
        if name == CONNECTOR_NAME && self.sm.state() == BrokerState::Exit {
            self.stopping = true;
        }
    }

    fn remove_module_internal(&mut self, name: &str) {
        if let Some(handle) = self.modules.get_mut(name) {
            handle.state = ModuleState::Finalizing;
            let _ = handle.inbox_tx.send(Message::eof());
        }
    }

    // ------------------------------------------------------------------
    // State machine actions
    // ------------------------------------------------------------------

    fn post_state(&self, event: &str) {
        let _ = self
            .core
            .inbox_tx
            .send(BrokerEvent::StatePost(event.to_owned()));
    }

    fn process_state_event(&mut self, event: &str) {
        if let Some(state) = self.sm.process(event) {
            for rsp in self.sm.monitor_updates(state) {
                self.core.send_response(rsp);
            }
            self.shutdown.on_state_change(&mut self.core, state);
            self.state_action(state);
        }
    }

    fn state_action(&mut self, state: BrokerState) {
        match state {
            BrokerState::None | BrokerState::Quorum | BrokerState::Goodbye => {}
            BrokerState::Join => {
                if self.core.cfg.rank > 0 {
                    self.join_start();
                } else {
                    self.post_state("parent-none");
                }
            }
            BrokerState::Init => self.run_script_or_none("rc1"),
            BrokerState::Run => {
                if self.sm.shutdown_flag {
                    self.post_state("rc2-abort");
                } else {
                    self.run_script_or_none("rc2");
                }
                self.join.notify(&mut self.core, BrokerState::Run);
                self.rpc_and_log(
                    "groups.join",
                    serde_json::json!({ "name": ONLINE_GROUP }),
                );
            }
            BrokerState::Cleanup => {
                self.run_script_or_none("cleanup");
                self.rpc_and_log(
                    "groups.leave",
                    serde_json::json!({ "name": ONLINE_GROUP }),
                );
            }
            BrokerState::Shutdown => {
                self.join.notify(&mut self.core, BrokerState::Shutdown);
                if self.core.overlay.child_count() == 0 {
                    self.post_state("children-none");
                } else {
                    self.shutdown_grace_gen += 1;
                    let gen = self.shutdown_grace_gen;
                    let inbox = self.core.inbox();
                    compio::runtime::spawn(async move {
                        compio::time::sleep(SHUTDOWN_GRACE).await;
                        let _ = inbox.send(BrokerEvent::ShutdownGrace { gen });
                    })
                    .detach();
                }
            }
            BrokerState::Finalize => self.run_script_or_none("rc3"),
            BrokerState::Exit => {
                // Tell the parent this is an orderly departure, then unload
                // the connector and stop once it confirms EOF.
                if self.core.overlay.has_parent() {
                    let _ = self.core.overlay.send_parent(Message::control("overlay.goodbye"));
                }
                if self.modules.contains(CONNECTOR_NAME) {
                    self.remove_module_internal(CONNECTOR_NAME);
                } else {
                    self.stopping = true;
                }
            }
        }
    }

    fn run_script_or_none(&mut self, set: &str) {
        if self.runat.is_defined(set) {
            if let Err(e) = self.runat.start(set, self.core.inbox()) {
                warn!(set, error = %e, "broker: script start failed");
                self.post_state(&format!("{set}-fail"));
            }
        } else {
            self.post_state(&format!("{set}-none"));
        }
    }

    /// Child side of the bootstrap: ask the parent to confirm readiness.
    fn join_start(&mut self) {
        let (tag, reply) = self.core.rpc_register(false);
        let msg = Message::request("join.wait-ready")
            .with_matchtag(tag)
            .with_cred(Credential::owner(0));
        if self.core.send_upstream(msg).is_err() {
            self.core.rpc_cancel(tag);
            self.post_state("parent-fail");
            return;
        }
        let inbox = self.core.inbox();
        compio::runtime::spawn(async move {
            let event = match compio::time::timeout(JOIN_TIMEOUT, reply.recv_async()).await {
                Err(_) => {
                    let _ = inbox.send(BrokerEvent::RpcCancel { matchtag: tag });
                    "parent-timeout"
                }
                Ok(Ok(rsp)) if rsp.error().is_none() => "parent-ready",
                Ok(_) => "parent-fail",
            };
            let _ = inbox.send(BrokerEvent::StatePost(event.to_owned()));
        })
        .detach();
    }

    /// Fire a local RPC and log (not fail) on error responses.
    fn rpc_and_log(&mut self, topic: &str, payload: serde_json::Value) {
        let (tag, reply) = self.core.rpc_register(false);
        let msg = Message::request(topic)
            .with_matchtag(tag)
            .with_cred(Credential::owner(0))
            .with_payload(payload);
        let topic = topic.to_owned();
        self.dispatch(msg, None);
        compio::runtime::spawn(async move {
            if let Ok(rsp) = reply.recv_async().await {
                if let Some(err) = rsp.error() {
                    debug!(topic = %topic, code = %err.code, "broker: internal rpc error");
                }
            }
        })
        .detach();
    }

    /// The instance is shutting down (admin request, shutdown.all event, or
    /// parent loss): steer the state machine onto the shutdown path.
    fn request_shutdown(&mut self) {
        match self.sm.state() {
            BrokerState::None | BrokerState::Join | BrokerState::Init | BrokerState::Quorum => {
                info!("broker: shutdown deferred until run");
                self.sm.shutdown_flag = true;
            }
            BrokerState::Run => {
                if self.runat.is_defined("rc2") {
                    self.runat.abort("rc2");
                } else {
                    self.post_state("rc2-abort");
                }
            }
            state => {
                debug!(state = state.as_str(), "broker: shutdown already under way");
            }
        }
    }

    /// Signals translate to aborting the stage that is currently running.
    fn handle_signal(&mut self, signum: i32) {
        warn!(signum, "broker: signal received");
        self.core.note_exit_rc(128 + signum);
        match self.sm.state() {
            BrokerState::Init => self.runat.abort("rc1"),
            BrokerState::Run => {
                if self.runat.is_defined("rc2") {
                    self.runat.abort("rc2");
                } else {
                    self.post_state("rc2-abort");
                }
            }
            BrokerState::Cleanup => self.runat.abort("cleanup"),
            BrokerState::Finalize => self.runat.abort("rc3"),
            state => {
                info!(signum, state = state.as_str(), "broker: signal ignored in this state");
            }
        }
    }
}

fn spawn_ticker(
    inbox: Sender<BrokerEvent>,
    period: Duration,
    make: impl Fn() -> BrokerEvent + Send + 'static,
) {
    compio::runtime::spawn(async move {
        loop {
            compio::time::sleep(period).await;
            if inbox.send(make()).is_err() {
                return;
            }
        }
    })
    .detach();
}
