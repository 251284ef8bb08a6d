//! Broker life-cycle state machine.
//!
//! States advance monotonically through the event table below; the only
//! self-loop is `run --rc2-none--> run`, the steady state of a broker with
//! no rc2 script. Unknown events in a state are logged and ignored. The
//! actions bound to each state live in the broker, which owns the
//! subsystems they touch; this module owns the table, the current state and
//! the `state-machine.monitor` subscriptions.

use tracing::info;

use arbor_core::error::ErrorCode;
use arbor_core::message::Message;

/// Broker life-cycle states.
///
/// `Quorum` and `Goodbye` are carried for monitor/protocol compatibility;
/// the transition table does not route through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum BrokerState {
    None = 0,
    Join = 1,
    Init = 2,
    Quorum = 3,
    Run = 4,
    Cleanup = 5,
    Shutdown = 6,
    Finalize = 7,
    Goodbye = 8,
    Exit = 9,
}

impl BrokerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Join => "join",
            Self::Init => "init",
            Self::Quorum => "quorum",
            Self::Run => "run",
            Self::Cleanup => "cleanup",
            Self::Shutdown => "shutdown",
            Self::Finalize => "finalize",
            Self::Goodbye => "goodbye",
            Self::Exit => "exit",
        }
    }

    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Join),
            2 => Some(Self::Init),
            3 => Some(Self::Quorum),
            4 => Some(Self::Run),
            5 => Some(Self::Cleanup),
            6 => Some(Self::Shutdown),
            7 => Some(Self::Finalize),
            8 => Some(Self::Goodbye),
            9 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// (event, current, next); first match wins.
const NEXTTAB: &[(&str, BrokerState, BrokerState)] = &[
    ("start", BrokerState::None, BrokerState::Join),
    ("parent-ready", BrokerState::Join, BrokerState::Init),
    ("parent-none", BrokerState::Join, BrokerState::Init),
    ("parent-timeout", BrokerState::Join, BrokerState::Shutdown),
    ("parent-fail", BrokerState::Join, BrokerState::Shutdown),
    ("rc1-success", BrokerState::Init, BrokerState::Run),
    ("rc1-none", BrokerState::Init, BrokerState::Run),
    ("rc1-fail", BrokerState::Init, BrokerState::Shutdown),
    ("rc2-success", BrokerState::Run, BrokerState::Cleanup),
    ("rc2-fail", BrokerState::Run, BrokerState::Cleanup),
    ("rc2-abort", BrokerState::Run, BrokerState::Cleanup),
    ("rc2-none", BrokerState::Run, BrokerState::Run),
    ("cleanup-success", BrokerState::Cleanup, BrokerState::Shutdown),
    ("cleanup-none", BrokerState::Cleanup, BrokerState::Shutdown),
    ("cleanup-fail", BrokerState::Cleanup, BrokerState::Shutdown),
    ("children-complete", BrokerState::Shutdown, BrokerState::Finalize),
    ("children-none", BrokerState::Shutdown, BrokerState::Finalize),
    ("children-timeout", BrokerState::Shutdown, BrokerState::Finalize),
    ("rc3-success", BrokerState::Finalize, BrokerState::Exit),
    ("rc3-none", BrokerState::Finalize, BrokerState::Exit),
    ("rc3-fail", BrokerState::Finalize, BrokerState::Exit),
];

/// Look up the next state for (current, event). `None` for unknown events.
#[must_use]
pub fn state_next(current: BrokerState, event: &str) -> Option<BrokerState> {
    NEXTTAB
        .iter()
        .find(|(ev, cur, _)| *cur == current && *ev == event)
        .map(|(_, _, next)| *next)
}

/// State holder plus monitor subscriptions.
pub(crate) struct StateMachine {
    state: BrokerState,
    /// Deferred shutdown: set pre-run, honored when run is entered.
    pub shutdown_flag: bool,
    monitors: Vec<(Message, BrokerState)>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: BrokerState::None,
            shutdown_flag: false,
            monitors: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> BrokerState {
        self.state
    }

    /// Apply `event`. Returns the entered state when the action should run,
    /// `None` for no-op self-loops and ignored events.
    pub(crate) fn process(&mut self, event: &str) -> Option<BrokerState> {
        match state_next(self.state, event) {
            Some(next) if next != self.state => {
                info!(
                    "{event}: {old}->{new}",
                    old = self.state.as_str(),
                    new = next.as_str()
                );
                self.state = next;
                Some(next)
            }
            Some(_) => {
                info!("{event}: no-op in {}", self.state.as_str());
                None
            }
            None => {
                info!("{event}: ignored in {}", self.state.as_str());
                None
            }
        }
    }

    /// Register a `state-machine.monitor` request.
    ///
    /// The current state is reported immediately; if the final state is
    /// already reached (or the request is not streaming) the stream also
    /// terminates immediately.
    pub(crate) fn subscribe(&mut self, req: &Message, final_state: BrokerState) -> Vec<Message> {
        let mut out = vec![Self::update_for(req, self.state)];
        if self.state >= final_state || !req.is_streaming() {
            out.push(Message::error_response_to(req, ErrorCode::NoData, None));
        } else {
            self.monitors.push((req.clone(), final_state));
        }
        out
    }

    /// Responses owed to monitors for a transition into `state`.
    pub(crate) fn monitor_updates(&mut self, state: BrokerState) -> Vec<Message> {
        let mut out = Vec::new();
        self.monitors.retain(|(req, final_state)| {
            out.push(Self::update_for(req, state));
            if state >= *final_state {
                out.push(Message::error_response_to(req, ErrorCode::NoData, None));
                false
            } else {
                true
            }
        });
        out
    }

    /// Drop monitor subscriptions owned by a disconnecting peer.
    pub(crate) fn disconnect(&mut self, disc: &Message) {
        self.monitors.retain(|(req, _)| !disc.disconnect_match(req));
    }

    fn update_for(req: &Message, state: BrokerState) -> Message {
        Message::response_to(req)
            .with_payload(serde_json::json!({ "state": state.to_u32() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_sequence() {
        let mut sm = StateMachine::new();
        for (event, expect) in [
            ("start", BrokerState::Join),
            ("parent-none", BrokerState::Init),
            ("rc1-none", BrokerState::Run),
            ("rc2-success", BrokerState::Cleanup),
            ("cleanup-none", BrokerState::Shutdown),
            ("children-none", BrokerState::Finalize),
            ("rc3-none", BrokerState::Exit),
        ] {
            assert_eq!(sm.process(event), Some(expect), "event {event}");
        }
    }

    #[test]
    fn run_self_loop_is_noop() {
        let mut sm = StateMachine::new();
        sm.process("start");
        sm.process("parent-none");
        sm.process("rc1-success");
        assert_eq!(sm.state(), BrokerState::Run);
        // rc2-none keeps the broker in run without re-running the action.
        assert_eq!(sm.process("rc2-none"), None);
        assert_eq!(sm.state(), BrokerState::Run);
    }

    #[test]
    fn unknown_events_ignored() {
        let mut sm = StateMachine::new();
        sm.process("start");
        assert_eq!(sm.process("rc3-success"), None);
        assert_eq!(sm.state(), BrokerState::Join);
    }

    #[test]
    fn failure_paths() {
        let mut sm = StateMachine::new();
        sm.process("start");
        assert_eq!(sm.process("parent-timeout"), Some(BrokerState::Shutdown));

        let mut sm = StateMachine::new();
        sm.process("start");
        sm.process("parent-ready");
        assert_eq!(sm.process("rc1-fail"), Some(BrokerState::Shutdown));
    }

    #[test]
    fn monitor_streams_until_final() {
        let mut sm = StateMachine::new();
        let req = Message::request("state-machine.monitor")
            .with_matchtag(1)
            .streaming();

        let initial = sm.subscribe(&req, BrokerState::Exit);
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].payload().unwrap()["state"], 0);

        sm.process("start");
        let updates = sm.monitor_updates(BrokerState::Join);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].payload().unwrap()["state"], 1);

        // Reaching the final state ends the stream with no-data.
        let updates = sm.monitor_updates(BrokerState::Exit);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].error().unwrap().code, ErrorCode::NoData);
        assert!(sm.monitor_updates(BrokerState::Exit).is_empty());
    }

    #[test]
    fn non_streaming_monitor_answers_once() {
        let mut sm = StateMachine::new();
        let req = Message::request("state-machine.monitor").with_matchtag(1);
        let out = sm.subscribe(&req, BrokerState::Exit);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].error().unwrap().code, ErrorCode::NoData);
    }

    #[test]
    fn state_int_roundtrip() {
        for v in 0..10 {
            let state = BrokerState::from_u32(v).unwrap();
            assert_eq!(state.to_u32(), v);
        }
        assert!(BrokerState::from_u32(10).is_none());
    }
}
