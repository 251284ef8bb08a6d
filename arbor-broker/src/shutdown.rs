//! Coordinated instance shutdown.
//!
//! Active on rank 0: `shutdown.start` pushes the state machine onto the
//! shutdown path and broadcasts the `shutdown.all` event so every rank
//! aborts its rc2 stage. A streaming `shutdown.start` is held open and
//! terminated with `no-data` once the state machine reaches its final
//! state, so the admin client observes completion rather than assuming it.

use tracing::debug;

use arbor_core::error::ErrorCode;
use arbor_core::message::Message;

use crate::broker::Core;
use crate::state_machine::BrokerState;

/// The instance-wide event that tells every rank to begin shutting down.
pub const SHUTDOWN_EVENT: &str = "shutdown.all";

pub(crate) struct Shutdown {
    /// The single admin client driving the shutdown, if streaming.
    request: Option<Message>,
    in_progress: bool,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Self { request: None, in_progress: false }
    }

    /// Handle `shutdown.start`. Returns true when the broker should drive
    /// the state machine into the shutdown path and broadcast the event.
    pub(crate) fn on_start(&mut self, core: &mut Core, msg: Message) -> bool {
        if core.rank() != 0 {
            core.respond_err(&msg, ErrorCode::Protocol, "shutdown.start is only available on rank 0");
            return false;
        }
        if self.in_progress {
            core.respond_err(&msg, ErrorCode::Protocol, "shutdown is already in progress");
            return false;
        }
        self.in_progress = true;
        if msg.is_streaming() {
            self.request = Some(msg);
        } else {
            core.respond_ok(&msg, None);
        }
        true
    }

    /// Observe a state-machine transition; completion is the final state.
    pub(crate) fn on_state_change(&mut self, core: &mut Core, state: BrokerState) {
        if state < BrokerState::Exit {
            return;
        }
        debug!("shutdown: complete");
        if let Some(request) = self.request.take() {
            core.respond_err(&request, ErrorCode::NoData, "");
        }
    }

    /// The admin client went away; stop holding a response for it.
    pub(crate) fn disconnect(&mut self, disc: &Message) {
        if self
            .request
            .as_ref()
            .is_some_and(|req| disc.disconnect_match(req))
        {
            self.request = None;
        }
    }
}
