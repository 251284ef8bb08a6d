//! Child bootstrap wait: `join.wait-ready`.
//!
//! A non-root broker entering the join state sends `join.wait-ready` to its
//! TBON parent and holds there until the parent reaches run (success) or
//! surpasses it (failure). The server side parks requests that arrive
//! before run and answers them from the state-machine's run/shutdown
//! actions.

use std::time::Duration;

use tracing::debug;

use arbor_core::error::ErrorCode;
use arbor_core::message::Message;

use crate::broker::Core;
use crate::state_machine::BrokerState;

/// How long a child waits for its parent to become ready.
pub(crate) const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of `join.wait-ready`.
pub(crate) struct Join {
    waiters: Vec<Message>,
}

impl Join {
    pub(crate) fn new() -> Self {
        Self { waiters: Vec::new() }
    }

    /// Handle a `join.wait-ready` request given the current broker state.
    pub(crate) fn wait_ready(&mut self, core: &mut Core, state: BrokerState, msg: Message) {
        match state {
            // Run not yet reached: park the request for notify().
            BrokerState::None | BrokerState::Join | BrokerState::Init | BrokerState::Quorum => {
                debug!("join: parking wait-ready request");
                self.waiters.push(msg);
            }
            BrokerState::Run => core.respond_ok(&msg, None),
            // Run was surpassed; the instance is on its way down.
            _ => core.respond_err(&msg, ErrorCode::NoData, "parent broker is shutting down"),
        }
    }

    /// Answer parked waiters once run is entered or abandoned.
    pub(crate) fn notify(&mut self, core: &mut Core, state: BrokerState) {
        for msg in self.waiters.drain(..) {
            if state == BrokerState::Run {
                core.respond_ok(&msg, None);
            } else {
                core.respond_err(&msg, ErrorCode::NoData, "parent broker is shutting down");
            }
        }
    }

    /// Drop parked waiters from a disconnected peer.
    pub(crate) fn disconnect(&mut self, disc: &Message) {
        self.waiters.retain(|req| !disc.disconnect_match(req));
    }
}
