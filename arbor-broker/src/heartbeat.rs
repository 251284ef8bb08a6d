//! Heartbeat epoch.
//!
//! Rank 0 publishes a `heartbeat.pulse` event on a fixed period; every
//! broker tracks the epoch it last saw. The pulse doubles as downstream
//! liveness traffic: receiving it refreshes the parent link's last-seen
//! time like any other frame.

use arbor_core::message::Message;

/// Event topic carrying the epoch.
pub const PULSE_EVENT: &str = "heartbeat.pulse";

pub(crate) struct Heartbeat {
    epoch: u32,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        Self { epoch: 0 }
    }

    /// Root: build the next pulse event.
    pub(crate) fn pulse(&mut self) -> Message {
        self.epoch += 1;
        Message::event(PULSE_EVENT).with_payload(serde_json::json!({ "epoch": self.epoch }))
    }

    /// Any rank: note a delivered pulse.
    pub(crate) fn on_pulse(&mut self, msg: &Message) {
        if let Some(epoch) = msg
            .payload()
            .and_then(|p| p.get("epoch"))
            .and_then(serde_json::Value::as_u64)
        {
            self.epoch = epoch as u32;
        }
    }

    pub(crate) fn epoch(&self) -> u32 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_advances_epoch() {
        let mut hb = Heartbeat::new();
        let msg = hb.pulse();
        assert_eq!(hb.epoch(), 1);
        assert_eq!(msg.topic(), PULSE_EVENT);

        let mut follower = Heartbeat::new();
        follower.on_pulse(&msg);
        assert_eq!(follower.epoch(), 1);
    }
}
