//! Torpidity: a child that stops producing frames lands in broker.torpid
//! within the grace window, and leaves it again on its next frame.

mod util;

use std::time::Duration;

use arbor::{Broker, Credential, Message};
use arbor_broker::link;
use arbor_broker::PeerRole;

#[test]
fn silent_child_goes_torpid_and_recovers() {
    arbor::dev_tracing::init_tracing();
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "torpid";
        let mut cfg = util::config(0, 2, session);
        cfg.overlay.torpid_grace = 0.3;
        let t0 = util::spawn_broker(Broker::new(cfg));

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;

        // A hand-rolled child link that never sends keepalives.
        let endpoint = arbor::endpoint_name(session, 0);
        let (child_tx, _child_rx) = link::connect(
            &endpoint,
            link::new_uuid(),
            PeerRole::Child,
            Some(1),
            Credential::owner(0),
        )
        .unwrap();

        // Silence past the grace window flips the torpid bit.
        util::wait_for_members(&c0, "broker.torpid", |m| m == "1").await;

        // Any frame clears it; the group updates rank-granularly.
        child_tx.send(Message::keepalive()).unwrap();
        util::wait_for_members(&c0, "broker.torpid", |m| m.is_empty()).await;

        // Going quiet again re-enters the group.
        compio::time::sleep(Duration::from_millis(400)).await;
        util::wait_for_members(&c0, "broker.torpid", |m| m == "1").await;

        // Close the fake child first so shutdown does not wait out the
        // children grace timer on it.
        drop(child_tx);
        drop(_child_rx);
        util::wait_for_members(&c0, "broker.torpid", |m| m.is_empty()).await;

        c0.request("shutdown.start", None).await.unwrap();
        drop(c0);
        assert_eq!(t0.await, 0);
    });
}
