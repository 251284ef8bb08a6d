//! Subtree loss: a crashed broker takes its whole subtree out of every
//! group, and the loss shows up in overlay.stats.

mod util;

use arbor::Broker;
use futures::FutureExt;
use serde_json::json;

#[test]
fn crashed_child_subtree_leaves_groups() {
    arbor::dev_tracing::init_tracing();
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "subtree-loss";
        // k=2, size=4: rank 0 parents {1, 2}; rank 1 parents {3}.
        let t0 = util::spawn_broker(Broker::new(util::config(0, 4, session)));
        let (kill_tx, kill_rx) = flume::bounded::<()>(1);
        let b1 = Broker::new(util::config(1, 4, session));
        let t1 = compio::runtime::spawn(async move {
            let mut run = Box::pin(b1.run()).fuse();
            let mut kill = kill_rx.recv_async().fuse();
            futures::select! {
                rc = run => rc,
                // Dropping the run future mid-flight is the crash: every
                // channel the broker held closes abruptly.
                _ = kill => -1,
            }
        });
        let t2 = util::spawn_broker(Broker::new(util::config(2, 4, session)));
        let t3 = util::spawn_broker(Broker::new(util::config(3, 4, session)));

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;

        // All four ranks appear in broker.online once the tree is up.
        util::wait_for_members(&c0, "broker.online", |m| m == "0-3").await;

        // A client-visible group spanning every rank.
        let mut clients = vec![c0];
        for rank in 1..4 {
            let c = util::connect_client(session, rank).await;
            c.request("groups.join", Some(json!({ "name": "g" })))
                .await
                .unwrap();
            clients.push(c);
        }
        let c0 = clients.remove(0);
        c0.request("groups.join", Some(json!({ "name": "g" })))
            .await
            .unwrap();
        util::wait_for_members(&c0, "g", |m| m == "0-3").await;

        // Crash rank 1. Rank 0 must drop the {1, 3} subtree from both
        // groups even though rank 3 itself is still running.
        kill_tx.send(()).unwrap();
        assert_eq!(t1.await, -1);
        util::wait_for_members(&c0, "g", |m| m == "0,2").await;
        util::wait_for_members(&c0, "broker.online", |m| m == "0,2").await;

        let stats = c0.request("overlay.stats", None).await.unwrap();
        assert_eq!(stats.payload().unwrap()["peer_lost"], 1);
        // The lost child degrades the root's aggregate subtree health.
        assert_eq!(stats.payload().unwrap()["subtree"], "degraded");

        c0.request("shutdown.start", None).await.unwrap();
        drop(c0);
        drop(clients);
        assert_eq!(t0.await, 0);
        assert_eq!(t2.await, 0);
        // Rank 3 lost its parent and shut itself down.
        assert_eq!(t3.await, 0);
    });
}
