//! Scenario: a two-rank session where rank 1 joins through rank 0.
//!
//! Rank 1 holds in the join state until rank 0 reaches run, then both
//! brokers settle in run; a shutdown from rank 0 takes the whole session
//! down with exit code 0.

mod util;

use arbor::Broker;

#[test]
fn two_rank_join_ready() {
    arbor::dev_tracing::init_tracing();
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "two-rank-join";
        let t0 = util::spawn_broker(Broker::new(util::config(0, 2, session)));
        let t1 = util::spawn_broker(Broker::new(util::config(1, 2, session)));

        // Rank 1 only reaches run after its join.wait-ready completes on
        // rank 0, so observing run on rank 1 proves the bootstrap.
        let c1 = util::connect_client(session, 1).await;
        let states = util::monitor_until(&c1, 4).await;
        assert_eq!(states.last(), Some(&4), "rank 1 states: {states:?}");
        // Transitions are monotonic on the way up.
        assert!(states.windows(2).all(|w| w[0] < w[1]), "states: {states:?}");

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;

        // overlay.stats answers locally and shows the child peer; with the
        // whole tree up the root's aggregate subtree health is full.
        let stats = c0.request("overlay.stats", None).await.unwrap();
        let peers = stats.payload().unwrap()["peers"].as_array().unwrap().clone();
        assert!(
            peers.iter().any(|p| p["role"] == "child" && p["rank"] == 1),
            "peers: {peers:?}"
        );
        assert_eq!(stats.payload().unwrap()["subtree"], "full");

        drop(c1);
        c0.request("shutdown.start", None).await.unwrap();
        drop(c0);
        assert_eq!(t0.await, 0);
        assert_eq!(t1.await, 0);
    });
}

#[test]
fn unknown_service_answers_method_not_found() {
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "method-not-found";
        let t0 = util::spawn_broker(Broker::new(util::config(0, 1, session)));

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;
        let err = c0.request("no-such-service.method", None).await.unwrap_err();
        assert_eq!(err.rpc_code(), Some(arbor::ErrorCode::MethodNotFound));

        c0.request("shutdown.start", None).await.unwrap();
        drop(c0);
        assert_eq!(t0.await, 0);
    });
}
