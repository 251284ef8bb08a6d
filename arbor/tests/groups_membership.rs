//! Group membership: concurrent joins, duplicate-join refusal, rank-0-only
//! aggregate, streaming watch, and disconnect-driven auto-leave.

mod util;

use arbor::{Broker, ErrorCode};
use serde_json::json;

#[test]
fn three_rank_join_converges() {
    arbor::dev_tracing::init_tracing();
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "groups-join3";
        let tasks: Vec<_> = (0..3)
            .map(|rank| util::spawn_broker(Broker::new(util::config(rank, 3, session))))
            .collect();

        let c0 = util::connect_client(session, 0).await;
        let c1 = util::connect_client(session, 1).await;
        let c2 = util::connect_client(session, 2).await;
        util::wait_for_run(&c0).await;

        // Watch the group before anyone joins.
        let watch = c0
            .streaming("groups.get", Some(json!({ "name": "x" })))
            .unwrap();
        let first = c0.next_streaming(watch).await.unwrap().unwrap();
        assert_eq!(first.payload().unwrap()["members"], "");

        // Joins respond immediately, before propagation.
        for client in [&c0, &c1, &c2] {
            client
                .request("groups.join", Some(json!({ "name": "x" })))
                .await
                .unwrap();
        }

        let members = util::wait_for_members(&c0, "x", |m| m == "0-2").await;
        assert_eq!(members, "0-2");

        // The watcher observed growth in commit order up to the full set.
        let mut seen = vec![first.payload().unwrap()["members"].as_str().unwrap().to_owned()];
        while seen.last().map(String::as_str) != Some("0-2") {
            let update = c0.next_streaming(watch).await.unwrap().unwrap();
            seen.push(update.payload().unwrap()["members"].as_str().unwrap().to_owned());
        }

        // One join per broker per group.
        let err = c0
            .request("groups.join", Some(json!({ "name": "x" })))
            .await
            .unwrap_err();
        assert_eq!(err.rpc_code(), Some(ErrorCode::AlreadyMember));

        // Leaving without a cached join is refused.
        let err = c1
            .request("groups.leave", Some(json!({ "name": "never-joined" })))
            .await
            .unwrap_err();
        assert_eq!(err.rpc_code(), Some(ErrorCode::NotMember));

        // The aggregate is only served by rank 0.
        let err = c1
            .request("groups.get", Some(json!({ "name": "x" })))
            .await
            .unwrap_err();
        assert_eq!(err.rpc_code(), Some(ErrorCode::Protocol));

        c0.request("shutdown.start", None).await.unwrap();
        drop((c0, c1, c2));
        for task in tasks {
            assert_eq!(task.await, 0);
        }
    });
}

#[test]
fn disconnect_auto_leaves() {
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "groups-autoleave";
        let tasks: Vec<_> = (0..3)
            .map(|rank| util::spawn_broker(Broker::new(util::config(rank, 3, session))))
            .collect();

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;

        let c2 = util::connect_client(session, 2).await;
        c2.request("groups.join", Some(json!({ "name": "y" })))
            .await
            .unwrap();
        util::wait_for_members(&c0, "y", |m| m == "2").await;

        // Disconnect without leaving; the broker generates the leave.
        drop(c2);
        util::wait_for_members(&c0, "y", |m| !m.contains('2')).await;

        c0.request("shutdown.start", None).await.unwrap();
        drop(c0);
        for task in tasks {
            assert_eq!(task.await, 0);
        }
    });
}

#[test]
fn brokers_join_online_group() {
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "groups-online";
        let tasks: Vec<_> = (0..3)
            .map(|rank| util::spawn_broker(Broker::new(util::config(rank, 3, session))))
            .collect();

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;
        // Every broker joins broker.online when it reaches run.
        util::wait_for_members(&c0, "broker.online", |m| m == "0-2").await;

        c0.request("shutdown.start", None).await.unwrap();
        drop(c0);
        for task in tasks {
            assert_eq!(task.await, 0);
        }
    });
}
