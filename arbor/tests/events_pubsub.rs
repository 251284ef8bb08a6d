//! Events: published anywhere, sequenced at the root, delivered to
//! subscribers on every rank exactly once.

mod util;

use arbor::Broker;
use serde_json::json;

#[test]
fn event_crosses_the_tree() {
    arbor::dev_tracing::init_tracing();
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "events-tree";
        let tasks: Vec<_> = (0..3)
            .map(|rank| util::spawn_broker(Broker::new(util::config(rank, 3, session))))
            .collect();

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;

        // Subscriber on rank 1, publisher on rank 2: the event climbs to
        // rank 0 for sequencing and fans back out.
        let c1 = util::connect_client(session, 1).await;
        c1.subscribe("test.").await.unwrap();

        let c2 = util::connect_client(session, 2).await;
        c2.request(
            "event.publish",
            Some(json!({ "topic": "test.hello", "payload": { "n": 1 } })),
        )
        .await
        .unwrap();

        let event = c1.next_event().await.unwrap();
        assert_eq!(event.topic(), "test.hello");
        assert_eq!(event.payload().unwrap()["n"], 1);
        assert!(event.seq() > 0, "root assigns a nonzero sequence");

        // Prefix filtering: an unrelated topic is not delivered.
        c2.request(
            "event.publish",
            Some(json!({ "topic": "other.noise" })),
        )
        .await
        .unwrap();
        c2.request(
            "event.publish",
            Some(json!({ "topic": "test.second" })),
        )
        .await
        .unwrap();
        let event = c1.next_event().await.unwrap();
        assert_eq!(event.topic(), "test.second");

        c0.request("shutdown.start", None).await.unwrap();
        drop((c0, c1, c2));
        for task in tasks {
            assert_eq!(task.await, 0);
        }
    });
}

#[test]
fn heartbeat_epoch_advances() {
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "events-heartbeat";
        let t0 = util::spawn_broker(Broker::new(util::config(0, 2, session)));
        let t1 = util::spawn_broker(Broker::new(util::config(1, 2, session)));

        let c1 = util::connect_client(session, 1).await;
        util::wait_for_run(&c1).await;

        // The pulse propagates downstream; rank 1's epoch follows rank 0.
        let mut epoch = 0;
        for _ in 0..100 {
            let stats = c1.request("overlay.stats", None).await.unwrap();
            epoch = stats.payload().unwrap()["epoch"].as_u64().unwrap();
            if epoch >= 2 {
                break;
            }
            compio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(epoch >= 2, "epoch never advanced: {epoch}");

        let c0 = util::connect_client(session, 0).await;
        c0.request("shutdown.start", None).await.unwrap();
        drop((c0, c1));
        assert_eq!(t0.await, 0);
        assert_eq!(t1.await, 0);
    });
}
