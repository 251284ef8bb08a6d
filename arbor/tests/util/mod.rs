//! Shared helpers for multi-broker session tests.
//!
//! Each test runs a session on one compio runtime thread: brokers are
//! spawned as tasks, clients connect through the in-process endpoints, and
//! everything cooperates through awaits. Session names must be unique per
//! test because the endpoint registry is process-global.

#![allow(dead_code)]

use std::time::Duration;

use arbor::{endpoint_name, Broker, BrokerConfig, Client};

/// Test-friendly config: short batch windows, sane grace.
pub fn config(rank: u32, size: u32, session: &str) -> BrokerConfig {
    let mut cfg = BrokerConfig::new(rank, size).with_session(session);
    cfg.groups.batch_timeout = 0.02;
    cfg.overlay.torpid_grace = 5.0;
    cfg.heartbeat.period = 0.2;
    cfg
}

/// Spawn a broker task, returning its exit-code future.
pub fn spawn_broker(broker: Broker) -> compio::runtime::Task<i32> {
    compio::runtime::spawn(broker.run())
}

/// Connect a client to `rank`, retrying while the broker starts up.
pub async fn connect_client(session: &str, rank: u32) -> Client {
    let endpoint = endpoint_name(session, rank);
    for _ in 0..500 {
        if let Ok(client) = Client::connect(&endpoint) {
            return client;
        }
        compio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("could not connect to {endpoint}");
}

/// Stream `state-machine.monitor` until the broker reports `run`.
pub async fn wait_for_run(client: &Client) {
    let states = monitor_until(client, 4).await;
    assert_eq!(states.last(), Some(&4), "broker never reached run: {states:?}");
}

/// Collect monitor updates until `final_state` is reported.
pub async fn monitor_until(client: &Client, final_state: u32) -> Vec<u32> {
    let tag = client
        .streaming(
            "state-machine.monitor",
            Some(serde_json::json!({ "final": final_state })),
        )
        .expect("monitor request");
    let mut states = Vec::new();
    while let Some(update) = client.next_streaming(tag).await.expect("monitor update") {
        let state = update.payload().expect("state payload")["state"]
            .as_u64()
            .expect("state int") as u32;
        states.push(state);
    }
    states
}

/// Poll rank 0's aggregate for `group` until `predicate` holds.
pub async fn wait_for_members(
    client: &Client,
    group: &str,
    predicate: impl Fn(&str) -> bool,
) -> String {
    let mut last = String::new();
    for _ in 0..500 {
        let rsp = client
            .request("groups.get", Some(serde_json::json!({ "name": group })))
            .await
            .expect("groups.get");
        last = rsp.payload().expect("members payload")["members"]
            .as_str()
            .expect("members string")
            .to_owned();
        if predicate(&last) {
            return last;
        }
        compio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("group '{group}' never converged, last membership: {last:?}");
}
