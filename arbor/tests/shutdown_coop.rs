//! Cooperative shutdown: rc aborts, cleanup still runs, exit codes fold,
//! and children drain before the root finalizes.

mod util;

use arbor::Broker;

#[test]
fn shutdown_runs_cleanup_and_folds_exit_codes() {
    arbor::dev_tracing::init_tracing();
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "shutdown-fold";
        let mut cfg0 = util::config(0, 2, session);
        // Cleanup fails with a distinctive code; the broker still drains
        // and exits with that code.
        cfg0.state_machine.rc1_script = Some("true".to_owned());
        cfg0.state_machine.cleanup_script = Some("exit 3".to_owned());
        let t0 = util::spawn_broker(Broker::new(cfg0));
        let t1 = util::spawn_broker(Broker::new(util::config(1, 2, session)));

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;

        // Streaming shutdown.start is held open until the instance is down.
        let tag = c0.streaming("shutdown.start", None).unwrap();
        assert!(c0.next_streaming(tag).await.unwrap().is_none());

        drop(c0);
        assert_eq!(t0.await, 3);
        assert_eq!(t1.await, 0);
    });
}

#[test]
fn shutdown_aborts_running_rc2() {
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "shutdown-abort";
        let mut cfg0 = util::config(0, 1, session);
        // rc2 would run far longer than the test; shutdown kills it and
        // the nonzero status flows into the exit code.
        cfg0.state_machine.rc2_script = Some("sleep 60".to_owned());
        let t0 = util::spawn_broker(Broker::new(cfg0));

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;
        c0.request("shutdown.start", None).await.unwrap();
        drop(c0);

        let rc = t0.await;
        assert!(rc >= 128, "killed rc2 should produce a signal code, got {rc}");
    });
}

#[test]
fn second_shutdown_request_is_refused() {
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let session = "shutdown-twice";
        let mut cfg0 = util::config(0, 1, session);
        cfg0.state_machine.rc2_script = Some("sleep 60".to_owned());
        let t0 = util::spawn_broker(Broker::new(cfg0));

        let c0 = util::connect_client(session, 0).await;
        util::wait_for_run(&c0).await;

        c0.request("shutdown.start", None).await.unwrap();
        let err = c0.request("shutdown.start", None).await.unwrap_err();
        assert_eq!(err.rpc_code(), Some(arbor::ErrorCode::Protocol));

        drop(c0);
        assert!(t0.await >= 128);
    });
}
