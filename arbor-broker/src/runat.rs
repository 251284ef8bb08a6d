//! Named script sets run by life-cycle stages.
//!
//! The state machine starts `rc1`, `rc2`, `cleanup` and `rc3` by name and
//! consumes completion events; what a name expands to is external
//! configuration. Scripts run as external processes from a helper thread so
//! the broker loop never blocks on them; completion is posted into the
//! broker inbox as a [`BrokerEvent::ScriptDone`].
//!
//! Abort (shutdown request or signal) kills the running process; the nonzero
//! exit status then flows through the normal completion path, which is how
//! the state machine treats aborts as script failures.

use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use flume::Sender;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::BrokerEvent;
use crate::error::{BrokerError, Result};

struct ScriptHandle {
    child: Arc<Mutex<Option<Child>>>,
    aborted: Arc<AtomicBool>,
}

/// Registry and runner of named script sets.
#[derive(Default)]
pub(crate) struct Runat {
    defs: HashMap<String, String>,
    running: HashMap<String, ScriptHandle>,
}

impl Runat {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn define(&mut self, name: &str, cmdline: &str) {
        self.defs.insert(name.to_owned(), cmdline.to_owned());
    }

    pub(crate) fn is_defined(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    /// Start a defined script set; completion arrives as `ScriptDone`.
    ///
    /// # Errors
    ///
    /// Fails when `name` is undefined or already running.
    pub(crate) fn start(&mut self, name: &str, events: Sender<BrokerEvent>) -> Result<()> {
        let cmdline = self
            .defs
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::Module(format!("runat: {name} is not defined")))?;
        if self.running.contains_key(name) {
            return Err(BrokerError::Module(format!("runat: {name} is already running")));
        }

        let child_slot: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
        let aborted = Arc::new(AtomicBool::new(false));
        self.running.insert(
            name.to_owned(),
            ScriptHandle { child: child_slot.clone(), aborted: aborted.clone() },
        );

        let script = name.to_owned();
        debug!(name = %script, cmd = %cmdline, "runat: starting");
        thread::spawn(move || {
            let rc = run_script(&cmdline, &child_slot, &aborted);
            let _ = events.send(BrokerEvent::ScriptDone { name: script, rc });
        });
        Ok(())
    }

    /// Kill a running script set. No-op if it is not running.
    pub(crate) fn abort(&mut self, name: &str) {
        if let Some(handle) = self.running.get(name) {
            warn!(name, "runat: aborting");
            handle.aborted.store(true, Ordering::SeqCst);
            if let Some(child) = handle.child.lock().as_mut() {
                let _ = child.kill();
            }
        }
    }

    /// Forget a completed script set. Call from the `ScriptDone` handler.
    pub(crate) fn finished(&mut self, name: &str) {
        self.running.remove(name);
    }
}

fn run_script(cmdline: &str, slot: &Mutex<Option<Child>>, aborted: &AtomicBool) -> i32 {
    let child = Command::new("sh").arg("-c").arg(cmdline).spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(_) => return 127,
    };
    // Abort may have raced the spawn; honor it before parking the child
    // where abort() can reach it.
    if aborted.load(Ordering::SeqCst) {
        let _ = child.kill();
        return match child.wait() {
            Ok(status) => exit_code(&status),
            Err(_) => 1,
        };
    }
    *slot.lock() = Some(child);

    // Poll instead of wait(): abort() needs the mutex to deliver the kill.
    loop {
        {
            let mut guard = slot.lock();
            let Some(child) = guard.as_mut() else {
                return 1;
            };
            match child.try_wait() {
                Ok(Some(status)) => return exit_code(&status),
                Ok(None) => {}
                Err(_) => return 1,
            }
        }
        thread::sleep(std::time::Duration::from_millis(50));
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recv_done(rx: &flume::Receiver<BrokerEvent>) -> (String, i32) {
        match rx.recv_timeout(Duration::from_secs(10)).expect("completion") {
            BrokerEvent::ScriptDone { name, rc } => (name, rc),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn success_and_failure_codes() {
        let (tx, rx) = flume::unbounded();
        let mut runat = Runat::new();
        runat.define("rc1", "true");
        runat.define("rc2", "exit 3");

        runat.start("rc1", tx.clone()).unwrap();
        let (name, rc) = recv_done(&rx);
        assert_eq!((name.as_str(), rc), ("rc1", 0));
        runat.finished("rc1");

        runat.start("rc2", tx).unwrap();
        let (name, rc) = recv_done(&rx);
        assert_eq!((name.as_str(), rc), ("rc2", 3));
    }

    #[test]
    fn undefined_script_rejected() {
        let (tx, _rx) = flume::unbounded();
        let mut runat = Runat::new();
        assert!(runat.start("rc9", tx).is_err());
        assert!(!runat.is_defined("rc9"));
    }

    #[test]
    fn abort_kills_running_script() {
        let (tx, rx) = flume::unbounded();
        let mut runat = Runat::new();
        runat.define("rc2", "sleep 30");
        runat.start("rc2", tx).unwrap();

        // Give the helper thread a moment to spawn the process.
        std::thread::sleep(Duration::from_millis(100));
        runat.abort("rc2");

        let (name, rc) = recv_done(&rx);
        assert_eq!(name, "rc2");
        assert_ne!(rc, 0);
    }
}
