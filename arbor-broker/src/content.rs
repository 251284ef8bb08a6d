//! Content/checkpoint backing contract.
//!
//! The broker owns only the registration bookkeeping; blobs and checkpoint
//! values live in whatever module registered as the backing store. The
//! module registers its service names (`content-backing`,
//! `kvs-checkpoint`) through the service switch and then claims the backing
//! role here; the router forwards load/store/get/put requests to it like
//! any other service, including upstream forwarding from ranks without a
//! local backing.

use std::sync::Arc;

use tracing::info;

use arbor_core::error::ErrorCode;
use arbor_core::message::Message;

use crate::broker::Core;
use crate::module::ModuleHost;

/// Service name for blob load/store.
pub const BACKING_SERVICE: &str = "content-backing";
/// Service name for checkpoint get/put.
pub const CHECKPOINT_SERVICE: &str = "kvs-checkpoint";

/// Registration state: at most one backing module per broker.
pub(crate) struct ContentRegistry {
    backing: Option<(String, Arc<str>)>,
}

impl ContentRegistry {
    pub(crate) fn new() -> Self {
        Self { backing: None }
    }

    /// `content.register-backing {name}` from a backing module.
    pub(crate) fn register(&mut self, core: &mut Core, modules: &ModuleHost, msg: &Message) {
        let Some(module) = msg.sender().and_then(|uuid| modules.name_by_uuid(uuid)) else {
            core.respond_err(msg, ErrorCode::Protocol, "register-backing requires a module");
            return;
        };
        let Some(name) = msg
            .payload()
            .and_then(|p| p.get("name"))
            .and_then(serde_json::Value::as_str)
        else {
            core.respond_err(msg, ErrorCode::Protocol, "register-backing needs a name");
            return;
        };
        if let Some((active, _)) = &self.backing {
            core.respond_err(
                msg,
                ErrorCode::Protocol,
                &format!("backing store {active} is already registered"),
            );
            return;
        }
        info!(name, module = %module, "content: backing store registered");
        self.backing = Some((name.to_owned(), module));
        core.respond_ok(msg, None);
    }

    /// `content.unregister-backing` from the owning module.
    pub(crate) fn unregister(&mut self, core: &mut Core, modules: &ModuleHost, msg: &Message) {
        let sender_module = msg.sender().and_then(|uuid| modules.name_by_uuid(uuid));
        match (&self.backing, sender_module) {
            (Some((name, owner)), Some(module)) if *owner == module => {
                info!(name = %name, "content: backing store unregistered");
                self.backing = None;
                core.respond_ok(msg, None);
            }
            _ => {
                core.respond_err(msg, ErrorCode::NotFound, "no backing store registered by sender");
            }
        }
    }

    /// Module exit clears its registration implicitly.
    pub(crate) fn on_module_exit(&mut self, module: &str) {
        if self
            .backing
            .as_ref()
            .is_some_and(|(_, owner)| owner.as_ref() == module)
        {
            info!(module, "content: backing store dropped on module exit");
            self.backing = None;
        }
    }

    #[must_use]
    pub(crate) fn backing_name(&self) -> Option<&str> {
        self.backing.as_ref().map(|(name, _)| name.as_str())
    }
}
