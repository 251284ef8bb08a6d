//! Service switch: topic service names mapped to their owners.
//!
//! Builtin handlers are registered once at broker construction. Modules
//! register service names dynamically (`service.add`); a dynamic
//! registration shadows an identically named builtin while the module runs,
//! and the builtin resumes when the module's registrations are dropped.

use std::sync::Arc;

use hashbrown::HashMap;

use arbor_core::error::ErrorCode;
use arbor_core::message::{role, Credential};

/// The method part of a dotted topic (everything after the service name).
#[must_use]
pub(crate) fn topic_method(topic: &str) -> &str {
    topic.split_once('.').map_or("", |(_, method)| method)
}

/// The broker-internal services dispatched without a module channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinService {
    Overlay,
    Groups,
    StateMachine,
    Join,
    Shutdown,
    Content,
    Pmi,
    Event,
    Module,
    Service,
}

/// Who answers requests for a service name.
#[derive(Debug, Clone)]
pub enum ServiceOwner {
    Builtin(BuiltinService),
    /// Module name; the module host resolves it to the module's channel.
    Module(Arc<str>),
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub owner: ServiceOwner,
    /// Roles allowed in addition to the instance owner.
    pub open_roles: u32,
}

/// name → owner registry with builtin/dynamic layering.
#[derive(Debug, Default)]
pub struct ServiceSwitch {
    builtins: HashMap<&'static str, ServiceEntry>,
    dynamic: HashMap<String, ServiceEntry>,
}

impl ServiceSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_builtin(&mut self, name: &'static str, svc: BuiltinService, open_roles: u32) {
        self.builtins.insert(
            name,
            ServiceEntry { owner: ServiceOwner::Builtin(svc), open_roles },
        );
    }

    /// Register `name` to a module.
    ///
    /// # Errors
    ///
    /// Exactly one dynamic registration may be active per name.
    pub fn register_module(&mut self, name: &str, module: Arc<str>) -> Result<(), ErrorCode> {
        if self.dynamic.contains_key(name) {
            return Err(ErrorCode::Protocol);
        }
        self.dynamic.insert(
            name.to_owned(),
            ServiceEntry {
                owner: ServiceOwner::Module(module),
                open_roles: role::USER,
            },
        );
        Ok(())
    }

    /// Drop one dynamic registration, verifying ownership.
    ///
    /// # Errors
    ///
    /// `NotFound` when `name` is not registered to `module`.
    pub fn unregister_module(&mut self, name: &str, module: &str) -> Result<(), ErrorCode> {
        match self.dynamic.get(name) {
            Some(ServiceEntry { owner: ServiceOwner::Module(owner), .. })
                if owner.as_ref() == module =>
            {
                self.dynamic.remove(name);
                Ok(())
            }
            _ => Err(ErrorCode::NotFound),
        }
    }

    /// Drop every registration owned by `module` (module exit). Returns the
    /// dropped names.
    pub fn drop_module(&mut self, module: &str) -> Vec<String> {
        let names: Vec<String> = self
            .dynamic
            .iter()
            .filter(|(_, entry)| {
                matches!(&entry.owner, ServiceOwner::Module(owner) if owner.as_ref() == module)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.dynamic.remove(name);
        }
        names
    }

    /// Resolve a service name; dynamic registrations shadow builtins.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ServiceEntry> {
        self.dynamic.get(name).or_else(|| self.builtins.get(name))
    }

    /// ACL check: the instance owner always passes; other credentials need a
    /// role the entry opened up.
    #[must_use]
    pub fn authorize(entry: &ServiceEntry, cred: Credential) -> bool {
        cred.has_role(role::OWNER) || cred.rolemask & entry.open_roles != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_shadows_builtin_then_resumes() {
        let mut switch = ServiceSwitch::new();
        switch.register_builtin("groups", BuiltinService::Groups, role::USER);

        let module: Arc<str> = Arc::from("custom-groups");
        switch.register_module("groups", module.clone()).unwrap();
        assert!(matches!(
            switch.lookup("groups").unwrap().owner,
            ServiceOwner::Module(_)
        ));

        assert_eq!(switch.drop_module(&module), vec!["groups".to_owned()]);
        assert!(matches!(
            switch.lookup("groups").unwrap().owner,
            ServiceOwner::Builtin(BuiltinService::Groups)
        ));
    }

    #[test]
    fn single_active_registration() {
        let mut switch = ServiceSwitch::new();
        switch.register_module("kvs", Arc::from("kvs-a")).unwrap();
        assert_eq!(
            switch.register_module("kvs", Arc::from("kvs-b")).unwrap_err(),
            ErrorCode::Protocol
        );
    }

    #[test]
    fn unregister_checks_owner() {
        let mut switch = ServiceSwitch::new();
        switch.register_module("kvs", Arc::from("kvs-a")).unwrap();
        assert_eq!(
            switch.unregister_module("kvs", "kvs-b").unwrap_err(),
            ErrorCode::NotFound
        );
        switch.unregister_module("kvs", "kvs-a").unwrap();
        assert!(switch.lookup("kvs").is_none());
    }

    #[test]
    fn authorization() {
        let entry = ServiceEntry {
            owner: ServiceOwner::Builtin(BuiltinService::Groups),
            open_roles: role::USER,
        };
        assert!(ServiceSwitch::authorize(&entry, Credential::owner(0)));
        assert!(ServiceSwitch::authorize(&entry, Credential::new(100, role::USER)));

        let closed = ServiceEntry {
            owner: ServiceOwner::Builtin(BuiltinService::StateMachine),
            open_roles: 0,
        };
        assert!(!ServiceSwitch::authorize(&closed, Credential::new(100, role::USER)));
        assert!(ServiceSwitch::authorize(&closed, Credential::owner(0)));
    }
}
