//! Request authorization at the replica boundary.
//!
//! The core consults an [`AccessController`] before admitting any client
//! request. Policy evaluation itself lives outside the core; here we keep
//! only the capability lookup seam plus two stock implementations: allow
//! everything (the default for clusters without ACLs) and a capability
//! table mapping principals to permitted RPC codes.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use crate::request::{ClientRequest, RpcCode};

/// Capability lookup for request authorization.
pub trait AccessController: Send + Sync {
    /// True if the request's principal may invoke its RPC code.
    fn allowed(&self, request: &ClientRequest) -> bool;
}

/// Permits every request; used when ACLs are disabled.
#[derive(Debug, Default)]
pub struct AllowAllController;

impl AccessController for AllowAllController {
    fn allowed(&self, _request: &ClientRequest) -> bool {
        true
    }
}

/// Capability table: principal -> permitted RPC codes.
#[derive(Debug, Default)]
pub struct CapabilityController {
    capabilities: HashMap<String, HashSet<RpcCode>>,
}

impl CapabilityController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, principal: impl Into<String>, code: RpcCode) {
        self.capabilities
            .entry(principal.into())
            .or_default()
            .insert(code);
    }

    pub fn revoke(&mut self, principal: &str, code: RpcCode) {
        if let Some(codes) = self.capabilities.get_mut(principal) {
            codes.remove(&code);
        }
    }
}

impl AccessController for CapabilityController {
    fn allowed(&self, request: &ClientRequest) -> bool {
        self.capabilities
            .get(&request.principal)
            .is_some_and(|codes| codes.contains(&request.code))
    }
}

type ControllerFactory = Box<dyn Fn(&str) -> Box<dyn AccessController> + Send + Sync>;

fn factory() -> &'static Mutex<Option<ControllerFactory>> {
    static FACTORY: OnceLock<Mutex<Option<ControllerFactory>>> = OnceLock::new();
    FACTORY.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide access-controller factory.
///
/// Called once at process start by the stub; replicas constructed before
/// installation fall back to [`AllowAllController`].
pub fn set_access_controller_factory(f: ControllerFactory) {
    *factory().lock().expect("access factory poisoned") = Some(f);
}

/// Creates the access controller for a replica, by replica name.
pub fn create_replica_access_controller(name: &str) -> Box<dyn AccessController> {
    let guard = factory().lock().expect("access factory poisoned");
    match guard.as_ref() {
        Some(f) => f(name),
        None => Box::new(AllowAllController),
    }
}
