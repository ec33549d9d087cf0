//! Local allocator: hands out in-process servers up to a fixed capacity.
//!
//! Each `LocalServer` keeps the bundles it has received in memory and
//! instantiates models through a shared `ModelLoader`, which is enough to
//! exercise the full replicate → load → run protocol without remote hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use casegrid_core::{Model, ModelLoader, ResourceRequirements, ServerInfo};

use crate::ResourceAllocator;
use crate::server::{Server, ServerError};

/// Counters describing what the allocator has handed out so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationStats {
    pub allocated: usize,
    pub released: usize,
    pub bundles_received: usize,
    pub in_use: usize,
}

#[derive(Default)]
struct Counters {
    allocated: AtomicUsize,
    released: AtomicUsize,
    bundles_received: AtomicUsize,
}

/// In-process allocator with a fixed server capacity.
pub struct LocalAllocator {
    capacity: usize,
    runtime_version: String,
    capabilities: Vec<String>,
    loader: Arc<dyn ModelLoader>,
    /// Servers currently checked out.
    in_use: Mutex<usize>,
    counters: Arc<Counters>,
}

impl LocalAllocator {
    /// Create an allocator supporting models of the given kinds.
    pub fn new(capacity: usize, capabilities: Vec<String>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            capacity,
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities,
            loader,
            in_use: Mutex::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Override the runtime version servers advertise.
    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = version.into();
        self
    }

    pub fn stats(&self) -> AllocationStats {
        AllocationStats {
            allocated: self.counters.allocated.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            bundles_received: self.counters.bundles_received.load(Ordering::SeqCst),
            in_use: self.in_use.lock().map(|n| *n).unwrap_or_default(),
        }
    }

    fn supports(&self, requirements: &ResourceRequirements) -> bool {
        requirements.runtime_version == self.runtime_version
            && requirements
                .capabilities
                .iter()
                .all(|c| self.capabilities.contains(c))
    }
}

impl ResourceAllocator for LocalAllocator {
    fn max_servers(&self, requirements: &ResourceRequirements) -> i64 {
        if self.supports(requirements) {
            self.capacity as i64
        } else {
            debug!(?requirements, "requirements not supported by local allocator");
            0
        }
    }

    fn allocate(
        &self,
        requirements: &ResourceRequirements,
    ) -> Option<(Box<dyn Server>, ServerInfo)> {
        if !self.supports(requirements) {
            warn!(?requirements, "allocation refused: unsupported requirements");
            return None;
        }

        let mut in_use = self.in_use.lock().ok()?;
        if *in_use >= self.capacity {
            debug!(capacity = self.capacity, "local allocator at capacity");
            return None;
        }
        *in_use += 1;
        drop(in_use);

        let n = self.counters.allocated.fetch_add(1, Ordering::SeqCst) + 1;
        let info = ServerInfo {
            name: format!("local-{n}"),
            host: "localhost".to_string(),
            pid: std::process::id(),
        };
        info!(server = %info.name, "allocated local server");

        let server = LocalServer {
            info: info.clone(),
            bundles: HashMap::new(),
            loader: self.loader.clone(),
            counters: self.counters.clone(),
        };
        Some((Box::new(server), info))
    }

    fn release(&self, server: Box<dyn Server>) {
        if let Ok(mut in_use) = self.in_use.lock() {
            *in_use = in_use.saturating_sub(1);
        }
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        debug!(server = %server.info().name, "released local server");
    }
}

/// A server living in the current process.
pub struct LocalServer {
    info: ServerInfo,
    /// Received bundles: id → payload.
    bundles: HashMap<String, Vec<u8>>,
    loader: Arc<dyn ModelLoader>,
    counters: Arc<Counters>,
}

impl Server for LocalServer {
    fn info(&self) -> &ServerInfo {
        &self.info
    }

    fn receive_bundle(&mut self, id: &str, payload: &[u8]) -> Result<(), ServerError> {
        if payload.is_empty() {
            return Err(ServerError::Rejected(format!("empty payload for {id}")));
        }
        self.bundles.insert(id.to_string(), payload.to_vec());
        self.counters.bundles_received.fetch_add(1, Ordering::SeqCst);
        debug!(server = %self.info.name, bundle = %id, bytes = payload.len(), "bundle received");
        Ok(())
    }

    fn has_bundle(&self, id: &str) -> bool {
        self.bundles.contains_key(id)
    }

    fn load_model(&mut self, id: &str) -> Result<Box<dyn Model>, ServerError> {
        let payload = self
            .bundles
            .get(id)
            .ok_or_else(|| ServerError::BundleMissing(id.to_string()))?;
        Ok(self.loader.load(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casegrid_core::Paraboloid;
    use casegrid_core::paraboloid::KIND;

    fn allocator(capacity: usize) -> LocalAllocator {
        LocalAllocator::new(capacity, vec![KIND.to_string()], Arc::new(Paraboloid::load))
    }

    fn requirements() -> ResourceRequirements {
        ResourceRequirements::for_model(KIND)
    }

    #[test]
    fn max_servers_reports_capacity_for_supported_requirements() {
        assert_eq!(allocator(3).max_servers(&requirements()), 3);
    }

    #[test]
    fn max_servers_is_zero_for_unknown_capability() {
        let req = ResourceRequirements::for_model("turbine");
        assert_eq!(allocator(3).max_servers(&req), 0);
    }

    #[test]
    fn max_servers_is_zero_for_version_mismatch() {
        let alloc = allocator(3).with_runtime_version("0.0.0-other");
        assert_eq!(alloc.max_servers(&requirements()), 0);
    }

    #[test]
    fn allocate_respects_capacity_and_release_frees_slot() {
        let alloc = allocator(1);
        let (server, info) = alloc.allocate(&requirements()).unwrap();
        assert_eq!(info.name, "local-1");
        assert!(alloc.allocate(&requirements()).is_none());

        alloc.release(server);
        let stats = alloc.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.in_use, 0);
        assert!(alloc.allocate(&requirements()).is_some());
    }

    #[test]
    fn server_loads_model_from_received_bundle() {
        let alloc = allocator(1);
        let (mut server, _) = alloc.allocate(&requirements()).unwrap();
        assert!(matches!(
            server.load_model("b1"),
            Err(ServerError::BundleMissing(_))
        ));

        let payload = casegrid_core::Model::snapshot(&Paraboloid::default()).unwrap();
        server.receive_bundle("b1", &payload).unwrap();
        assert!(server.has_bundle("b1"));
        let model = server.load_model("b1").unwrap();
        assert_eq!(model.kind(), KIND);
        assert_eq!(alloc.stats().bundles_received, 1);
    }

    #[test]
    fn server_rejects_empty_payload() {
        let alloc = allocator(1);
        let (mut server, _) = alloc.allocate(&requirements()).unwrap();
        assert!(matches!(
            server.receive_bundle("b1", &[]),
            Err(ServerError::Rejected(_))
        ));
    }
}
