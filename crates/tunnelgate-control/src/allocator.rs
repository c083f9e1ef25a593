//! Tunnel port allocation
//!
//! A port is handed out only if no active session holds it and nothing on the
//! host is bound to it. The scan is ascending and deterministic; the store's
//! unique index is what finally arbitrates between overlapping invocations.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use tunnelgate_db::SessionStore;

use crate::config::PortPool;
use crate::error::TunnelError;
use crate::process::PortProbe;

pub struct PortAllocator {
    store: SessionStore,
    pool: PortPool,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(store: SessionStore, pool: PortPool, probe: Arc<dyn PortProbe>) -> Self {
        Self { store, pool, probe }
    }

    pub fn pool(&self) -> PortPool {
        self.pool
    }

    /// Lowest free port in the pool
    pub async fn allocate(&self) -> Result<u16, TunnelError> {
        self.allocate_excluding(&BTreeSet::new()).await
    }

    /// Lowest free port that is also not in `skip`, for retrying after an
    /// insert lost the race for a port
    pub async fn allocate_excluding(&self, skip: &BTreeSet<u16>) -> Result<u16, TunnelError> {
        let held = self.store.active_ports().await?;

        for port in self.pool.iter() {
            if held.contains(&port) || skip.contains(&port) {
                continue;
            }
            if self.probe.is_listening(port) {
                // Orphaned tunnel or a foreign service; the reaper deals with the former
                debug!("Port {} is bound outside the session store, skipping", port);
                continue;
            }
            debug!("Allocated tunnel port {}", port);
            return Ok(port);
        }

        warn!(
            "Tunnel port pool {}-{} exhausted ({} held by sessions)",
            self.pool.min,
            self.pool.max,
            held.len()
        );
        Err(TunnelError::AllocationExhausted {
            min: self.pool.min,
            max: self.pool.max,
        })
    }
}
