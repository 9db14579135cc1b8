use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::PortsConfig;
use crate::store::{Store, StoreError, VmId};

/// Whether an address sits in one of the RFC1918 ranges
/// (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16). VMs on these addresses are
/// reached through a forwarded port on the hypervisor host.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

/// One entry of the forwarding port pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLease {
    pub port: u16,
    pub allocated: bool,
    pub vm_id: Option<VmId>,
    pub allocated_at: Option<DateTime<Utc>>,
}

impl PortLease {
    fn free(port: u16) -> Self {
        Self {
            port,
            allocated: false,
            vm_id: None,
            allocated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("SSH port pool exhausted (ceiling {ceiling} reached)")]
    Exhausted { ceiling: u16 },

    #[error("port {port} is not part of the pool")]
    Unknown { port: u16 },

    #[error("port {port} is already leased to vm {vm_id}")]
    InUse { port: u16, vm_id: VmId },
}

/// Forwarding port pool.
///
/// Hands out the lowest free port. When every port is taken the upper bound
/// grows by one, up to `ceiling`; the bound never shrinks. This type does no
/// locking of its own: it lives inside the store state and every mutation
/// happens under the store's write lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPool {
    start: u16,
    end: u16,
    ceiling: u16,
    leases: BTreeMap<u16, PortLease>,
}

impl PortPool {
    /// Seed the pool with `start..=initial_end`, all free.
    pub fn new(config: &PortsConfig) -> Self {
        let leases = (config.start..=config.initial_end)
            .map(|port| (port, PortLease::free(port)))
            .collect();
        Self {
            start: config.start,
            end: config.initial_end,
            ceiling: config.ceiling,
            leases,
        }
    }

    /// Apply configuration to a pool restored from disk. The ceiling follows
    /// the config; seeded ports are added if `initial_end` grew. Existing
    /// leases are untouched and the current upper bound is never lowered.
    pub fn reconcile(&mut self, config: &PortsConfig) {
        self.ceiling = config.ceiling.max(self.end);
        if config.initial_end > self.end {
            for port in (self.end + 1)..=config.initial_end {
                self.leases.entry(port).or_insert_with(|| PortLease::free(port));
            }
            self.end = config.initial_end;
        }
    }

    /// Lease the lowest free port, growing the pool if none is free.
    pub fn allocate(&mut self, vm_id: Option<VmId>, now: DateTime<Utc>) -> Result<u16, PortError> {
        let port = match self.leases.values().find(|l| !l.allocated) {
            Some(lease) => lease.port,
            None => {
                if self.end >= self.ceiling {
                    return Err(PortError::Exhausted { ceiling: self.ceiling });
                }
                self.end += 1;
                debug!(port = self.end, ceiling = self.ceiling, "extended port pool");
                self.end
            }
        };

        self.leases.insert(
            port,
            PortLease {
                port,
                allocated: true,
                vm_id,
                allocated_at: Some(now),
            },
        );
        Ok(port)
    }

    /// Bind an already-leased port to a VM.
    pub fn assign(&mut self, port: u16, vm_id: VmId) -> Result<(), PortError> {
        let lease = self
            .leases
            .get_mut(&port)
            .ok_or(PortError::Unknown { port })?;
        match lease.vm_id {
            Some(owner) if lease.allocated && owner != vm_id => {
                Err(PortError::InUse { port, vm_id: owner })
            }
            _ => {
                lease.allocated = true;
                lease.vm_id = Some(vm_id);
                if lease.allocated_at.is_none() {
                    lease.allocated_at = Some(Utc::now());
                }
                Ok(())
            }
        }
    }

    /// Return a port to the pool. Releasing a free or unknown port is a no-op.
    /// Returns whether anything changed.
    pub fn release(&mut self, port: u16) -> bool {
        match self.leases.get_mut(&port) {
            Some(lease) if lease.allocated => {
                *lease = PortLease::free(port);
                true
            }
            _ => false,
        }
    }

    pub fn leases(&self) -> impl Iterator<Item = &PortLease> {
        self.leases.values()
    }

    pub fn allocated_count(&self) -> usize {
        self.leases.values().filter(|l| l.allocated).count()
    }

    /// Current upper bound (inclusive).
    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn ceiling(&self) -> u16 {
        self.ceiling
    }

    pub fn start(&self) -> u16 {
        self.start
    }
}

/// Shared handle for leasing forwarding ports.
///
/// The pool itself lives in the store so that VM creation can take a lease
/// and insert the record in one atomic step; this handle exposes the pool
/// operations on their own.
#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<dyn Store>,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Lease the lowest free port (growing the pool up to its ceiling).
    #[instrument(skip(self))]
    pub async fn allocate(&self) -> Result<u16, StoreError> {
        let port = self.store.allocate_port().await?;
        info!(port, "leased SSH forwarding port");
        Ok(port)
    }

    /// Bind a leased port to a VM.
    #[instrument(skip(self))]
    pub async fn assign(&self, port: u16, vm_id: VmId) -> Result<(), StoreError> {
        self.store.assign_port(port, vm_id).await
    }

    /// Release a port. Idempotent.
    #[instrument(skip(self))]
    pub async fn release(&self, port: u16) -> Result<(), StoreError> {
        if self.store.release_port(port).await? {
            info!(port, "released SSH forwarding port");
        } else {
            debug!(port, "release of free port ignored");
        }
        Ok(())
    }

    pub async fn leases(&self) -> Result<Vec<PortLease>, StoreError> {
        self.store.port_leases().await
    }
}
