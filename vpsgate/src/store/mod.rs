pub mod memory;

pub use memory::{MemoryStore, PersistedState};

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::{self, PortError, PortLease};

pub type VmId = u64;
pub type UserId = u64;

/// VM lifecycle states as seen by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Stopped,
    Running,
    Suspended,
    Expired,
}

impl VmStatus {
    /// Suspended and expired VMs never admit new sessions.
    pub fn admits_sessions(&self) -> bool {
        !matches!(self, Self::Suspended | Self::Expired)
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown VM status: {}", other)),
        }
    }
}

/// A VM known to the panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: VmId,
    /// Hypervisor-side VM id.
    pub vmid: u32,
    pub name: String,
    pub node: String,
    pub owner: Option<UserId>,
    pub ip_address: IpAddr,
    /// Forwarding port; present iff `ip_address` is private.
    pub ssh_port: Option<u16>,
    pub status: VmStatus,
    pub suspension_reason: Option<String>,
    pub override_suspension: bool,
    pub expiry_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn is_private(&self) -> bool {
        ports::is_private(self.ip_address)
    }

    /// Command operators paste to reach the VM.
    pub fn ssh_command(&self, forward_host: Option<&str>) -> String {
        match (self.ssh_port, forward_host) {
            (Some(port), Some(host)) => format!("ssh root@{} -p {}", host, port),
            _ => format!("ssh root@{}", self.ip_address),
        }
    }
}

/// Parameters for registering a VM.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub vmid: u32,
    pub name: String,
    pub node: String,
    pub owner: Option<UserId>,
    pub ip_address: IpAddr,
    pub expiry_date: Option<NaiveDate>,
}

/// One reading from the hypervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub net_in: u64,
    pub net_out: u64,
}

impl ResourceSample {
    pub fn is_overloaded(&self, cpu_threshold: f64, mem_threshold: f64) -> bool {
        self.cpu > cpu_threshold || self.mem > mem_threshold
    }
}

/// Latest sample and consecutive-overload counter for a VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringRecord {
    pub vm_id: VmId,
    pub latest: ResourceSample,
    pub overload_count: u32,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vm {0} not found")]
    NotFound(VmId),

    #[error("a vm with hypervisor id {0} already exists")]
    Duplicate(u32),

    #[error("vm {vm_id} is {status}")]
    Conflict { vm_id: VmId, status: VmStatus },

    #[error(transparent)]
    Ports(#[from] PortError),
}

/// Transactional store for VM records, the forwarding port pool, monitoring
/// counters and revoked tokens. Every method is one atomic operation.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_vm(&self, id: VmId) -> Result<Option<VmRecord>, StoreError>;

    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError>;

    /// Insert a VM. Private-IP VMs get a port lease in the same step; if no
    /// port can be leased nothing is inserted.
    async fn create_vm(&self, new: NewVm) -> Result<VmRecord, StoreError>;

    /// Remove a VM along with its monitoring record and port lease.
    async fn delete_vm(&self, id: VmId) -> Result<VmRecord, StoreError>;

    async fn set_status(
        &self,
        id: VmId,
        status: VmStatus,
        reason: Option<String>,
    ) -> Result<VmRecord, StoreError>;

    /// Running <-> stopped. Refused with `Conflict` while the VM is suspended
    /// or expired.
    async fn set_power_state(&self, id: VmId, status: VmStatus) -> Result<VmRecord, StoreError>;

    /// Stopped or running -> suspended with `reason`, in one step. An expired
    /// VM is refused with `Conflict`; an already suspended one is returned
    /// unchanged so its original reason survives.
    async fn suspend(&self, id: VmId, reason: &str) -> Result<VmRecord, StoreError>;

    /// Suspended or expired -> stopped, clearing the reason and the overload
    /// counter.
    async fn unsuspend(&self, id: VmId) -> Result<VmRecord, StoreError>;

    async fn set_override(&self, id: VmId, enabled: bool) -> Result<VmRecord, StoreError>;

    async fn set_expiry(&self, id: VmId, date: Option<NaiveDate>) -> Result<VmRecord, StoreError>;

    async fn assign_owner(&self, id: VmId, owner: Option<UserId>) -> Result<VmRecord, StoreError>;

    /// Change the VM address, taking or releasing a port lease as needed.
    async fn set_ip(&self, id: VmId, ip: IpAddr) -> Result<VmRecord, StoreError>;

    /// Store a sample. The counter increments when `overloaded` is set and the
    /// VM is running, otherwise it resets to zero. Returns the new count.
    async fn record_sample(
        &self,
        id: VmId,
        sample: ResourceSample,
        overloaded: bool,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    async fn monitoring(&self, id: VmId) -> Result<Option<MonitoringRecord>, StoreError>;

    /// Running, non-overridden VMs whose counter reached `limit`.
    async fn overload_candidates(&self, limit: u32) -> Result<Vec<VmRecord>, StoreError>;

    /// Non-overridden, not yet expired VMs whose expiry date is on or before `today`.
    async fn expired_candidates(&self, today: NaiveDate) -> Result<Vec<VmRecord>, StoreError>;

    /// Suspend if the VM still qualifies as an overload candidate, resetting
    /// its counter. Returns whether the transition happened.
    async fn suspend_for_overload(&self, id: VmId, limit: u32, reason: &str) -> Result<bool, StoreError>;

    /// Expire if the VM still qualifies as an expiry candidate. Returns
    /// whether the transition happened.
    async fn expire(&self, id: VmId, today: NaiveDate, reason: &str) -> Result<bool, StoreError>;

    async fn allocate_port(&self) -> Result<u16, StoreError>;

    async fn assign_port(&self, port: u16, vm_id: VmId) -> Result<(), StoreError>;

    /// Returns whether the port was leased before the call.
    async fn release_port(&self, port: u16) -> Result<bool, StoreError>;

    async fn port_leases(&self) -> Result<Vec<PortLease>, StoreError>;

    async fn revoke_token(&self, token_hash: String, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn is_token_revoked(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Drop revocations whose token has expired anyway. Returns how many.
    async fn purge_revocations(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}
