//! Administrative VM operations.
//!
//! Everything that changes a VM outside the monitor's automatic transitions
//! goes through here, so port leases, session teardown and hypervisor power
//! actions stay consistent with the stored status.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};
use vpsgate_protocol::ErrorCode;

use crate::gateway::SessionRegistry;
use crate::metrics::{MetricsRegistry, SuspensionCause};
use crate::ports::PortError;
use crate::store::{NewVm, Store, StoreError, UserId, VmId, VmRecord, VmStatus};
use crate::vm::{ControlError, LiveStatus, VmControl};

pub const MANUAL_SUSPENSION_REASON: &str = "Manual suspension by admin";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cannot {action} a {status} VPS")]
    StatusConflict { action: PowerAction, status: VmStatus },

    #[error(transparent)]
    Control(#[from] ControlError),
}

impl ProvisionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(StoreError::Ports(PortError::Exhausted { .. })) => ErrorCode::PortExhausted,
            Self::Store(StoreError::NotFound(_)) => ErrorCode::NotFound,
            Self::Store(StoreError::Conflict { .. }) | Self::StatusConflict { .. } => ErrorCode::StatusConflict,
            Self::Control(_) => ErrorCode::DownstreamUnavailable,
            Self::Store(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Reboot,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Reboot => write!(f, "reboot"),
        }
    }
}

pub struct Provisioner {
    store: Arc<dyn Store>,
    control: Arc<dyn VmControl>,
    sessions: SessionRegistry,
    metrics: MetricsRegistry,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn Store>,
        control: Arc<dyn VmControl>,
        sessions: SessionRegistry,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            control,
            sessions,
            metrics,
        }
    }

    async fn get(&self, id: VmId) -> Result<VmRecord, ProvisionError> {
        Ok(self.store.get_vm(id).await?.ok_or(StoreError::NotFound(id))?)
    }

    /// Register a VM. A private address takes a forwarding port in the same
    /// step; if the pool is exhausted the VM is not created.
    pub async fn create(&self, new: NewVm) -> Result<VmRecord, ProvisionError> {
        let vm = self.store.create_vm(new).await?;
        info!(vm_id = vm.id, vmid = vm.vmid, ssh_port = ?vm.ssh_port, "vm created");
        Ok(vm)
    }

    /// Stop (best effort), close sessions, and drop the record and its lease.
    pub async fn delete(&self, id: VmId) -> Result<VmRecord, ProvisionError> {
        let vm = self.get(id).await?;
        if let Err(e) = self.control.stop(&vm.node, vm.vmid).await {
            warn!(vm_id = id, vmid = vm.vmid, error = %e, "stopping vm before delete failed");
        }
        let removed = self.store.delete_vm(id).await?;
        self.sessions.force_close_by_vm(id);
        info!(vm_id = id, vmid = removed.vmid, released_port = ?removed.ssh_port, "vm deleted");
        Ok(removed)
    }

    /// Expired VMs stay expired; suspending one is a conflict.
    pub async fn suspend(&self, id: VmId) -> Result<VmRecord, ProvisionError> {
        let suspended = self.store.suspend(id, MANUAL_SUSPENSION_REASON).await?;
        if let Err(e) = self.control.stop(&suspended.node, suspended.vmid).await {
            warn!(vm_id = id, vmid = suspended.vmid, error = %e, "stopping vm during suspend failed");
        }
        let closed = self.sessions.force_close_by_vm(id);
        self.metrics.record_suspension(SuspensionCause::Manual);
        info!(vm_id = id, sessions_closed = closed, "vm suspended");
        Ok(suspended)
    }

    /// Back to stopped, never straight to running.
    pub async fn unsuspend(&self, id: VmId) -> Result<VmRecord, ProvisionError> {
        let vm = self.store.unsuspend(id).await?;
        info!(vm_id = id, "vm unsuspended");
        Ok(vm)
    }

    pub async fn set_override(&self, id: VmId, enabled: bool) -> Result<VmRecord, ProvisionError> {
        let vm = self.store.set_override(id, enabled).await?;
        info!(vm_id = id, enabled, "suspension override changed");
        Ok(vm)
    }

    pub async fn set_expiry(&self, id: VmId, date: Option<NaiveDate>) -> Result<VmRecord, ProvisionError> {
        let vm = self.store.set_expiry(id, date).await?;
        info!(vm_id = id, expiry_date = ?date, "expiry date changed");
        Ok(vm)
    }

    /// Change the owner. Sessions opened by the previous owner are closed.
    pub async fn assign_owner(&self, id: VmId, owner: Option<UserId>) -> Result<VmRecord, ProvisionError> {
        let before = self.get(id).await?;
        let vm = self.store.assign_owner(id, owner).await?;
        if before.owner != owner {
            let stale: Vec<_> = self
                .sessions
                .list()
                .into_iter()
                .filter(|s| s.vm_id == id && Some(s.user_id) == before.owner)
                .collect();
            for session in &stale {
                self.sessions.force_close(session.id);
            }
            info!(vm_id = id, from = ?before.owner, to = ?owner, sessions_closed = stale.len(), "vm owner changed");
        }
        Ok(vm)
    }

    pub async fn set_ip(&self, id: VmId, ip: IpAddr) -> Result<VmRecord, ProvisionError> {
        let vm = self.store.set_ip(id, ip).await?;
        info!(vm_id = id, %ip, ssh_port = ?vm.ssh_port, "vm address changed");
        Ok(vm)
    }

    /// Account removal: close everything the user has open.
    pub fn disconnect_user(&self, user_id: UserId) -> usize {
        self.sessions.force_close_by_user(user_id)
    }

    /// Close every session on a VM without changing its status.
    pub fn disconnect_vm(&self, id: VmId) -> usize {
        self.sessions.force_close_by_vm(id)
    }

    pub async fn power(&self, id: VmId, action: PowerAction) -> Result<VmRecord, ProvisionError> {
        let vm = self.get(id).await?;
        if !vm.status.admits_sessions() && action != PowerAction::Stop {
            return Err(ProvisionError::StatusConflict {
                action,
                status: vm.status,
            });
        }

        match action {
            PowerAction::Start => self.control.start(&vm.node, vm.vmid).await?,
            PowerAction::Stop => self.control.stop(&vm.node, vm.vmid).await?,
            PowerAction::Reboot => self.control.reboot(&vm.node, vm.vmid).await?,
        }
        info!(vm_id = id, vmid = vm.vmid, %action, "power action sent");

        let target = match action {
            PowerAction::Start | PowerAction::Reboot => VmStatus::Running,
            PowerAction::Stop => VmStatus::Stopped,
        };
        if !vm.status.admits_sessions() {
            // Stopping a suspended VM leaves it suspended.
            return Ok(vm);
        }
        Ok(self.store.set_power_state(id, target).await?)
    }

    /// Pull the live state from the hypervisor and update a running/stopped
    /// record to match. Suspended and expired records are left alone.
    pub async fn sync_status(&self, id: VmId) -> Result<(VmRecord, LiveStatus), ProvisionError> {
        let vm = self.get(id).await?;
        let live = self.control.status(&vm.node, vm.vmid).await?;
        if !vm.status.admits_sessions() {
            return Ok((vm, live));
        }
        let observed = if live.status == "running" {
            VmStatus::Running
        } else {
            VmStatus::Stopped
        };
        if observed == vm.status {
            return Ok((vm, live));
        }
        let updated = self.store.set_power_state(id, observed).await?;
        info!(vm_id = id, from = %vm.status, to = %observed, "vm status synced");
        Ok((updated, live))
    }
}
