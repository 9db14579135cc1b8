use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{
    MonitoringRecord, NewVm, ResourceSample, Store, StoreError, UserId, VmId, VmRecord, VmStatus,
};
use crate::config::PortsConfig;
use crate::ports::{self, PortLease, PortPool};

const SCHEMA_VERSION: u32 = 1;

/// Persisted state (serialized to JSON on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// Version 0 = files written without this field; version 1 = current.
    #[serde(default)]
    pub schema_version: u32,
    pub next_vm_id: VmId,
    pub vms: BTreeMap<VmId, VmRecord>,
    #[serde(default)]
    pub monitoring: BTreeMap<VmId, MonitoringRecord>,
    pub ports: PortPool,
    /// SHA-256 hex of revoked bearer tokens, mapped to the token's own expiry.
    #[serde(default)]
    pub revoked_tokens: HashMap<String, DateTime<Utc>>,
}

impl PersistedState {
    fn new(ports: &PortsConfig) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_vm_id: 1,
            vms: BTreeMap::new(),
            monitoring: BTreeMap::new(),
            ports: PortPool::new(ports),
            revoked_tokens: HashMap::new(),
        }
    }

    /// Read a state file without going through a store. Used by `status`.
    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading state file: {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing state file: {}", path.display()))
    }

    fn vm_mut(&mut self, id: VmId) -> Result<&mut VmRecord, StoreError> {
        self.vms.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn overload_count(&self, id: VmId) -> u32 {
        self.monitoring.get(&id).map_or(0, |m| m.overload_count)
    }

    fn reset_overload(&mut self, id: VmId) {
        if let Some(m) = self.monitoring.get_mut(&id) {
            m.overload_count = 0;
        }
    }

    fn is_overload_candidate(&self, vm: &VmRecord, limit: u32) -> bool {
        vm.status == VmStatus::Running
            && !vm.override_suspension
            && self.overload_count(vm.id) >= limit
    }
}

fn is_expiry_candidate(vm: &VmRecord, today: NaiveDate) -> bool {
    vm.expiry_date.is_some_and(|d| d <= today)
        && vm.status != VmStatus::Expired
        && !vm.override_suspension
}

/// In-process store. One lock guards everything, so each trait method is a
/// single atomic step. State is snapshotted to a JSON file on request.
pub struct MemoryStore {
    state: RwLock<PersistedState>,
    state_file: Option<PathBuf>,
    ports: PortsConfig,
}

impl MemoryStore {
    pub fn new(ports: &PortsConfig) -> Self {
        Self {
            state: RwLock::new(PersistedState::new(ports)),
            state_file: None,
            ports: ports.clone(),
        }
    }

    pub fn with_state_file(ports: &PortsConfig, state_file: PathBuf) -> Self {
        Self {
            state_file: Some(state_file),
            ..Self::new(ports)
        }
    }

    /// Load persisted state, if a state file is configured and present.
    pub async fn load(&self) -> Result<()> {
        let Some(state_path) = &self.state_file else {
            return Ok(());
        };
        if !state_path.exists() {
            info!(path = %state_path.display(), "no persisted state file, starting fresh");
            return Ok(());
        }

        let data = tokio::fs::read_to_string(state_path)
            .await
            .with_context(|| format!("reading state file: {}", state_path.display()))?;
        let mut persisted: PersistedState = serde_json::from_str(&data)
            .with_context(|| format!("parsing state file: {}", state_path.display()))?;

        if persisted.schema_version > SCHEMA_VERSION {
            warn!(
                version = persisted.schema_version,
                "state file has newer schema version than supported (1), some fields may be lost"
            );
        }
        persisted.schema_version = SCHEMA_VERSION;
        persisted.ports.reconcile(&self.ports);

        // Monitoring rows are created with the VM; fill gaps from older files.
        for id in persisted.vms.keys() {
            persisted.monitoring.entry(*id).or_insert_with(|| MonitoringRecord {
                vm_id: *id,
                ..Default::default()
            });
        }

        info!(
            path = %state_path.display(),
            vms = persisted.vms.len(),
            leased_ports = persisted.ports.allocated_count(),
            "loaded persisted state"
        );
        *self.state.write().await = persisted;
        Ok(())
    }

    /// Persist current state to the state file.
    pub async fn save(&self) -> Result<()> {
        let Some(state_path) = &self.state_file else {
            return Ok(());
        };

        if let Some(parent) = state_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        // Clone under the lock, write without it.
        let snapshot = self.state.read().await.clone();
        let data = serde_json::to_string_pretty(&snapshot).context("serializing state")?;

        // Write to temp file then rename (atomic on same filesystem)
        let tmp_path = state_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("writing temp state file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, state_path)
            .await
            .with_context(|| format!("renaming temp state file to: {}", state_path.display()))?;

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(state_path, perms).await.ok();

        debug!(path = %state_path.display(), "state saved");
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_vm(&self, id: VmId) -> Result<Option<VmRecord>, StoreError> {
        Ok(self.state.read().await.vms.get(&id).cloned())
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError> {
        Ok(self.state.read().await.vms.values().cloned().collect())
    }

    #[instrument(skip(self, new), fields(vmid = new.vmid, ip = %new.ip_address))]
    async fn create_vm(&self, new: NewVm) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        if state.vms.values().any(|vm| vm.vmid == new.vmid) {
            return Err(StoreError::Duplicate(new.vmid));
        }

        let id = state.next_vm_id;
        let now = Utc::now();
        let ssh_port = if ports::is_private(new.ip_address) {
            Some(state.ports.allocate(Some(id), now)?)
        } else {
            None
        };

        let record = VmRecord {
            id,
            vmid: new.vmid,
            name: new.name,
            node: new.node,
            owner: new.owner,
            ip_address: new.ip_address,
            ssh_port,
            status: VmStatus::Stopped,
            suspension_reason: None,
            override_suspension: false,
            expiry_date: new.expiry_date,
            created_at: now,
        };
        state.next_vm_id += 1;
        state.vms.insert(id, record.clone());
        state.monitoring.insert(
            id,
            MonitoringRecord {
                vm_id: id,
                ..Default::default()
            },
        );
        info!(vm_id = id, ssh_port = ?ssh_port, "vm registered");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn delete_vm(&self, id: VmId) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let record = state.vms.remove(&id).ok_or(StoreError::NotFound(id))?;
        state.monitoring.remove(&id);
        if let Some(port) = record.ssh_port {
            state.ports.release(port);
        }
        info!(vm_id = id, ssh_port = ?record.ssh_port, "vm removed");
        Ok(record)
    }

    async fn set_status(
        &self,
        id: VmId,
        status: VmStatus,
        reason: Option<String>,
    ) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        vm.status = status;
        vm.suspension_reason = reason;
        Ok(vm.clone())
    }

    async fn set_power_state(&self, id: VmId, status: VmStatus) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        if !vm.status.admits_sessions() || !status.admits_sessions() {
            return Err(StoreError::Conflict {
                vm_id: id,
                status: vm.status,
            });
        }
        vm.status = status;
        Ok(vm.clone())
    }

    async fn suspend(&self, id: VmId, reason: &str) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        match vm.status {
            VmStatus::Expired => Err(StoreError::Conflict {
                vm_id: id,
                status: vm.status,
            }),
            VmStatus::Suspended => Ok(vm.clone()),
            VmStatus::Stopped | VmStatus::Running => {
                vm.status = VmStatus::Suspended;
                vm.suspension_reason = Some(reason.to_string());
                Ok(vm.clone())
            }
        }
    }

    async fn unsuspend(&self, id: VmId) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        if vm.status.admits_sessions() {
            return Err(StoreError::Conflict {
                vm_id: id,
                status: vm.status,
            });
        }
        vm.status = VmStatus::Stopped;
        vm.suspension_reason = None;
        let record = vm.clone();
        state.reset_overload(id);
        Ok(record)
    }

    async fn set_override(&self, id: VmId, enabled: bool) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        vm.override_suspension = enabled;
        Ok(vm.clone())
    }

    async fn set_expiry(&self, id: VmId, date: Option<NaiveDate>) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        vm.expiry_date = date;
        Ok(vm.clone())
    }

    async fn assign_owner(&self, id: VmId, owner: Option<UserId>) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        vm.owner = owner;
        Ok(vm.clone())
    }

    #[instrument(skip(self))]
    async fn set_ip(&self, id: VmId, ip: IpAddr) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let current = state.vm_mut(id)?.ssh_port;

        let ssh_port = match (ports::is_private(ip), current) {
            (true, None) => Some(state.ports.allocate(Some(id), Utc::now())?),
            (false, Some(port)) => {
                state.ports.release(port);
                None
            }
            (_, keep) => keep,
        };

        let vm = state.vm_mut(id)?;
        vm.ip_address = ip;
        vm.ssh_port = ssh_port;
        Ok(vm.clone())
    }

    async fn record_sample(
        &self,
        id: VmId,
        sample: ResourceSample,
        overloaded: bool,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut state = self.state.write().await;
        let running = state.vm_mut(id)?.status == VmStatus::Running;
        let entry = state.monitoring.entry(id).or_insert_with(|| MonitoringRecord {
            vm_id: id,
            ..Default::default()
        });
        entry.latest = sample;
        entry.last_check = Some(at);
        entry.overload_count = if overloaded && running {
            entry.overload_count + 1
        } else {
            0
        };
        Ok(entry.overload_count)
    }

    async fn monitoring(&self, id: VmId) -> Result<Option<MonitoringRecord>, StoreError> {
        Ok(self.state.read().await.monitoring.get(&id).cloned())
    }

    async fn overload_candidates(&self, limit: u32) -> Result<Vec<VmRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .vms
            .values()
            .filter(|vm| state.is_overload_candidate(vm, limit))
            .cloned()
            .collect())
    }

    async fn expired_candidates(&self, today: NaiveDate) -> Result<Vec<VmRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .vms
            .values()
            .filter(|vm| is_expiry_candidate(vm, today))
            .cloned()
            .collect())
    }

    async fn suspend_for_overload(&self, id: VmId, limit: u32, reason: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let qualifies = match state.vms.get(&id) {
            Some(vm) => state.is_overload_candidate(vm, limit),
            None => return Err(StoreError::NotFound(id)),
        };
        if !qualifies {
            return Ok(false);
        }
        let vm = state.vm_mut(id)?;
        vm.status = VmStatus::Suspended;
        vm.suspension_reason = Some(reason.to_string());
        state.reset_overload(id);
        Ok(true)
    }

    async fn expire(&self, id: VmId, today: NaiveDate, reason: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(id)?;
        if !is_expiry_candidate(vm, today) {
            return Ok(false);
        }
        vm.status = VmStatus::Expired;
        vm.suspension_reason = Some(reason.to_string());
        Ok(true)
    }

    async fn allocate_port(&self) -> Result<u16, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.ports.allocate(None, Utc::now())?)
    }

    async fn assign_port(&self, port: u16, vm_id: VmId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let previous = state.vm_mut(vm_id)?.ssh_port;
        state.ports.assign(port, vm_id)?;
        if let Some(old) = previous.filter(|old| *old != port) {
            state.ports.release(old);
        }
        state.vm_mut(vm_id)?.ssh_port = Some(port);
        Ok(())
    }

    async fn release_port(&self, port: u16) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let released = state.ports.release(port);
        for vm in state.vms.values_mut().filter(|vm| vm.ssh_port == Some(port)) {
            warn!(vm_id = vm.id, port, "released port was still bound to a vm");
            vm.ssh_port = None;
        }
        Ok(released)
    }

    async fn port_leases(&self) -> Result<Vec<PortLease>, StoreError> {
        Ok(self.state.read().await.ports.leases().cloned().collect())
    }

    async fn revoke_token(&self, token_hash: String, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .revoked_tokens
            .insert(token_hash, expires_at);
        Ok(())
    }

    async fn is_token_revoked(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .revoked_tokens
            .get(token_hash)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn purge_revocations(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let before = state.revoked_tokens.len();
        state.revoked_tokens.retain(|_, expires_at| *expires_at > now);
        Ok(before - state.revoked_tokens.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortError;
    use chrono::Duration;

    fn ports(start: u16, end: u16, ceiling: u16) -> PortsConfig {
        PortsConfig {
            start,
            initial_end: end,
            ceiling,
        }
    }

    fn new_vm(vmid: u32, ip: &str) -> NewVm {
        NewVm {
            vmid,
            name: format!("vm-{}", vmid),
            node: "pve".into(),
            owner: Some(1),
            ip_address: ip.parse().unwrap(),
            expiry_date: None,
        }
    }

    fn hot() -> ResourceSample {
        ResourceSample {
            cpu: 99.0,
            mem: 40.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_private_vm_takes_lease() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "10.0.0.2")).await.unwrap();
        assert_eq!(vm.ssh_port, Some(10000));
        assert_eq!(vm.status, VmStatus::Stopped);

        let leases = store.port_leases().await.unwrap();
        let lease = leases.iter().find(|l| l.port == 10000).unwrap();
        assert!(lease.allocated);
        assert_eq!(lease.vm_id, Some(vm.id));

        let public = store.create_vm(new_vm(101, "203.0.113.7")).await.unwrap();
        assert_eq!(public.ssh_port, None);
        assert!(store.monitoring(public.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_fails_without_lease_and_inserts_nothing() {
        let store = MemoryStore::new(&ports(10000, 10000, 10000));
        store.create_vm(new_vm(100, "10.0.0.2")).await.unwrap();

        let err = store.create_vm(new_vm(101, "10.0.0.3")).await.unwrap_err();
        assert!(matches!(err, StoreError::Ports(PortError::Exhausted { ceiling: 10000 })));
        assert_eq!(store.list_vms().await.unwrap().len(), 1);

        // Public VMs need no lease.
        assert!(store.create_vm(new_vm(102, "198.51.100.1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_vmid_rejected() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        store.create_vm(new_vm(100, "10.0.0.2")).await.unwrap();
        let err = store.create_vm(new_vm(100, "10.0.0.9")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(100)));
        // The failed attempt did not consume a port.
        let vm = store.create_vm(new_vm(101, "10.0.0.3")).await.unwrap();
        assert_eq!(vm.ssh_port, Some(10001));
    }

    #[tokio::test]
    async fn test_delete_releases_lease() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "10.0.0.2")).await.unwrap();
        store.delete_vm(vm.id).await.unwrap();
        assert!(store.get_vm(vm.id).await.unwrap().is_none());
        assert!(store.monitoring(vm.id).await.unwrap().is_none());

        let next = store.create_vm(new_vm(101, "10.0.0.3")).await.unwrap();
        assert_eq!(next.ssh_port, Some(10000));

        assert!(matches!(store.delete_vm(999).await, Err(StoreError::NotFound(999))));
    }

    #[tokio::test]
    async fn test_record_sample_increments_and_resets() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();
        store.set_status(vm.id, VmStatus::Running, None).await.unwrap();

        let now = Utc::now();
        assert_eq!(store.record_sample(vm.id, hot(), true, now).await.unwrap(), 1);
        assert_eq!(store.record_sample(vm.id, hot(), true, now).await.unwrap(), 2);
        let cool = ResourceSample::default();
        assert_eq!(store.record_sample(vm.id, cool, false, now).await.unwrap(), 0);

        let m = store.monitoring(vm.id).await.unwrap().unwrap();
        assert_eq!(m.latest, cool);
        assert_eq!(m.last_check, Some(now));
    }

    #[tokio::test]
    async fn test_record_sample_on_stopped_vm_does_not_count() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();
        let count = store.record_sample(vm.id, hot(), true, Utc::now()).await.unwrap();
        assert_eq!(count, 0);
        // The sample itself is still stored.
        let m = store.monitoring(vm.id).await.unwrap().unwrap();
        assert_eq!(m.latest, hot());
    }

    #[tokio::test]
    async fn test_suspend_for_overload_is_conditional() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();
        store.set_status(vm.id, VmStatus::Running, None).await.unwrap();
        for _ in 0..3 {
            store.record_sample(vm.id, hot(), true, Utc::now()).await.unwrap();
        }
        assert_eq!(store.overload_candidates(3).await.unwrap().len(), 1);

        // An override set after the candidate scan wins.
        store.set_override(vm.id, true).await.unwrap();
        assert!(!store.suspend_for_overload(vm.id, 3, "overload").await.unwrap());
        assert!(store.overload_candidates(3).await.unwrap().is_empty());

        store.set_override(vm.id, false).await.unwrap();
        assert!(store.suspend_for_overload(vm.id, 3, "overload").await.unwrap());
        let vm = store.get_vm(vm.id).await.unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Suspended);
        assert_eq!(vm.suspension_reason.as_deref(), Some("overload"));
        assert_eq!(store.monitoring(vm.id).await.unwrap().unwrap().overload_count, 0);
    }

    #[tokio::test]
    async fn test_unsuspend() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();
        assert!(matches!(
            store.unsuspend(vm.id).await,
            Err(StoreError::Conflict { status: VmStatus::Stopped, .. })
        ));

        store
            .set_status(vm.id, VmStatus::Suspended, Some("Manual suspension by admin".into()))
            .await
            .unwrap();
        let vm = store.unsuspend(vm.id).await.unwrap();
        assert_eq!(vm.status, VmStatus::Stopped);
        assert!(vm.suspension_reason.is_none());
    }

    #[tokio::test]
    async fn test_suspend_never_overwrites_expired() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();

        let suspended = store.suspend(vm.id, "Manual suspension by admin").await.unwrap();
        assert_eq!(suspended.status, VmStatus::Suspended);

        // Already suspended keeps the first reason.
        let again = store.suspend(vm.id, "something else").await.unwrap();
        assert_eq!(again.suspension_reason.as_deref(), Some("Manual suspension by admin"));

        store.set_status(vm.id, VmStatus::Expired, Some("VPS expired".into())).await.unwrap();
        assert!(matches!(
            store.suspend(vm.id, "Manual suspension by admin").await,
            Err(StoreError::Conflict { status: VmStatus::Expired, .. })
        ));
        let vm = store.get_vm(vm.id).await.unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Expired);
        assert_eq!(vm.suspension_reason.as_deref(), Some("VPS expired"));

        assert!(matches!(store.suspend(999, "x").await, Err(StoreError::NotFound(999))));
    }

    #[tokio::test]
    async fn test_expiry_candidates() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let today = Utc::now().date_naive();
        let yesterday = today - Duration::days(1);

        let a = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();
        let b = store.create_vm(new_vm(101, "203.0.113.8")).await.unwrap();
        let c = store.create_vm(new_vm(102, "203.0.113.9")).await.unwrap();
        store.set_expiry(a.id, Some(yesterday)).await.unwrap();
        store.set_expiry(b.id, Some(yesterday)).await.unwrap();
        store.set_override(b.id, true).await.unwrap();
        store.set_expiry(c.id, Some(today + Duration::days(3))).await.unwrap();

        let ids: Vec<_> = store
            .expired_candidates(today)
            .await
            .unwrap()
            .into_iter()
            .map(|vm| vm.id)
            .collect();
        assert_eq!(ids, vec![a.id]);

        assert!(store.expire(a.id, today, "VPS expired").await.unwrap());
        assert!(!store.expire(a.id, today, "VPS expired").await.unwrap());
        assert!(!store.expire(b.id, today, "VPS expired").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_ip_moves_lease() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();

        let vm = store.set_ip(vm.id, "192.168.1.20".parse().unwrap()).await.unwrap();
        assert_eq!(vm.ssh_port, Some(10000));

        let vm = store.set_ip(vm.id, "192.168.1.21".parse().unwrap()).await.unwrap();
        assert_eq!(vm.ssh_port, Some(10000));

        let vm = store.set_ip(vm.id, "198.51.100.4".parse().unwrap()).await.unwrap();
        assert_eq!(vm.ssh_port, None);
        assert!(store.port_leases().await.unwrap().iter().all(|l| !l.allocated));
    }

    #[tokio::test]
    async fn test_assign_and_release_port() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "10.0.0.2")).await.unwrap();
        assert_eq!(vm.ssh_port, Some(10000));

        let spare = store.allocate_port().await.unwrap();
        assert_eq!(spare, 10001);
        store.assign_port(spare, vm.id).await.unwrap();
        let vm = store.get_vm(vm.id).await.unwrap().unwrap();
        assert_eq!(vm.ssh_port, Some(10001));
        // The old lease went back to the pool.
        assert_eq!(store.allocate_port().await.unwrap(), 10000);

        assert!(store.release_port(10001).await.unwrap());
        assert!(!store.release_port(10001).await.unwrap());
        assert_eq!(store.get_vm(vm.id).await.unwrap().unwrap().ssh_port, None);
    }

    #[tokio::test]
    async fn test_token_revocation() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let now = Utc::now();
        store.revoke_token("live".into(), now + Duration::hours(1)).await.unwrap();
        store.revoke_token("stale".into(), now - Duration::hours(1)).await.unwrap();

        assert!(store.is_token_revoked("live", now).await.unwrap());
        assert!(!store.is_token_revoked("stale", now).await.unwrap());
        assert!(!store.is_token_revoked("unknown", now).await.unwrap());

        assert_eq!(store.purge_revocations(now).await.unwrap(), 1);
        assert!(store.is_token_revoked("live", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let cfg = ports(10000, 10005, 10010);

        let store = MemoryStore::with_state_file(&cfg, path.clone());
        let vm = store.create_vm(new_vm(100, "10.0.0.2")).await.unwrap();
        store.set_override(vm.id, true).await.unwrap();
        store
            .revoke_token("abc".into(), Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        store.save().await.unwrap();

        let on_disk = PersistedState::read(&path).unwrap();
        assert_eq!(on_disk.schema_version, 1);
        assert_eq!(on_disk.vms.len(), 1);

        let restored = MemoryStore::with_state_file(&cfg, path);
        restored.load().await.unwrap();
        let vm = restored.get_vm(vm.id).await.unwrap().unwrap();
        assert!(vm.override_suspension);
        assert_eq!(vm.ssh_port, Some(10000));
        assert!(restored.is_token_revoked("abc", Utc::now()).await.unwrap());

        // Ids keep counting from where they left off.
        let next = restored.create_vm(new_vm(101, "10.0.0.3")).await.unwrap();
        assert_eq!(next.id, vm.id + 1);
        assert_eq!(next.ssh_port, Some(10001));
    }

    #[tokio::test]
    async fn test_power_state_refused_while_suspended() {
        let store = MemoryStore::new(&ports(10000, 10005, 10005));
        let vm = store.create_vm(new_vm(100, "203.0.113.7")).await.unwrap();
        assert_eq!(
            store.set_power_state(vm.id, VmStatus::Running).await.unwrap().status,
            VmStatus::Running
        );

        store
            .set_status(vm.id, VmStatus::Suspended, Some("Manual suspension by admin".into()))
            .await
            .unwrap();
        assert!(matches!(
            store.set_power_state(vm.id, VmStatus::Running).await,
            Err(StoreError::Conflict { status: VmStatus::Suspended, .. })
        ));
        // Power state changes never produce suspended or expired.
        store.unsuspend(vm.id).await.unwrap();
        assert!(store.set_power_state(vm.id, VmStatus::Expired).await.is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_state_file(&ports(10000, 10005, 10005), dir.path().join("none.json"));
        store.load().await.unwrap();
        assert!(store.list_vms().await.unwrap().is_empty());
    }
}
