//! Scheduled lifecycle enforcement.
//!
//! Three cadences run as independent tasks: resource sampling followed by
//! overload enforcement, the expiry sweep, and revocation cleanup. Each
//! cadence has its own in-flight flag, so a slow cycle is skipped rather
//! than queued and never delays the other two. A failure on one VM is
//! logged and counted and the rest of the batch carries on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::MonitorConfig;
use crate::gateway::SessionRegistry;
use crate::metrics::{MetricsRegistry, SuspensionCause};
use crate::store::{Store, StoreError, VmId, VmRecord, VmStatus};
use crate::vm::{ControlError, VmControl};

pub const EXPIRY_REASON: &str = "VPS expired";

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("sampling vm {vm_id} failed: {source}")]
    Sample {
        vm_id: VmId,
        #[source]
        source: ControlError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    Sampling,
    Expiry,
    TokenCleanup,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Sampling, Cadence::Expiry, Cadence::TokenCleanup];

    fn period(&self, config: &MonitorConfig) -> Duration {
        let secs = match self {
            Self::Sampling => config.sample_interval_secs,
            Self::Expiry => config.expiry_interval_secs,
            Self::TokenCleanup => config.token_cleanup_interval_secs,
        };
        Duration::from_secs(secs)
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sampling => write!(f, "sampling"),
            Self::Expiry => write!(f, "expiry"),
            Self::TokenCleanup => write!(f, "token-cleanup"),
        }
    }
}

impl std::str::FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sampling" => Ok(Self::Sampling),
            "expiry" => Ok(Self::Expiry),
            "token-cleanup" => Ok(Self::TokenCleanup),
            other => Err(format!(
                "unknown cadence '{}' (expected sampling, expiry or token-cleanup)",
                other
            )),
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sampled: usize,
    pub overloaded: usize,
    pub failed: usize,
    pub suspended: Vec<VmId>,
    pub expired: Vec<VmId>,
    pub purged: usize,
    pub sessions_closed: usize,
}

/// Holds a cadence's in-flight flag for the duration of a cycle.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LifecycleMonitor {
    store: Arc<dyn Store>,
    control: Arc<dyn VmControl>,
    sessions: SessionRegistry,
    config: MonitorConfig,
    metrics: MetricsRegistry,
    sampling: AtomicBool,
    sweeping: AtomicBool,
    purging: AtomicBool,
}

impl LifecycleMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        control: Arc<dyn VmControl>,
        sessions: SessionRegistry,
        config: MonitorConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            control,
            sessions,
            config,
            metrics,
            sampling: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            purging: AtomicBool::new(false),
        }
    }

    /// Suspension reason recorded on auto-suspended VMs.
    pub fn overload_reason(&self) -> String {
        let minutes = (u64::from(self.config.overload_limit) * self.config.sample_interval_secs) / 60;
        format!(
            "Auto-suspended due to resource overload (>{}% for {}+ minutes)",
            self.config.cpu_threshold.max(self.config.mem_threshold),
            minutes
        )
    }

    fn flag(&self, cadence: Cadence) -> &AtomicBool {
        match cadence {
            Cadence::Sampling => &self.sampling,
            Cadence::Expiry => &self.sweeping,
            Cadence::TokenCleanup => &self.purging,
        }
    }

    /// Run one cycle now. Returns `None` if the same cadence is already
    /// mid-cycle.
    pub async fn run(&self, cadence: Cadence) -> Result<Option<CycleReport>, MonitorError> {
        let Some(_guard) = CycleGuard::try_acquire(self.flag(cadence)) else {
            debug!(%cadence, "previous cycle still running, skipping");
            return Ok(None);
        };

        let mut report = CycleReport::default();
        let now = Utc::now();
        match cadence {
            Cadence::Sampling => {
                self.sample_all(now, &mut report).await?;
                self.enforce_overloads(&mut report).await?;
            }
            Cadence::Expiry => self.sweep_expired(now, &mut report).await?,
            Cadence::TokenCleanup => {
                report.purged = self.store.purge_revocations(now).await?;
            }
        }

        if report.failed > 0 || !report.suspended.is_empty() || !report.expired.is_empty() {
            info!(%cadence, ?report, "monitor cycle completed");
        } else {
            debug!(%cadence, ?report, "monitor cycle completed");
        }
        Ok(Some(report))
    }

    async fn sample_vm(&self, vm: &VmRecord, now: DateTime<Utc>) -> Result<bool, MonitorError> {
        let sample = self
            .control
            .resource_sample(&vm.node, vm.vmid)
            .await
            .map_err(|source| MonitorError::Sample { vm_id: vm.id, source })?;
        let overloaded = sample.is_overloaded(self.config.cpu_threshold, self.config.mem_threshold);
        let count = self.store.record_sample(vm.id, sample, overloaded, now).await?;
        if overloaded {
            warn!(vm_id = vm.id, cpu = sample.cpu, mem = sample.mem, count, "vm over resource threshold");
        }
        Ok(overloaded)
    }

    /// Sample every running VM with bounded concurrency.
    #[instrument(skip(self, report))]
    async fn sample_all(&self, now: DateTime<Utc>, report: &mut CycleReport) -> Result<(), MonitorError> {
        let running: Vec<VmRecord> = self
            .store
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.status == VmStatus::Running)
            .collect();

        let samples: Vec<_> = running
            .iter()
            .map(|vm| async move { (vm.id, self.sample_vm(vm, now).await) })
            .collect();
        let results: Vec<(VmId, Result<bool, MonitorError>)> = stream::iter(samples)
            .buffer_unordered(self.config.max_concurrent_samples.max(1))
            .collect()
            .await;

        for (vm_id, result) in results {
            match result {
                Ok(overloaded) => {
                    report.sampled += 1;
                    if overloaded {
                        report.overloaded += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.record_sample_error();
                    warn!(vm_id, error = %e, "resource sample failed");
                }
            }
        }
        Ok(())
    }

    /// Suspend running, non-overridden VMs whose counter reached the limit.
    #[instrument(skip(self, report))]
    async fn enforce_overloads(&self, report: &mut CycleReport) -> Result<(), MonitorError> {
        let limit = self.config.overload_limit;
        let reason = self.overload_reason();
        for vm in self.store.overload_candidates(limit).await? {
            match self.store.suspend_for_overload(vm.id, limit, &reason).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(vm_id = vm.id, "vm no longer qualifies for suspension");
                    continue;
                }
                Err(e) => {
                    warn!(vm_id = vm.id, error = %e, "failed to suspend overloaded vm");
                    continue;
                }
            }
            warn!(vm_id = vm.id, vmid = vm.vmid, node = %vm.node, "vm auto-suspended for overload");
            if let Err(e) = self.control.shutdown(&vm.node, vm.vmid).await {
                warn!(vm_id = vm.id, vmid = vm.vmid, error = %e, "graceful stop of overloaded vm failed");
            }
            report.sessions_closed += self.sessions.force_close_by_vm(vm.id);
            report.suspended.push(vm.id);
            self.metrics.record_suspension(SuspensionCause::Overload);
        }
        Ok(())
    }

    /// Expire VMs whose expiry date is today (UTC) or earlier.
    #[instrument(skip(self, report))]
    async fn sweep_expired(&self, now: DateTime<Utc>, report: &mut CycleReport) -> Result<(), MonitorError> {
        let today = now.date_naive();
        for vm in self.store.expired_candidates(today).await? {
            match self.store.expire(vm.id, today, EXPIRY_REASON).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(vm_id = vm.id, error = %e, "failed to expire vm");
                    continue;
                }
            }
            info!(vm_id = vm.id, vmid = vm.vmid, expiry_date = ?vm.expiry_date, "vm expired");
            if let Err(e) = self.control.stop(&vm.node, vm.vmid).await {
                warn!(vm_id = vm.id, vmid = vm.vmid, error = %e, "stopping expired vm failed");
            }
            report.sessions_closed += self.sessions.force_close_by_vm(vm.id);
            report.expired.push(vm.id);
            self.metrics.record_suspension(SuspensionCause::Expiry);
        }
        Ok(())
    }

    /// One task per cadence, all stopped by `cancel`. Each task yields its
    /// cadence when it exits.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinSet<Cadence> {
        let mut tasks = JoinSet::new();
        for cadence in Cadence::ALL {
            let monitor = Arc::clone(&self);
            let cancel = cancel.clone();
            let period = cadence.period(&self.config);
            tasks.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = monitor.run(cadence).await {
                                error!(%cadence, error = %e, "monitor cycle failed");
                            }
                        }
                    }
                }
                debug!(%cadence, "monitor cadence stopped");
                cadence
            });
        }
        info!(
            sample_secs = self.config.sample_interval_secs,
            expiry_secs = self.config.expiry_interval_secs,
            cleanup_secs = self.config.token_cleanup_interval_secs,
            "lifecycle monitor started"
        );
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    use crate::config::PortsConfig;
    use crate::gateway::SessionKind;
    use crate::store::{MemoryStore, NewVm, ResourceSample};
    use crate::vm::fake::FakeControl;

    struct Fixture {
        monitor: Arc<LifecycleMonitor>,
        store: Arc<dyn Store>,
        control: Arc<FakeControl>,
        sessions: SessionRegistry,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(&PortsConfig::default()));
        let control = Arc::new(FakeControl::default());
        let sessions = SessionRegistry::new();
        let monitor = Arc::new(LifecycleMonitor::new(
            store.clone(),
            control.clone(),
            sessions.clone(),
            MonitorConfig::default(),
            MetricsRegistry::new(),
        ));
        Fixture {
            monitor,
            store,
            control,
            sessions,
        }
    }

    async fn running_vm(store: &Arc<dyn Store>, vmid: u32, expiry: Option<NaiveDate>) -> VmRecord {
        let vm = store
            .create_vm(NewVm {
                vmid,
                name: format!("vm-{}", vmid),
                node: "pve".into(),
                owner: Some(1),
                ip_address: format!("10.0.0.{}", vmid % 250).parse().unwrap(),
                expiry_date: expiry,
            })
            .await
            .unwrap();
        store.set_status(vm.id, VmStatus::Running, None).await.unwrap()
    }

    fn sample(cpu: f64, mem: f64) -> ResourceSample {
        ResourceSample {
            cpu,
            mem,
            disk: 40.0,
            net_in: 1_000,
            net_out: 2_000,
        }
    }

    #[test]
    fn test_overload_reason_matches_defaults() {
        let f = fixture();
        assert_eq!(
            f.monitor.overload_reason(),
            "Auto-suspended due to resource overload (>95% for 3+ minutes)"
        );
    }

    #[test]
    fn test_cadence_parse() {
        for cadence in Cadence::ALL {
            assert_eq!(cadence.to_string().parse::<Cadence>().unwrap(), cadence);
        }
        assert!("hourly".parse::<Cadence>().is_err());
    }

    #[tokio::test]
    async fn test_three_overloaded_samples_suspend() {
        let f = fixture();
        let vm = running_vm(&f.store, 101, None).await;
        let session = f.sessions.insert(Uuid::new_v4(), 1, vm.id, SessionKind::Shell);
        f.control.set_sample(vm.vmid, sample(97.0, 50.0));

        for _ in 0..2 {
            let report = f.monitor.run(Cadence::Sampling).await.unwrap().unwrap();
            assert_eq!(report.overloaded, 1);
            assert!(report.suspended.is_empty());
        }
        assert_eq!(f.store.monitoring(vm.id).await.unwrap().unwrap().overload_count, 2);

        let report = f.monitor.run(Cadence::Sampling).await.unwrap().unwrap();
        assert_eq!(report.suspended, vec![vm.id]);
        assert_eq!(report.sessions_closed, 1);
        assert!(session.is_cancelled());

        let vm_now = f.store.get_vm(vm.id).await.unwrap().unwrap();
        assert_eq!(vm_now.status, VmStatus::Suspended);
        assert_eq!(
            vm_now.suspension_reason.as_deref(),
            Some("Auto-suspended due to resource overload (>95% for 3+ minutes)")
        );
        assert_eq!(f.store.monitoring(vm.id).await.unwrap().unwrap().overload_count, 0);
        assert!(f.control.actions_for(vm.vmid).contains(&"shutdown".to_string()));

        // Suspended VMs are no longer sampled.
        let report = f.monitor.run(Cadence::Sampling).await.unwrap().unwrap();
        assert_eq!(report.sampled, 0);
    }

    #[tokio::test]
    async fn test_calm_sample_resets_counter() {
        let f = fixture();
        let vm = running_vm(&f.store, 101, None).await;

        for (cpu, mem) in [(97.0, 10.0), (10.0, 99.0), (20.0, 20.0), (96.0, 10.0), (10.0, 96.0)] {
            f.control.set_sample(vm.vmid, sample(cpu, mem));
            f.monitor.run(Cadence::Sampling).await.unwrap();
        }
        let record = f.store.monitoring(vm.id).await.unwrap().unwrap();
        assert_eq!(record.overload_count, 2);
        assert_eq!(record.latest.mem, 96.0);
        assert!(record.last_check.is_some());
        assert_eq!(f.store.get_vm(vm.id).await.unwrap().unwrap().status, VmStatus::Running);
    }

    #[tokio::test]
    async fn test_override_suppresses_suspension() {
        let f = fixture();
        let vm = running_vm(&f.store, 101, None).await;
        f.store.set_override(vm.id, true).await.unwrap();
        f.control.set_sample(vm.vmid, sample(99.0, 99.0));

        for _ in 0..5 {
            let report = f.monitor.run(Cadence::Sampling).await.unwrap().unwrap();
            assert!(report.suspended.is_empty());
        }
        assert_eq!(f.store.get_vm(vm.id).await.unwrap().unwrap().status, VmStatus::Running);
        assert_eq!(f.store.monitoring(vm.id).await.unwrap().unwrap().overload_count, 5);
    }

    #[tokio::test]
    async fn test_sample_failure_is_isolated() {
        let f = fixture();
        let bad = running_vm(&f.store, 101, None).await;
        let good = running_vm(&f.store, 102, None).await;
        f.control.fail(bad.vmid);
        f.control.set_sample(good.vmid, sample(12.5, 30.0));

        let report = f.monitor.run(Cadence::Sampling).await.unwrap().unwrap();
        assert_eq!(report.sampled, 1);
        assert_eq!(report.failed, 1);

        let record = f.store.monitoring(good.id).await.unwrap().unwrap();
        assert_eq!(record.latest.cpu, 12.5);
        // The failed VM keeps its previous counter instead of a zero sample.
        assert!(f.store.monitoring(bad.id).await.unwrap().unwrap().last_check.is_none());
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let f = fixture();
        let today = Utc::now().date_naive();
        let yesterday = today.pred_opt().unwrap();
        let tomorrow = today.succ_opt().unwrap();

        let lapsed = running_vm(&f.store, 101, Some(yesterday)).await;
        let spared = running_vm(&f.store, 102, Some(yesterday)).await;
        let current = running_vm(&f.store, 103, Some(tomorrow)).await;
        f.store.set_override(spared.id, true).await.unwrap();
        let session = f.sessions.insert(Uuid::new_v4(), 1, lapsed.id, SessionKind::Console);

        let report = f.monitor.run(Cadence::Expiry).await.unwrap().unwrap();
        assert_eq!(report.expired, vec![lapsed.id]);
        assert!(session.is_cancelled());

        let lapsed_now = f.store.get_vm(lapsed.id).await.unwrap().unwrap();
        assert_eq!(lapsed_now.status, VmStatus::Expired);
        assert_eq!(lapsed_now.suspension_reason.as_deref(), Some(EXPIRY_REASON));
        assert_eq!(f.control.actions_for(lapsed.vmid), vec!["stop".to_string()]);
        assert_eq!(f.store.get_vm(spared.id).await.unwrap().unwrap().status, VmStatus::Running);
        assert_eq!(f.store.get_vm(current.id).await.unwrap().unwrap().status, VmStatus::Running);

        // Already expired VMs are not processed again.
        let report = f.monitor.run(Cadence::Expiry).await.unwrap().unwrap();
        assert!(report.expired.is_empty());
    }

    #[tokio::test]
    async fn test_failed_stop_does_not_block_expiry() {
        let f = fixture();
        let yesterday = Utc::now().date_naive().pred_opt().unwrap();
        let vm = running_vm(&f.store, 101, Some(yesterday)).await;
        f.control.fail(vm.vmid);

        let report = f.monitor.run(Cadence::Expiry).await.unwrap().unwrap();
        assert_eq!(report.expired, vec![vm.id]);
        assert_eq!(f.store.get_vm(vm.id).await.unwrap().unwrap().status, VmStatus::Expired);
    }

    #[tokio::test]
    async fn test_token_cleanup() {
        let f = fixture();
        let now = Utc::now();
        f.store
            .revoke_token("old".into(), now - chrono::Duration::hours(1))
            .await
            .unwrap();
        f.store
            .revoke_token("fresh".into(), now + chrono::Duration::hours(1))
            .await
            .unwrap();

        let report = f.monitor.run(Cadence::TokenCleanup).await.unwrap().unwrap();
        assert_eq!(report.purged, 1);
        assert!(f.store.is_token_revoked("fresh", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let f = fixture();
        let _busy = CycleGuard::try_acquire(&f.monitor.sampling).unwrap();
        assert_eq!(f.monitor.run(Cadence::Sampling).await.unwrap(), None);
        // Other cadences are unaffected.
        assert!(f.monitor.run(Cadence::TokenCleanup).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_cadences_stop_on_cancel() {
        let f = fixture();
        let vm = running_vm(&f.store, 101, None).await;
        f.control.set_sample(vm.vmid, sample(99.0, 10.0));

        let cancel = CancellationToken::new();
        let mut tasks = Arc::clone(&f.monitor).spawn(cancel.clone());

        // Initial tick plus two more minutes of sampling.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(f.store.get_vm(vm.id).await.unwrap().unwrap().status, VmStatus::Suspended);

        cancel.cancel();
        let mut stopped = Vec::new();
        while let Some(res) = tasks.join_next().await {
            stopped.push(res.unwrap());
        }
        assert_eq!(stopped.len(), 3);
    }
}
