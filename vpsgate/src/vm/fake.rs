//! In-memory [`VmControl`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ConsoleEndpoint, ConsoleTicket, ControlError, LiveStatus, VmControl};
use crate::store::ResourceSample;

#[derive(Default)]
pub(crate) struct FakeControl {
    samples: Mutex<HashMap<u32, ResourceSample>>,
    failing: Mutex<HashSet<u32>>,
    calls: Mutex<Vec<(String, u32)>>,
    ticket_fails: AtomicBool,
}

impl FakeControl {
    pub fn set_sample(&self, vmid: u32, sample: ResourceSample) {
        self.samples.lock().unwrap().insert(vmid, sample);
    }

    /// Every call for `vmid` fails from now on.
    pub fn fail(&self, vmid: u32) {
        self.failing.lock().unwrap().insert(vmid);
    }

    pub fn fail_tickets(&self) {
        self.ticket_fails.store(true, Ordering::SeqCst);
    }

    pub fn actions_for(&self, vmid: u32) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id)| *id == vmid)
            .map(|(action, _)| action.clone())
            .collect()
    }

    fn record(&self, action: &str, vmid: u32) -> Result<(), ControlError> {
        self.calls.lock().unwrap().push((action.to_string(), vmid));
        if self.failing.lock().unwrap().contains(&vmid) {
            return Err(ControlError::Api {
                status: 500,
                message: format!("{} failed", action),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VmControl for FakeControl {
    async fn start(&self, _node: &str, vmid: u32) -> Result<(), ControlError> {
        self.record("start", vmid)
    }

    async fn stop(&self, _node: &str, vmid: u32) -> Result<(), ControlError> {
        self.record("stop", vmid)
    }

    async fn shutdown(&self, _node: &str, vmid: u32) -> Result<(), ControlError> {
        self.record("shutdown", vmid)
    }

    async fn reboot(&self, _node: &str, vmid: u32) -> Result<(), ControlError> {
        self.record("reboot", vmid)
    }

    async fn status(&self, _node: &str, vmid: u32) -> Result<LiveStatus, ControlError> {
        self.record("status", vmid)?;
        Ok(LiveStatus {
            status: "running".into(),
            ..LiveStatus::default()
        })
    }

    async fn resource_sample(&self, _node: &str, vmid: u32) -> Result<ResourceSample, ControlError> {
        self.record("sample", vmid)?;
        Ok(self
            .samples
            .lock()
            .unwrap()
            .get(&vmid)
            .copied()
            .unwrap_or_default())
    }

    async fn console_ticket(&self, _node: &str, vmid: u32) -> Result<ConsoleTicket, ControlError> {
        self.record("console_ticket", vmid)?;
        if self.ticket_fails.load(Ordering::SeqCst) {
            return Err(ControlError::Malformed("no ticket".into()));
        }
        Ok(ConsoleTicket {
            ticket: format!("PVEVNC:{}", vmid),
            port: 5900,
        })
    }

    fn console_endpoint(
        &self,
        node: &str,
        vmid: u32,
        ticket: &ConsoleTicket,
    ) -> Result<ConsoleEndpoint, ControlError> {
        let url = url::Url::parse(&format!(
            "ws://hypervisor.test/api2/json/nodes/{}/qemu/{}/vncwebsocket?port={}",
            node, vmid, ticket.port
        ))
        .map_err(|e| ControlError::Malformed(e.to_string()))?;
        Ok(ConsoleEndpoint {
            url,
            authorization: None,
            insecure_tls: false,
        })
    }

    async fn version(&self) -> Result<String, ControlError> {
        Ok("8.2.4 (fake)".into())
    }
}
