#[cfg(test)]
pub(crate) mod fake;
pub mod proxmox;

pub use proxmox::ProxmoxClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::ResourceSample;

/// Live state as reported by the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    /// Hypervisor-side status string, e.g. "running" or "stopped".
    pub status: String,
    /// CPU usage as a fraction of allotted cores (0.0..=1.0 per core).
    pub cpu: f64,
    pub mem: u64,
    pub maxmem: u64,
    pub uptime: u64,
}

/// One-time console credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleTicket {
    pub ticket: String,
    pub port: u16,
}

/// Where and how to open a console stream for a ticket.
#[derive(Debug, Clone)]
pub struct ConsoleEndpoint {
    pub url: url::Url,
    /// Value for the `Authorization` header on the upgrade request.
    pub authorization: Option<String>,
    pub insecure_tls: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("hypervisor API is not configured (hypervisor.api_url is empty)")]
    NotConfigured,

    #[error("hypervisor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hypervisor returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected hypervisor response: {0}")]
    Malformed(String),
}

/// VM control API of the hypervisor.
#[async_trait]
pub trait VmControl: Send + Sync {
    async fn start(&self, node: &str, vmid: u32) -> Result<(), ControlError>;

    /// Hard stop.
    async fn stop(&self, node: &str, vmid: u32) -> Result<(), ControlError>;

    /// ACPI shutdown request.
    async fn shutdown(&self, node: &str, vmid: u32) -> Result<(), ControlError>;

    async fn reboot(&self, node: &str, vmid: u32) -> Result<(), ControlError>;

    async fn status(&self, node: &str, vmid: u32) -> Result<LiveStatus, ControlError>;

    /// Latest resource reading, as percentages plus network byte counters.
    async fn resource_sample(&self, node: &str, vmid: u32) -> Result<ResourceSample, ControlError>;

    async fn console_ticket(&self, node: &str, vmid: u32) -> Result<ConsoleTicket, ControlError>;

    fn console_endpoint(
        &self,
        node: &str,
        vmid: u32,
        ticket: &ConsoleTicket,
    ) -> Result<ConsoleEndpoint, ControlError>;

    /// API version string, used as a reachability check.
    async fn version(&self) -> Result<String, ControlError>;
}

/// Stand-in used when no hypervisor API is configured. Every call fails with
/// [`ControlError::NotConfigured`], so best-effort power actions are skipped
/// and console sessions are refused.
pub struct Detached;

#[async_trait]
impl VmControl for Detached {
    async fn start(&self, _node: &str, _vmid: u32) -> Result<(), ControlError> {
        Err(ControlError::NotConfigured)
    }

    async fn stop(&self, _node: &str, _vmid: u32) -> Result<(), ControlError> {
        Err(ControlError::NotConfigured)
    }

    async fn shutdown(&self, _node: &str, _vmid: u32) -> Result<(), ControlError> {
        Err(ControlError::NotConfigured)
    }

    async fn reboot(&self, _node: &str, _vmid: u32) -> Result<(), ControlError> {
        Err(ControlError::NotConfigured)
    }

    async fn status(&self, _node: &str, _vmid: u32) -> Result<LiveStatus, ControlError> {
        Err(ControlError::NotConfigured)
    }

    async fn resource_sample(&self, _node: &str, _vmid: u32) -> Result<ResourceSample, ControlError> {
        Err(ControlError::NotConfigured)
    }

    async fn console_ticket(&self, _node: &str, _vmid: u32) -> Result<ConsoleTicket, ControlError> {
        Err(ControlError::NotConfigured)
    }

    fn console_endpoint(
        &self,
        _node: &str,
        _vmid: u32,
        _ticket: &ConsoleTicket,
    ) -> Result<ConsoleEndpoint, ControlError> {
        Err(ControlError::NotConfigured)
    }

    async fn version(&self) -> Result<String, ControlError> {
        Err(ControlError::NotConfigured)
    }
}

/// The configured hypervisor client, or [`Detached`] when `hypervisor.api_url`
/// is empty.
pub fn connect(config: &crate::config::HypervisorConfig) -> Result<std::sync::Arc<dyn VmControl>, ControlError> {
    match ProxmoxClient::new(config) {
        Ok(client) => Ok(std::sync::Arc::new(client)),
        Err(ControlError::NotConfigured) => {
            tracing::warn!("hypervisor.api_url is empty; power actions and consoles are unavailable");
            Ok(std::sync::Arc::new(Detached))
        }
        Err(e) => Err(e),
    }
}
