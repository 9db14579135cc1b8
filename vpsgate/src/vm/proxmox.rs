//! Proxmox VE implementation of [`VmControl`].
//!
//! Talks to `/api2/json` with an API token
//! (`Authorization: PVEAPIToken=<user>!<tokenid>=<secret>`). Every response is
//! wrapped in `{"data": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::{ConsoleEndpoint, ConsoleTicket, ControlError, LiveStatus, VmControl};
use crate::config::HypervisorConfig;
use crate::store::ResourceSample;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// One row of `rrddata`. Fields are missing for intervals with no data.
#[derive(Debug, Default, Deserialize)]
struct RrdPoint {
    cpu: Option<f64>,
    mem: Option<f64>,
    maxmem: Option<f64>,
    disk: Option<f64>,
    maxdisk: Option<f64>,
    netin: Option<f64>,
    netout: Option<f64>,
}

impl RrdPoint {
    fn to_sample(&self) -> ResourceSample {
        fn ratio(used: Option<f64>, max: Option<f64>) -> f64 {
            match (used, max) {
                (Some(used), Some(max)) if max > 0.0 => used / max * 100.0,
                _ => 0.0,
            }
        }
        ResourceSample {
            cpu: self.cpu.unwrap_or(0.0) * 100.0,
            mem: ratio(self.mem, self.maxmem),
            disk: ratio(self.disk, self.maxdisk),
            net_in: self.netin.unwrap_or(0.0) as u64,
            net_out: self.netout.unwrap_or(0.0) as u64,
        }
    }
}

#[derive(Deserialize)]
struct VncProxy {
    ticket: Option<String>,
    port: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct Version {
    version: String,
    #[serde(default)]
    release: Option<String>,
}

pub struct ProxmoxClient {
    http: reqwest::Client,
    /// `<api_url>/api2/json/`
    base: Url,
    authorization: String,
    insecure_tls: bool,
}

impl ProxmoxClient {
    pub fn new(config: &HypervisorConfig) -> Result<Self, ControlError> {
        if config.api_url.is_empty() {
            return Err(ControlError::NotConfigured);
        }
        let mut base = Url::parse(&config.api_url)
            .map_err(|e| ControlError::Malformed(format!("hypervisor.api_url: {}", e)))?;
        base.set_path("/api2/json/");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()?;

        Ok(Self {
            http,
            base,
            authorization: format!(
                "PVEAPIToken={}!{}={}",
                config.user, config.token_id, config.token_secret
            ),
            insecure_tls: config.insecure_tls,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ControlError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ControlError::Malformed(format!("bad API path {}: {}", path, e)))
    }

    fn qemu_path(node: &str, vmid: u32, rest: &str) -> String {
        format!("nodes/{}/qemu/{}/{}", node, vmid, rest)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ControlError> {
        let resp = self
            .http
            .get(self.url(path)?)
            .header(AUTHORIZATION, &self.authorization)
            .query(query)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, form: &[(&str, &str)]) -> Result<T, ControlError> {
        let resp = self
            .http
            .post(self.url(path)?)
            .header(AUTHORIZATION, &self.authorization)
            .form(form)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ControlError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ControlError::Api {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| ControlError::Malformed(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn power(&self, node: &str, vmid: u32, action: &str) -> Result<(), ControlError> {
        let task: serde_json::Value = self
            .post(&Self::qemu_path(node, vmid, &format!("status/{}", action)), &[])
            .await?;
        info!(node, vmid, action, task = %task, "power action submitted");
        Ok(())
    }
}

/// Pick the newest rrd row that actually carries data.
fn latest_point(points: Vec<RrdPoint>) -> RrdPoint {
    points
        .into_iter()
        .rev()
        .find(|p| p.cpu.is_some() || p.mem.is_some())
        .unwrap_or_default()
}

fn parse_port(value: &serde_json::Value) -> Option<u16> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl VmControl for ProxmoxClient {
    async fn start(&self, node: &str, vmid: u32) -> Result<(), ControlError> {
        self.power(node, vmid, "start").await
    }

    async fn stop(&self, node: &str, vmid: u32) -> Result<(), ControlError> {
        self.power(node, vmid, "stop").await
    }

    async fn shutdown(&self, node: &str, vmid: u32) -> Result<(), ControlError> {
        self.power(node, vmid, "shutdown").await
    }

    async fn reboot(&self, node: &str, vmid: u32) -> Result<(), ControlError> {
        self.power(node, vmid, "reboot").await
    }

    async fn status(&self, node: &str, vmid: u32) -> Result<LiveStatus, ControlError> {
        #[derive(Deserialize)]
        struct Current {
            status: String,
            #[serde(default)]
            cpu: f64,
            #[serde(default)]
            mem: u64,
            #[serde(default)]
            maxmem: u64,
            #[serde(default)]
            uptime: u64,
        }
        let current: Current = self.get(&Self::qemu_path(node, vmid, "status/current"), &[]).await?;
        Ok(LiveStatus {
            status: current.status,
            cpu: current.cpu,
            mem: current.mem,
            maxmem: current.maxmem,
            uptime: current.uptime,
        })
    }

    async fn resource_sample(&self, node: &str, vmid: u32) -> Result<ResourceSample, ControlError> {
        let points: Vec<RrdPoint> = self
            .get(&Self::qemu_path(node, vmid, "rrddata"), &[("timeframe", "hour")])
            .await?;
        let sample = latest_point(points).to_sample();
        debug!(node, vmid, cpu = sample.cpu, mem = sample.mem, "resource sample");
        Ok(sample)
    }

    async fn console_ticket(&self, node: &str, vmid: u32) -> Result<ConsoleTicket, ControlError> {
        let proxy: VncProxy = self
            .post(&Self::qemu_path(node, vmid, "vncproxy"), &[("websocket", "1")])
            .await?;
        match (proxy.ticket, proxy.port.as_ref().and_then(parse_port)) {
            (Some(ticket), Some(port)) if !ticket.is_empty() => Ok(ConsoleTicket { ticket, port }),
            _ => Err(ControlError::Malformed("vncproxy returned no ticket or port".into())),
        }
    }

    fn console_endpoint(
        &self,
        node: &str,
        vmid: u32,
        ticket: &ConsoleTicket,
    ) -> Result<ConsoleEndpoint, ControlError> {
        let mut url = self.url(&Self::qemu_path(node, vmid, "vncwebsocket"))?;
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme)
            .map_err(|_| ControlError::Malformed(format!("cannot use {} for console", url)))?;
        url.query_pairs_mut()
            .append_pair("port", &ticket.port.to_string())
            .append_pair("vncticket", &ticket.ticket);
        Ok(ConsoleEndpoint {
            url,
            authorization: Some(self.authorization.clone()),
            insecure_tls: self.insecure_tls,
        })
    }

    async fn version(&self) -> Result<String, ControlError> {
        let v: Version = self.get("version", &[]).await?;
        Ok(match v.release {
            Some(release) => format!("{} ({})", v.version, release),
            None => v.version,
        })
    }
}
