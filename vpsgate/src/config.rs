use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides `auth.jwt_secret`.
pub const JWT_SECRET_ENV: &str = "VPSGATE_JWT_SECRET";
/// Environment variable that overrides `hypervisor.token_secret`.
pub const HYPERVISOR_SECRET_ENV: &str = "VPSGATE_HYPERVISOR_TOKEN_SECRET";
/// Environment variable that overrides `gateway.ssh_password`.
pub const SSH_PASSWORD_ENV: &str = "VPSGATE_SSH_PASSWORD";

/// Top-level configuration for the vpsgate daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub hypervisor: HypervisorConfig,
    pub ports: PortsConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply secret overrides from
    /// the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, used when no file is given.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(JWT_SECRET_ENV) {
            if !secret.is_empty() {
                self.auth.jwt_secret = secret;
            }
        }
        if let Ok(secret) = std::env::var(HYPERVISOR_SECRET_ENV) {
            if !secret.is_empty() {
                self.hypervisor.token_secret = secret;
            }
        }
        if let Ok(password) = std::env::var(SSH_PASSWORD_ENV) {
            if !password.is_empty() {
                self.gateway.ssh_password = Some(password);
            }
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.ports.start >= 1, "ports.start must be >= 1");
        anyhow::ensure!(
            self.ports.start <= self.ports.initial_end,
            "ports.start must be <= ports.initial_end"
        );
        anyhow::ensure!(
            self.ports.initial_end <= self.ports.ceiling,
            "ports.initial_end must be <= ports.ceiling"
        );
        anyhow::ensure!(
            self.gateway.idle_timeout_secs >= 1,
            "gateway.idle_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.gateway.connect_timeout_secs >= 1,
            "gateway.connect_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.gateway.cols >= 1 && self.gateway.rows >= 1,
            "gateway.cols and gateway.rows must be >= 1"
        );
        for (name, value) in [
            ("monitor.cpu_threshold", self.monitor.cpu_threshold),
            ("monitor.mem_threshold", self.monitor.mem_threshold),
        ] {
            anyhow::ensure!(
                (0.0..=100.0).contains(&value),
                "{} must be between 0 and 100, got {}",
                name,
                value
            );
        }
        anyhow::ensure!(
            self.monitor.overload_limit >= 1,
            "monitor.overload_limit must be >= 1"
        );
        anyhow::ensure!(
            self.monitor.max_concurrent_samples >= 1,
            "monitor.max_concurrent_samples must be >= 1"
        );
        for (name, value) in [
            ("monitor.sample_interval_secs", self.monitor.sample_interval_secs),
            ("monitor.expiry_interval_secs", self.monitor.expiry_interval_secs),
            ("monitor.token_cleanup_interval_secs", self.monitor.token_cleanup_interval_secs),
            ("server.state_persist_interval_secs", self.server.state_persist_interval_secs),
        ] {
            anyhow::ensure!(value >= 1, "{} must be >= 1", name);
        }
        anyhow::ensure!(
            !self.auth.elevated_role.is_empty(),
            "auth.elevated_role must not be empty"
        );
        if !self.hypervisor.api_url.is_empty() {
            url::Url::parse(&self.hypervisor.api_url)
                .with_context(|| format!("hypervisor.api_url is not a valid URL: {}", self.hypervisor.api_url))?;
        }
        Ok(())
    }
}

/// Daemon / listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the tunnel endpoints listen on.
    pub bind_addr: IpAddr,
    /// Port the tunnel endpoints listen on.
    pub port: u16,
    /// Path to persist VM, lease and revocation state as JSON.
    pub state_file: PathBuf,
    /// Interval in seconds for periodic state persistence.
    pub state_persist_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            port: 5000,
            state_file: PathBuf::from("/var/lib/vpsgate/state.json"),
            state_persist_interval_secs: 30,
        }
    }
}

/// Proxmox VE API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Base URL of the API, e.g. "https://pve.example.net:8006".
    pub api_url: String,
    /// API user, e.g. "root@pam".
    pub user: String,
    /// API token name.
    pub token_id: String,
    /// API token secret. Prefer `VPSGATE_HYPERVISOR_TOKEN_SECRET`.
    pub token_secret: String,
    /// Node used when a VM record does not name one.
    pub default_node: String,
    /// Accept self-signed certificates on the API and console endpoints.
    pub insecure_tls: bool,
    pub request_timeout_secs: u64,
    /// Host that forwards leased SSH ports to private-network VMs.
    /// Defaults to the host part of `api_url`.
    pub ssh_host: Option<String>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            user: "root@pam".into(),
            token_id: "vpsgate".into(),
            token_secret: String::new(),
            default_node: "pve".into(),
            insecure_tls: false,
            request_timeout_secs: 15,
            ssh_host: None,
        }
    }
}

impl HypervisorConfig {
    /// Host used for SSH port forwarding: explicit `ssh_host`, else the API host.
    pub fn forward_host(&self) -> Option<String> {
        if let Some(host) = &self.ssh_host {
            return Some(host.clone());
        }
        url::Url::parse(&self.api_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

/// SSH forwarding port pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port of the pool.
    pub start: u16,
    /// Last port seeded into the pool at first start.
    pub initial_end: u16,
    /// The pool grows one port at a time up to this bound.
    pub ceiling: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 10000,
            initial_end: 10500,
            ceiling: 20000,
        }
    }
}

/// Bearer token verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret. Prefer `VPSGATE_JWT_SECRET`.
    pub jwt_secret: String,
    pub issuer: String,
    /// Role that may open sessions on any VM regardless of ownership.
    pub elevated_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: "astracloud-vps-panel".into(),
            elevated_role: "owner".into(),
        }
    }
}

/// Terminal/console tunnel behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub idle_timeout_secs: u64,
    pub ssh_user: String,
    /// OpenSSH private key tried first for shell logins.
    pub identity_file: Option<PathBuf>,
    /// Fallback when there is no key or the VM rejects it. Prefer
    /// `VPSGATE_SSH_PASSWORD`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    /// Covers TCP connect, key exchange, authentication and shell setup.
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub cols: u16,
    pub rows: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: vpsgate_protocol::IDLE_TIMEOUT_SECS,
            ssh_user: "root".into(),
            identity_file: None,
            ssh_password: None,
            connect_timeout_secs: 30,
            keepalive_secs: 10,
            cols: vpsgate_protocol::DEFAULT_COLS,
            rows: vpsgate_protocol::DEFAULT_ROWS,
        }
    }
}

/// Lifecycle monitor cadences and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub sample_interval_secs: u64,
    pub expiry_interval_secs: u64,
    pub token_cleanup_interval_secs: u64,
    /// A sample is overloaded when cpu% or mem% is strictly above its threshold.
    pub cpu_threshold: f64,
    pub mem_threshold: f64,
    /// Consecutive overloaded samples before auto-suspension.
    pub overload_limit: u32,
    pub max_concurrent_samples: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: 60,
            expiry_interval_secs: 86400,
            token_cleanup_interval_secs: 3600,
            cpu_threshold: 95.0,
            mem_threshold: 95.0,
            overload_limit: 3,
            max_concurrent_samples: 8,
        }
    }
}
