//! CLI-only subcommand implementations.
//!
//! `check` and `status` never touch a running daemon. The administrative
//! commands (`vm`, `ports`, `revoke-token`, `monitor run`) edit the state file
//! offline and take the same instance lock as `serve`, so they refuse to run
//! while the daemon owns the state.

use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Subcommand;

use crate::auth::JwtAuthenticator;
use crate::config::Config;
use crate::gateway::SessionRegistry;
use crate::metrics::MetricsRegistry;
use crate::monitor::{Cadence, LifecycleMonitor};
use crate::ports::PortAllocator;
use crate::provision::{PowerAction, Provisioner};
use crate::store::{MemoryStore, NewVm, PersistedState, Store, UserId, VmId, VmRecord};

// ---------------------------------------------------------------------------
// instance lock
// ---------------------------------------------------------------------------

/// Take the exclusive instance lock next to the state file. The returned
/// file must stay alive for as long as the lock is needed.
pub fn acquire_instance_lock(config: &Config) -> Result<File> {
    let lock_path = config
        .server
        .state_file
        .parent()
        .map(|p| p.join("vpsgate.lock"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/vpsgate/vpsgate.lock"));
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("failed to open instance lock file {}", lock_path.display()))?;
    use std::os::unix::io::AsRawFd;
    let fd = lock_file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "Another vpsgate instance is already running.\n\
             The daemon and offline commands share one state file and port pool.\n\
             Stop the daemon first, or check: vpsgate status"
        );
    }
    Ok(lock_file)
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `vpsgate check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_jwt_secret(config),
        check_hypervisor(config).await,
        check_ssh_credentials(config),
        check_forward_host(config),
        check_port_range(config),
        check_state_dir(config),
        check_state_file(config),
    ];

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Run: vpsgate serve --config config.toml");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_jwt_secret(config: &Config) -> Check {
    if config.auth.jwt_secret.is_empty() {
        Check::fail(
            "JWT secret",
            "auth.jwt_secret is empty",
            format!("set auth.jwt_secret or export {}", crate::config::JWT_SECRET_ENV),
        )
    } else {
        Check::pass("JWT secret", format!("issuer {}", config.auth.issuer))
    }
}

async fn check_hypervisor(config: &Config) -> Check {
    if config.hypervisor.api_url.is_empty() {
        return Check::fail(
            "Hypervisor API",
            "hypervisor.api_url is empty",
            "set hypervisor.api_url, user, token_id and token_secret",
        );
    }
    let client = match crate::vm::ProxmoxClient::new(&config.hypervisor) {
        Ok(c) => c,
        Err(e) => {
            return Check::fail("Hypervisor API", e.to_string(), "fix the [hypervisor] section")
        }
    };
    use crate::vm::VmControl;
    match client.version().await {
        Ok(version) => Check::pass("Hypervisor API", format!("{} ({})", config.hypervisor.api_url, version)),
        Err(e) => Check::fail(
            "Hypervisor API",
            format!("{}: {}", config.hypervisor.api_url, e),
            "check the API token and that the host is reachable (hypervisor.insecure_tls for self-signed certs)",
        ),
    }
}

fn check_ssh_credentials(config: &Config) -> Check {
    let gw = &config.gateway;
    if gw.identity_file.is_none() && gw.ssh_password.is_none() {
        return Check::fail(
            "SSH login",
            "no identity file or password",
            format!("set gateway.identity_file or export {}", crate::config::SSH_PASSWORD_ENV),
        );
    }
    match crate::gateway::HostDownstream::new(gw) {
        Ok(_) => {
            let detail = match &gw.identity_file {
                Some(path) => format!("{}@ key {}", gw.ssh_user, path.display()),
                None => format!("{}@ password", gw.ssh_user),
            };
            Check::pass("SSH login", detail)
        }
        Err(e) => Check::fail(
            "SSH login",
            e.to_string(),
            "point gateway.identity_file at an unencrypted OpenSSH private key",
        ),
    }
}

/// Private VMs are only reachable through their leased port on the
/// forwarding host.
fn check_forward_host(config: &Config) -> Check {
    match config.hypervisor.forward_host() {
        Some(host) => Check::pass("SSH forwarding host", host),
        None => Check::fail(
            "SSH forwarding host",
            "none; shells would dial port 22 on the VM address directly",
            "set hypervisor.ssh_host or hypervisor.api_url",
        ),
    }
}

fn check_port_range(config: &Config) -> Check {
    let p = &config.ports;
    let detail = format!("{}-{} (ceiling {})", p.start, p.initial_end, p.ceiling);
    if p.start < 1024 {
        Check::fail(
            "Forwarding ports",
            detail,
            "use ports above 1023 so they do not clash with system services",
        )
    } else {
        Check::pass("Forwarding ports", detail)
    }
}

fn check_state_dir(config: &Config) -> Check {
    let state_file = &config.server.state_file;
    let parent = match state_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return Check::pass("State directory", "current directory"),
    };

    if !parent.exists() {
        return Check::fail(
            "State directory",
            format!("{} does not exist", parent.display()),
            format!("mkdir -p {}", parent.display()),
        );
    }

    let scratch = parent.join(".vpsgate-check-write");
    match std::fs::write(&scratch, b"") {
        Ok(_) => {
            let _ = std::fs::remove_file(&scratch);
            Check::pass("State directory", parent.display().to_string())
        }
        Err(e) => Check::fail(
            "State directory",
            format!("{} is not writable: {}", parent.display(), e),
            format!("chmod u+w {} or run vpsgate as a user with write access", parent.display()),
        ),
    }
}

fn check_state_file(config: &Config) -> Check {
    let path = &config.server.state_file;
    if !path.exists() {
        return Check::pass("State file", format!("{} (will be created)", path.display()));
    }
    match PersistedState::read(path) {
        Ok(state) => Check::pass(
            "State file",
            format!("{} ({} VMs, schema {})", path.display(), state.vms.len(), state.schema_version),
        ),
        Err(e) => Check::fail(
            "State file",
            format!("{:#}", e),
            "restore the file from a backup or move it aside to start fresh",
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `vpsgate status`. Always returns `Ok(())`, informational only.
pub fn run_status(config: &Config) -> Result<()> {
    let state_file = &config.server.state_file;

    if !state_file.exists() {
        println!("No state file at {}", state_file.display());
        println!("Is vpsgate running? Try: vpsgate serve --config config.toml");
        return Ok(());
    }

    let modified_ago = match std::fs::metadata(state_file).and_then(|m| m.modified()) {
        Ok(mtime) => format_duration(mtime.elapsed().unwrap_or_default()),
        Err(_) => "unknown".to_string(),
    };

    let state = match PersistedState::read(state_file) {
        Ok(s) => s,
        Err(e) => {
            println!("State file: {} (last modified: {})", state_file.display(), modified_ago);
            println!("Error: {:#}", e);
            return Ok(());
        }
    };

    println!(
        "State file: {} (last modified: {})\n",
        state_file.display(),
        modified_ago
    );

    println!("VMs: {}", state.vms.len());
    let forward_host = config.hypervisor.forward_host();
    for vm in state.vms.values() {
        let overloads = state.monitoring.get(&vm.id).map_or(0, |m| m.overload_count);
        println!(
            "  {:<4} {:<6} {:<16} {:<9} {:<15} {}{}",
            vm.id,
            vm.vmid,
            vm.name,
            vm.status.to_string(),
            vm.ip_address.to_string(),
            vm.ssh_command(forward_host.as_deref()),
            if overloads > 0 { format!("  overload {}", overloads) } else { String::new() },
        );
    }

    println!(
        "\nForwarding ports: {}-{} (ceiling {}), {} leased",
        state.ports.start(),
        state.ports.end(),
        state.ports.ceiling(),
        state.ports.allocated_count()
    );

    let now = Utc::now();
    let live = state.revoked_tokens.values().filter(|exp| **exp > now).count();
    println!("Revoked tokens: {} ({} awaiting cleanup)", live, state.revoked_tokens.len() - live);

    Ok(())
}

/// Format a duration as a human-friendly relative string (e.g. "3 seconds ago", "2 minutes ago").
fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    let (n, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86400, "day")
    };
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}

/// Load a config from an optional path, falling back to defaults plus
/// environment overrides.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::from_env(),
    }
}

// ---------------------------------------------------------------------------
// offline administration
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum VmCommand {
    /// Register a VM. A private address leases a forwarding port.
    Create {
        /// Hypervisor-side VM id.
        #[arg(long)]
        vmid: u32,
        #[arg(long)]
        name: String,
        /// Hypervisor node (default: hypervisor.default_node).
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        ip: IpAddr,
        #[arg(long)]
        owner: Option<UserId>,
        /// Expiry date, YYYY-MM-DD.
        #[arg(long)]
        expires: Option<NaiveDate>,
    },
    /// Stop, close sessions, release the port and remove the record.
    Delete { id: VmId },
    Suspend { id: VmId },
    Unsuspend { id: VmId },
    /// Exempt a VM from automatic suspension and expiry (or undo it).
    Override {
        id: VmId,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Set or clear the expiry date.
    Expiry {
        id: VmId,
        /// YYYY-MM-DD; omit to clear.
        date: Option<NaiveDate>,
    },
    /// Assign an owner; omit the user to unassign.
    Assign { id: VmId, user: Option<UserId> },
    SetIp { id: VmId, ip: IpAddr },
    Start { id: VmId },
    Stop { id: VmId },
    Reboot { id: VmId },
    /// Refresh the stored status from the hypervisor.
    Sync { id: VmId },
}

#[derive(Subcommand)]
pub enum PortsCommand {
    /// List port leases.
    List {
        /// Include free ports.
        #[arg(long)]
        all: bool,
    },
    /// Release a lease. Releasing a free port is a no-op.
    Release { port: u16 },
}

/// Store, lock and control handle for one offline command.
struct Offline {
    _lock: File,
    store: Arc<MemoryStore>,
    provisioner: Provisioner,
}

impl Offline {
    async fn open(config: &Config) -> Result<Self> {
        let lock = acquire_instance_lock(config)?;
        let store = Arc::new(MemoryStore::with_state_file(
            &config.ports,
            config.server.state_file.clone(),
        ));
        store.load().await?;
        let control = crate::vm::connect(&config.hypervisor)?;
        let provisioner = Provisioner::new(
            store.clone(),
            control,
            SessionRegistry::new(),
            MetricsRegistry::new(),
        );
        Ok(Self {
            _lock: lock,
            store,
            provisioner,
        })
    }

    async fn finish(self) -> Result<()> {
        self.store.save().await
    }
}

fn print_vm(vm: &VmRecord, config: &Config) {
    println!(
        "{} {} ({}) on {}: {}, {}",
        vm.id,
        vm.name,
        vm.vmid,
        vm.node,
        vm.status,
        vm.ssh_command(config.hypervisor.forward_host().as_deref())
    );
    if let Some(reason) = &vm.suspension_reason {
        println!("  reason: {}", reason);
    }
    if let Some(date) = vm.expiry_date {
        println!("  expires: {}", date);
    }
    if vm.override_suspension {
        println!("  override: on");
    }
}

pub async fn run_vm(config: &Config, command: VmCommand) -> Result<()> {
    let offline = Offline::open(config).await?;
    let p = &offline.provisioner;

    let vm = match command {
        VmCommand::Create { vmid, name, node, ip, owner, expires } => {
            p.create(NewVm {
                vmid,
                name,
                node: node.unwrap_or_else(|| config.hypervisor.default_node.clone()),
                owner,
                ip_address: ip,
                expiry_date: expires,
            })
            .await?
        }
        VmCommand::Delete { id } => {
            let vm = p.delete(id).await?;
            println!("deleted {} ({})", vm.name, vm.vmid);
            return offline.finish().await;
        }
        VmCommand::Suspend { id } => p.suspend(id).await?,
        VmCommand::Unsuspend { id } => p.unsuspend(id).await?,
        VmCommand::Override { id, enabled } => p.set_override(id, enabled).await?,
        VmCommand::Expiry { id, date } => p.set_expiry(id, date).await?,
        VmCommand::Assign { id, user } => p.assign_owner(id, user).await?,
        VmCommand::SetIp { id, ip } => p.set_ip(id, ip).await?,
        VmCommand::Start { id } => p.power(id, PowerAction::Start).await?,
        VmCommand::Stop { id } => p.power(id, PowerAction::Stop).await?,
        VmCommand::Reboot { id } => p.power(id, PowerAction::Reboot).await?,
        VmCommand::Sync { id } => {
            let (vm, live) = p.sync_status(id).await?;
            println!(
                "hypervisor: {} (cpu {:.1}%, uptime {}s)",
                live.status,
                live.cpu * 100.0,
                live.uptime
            );
            vm
        }
    };
    print_vm(&vm, config);
    offline.finish().await
}

pub async fn run_ports(config: &Config, command: PortsCommand) -> Result<()> {
    let offline = Offline::open(config).await?;
    let allocator = PortAllocator::new(offline.store.clone());

    match command {
        PortsCommand::List { all } => {
            for lease in allocator.leases().await? {
                if !lease.allocated && !all {
                    continue;
                }
                match (lease.allocated, lease.vm_id) {
                    (true, Some(vm_id)) => println!("{:<6} vm {}", lease.port, vm_id),
                    (true, None) => println!("{:<6} leased", lease.port),
                    (false, _) => println!("{:<6} free", lease.port),
                }
            }
        }
        PortsCommand::Release { port } => {
            let owner = allocator
                .leases()
                .await?
                .into_iter()
                .find(|l| l.port == port && l.allocated)
                .and_then(|l| l.vm_id);
            if let Some(vm_id) = owner {
                if offline.store.get_vm(vm_id).await?.is_some() {
                    anyhow::bail!(
                        "port {} belongs to vm {}; change its address or delete it instead",
                        port,
                        vm_id
                    );
                }
            }
            allocator.release(port).await?;
            println!("port {} is free", port);
        }
    }
    offline.finish().await
}

/// Add a token to the revocation list.
pub async fn run_revoke_token(config: &Config, token: &str) -> Result<()> {
    let offline = Offline::open(config).await?;
    let auth = JwtAuthenticator::new(&config.auth, offline.store.clone())?;
    let expires_at = auth.revoke(token.trim()).await.context("revoking token")?;
    println!("token revoked until {}", expires_at);
    offline.finish().await
}

/// Run one monitor cycle against the state file.
pub async fn run_monitor_cycle(config: &Config, cadence: Cadence) -> Result<()> {
    let offline = Offline::open(config).await?;
    let monitor = LifecycleMonitor::new(
        offline.store.clone(),
        crate::vm::connect(&config.hypervisor)?,
        SessionRegistry::new(),
        config.monitor.clone(),
        MetricsRegistry::new(),
    );
    if let Some(report) = monitor.run(cadence).await? {
        println!("{} cycle: {:?}", cadence, report);
    }
    offline.finish().await
}
