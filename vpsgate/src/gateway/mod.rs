//! WebSocket tunnels from the panel to VM shells and consoles.
//!
//! A session is admitted in a fixed order: VM id syntax, token, VM lookup,
//! ownership, then VM status. Only an admitted session is registered and
//! allowed to open a downstream connection. Every session ends with exactly
//! one teardown, whether the client left, the VM side closed, the idle
//! timer fired or the registry force-closed it.

pub mod downstream;
#[cfg(test)]
pub(crate) mod fake_sshd;
pub mod registry;
pub mod session;

pub use downstream::{Downstream, DownstreamError, DownstreamLink, HostDownstream, ShellTarget, Upstream};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::{ClientChannel, ClientFrame, SessionEnd, SessionKind, SessionState};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpsgate_protocol::{ErrorCode, ServerMessage};

use crate::auth::{AuthError, Authenticator, Identity};
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::store::{Store, VmId, VmRecord, VmStatus};
use crate::vm::VmControl;
use session::{bounded, relay, SessionGuard};

const CLIENT_CHANNEL_DEPTH: usize = 64;

/// Why a session was refused or could not reach its VM. Display strings are
/// sent to the client verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid VPS ID")]
    InvalidVmId,

    #[error("{0}")]
    Authentication(AuthError),

    #[error("VPS not found")]
    NotFound,

    #[error("Access denied")]
    Authorization,

    #[error("Cannot connect to a {0} VPS")]
    StatusConflict(VmStatus),

    #[error("{0}")]
    DownstreamUnavailable(String),

    #[error("Internal error")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidVmId => ErrorCode::InvalidVmId,
            Self::Authentication(_) => ErrorCode::AuthenticationFailed,
            Self::NotFound => ErrorCode::NotFound,
            Self::Authorization => ErrorCode::AuthorizationFailed,
            Self::StatusConflict(_) => ErrorCode::StatusConflict,
            Self::DownstreamUnavailable(_) => ErrorCode::DownstreamUnavailable,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Knobs the gateway needs from the wider config.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub idle_timeout: Duration,
    /// Role that may open sessions on any VM.
    pub elevated_role: String,
    /// Host that forwards leased ports to private VMs.
    pub forward_host: Option<String>,
    pub ssh_user: String,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.gateway.idle_timeout_secs),
            elevated_role: config.auth.elevated_role.clone(),
            forward_host: config.hypervisor.forward_host(),
            ssh_user: config.gateway.ssh_user.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SessionGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    store: Arc<dyn Store>,
    auth: Arc<dyn Authenticator>,
    control: Arc<dyn VmControl>,
    downstream: Arc<dyn Downstream>,
    registry: SessionRegistry,
    settings: GatewaySettings,
    metrics: MetricsRegistry,
}

impl SessionGateway {
    pub fn new(
        store: Arc<dyn Store>,
        auth: Arc<dyn Authenticator>,
        control: Arc<dyn VmControl>,
        downstream: Arc<dyn Downstream>,
        registry: SessionRegistry,
        settings: GatewaySettings,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                store,
                auth,
                control,
                downstream,
                registry,
                settings,
                metrics,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Run the admission checks. Nothing is registered or connected here.
    pub async fn admit(&self, raw_vm_id: &str, token: Option<&str>) -> Result<(Identity, VmRecord), GatewayError> {
        let vm_id: VmId = raw_vm_id.trim().parse().map_err(|_| GatewayError::InvalidVmId)?;

        let identity = self
            .inner
            .auth
            .verify(token.unwrap_or_default())
            .await
            .map_err(GatewayError::Authentication)?;

        let vm = self.lookup(vm_id).await?;

        if identity.role != self.inner.settings.elevated_role && vm.owner != Some(identity.user_id) {
            return Err(GatewayError::Authorization);
        }
        if !vm.status.admits_sessions() {
            return Err(GatewayError::StatusConflict(vm.status));
        }
        Ok((identity, vm))
    }

    async fn lookup(&self, vm_id: VmId) -> Result<VmRecord, GatewayError> {
        self.inner
            .store
            .get_vm(vm_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or(GatewayError::NotFound)
    }

    /// Leased port on the forwarding host when there is one, else port 22 on
    /// the VM address.
    pub fn shell_target(&self, vm: &VmRecord) -> ShellTarget {
        let user = self.inner.settings.ssh_user.clone();
        match (vm.ssh_port, &self.inner.settings.forward_host) {
            (Some(port), Some(host)) => ShellTarget {
                host: host.clone(),
                port,
                user,
            },
            (Some(port), None) => {
                warn!(
                    vm_id = vm.id,
                    leased_port = port,
                    ip = %vm.ip_address,
                    "no forwarding host configured, dialing the VM address directly"
                );
                ShellTarget {
                    host: vm.ip_address.to_string(),
                    port: 22,
                    user,
                }
            }
            (None, _) => ShellTarget {
                host: vm.ip_address.to_string(),
                port: 22,
                user,
            },
        }
    }

    async fn connect(&self, kind: SessionKind, vm: &VmRecord) -> Result<DownstreamLink, GatewayError> {
        match kind {
            SessionKind::Shell => {
                let target = self.shell_target(vm);
                self.inner.downstream.open_shell(&target).await.map_err(|e| {
                    warn!(vm_id = vm.id, host = %target.host, port = target.port, error = %e, "ssh connect failed");
                    GatewayError::DownstreamUnavailable(format!("SSH connection failed: {}", e))
                })
            }
            SessionKind::Console => {
                let control = &self.inner.control;
                let endpoint = control
                    .console_ticket(&vm.node, vm.vmid)
                    .await
                    .and_then(|ticket| control.console_endpoint(&vm.node, vm.vmid, &ticket))
                    .map_err(|e| {
                        warn!(vm_id = vm.id, vmid = vm.vmid, error = %e, "console ticket failed");
                        GatewayError::DownstreamUnavailable("Failed to get VNC ticket".into())
                    })?;
                self.inner.downstream.open_console(&endpoint).await.map_err(|e| {
                    warn!(vm_id = vm.id, vmid = vm.vmid, error = %e, "console connect failed");
                    GatewayError::DownstreamUnavailable("VNC connection error".into())
                })
            }
        }
    }

    async fn reject(&self, client: &ClientChannel, err: &GatewayError) {
        let code = err.code();
        self.inner.metrics.session_rejected(code.as_str());
        client.farewell(Some(&ServerMessage::error(code, err.to_string()))).await;
    }

    /// Drive one session from admission to close over an abstract client
    /// channel. The websocket handler and the tests both come through here.
    pub async fn serve(
        &self,
        kind: SessionKind,
        raw_vm_id: &str,
        token: Option<&str>,
        mut client: ClientChannel,
    ) -> SessionEnd {
        let id = Uuid::new_v4();
        let mut guard = SessionGuard::new(id, kind, self.inner.registry.clone());

        guard.advance(SessionState::Authenticating);
        let (identity, vm) = match self.admit(raw_vm_id, token).await {
            Ok(admitted) => admitted,
            Err(e) => {
                info!(session = %id, %kind, vm = raw_vm_id, reason = %e.code(), "session rejected");
                self.reject(&client, &e).await;
                return SessionEnd::Rejected(e.code());
            }
        };
        guard.advance(SessionState::Authorized);

        let cancel = self.inner.registry.insert(id, identity.user_id, vm.id, kind);
        guard.mark_registered();

        // The VM may have been suspended between admission and registration,
        // in which case its force-close already ran without us.
        match self.lookup(vm.id).await {
            Ok(current) if current.status.admits_sessions() => {}
            Ok(current) => {
                let e = GatewayError::StatusConflict(current.status);
                guard.finish();
                self.reject(&client, &e).await;
                return SessionEnd::Rejected(e.code());
            }
            Err(e) => {
                guard.finish();
                self.reject(&client, &e).await;
                return SessionEnd::Rejected(e.code());
            }
        }

        info!(session = %id, %kind, user_id = identity.user_id, vm_id = vm.id, "session authorized");
        guard.advance(SessionState::ConnectingDownstream);
        let idle = self.inner.settings.idle_timeout;
        // A cancel here is picked up by the connect race below.
        let _ = bounded(
            client.send(&ServerMessage::status(kind.connecting_message())),
            &cancel,
            tokio::time::Instant::now() + idle,
        )
        .await;

        let connected = tokio::select! {
            _ = cancel.cancelled() => None,
            res = self.connect(kind, &vm) => Some(res),
        };
        let link = match connected {
            None => {
                guard.finish();
                client.farewell(Some(&ServerMessage::closed("Session terminated"))).await;
                return SessionEnd::Terminated;
            }
            Some(Err(e)) => {
                guard.finish();
                client.farewell(Some(&ServerMessage::error(e.code(), e.to_string()))).await;
                return SessionEnd::DownstreamFailed;
            }
            Some(Ok(link)) => link,
        };
        guard.attach(link);
        guard.advance(SessionState::Active);

        let opened = tokio::time::Instant::now();
        self.inner.metrics.session_opened(kind);

        let announced = bounded(
            client.send(&ServerMessage::connected(kind.connected_message())),
            &cancel,
            tokio::time::Instant::now() + idle,
        )
        .await;
        let end = match announced {
            Err(end) => end,
            Ok(false) => SessionEnd::ClientClosed,
            Ok(true) => match guard.link_mut() {
                Some(link) => relay(kind, link, &mut client, &cancel, idle).await,
                None => SessionEnd::DownstreamClosed,
            },
        };

        let last = match end {
            SessionEnd::DownstreamClosed => Some(ServerMessage::closed(kind.closed_message())),
            SessionEnd::IdleTimeout => Some(ServerMessage::timeout()),
            SessionEnd::Terminated => Some(ServerMessage::closed("Session terminated")),
            _ => None,
        };
        guard.finish();
        client.farewell(last.as_ref()).await;
        self.inner.metrics.session_closed(kind, opened.elapsed());

        info!(session = %id, %kind, vm_id = vm.id, ?end, "session ended");
        end
    }

    /// Pump an upgraded socket through [`serve`](Self::serve).
    async fn run_socket(self, socket: WebSocket, kind: SessionKind, raw_vm_id: String, token: Option<String>) {
        let (mut sink, mut stream) = socket.split();
        let (in_tx, in_rx) = mpsc::channel::<ClientFrame>(CLIENT_CHANNEL_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(CLIENT_CHANNEL_DEPTH);

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => ClientFrame::Text(text.to_string()),
                    Ok(Message::Binary(data)) => ClientFrame::Binary(data.to_vec()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "client socket error");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match frame {
                    ClientFrame::Text(text) => Message::Text(text.into()),
                    ClientFrame::Binary(data) => Message::Binary(data.into()),
                    ClientFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.serve(kind, &raw_vm_id, token.as_deref(), ClientChannel::new(in_rx, out_tx))
            .await;
        reader.abort();
        let _ = writer.await;
    }

    /// Routes: `/ws/terminal/{vm_id}` and `/ws/vnc/{vm_id}`, token in the
    /// `token` query parameter.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/terminal/{vm_id}", get(terminal_upgrade))
            .route("/ws/vnc/{vm_id}", get(console_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn terminal_upgrade(
    State(gateway): State<SessionGateway>,
    Path(vm_id): Path<String>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| gateway.run_socket(socket, SessionKind::Shell, vm_id, query.token))
}

async fn console_upgrade(
    State(gateway): State<SessionGateway>,
    Path(vm_id): Path<String>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| gateway.run_socket(socket, SessionKind::Console, vm_id, query.token))
}
