use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::gateway::{SessionKind, SessionRegistry};
use crate::provision::Provisioner;
use crate::store::{Store, UserId, VmId};
use vpsgate_protocol::ErrorCode;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProtocolLabels {
    protocol: String,
}

impl From<SessionKind> for ProtocolLabels {
    fn from(kind: SessionKind) -> Self {
        Self {
            protocol: kind.as_str().to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReasonLabels {
    reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CauseLabels {
    cause: String,
}

/// Why a VM left the running set.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SuspensionCause {
    Overload,
    Expiry,
    Manual,
}

impl SuspensionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overload => "overload",
            Self::Expiry => "expiry",
            Self::Manual => "manual",
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Prometheus metrics for the gateway and the lifecycle monitor.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    sessions_active: Family<ProtocolLabels, Gauge>,
    sessions_rejected_total: Family<ReasonLabels, Counter>,
    session_duration_seconds: Histogram,
    suspensions_total: Family<CauseLabels, Counter>,
    monitor_sample_errors_total: Counter,
    port_leases: Gauge,
    start_time: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let sessions_active = Family::<ProtocolLabels, Gauge>::default();
        registry.register(
            "vpsgate_sessions_active",
            "Open tunnel sessions by protocol",
            sessions_active.clone(),
        );

        let sessions_rejected_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "vpsgate_sessions_rejected",
            "Tunnel sessions refused before reaching the VM, by reason",
            sessions_rejected_total.clone(),
        );

        // 1s to ~4.5h
        let session_duration_seconds = Histogram::new(exponential_buckets(1.0, 4.0, 8));
        registry.register(
            "vpsgate_session_duration_seconds",
            "Lifetime of tunnel sessions that reached the VM",
            session_duration_seconds.clone(),
        );

        let suspensions_total = Family::<CauseLabels, Counter>::default();
        registry.register(
            "vpsgate_vm_suspensions",
            "VMs suspended or expired, by cause",
            suspensions_total.clone(),
        );

        let monitor_sample_errors_total = Counter::default();
        registry.register(
            "vpsgate_monitor_sample_errors",
            "Resource samples that failed",
            monitor_sample_errors_total.clone(),
        );

        let port_leases = Gauge::default();
        registry.register(
            "vpsgate_port_leases",
            "Forwarding ports currently leased",
            port_leases.clone(),
        );

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                sessions_active,
                sessions_rejected_total,
                session_duration_seconds,
                suspensions_total,
                monitor_sample_errors_total,
                port_leases,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn session_opened(&self, kind: SessionKind) {
        self.inner.sessions_active.get_or_create(&kind.into()).inc();
    }

    pub fn session_closed(&self, kind: SessionKind, lifetime: std::time::Duration) {
        self.inner.sessions_active.get_or_create(&kind.into()).dec();
        self.inner
            .session_duration_seconds
            .observe(lifetime.as_secs_f64());
    }

    pub fn session_rejected(&self, reason: &str) {
        self.inner
            .sessions_rejected_total
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn record_suspension(&self, cause: SuspensionCause) {
        self.inner
            .suspensions_total
            .get_or_create(&CauseLabels {
                cause: cause.as_str().to_string(),
            })
            .inc();
    }

    pub fn record_sample_error(&self) {
        self.inner.monitor_sample_errors_total.inc();
    }

    pub fn set_port_leases(&self, count: usize) {
        self.inner.port_leases.set(count as i64);
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> String {
        let mut buf = String::new();
        let registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = encode(&mut buf, &registry) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        buf
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

struct MetricsState {
    metrics: MetricsRegistry,
    sessions: SessionRegistry,
    store: Arc<dyn Store>,
    provisioner: Arc<Provisioner>,
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    // Lease count lives in the store; refresh before encoding
    if let Ok(leases) = state.store.port_leases().await {
        state
            .metrics
            .set_port_leases(leases.iter().filter(|l| l.allocated).count());
    }

    let body = state.metrics.encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        body,
    )
}

async fn healthz_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "sessions": {
            "shell": state.sessions.count_kind(SessionKind::Shell),
            "console": state.sessions.count_kind(SessionKind::Console),
        },
        "uptime_seconds": state.metrics.uptime_seconds(),
    });

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> (StatusCode, [(&'static str, &'static str); 1], String) {
    (status, [("content-type", "application/json")], body.to_string())
}

/// Close every live session of one user, e.g. when the account is removed.
async fn disconnect_user_handler(
    State(state): State<Arc<MetricsState>>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    let closed = state.provisioner.disconnect_user(user_id);
    tracing::info!(user_id, sessions_closed = closed, "admin disconnected user");
    json_response(StatusCode::OK, serde_json::json!({ "closed": closed }))
}

async fn disconnect_vm_handler(State(state): State<Arc<MetricsState>>, Path(vm_id): Path<VmId>) -> impl IntoResponse {
    let closed = state.provisioner.disconnect_vm(vm_id);
    tracing::info!(vm_id, sessions_closed = closed, "admin disconnected vm");
    json_response(StatusCode::OK, serde_json::json!({ "closed": closed }))
}

/// Suspend through the running daemon, so its sessions are torn down too.
async fn suspend_vm_handler(State(state): State<Arc<MetricsState>>, Path(vm_id): Path<VmId>) -> impl IntoResponse {
    match state.provisioner.suspend(vm_id).await {
        Ok(vm) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": vm.id, "status": vm.status.to_string() }),
        ),
        Err(e) => {
            let status = match e.code() {
                ErrorCode::NotFound => StatusCode::NOT_FOUND,
                ErrorCode::StatusConflict => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            json_response(status, serde_json::json!({ "code": e.code(), "message": e.to_string() }))
        }
    }
}

/// Routes for the loopback-only listener: `/metrics`, `/healthz` and the
/// `/admin` session controls.
pub fn router(
    metrics: MetricsRegistry,
    sessions: SessionRegistry,
    store: Arc<dyn Store>,
    provisioner: Arc<Provisioner>,
) -> Router {
    let state = Arc::new(MetricsState {
        metrics,
        sessions,
        store,
        provisioner,
    });

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/admin/users/{user_id}/disconnect", post(disconnect_user_handler))
        .route("/admin/vms/{vm_id}/disconnect", post(disconnect_vm_handler))
        .route("/admin/vms/{vm_id}/suspend", post(suspend_vm_handler))
        .with_state(state)
}

/// Start the metrics and admin HTTP server as a background tokio task.
/// `addr` should be a loopback address; the admin routes carry no auth.
pub fn start_metrics_server(addr: SocketAddr, app: Router) -> tokio::task::JoinHandle<()> {
    if !addr.ip().is_loopback() {
        tracing::warn!(addr = %addr, "admin routes exposed on a non-loopback address");
    }
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to bind metrics server");
                return;
            }
        };
        tracing::info!(addr = %addr, "metrics server listening");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server error");
        }
    })
}
