//! Connections from the gateway to the VM side.
//!
//! A [`DownstreamLink`] is a pair of channels plus a drop guard. Dropping the
//! link cancels the pump task, which disconnects the SSH session or closes
//! the console websocket. The relay loop in `session` never touches sockets
//! directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use russh::client;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::vm::ConsoleEndpoint;

const CHANNEL_DEPTH: usize = 64;

/// Traffic from the client towards the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// Live connection to a VM shell or console.
pub struct DownstreamLink {
    pub input: mpsc::Sender<Upstream>,
    pub output: mpsc::Receiver<Vec<u8>>,
    _guard: DropGuard,
}

impl DownstreamLink {
    /// `cancel` must stop every task feeding or draining the channels.
    pub fn new(
        input: mpsc::Sender<Upstream>,
        output: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            input,
            output,
            _guard: cancel.drop_guard(),
        }
    }
}

/// Where to open an interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("{0}")]
    Ssh(#[from] russh::Error),

    #[error("authentication rejected for {0}")]
    AuthRejected(String),

    #[error("no SSH key or password configured")]
    NoCredentials,

    #[error("cannot load identity {path}: {reason}")]
    Identity { path: PathBuf, reason: String },

    #[error("console connection failed: {0}")]
    Console(String),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Downstream: Send + Sync {
    /// Resolves only once the VM has accepted our login and a shell with a
    /// pty is open.
    async fn open_shell(&self, target: &ShellTarget) -> Result<DownstreamLink, DownstreamError>;

    async fn open_console(&self, endpoint: &ConsoleEndpoint) -> Result<DownstreamLink, DownstreamError>;
}

/// Host key policy for VM shells. VMs are reinstalled and re-addressed
/// freely, so there is nothing stable to pin against.
struct VmHostKeys;

impl client::Handler for VmHostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Shells over SSH, consoles through a websocket to the hypervisor.
pub struct HostDownstream {
    key: Option<Arc<PrivateKey>>,
    password: Option<String>,
    connect_timeout: Duration,
    keepalive: Duration,
    cols: u16,
    rows: u16,
}

impl HostDownstream {
    /// Loads the identity file up front so a bad key fails the daemon at
    /// startup rather than every session.
    pub fn new(config: &GatewayConfig) -> Result<Self, DownstreamError> {
        let key = match &config.identity_file {
            Some(path) => {
                let key = russh::keys::load_secret_key(path, None).map_err(|e| DownstreamError::Identity {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                Some(Arc::new(key))
            }
            None => None,
        };
        if key.is_none() && config.ssh_password.is_none() {
            warn!("no ssh identity or password configured, shell sessions will fail");
        }
        Ok(Self {
            key,
            password: config.ssh_password.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
            cols: config.cols,
            rows: config.rows,
        })
    }

    /// Key first, then password, the same order OpenSSH tries them.
    async fn authenticate(
        &self,
        session: &mut client::Handle<VmHostKeys>,
        user: &str,
    ) -> Result<(), DownstreamError> {
        if self.key.is_none() && self.password.is_none() {
            return Err(DownstreamError::NoCredentials);
        }
        if let Some(key) = &self.key {
            let hash = session.best_supported_rsa_hash().await?.flatten();
            let auth = session
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash))
                .await?;
            if auth.success() {
                return Ok(());
            }
            debug!(user, "public key rejected");
        }
        if let Some(password) = &self.password {
            let auth = session.authenticate_password(user, password).await?;
            if auth.success() {
                return Ok(());
            }
        }
        Err(DownstreamError::AuthRejected(user.to_string()))
    }

    /// Connect, log in and start a shell on a pty.
    async fn handshake(
        &self,
        target: &ShellTarget,
    ) -> Result<(client::Handle<VmHostKeys>, russh::Channel<client::Msg>), DownstreamError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(self.keepalive),
            ..Default::default()
        });
        let mut session = client::connect(config, (target.host.as_str(), target.port), VmHostKeys).await?;
        self.authenticate(&mut session, &target.user).await?;

        let channel = session.channel_open_session().await?;
        channel
            .request_pty(
                false,
                vpsgate_protocol::SHELL_TERM,
                u32::from(self.cols),
                u32::from(self.rows),
                0,
                0,
                &[],
            )
            .await?;
        channel.request_shell(false).await?;
        Ok((session, channel))
    }
}

/// Move bytes between one SSH channel and the link channels until either
/// side closes or the link is dropped.
async fn pump_shell(
    session: client::Handle<VmHostKeys>,
    mut channel: russh::Channel<client::Msg>,
    mut input: mpsc::Receiver<Upstream>,
    output: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = channel.wait() => {
                // stdout and stderr both go to the client as output
                let bytes = match msg {
                    Some(ChannelMsg::Data { data }) => data.to_vec(),
                    Some(ChannelMsg::ExtendedData { data, .. }) => data.to_vec(),
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!(exit_status, "remote shell exited");
                        continue;
                    }
                    Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                    Some(_) => continue,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = output.send(bytes) => if sent.is_err() { break },
                }
            }

            msg = input.recv() => match msg {
                Some(Upstream::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        debug!(error = %e, "ssh write failed");
                        break;
                    }
                }
                Some(Upstream::Resize { cols, rows }) => {
                    if let Err(e) = channel.window_change(u32::from(cols), u32::from(rows), 0, 0).await {
                        debug!(error = %e, "ssh window change failed");
                    }
                }
                None => break,
            },
        }
    }
    let _ = channel.eof().await;
    if let Err(e) = session.disconnect(Disconnect::ByApplication, "session closed", "en").await {
        debug!(error = %e, "ssh disconnect failed");
    }
}

#[async_trait]
impl Downstream for HostDownstream {
    async fn open_shell(&self, target: &ShellTarget) -> Result<DownstreamLink, DownstreamError> {
        let (session, channel) = tokio::time::timeout(self.connect_timeout, self.handshake(target))
            .await
            .map_err(|_| DownstreamError::Timeout(self.connect_timeout))??;

        info!(host = %target.host, port = target.port, user = %target.user, "ssh shell open");

        let (in_tx, in_rx) = mpsc::channel::<Upstream>(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let cancel = CancellationToken::new();
        tokio::spawn(pump_shell(session, channel, in_rx, out_tx, cancel.clone()));

        Ok(DownstreamLink::new(in_tx, out_rx, cancel))
    }

    async fn open_console(&self, endpoint: &ConsoleEndpoint) -> Result<DownstreamLink, DownstreamError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DownstreamError::Console(e.to_string()))?;
        if let Some(auth) = &endpoint.authorization {
            let value = HeaderValue::from_str(auth).map_err(|e| DownstreamError::Console(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let connector = if endpoint.insecure_tls {
            Some(Connector::Rustls(Arc::new(insecure::client_config()?)))
        } else {
            None
        };

        let (ws, _response) = tokio::time::timeout(
            self.connect_timeout,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| DownstreamError::Timeout(self.connect_timeout))?
        .map_err(|e| DownstreamError::Console(e.to_string()))?;

        info!(host = ?endpoint.url.host_str(), "console websocket connected");

        let (mut sink, mut stream) = ws.split();
        let (in_tx, mut in_rx) = mpsc::channel::<Upstream>(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = in_rx.recv() => msg,
                };
                match msg {
                    Some(Upstream::Data(bytes)) => {
                        if let Err(e) = sink.send(WsMessage::Binary(bytes.into())).await {
                            debug!(error = %e, "console write failed");
                            break;
                        }
                    }
                    Some(Upstream::Resize { .. }) => {}
                    None => break,
                }
            }
            let _ = sink.close().await;
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = stream.next() => frame,
                };
                let bytes = match frame {
                    Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                    Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(?frame, "console closed by hypervisor");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "console websocket error");
                        break;
                    }
                    None => break,
                };
                if out_tx.send(bytes).await.is_err() {
                    break;
                }
            }
            // Output side gone; stop the writer too.
            reader_cancel.cancel();
        });

        Ok(DownstreamLink::new(in_tx, out_rx, cancel))
    }
}

/// TLS config for hypervisors with self-signed certificates.
mod insecure {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

    use super::DownstreamError;

    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    pub(super) fn client_config() -> Result<ClientConfig, DownstreamError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| DownstreamError::Console(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        Ok(config)
    }
}
