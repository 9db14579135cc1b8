//! Per-session relay between a client socket and a downstream link.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use vpsgate_protocol::{decode_bytes, ConsoleControl, ErrorCode, ServerMessage, ShellClientMessage};

use super::downstream::{DownstreamLink, Upstream};
use super::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Interactive shell over SSH, JSON framed.
    Shell,
    /// Graphical console, raw binary passthrough.
    Console,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Console => "console",
        }
    }

    pub(super) fn connecting_message(&self) -> &'static str {
        match self {
            Self::Shell => "Connecting to VPS...",
            Self::Console => "Connecting to VNC...",
        }
    }

    pub(super) fn connected_message(&self) -> &'static str {
        match self {
            Self::Shell => "SSH connection established",
            Self::Console => "VNC connection established",
        }
    }

    pub(super) fn closed_message(&self) -> &'static str {
        match self {
            Self::Shell => "Shell session closed",
            Self::Console => "VNC session closed",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle. Every session ends in `Closed`, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Authenticating,
    Authorized,
    ConnectingDownstream,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Authenticating)
                | (Authenticating, Authorized)
                | (Authorized, ConnectingDownstream)
                | (ConnectingDownstream, Active)
                | (Closing, Closed)
        ) || (next == Closing && !matches!(self, Closing | Closed))
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Refused before any downstream connection was attempted.
    Rejected(ErrorCode),
    /// Admitted, but the VM side could not be reached.
    DownstreamFailed,
    ClientClosed,
    DownstreamClosed,
    IdleTimeout,
    /// Force-closed by the registry (suspension, expiry, deletion, shutdown).
    Terminated,
}

const FAREWELL_GRACE: Duration = Duration::from_secs(2);

/// One frame on the client socket, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Inactivity deadline, pushed forward by traffic in either direction.
#[derive(Debug)]
pub struct IdleTimer {
    window: Duration,
    deadline: Instant,
}

impl IdleTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Instant::now() + window,
        }
    }

    pub fn touch(&mut self) {
        self.deadline = Instant::now() + self.window;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// The client half of a session: frames in, frames out.
pub struct ClientChannel {
    inbound: mpsc::Receiver<ClientFrame>,
    outbound: mpsc::Sender<ClientFrame>,
}

impl ClientChannel {
    pub fn new(inbound: mpsc::Receiver<ClientFrame>, outbound: mpsc::Sender<ClientFrame>) -> Self {
        Self { inbound, outbound }
    }

    /// Returns false once the client is gone.
    pub(super) async fn send(&self, msg: &ServerMessage) -> bool {
        match msg.to_text() {
            Ok(text) => self.outbound.send(ClientFrame::Text(text)).await.is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to encode server message");
                false
            }
        }
    }

    async fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.outbound.send(ClientFrame::Binary(bytes)).await.is_ok()
    }

    pub(super) async fn close(&self) {
        let _ = self.outbound.send(ClientFrame::Close).await;
    }

    /// Optional last message, then close. Gives up after a short grace so a
    /// client that stopped reading cannot hold up teardown.
    pub(super) async fn farewell(&self, last: Option<&ServerMessage>) {
        let flush = async {
            if let Some(msg) = last {
                self.send(msg).await;
            }
            self.close().await;
        };
        if tokio::time::timeout(FAREWELL_GRACE, flush).await.is_err() {
            debug!("client not draining, dropped final frames");
        }
    }

    async fn recv(&mut self) -> Option<ClientFrame> {
        self.inbound.recv().await
    }
}

/// Owns the teardown side effects of one session: the registry entry and
/// the downstream link. Runs them once, on `finish` or on drop.
pub(super) struct SessionGuard {
    pub id: Uuid,
    pub kind: SessionKind,
    state: SessionState,
    registry: SessionRegistry,
    registered: bool,
    link: Option<DownstreamLink>,
}

impl SessionGuard {
    pub fn new(id: Uuid, kind: SessionKind, registry: SessionRegistry) -> Self {
        Self {
            id,
            kind,
            state: SessionState::Init,
            registry,
            registered: false,
            link: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn advance(&mut self, next: SessionState) {
        if !self.state.can_advance_to(next) {
            warn!(session = %self.id, from = ?self.state, to = ?next, "illegal session transition");
            return;
        }
        debug!(session = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    pub fn attach(&mut self, link: DownstreamLink) {
        self.link = Some(link);
    }

    pub fn link_mut(&mut self) -> Option<&mut DownstreamLink> {
        self.link.as_mut()
    }

    /// Drop the downstream and deregister. Safe to call more than once.
    pub fn finish(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.advance(SessionState::Closing);
        // Dropping the link cancels its pumps.
        self.link.take();
        if self.registered {
            self.registry.remove(self.id);
            self.registered = false;
        }
        self.advance(SessionState::Closed);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Pump traffic until something ends the session. Does not send the final
/// frame; the caller does that after teardown bookkeeping.
///
/// Every send waits under the same cancel token and idle deadline as the
/// receives, so a client or VM that stops draining cannot pin the session.
pub(super) async fn relay(
    kind: SessionKind,
    link: &mut DownstreamLink,
    client: &mut ClientChannel,
    cancel: &CancellationToken,
    idle: Duration,
) -> SessionEnd {
    let mut timer = IdleTimer::new(idle);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return SessionEnd::Terminated,

            out = link.output.recv() => match out {
                Some(bytes) => {
                    timer.touch();
                    let deadline = timer.deadline();
                    let delivered = match kind {
                        SessionKind::Shell => bounded(client.send(&ServerMessage::output(&bytes)), cancel, deadline).await,
                        SessionKind::Console => bounded(client.send_binary(bytes), cancel, deadline).await,
                    };
                    match delivered {
                        Ok(true) => {}
                        Ok(false) => return SessionEnd::ClientClosed,
                        Err(end) => return end,
                    }
                }
                None => return SessionEnd::DownstreamClosed,
            },

            _ = sleep_until(timer.deadline()) => return SessionEnd::IdleTimeout,

            frame = client.recv() => {
                let frame = match frame {
                    Some(ClientFrame::Close) | None => return SessionEnd::ClientClosed,
                    Some(frame) => frame,
                };
                timer.touch();
                let inbound = match kind {
                    SessionKind::Shell => shell_inbound(frame),
                    SessionKind::Console => console_inbound(frame),
                };
                match inbound {
                    Inbound::Forward(msg) => {
                        match bounded(link.input.send(msg), cancel, timer.deadline()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => return SessionEnd::DownstreamClosed,
                            Err(end) => return end,
                        }
                    }
                    Inbound::Reply(msg) => {
                        match bounded(client.send(&msg), cancel, timer.deadline()).await {
                            Ok(true) => {}
                            Ok(false) => return SessionEnd::ClientClosed,
                            Err(end) => return end,
                        }
                    }
                    Inbound::Handled => {}
                    Inbound::ClientGone => return SessionEnd::ClientClosed,
                }
            }
        }
    }
}

/// Run `fut` unless the session is cancelled or goes idle first.
pub(super) async fn bounded<F: Future>(fut: F, cancel: &CancellationToken, deadline: Instant) -> Result<F::Output, SessionEnd> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionEnd::Terminated),
        _ = sleep_until(deadline) => Err(SessionEnd::IdleTimeout),
        out = fut => Ok(out),
    }
}

enum Inbound {
    Forward(Upstream),
    /// Answer the client directly without touching the VM.
    Reply(ServerMessage),
    Handled,
    ClientGone,
}

fn shell_inbound(frame: ClientFrame) -> Inbound {
    let text = match frame {
        ClientFrame::Text(text) => text,
        _ => {
            debug!("ignoring binary frame on shell session");
            return Inbound::Handled;
        }
    };
    match ShellClientMessage::parse(&text) {
        Ok(ShellClientMessage::Input { data }) => match decode_bytes(&data) {
            Ok(bytes) => Inbound::Forward(Upstream::Data(bytes)),
            Err(e) => {
                debug!(error = %e, "dropping input with bad base64");
                Inbound::Handled
            }
        },
        Ok(ShellClientMessage::Resize { cols, rows }) => Inbound::Forward(Upstream::Resize { cols, rows }),
        Ok(ShellClientMessage::Ping) => Inbound::Reply(ServerMessage::Pong),
        Err(e) => {
            debug!(error = %e, "ignoring malformed shell message");
            Inbound::Handled
        }
    }
}

fn console_inbound(frame: ClientFrame) -> Inbound {
    match frame {
        ClientFrame::Binary(bytes) => Inbound::Forward(Upstream::Data(bytes)),
        ClientFrame::Text(text) => {
            if ConsoleControl::parse(&text) == Some(ConsoleControl::Ping) {
                Inbound::Reply(ServerMessage::Pong)
            } else {
                Inbound::Forward(Upstream::Data(text.into_bytes()))
            }
        }
        ClientFrame::Close => Inbound::ClientGone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        link: DownstreamLink,
        client: ClientChannel,
        /// What the VM side receives.
        vm_in: mpsc::Receiver<Upstream>,
        /// What the VM side emits.
        vm_out: mpsc::Sender<Vec<u8>>,
        /// What the client sends.
        client_tx: mpsc::Sender<ClientFrame>,
        /// What the client receives.
        client_rx: mpsc::Receiver<ClientFrame>,
    }

    fn harness() -> Harness {
        harness_with(16)
    }

    /// `client_depth` bounds how far output can run ahead of a client that
    /// is not reading.
    fn harness_with(client_depth: usize) -> Harness {
        let (in_tx, vm_in) = mpsc::channel(16);
        let (vm_out, out_rx) = mpsc::channel(16);
        let (client_tx, inbound) = mpsc::channel(16);
        let (outbound, client_rx) = mpsc::channel(client_depth);
        Harness {
            link: DownstreamLink::new(in_tx, out_rx, CancellationToken::new()),
            client: ClientChannel::new(inbound, outbound),
            vm_in,
            vm_out,
            client_tx,
            client_rx,
        }
    }

    fn text(frame: ClientFrame) -> serde_json::Value {
        match frame {
            ClientFrame::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Init.can_advance_to(Authenticating));
        assert!(Authenticating.can_advance_to(Closing));
        assert!(Active.can_advance_to(Closing));
        assert!(Closing.can_advance_to(Closed));
        assert!(!Init.can_advance_to(Active));
        assert!(!Closed.can_advance_to(Closing));
        assert!(!Closing.can_advance_to(Closing));
    }

    #[test]
    fn test_guard_finish_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.insert(id, 1, 1, SessionKind::Shell);
        let mut guard = SessionGuard::new(id, SessionKind::Shell, registry.clone());
        guard.mark_registered();
        guard.finish();
        assert_eq!(guard.state(), SessionState::Closed);
        assert_eq!(registry.count(), 0);

        // A second session with the same id registered later is untouched.
        registry.insert(id, 2, 2, SessionKind::Shell);
        guard.finish();
        drop(guard);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_shell_input_and_output() {
        let Harness { mut link, mut client, mut vm_in, vm_out, client_tx, mut client_rx } = harness();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move {
            relay(SessionKind::Shell, &mut link, &mut client, &cancel, Duration::from_secs(60)).await
        });

        let input = serde_json::to_string(&ShellClientMessage::input(b"ls\n")).unwrap();
        client_tx.send(ClientFrame::Text(input)).await.unwrap();
        assert_eq!(vm_in.recv().await, Some(Upstream::Data(b"ls\n".to_vec())));

        vm_out.send(b"file.txt\n".to_vec()).await.unwrap();
        let msg = text(client_rx.recv().await.unwrap());
        assert_eq!(msg["type"], "output");
        assert_eq!(decode_bytes(msg["data"].as_str().unwrap()).unwrap(), b"file.txt\n");

        client_tx
            .send(ClientFrame::Text(r#"{"type":"resize","cols":120,"rows":40}"#.into()))
            .await
            .unwrap();
        assert_eq!(vm_in.recv().await, Some(Upstream::Resize { cols: 120, rows: 40 }));

        client_tx.send(ClientFrame::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(text(client_rx.recv().await.unwrap())["type"], "pong");

        drop(vm_out);
        assert_eq!(task.await.unwrap(), SessionEnd::DownstreamClosed);
    }

    #[tokio::test]
    async fn test_shell_ignores_malformed_input() {
        let Harness { mut link, mut client, mut vm_in, vm_out: _vm_out, client_tx, mut client_rx } = harness();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move {
            relay(SessionKind::Shell, &mut link, &mut client, &cancel, Duration::from_secs(60)).await
        });
        client_tx.send(ClientFrame::Text("not json".into())).await.unwrap();
        client_tx
            .send(ClientFrame::Text(r#"{"type":"input","data":"***"}"#.into()))
            .await
            .unwrap();
        client_tx.send(ClientFrame::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        // Session is still alive and answering.
        assert_eq!(text(client_rx.recv().await.unwrap())["type"], "pong");
        assert!(vm_in.try_recv().is_err());

        client_tx.send(ClientFrame::Close).await.unwrap();
        assert_eq!(task.await.unwrap(), SessionEnd::ClientClosed);
    }

    #[tokio::test]
    async fn test_console_passthrough() {
        let Harness { mut link, mut client, mut vm_in, vm_out, client_tx, mut client_rx } = harness();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move {
            relay(SessionKind::Console, &mut link, &mut client, &cancel, Duration::from_secs(60)).await
        });

        client_tx.send(ClientFrame::Binary(vec![0x03, 0x00, 0x01])).await.unwrap();
        assert_eq!(vm_in.recv().await, Some(Upstream::Data(vec![0x03, 0x00, 0x01])));

        vm_out.send(vec![0xde, 0xad]).await.unwrap();
        assert_eq!(client_rx.recv().await, Some(ClientFrame::Binary(vec![0xde, 0xad])));

        client_tx.send(ClientFrame::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(text(client_rx.recv().await.unwrap())["type"], "pong");

        client_tx.send(ClientFrame::Text("RFB 003.008\n".into())).await.unwrap();
        assert_eq!(vm_in.recv().await, Some(Upstream::Data(b"RFB 003.008\n".to_vec())));

        drop(client_tx);
        assert_eq!(task.await.unwrap(), SessionEnd::ClientClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let mut h = harness();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let end = relay(SessionKind::Shell, &mut h.link, &mut h.client, &cancel, Duration::from_secs(1800)).await;
        assert_eq!(end, SessionEnd::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_resets_idle_timer() {
        let Harness { mut link, mut client, vm_in: _vm_in, vm_out, client_tx: _client_tx, mut client_rx } = harness();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let task = tokio::spawn(async move {
            relay(SessionKind::Shell, &mut link, &mut client, &cancel, Duration::from_secs(1800)).await
        });

        tokio::time::sleep(Duration::from_secs(1500)).await;
        vm_out.send(b"tick".to_vec()).await.unwrap();
        client_rx.recv().await.unwrap();

        // Without the reset this would have fired at 1800s.
        assert_eq!(task.await.unwrap(), SessionEnd::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_secs(3300));
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let mut h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let end = relay(SessionKind::Console, &mut h.link, &mut h.client, &cancel, Duration::from_secs(60)).await;
        assert_eq!(end, SessionEnd::Terminated);
    }

    #[tokio::test]
    async fn test_cancel_reaches_session_stalled_on_client() {
        let Harness { mut link, mut client, vm_in: _vm_in, vm_out, client_tx: _client_tx, client_rx: _client_rx } =
            harness_with(4);
        let cancel = CancellationToken::new();
        let relay_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            relay(SessionKind::Shell, &mut link, &mut client, &relay_cancel, Duration::from_secs(1800)).await
        });

        // The client never reads, so the fifth chunk blocks the relay.
        for i in 0..10u8 {
            vm_out.send(vec![b'a' + i; 32]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let end = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("relay stuck behind a stalled client")
            .unwrap();
        assert_eq!(end, SessionEnd::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_reaches_session_stalled_on_client() {
        let Harness { mut link, mut client, vm_in: _vm_in, vm_out, client_tx: _client_tx, client_rx: _client_rx } =
            harness_with(4);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let task = tokio::spawn(async move {
            relay(SessionKind::Console, &mut link, &mut client, &cancel, Duration::from_secs(1800)).await
        });

        for _ in 0..10 {
            vm_out.send(vec![0xff; 16]).await.unwrap();
        }
        assert_eq!(task.await.unwrap(), SessionEnd::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_cancel_reaches_session_stalled_on_downstream() {
        // VM input channel of one slot that nobody drains.
        let (in_tx, _vm_in) = mpsc::channel(1);
        let (_vm_out, out_rx) = mpsc::channel::<Vec<u8>>(1);
        let (client_tx, inbound) = mpsc::channel(16);
        let (outbound, _client_rx) = mpsc::channel(16);
        let mut link = DownstreamLink::new(in_tx, out_rx, CancellationToken::new());
        let mut client = ClientChannel::new(inbound, outbound);
        let cancel = CancellationToken::new();
        let relay_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            relay(SessionKind::Console, &mut link, &mut client, &relay_cancel, Duration::from_secs(1800)).await
        });

        for _ in 0..3 {
            client_tx.send(ClientFrame::Binary(vec![1, 2, 3])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Terminated);
    }

    #[tokio::test]
    async fn test_farewell_gives_up_on_full_client() {
        let (_client_tx, inbound) = mpsc::channel(1);
        let (outbound, _client_rx) = mpsc::channel(1);
        let client = ClientChannel::new(inbound, outbound);
        // Fill the only slot.
        assert!(client.send(&ServerMessage::Pong).await);
        tokio::time::timeout(Duration::from_secs(5), client.farewell(Some(&ServerMessage::timeout())))
            .await
            .expect("farewell should be bounded");
    }
}
