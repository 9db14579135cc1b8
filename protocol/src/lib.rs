use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Inactivity window after which a tunnel session is closed.
pub const IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Terminal type requested for shell sessions.
pub const SHELL_TERM: &str = "xterm-256color";

/// Initial terminal geometry.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

// Framing: the shell tunnel exchanges one JSON object per WebSocket text
// frame, tagged by `type`. The console tunnel passes binary frames through
// untouched and only understands `{"type":"ping"}` as text.

// ---------------------------------------------------------------------------
// Client -> gateway (shell)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellClientMessage {
    /// Keystrokes, base64-encoded.
    Input { data: String },

    /// Terminal window changed size.
    Resize { cols: u16, rows: u16 },

    /// Liveness check, answered with `pong`.
    Ping,
}

impl ShellClientMessage {
    pub fn input(bytes: &[u8]) -> Self {
        Self::Input {
            data: encode_bytes(bytes),
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// Gateway -> client (shell, plus console control replies)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Progress notice while the downstream connection is being set up.
    Status { message: String },

    /// Downstream is up; the session is active.
    Connected { message: String },

    /// Raw shell bytes (stdout and stderr), base64-encoded.
    Output { data: String },

    /// Rejection or failure. `code` is stable and machine-checkable.
    Error { code: ErrorCode, message: String },

    /// The session ended normally (downstream closed or forced teardown).
    Closed { message: String },

    /// The session hit the inactivity window. `code` is always `timeout`.
    Timeout { code: ErrorCode, message: String },

    Pong,
}

impl ServerMessage {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn connected(message: impl Into<String>) -> Self {
        Self::Connected {
            message: message.into(),
        }
    }

    pub fn output(bytes: &[u8]) -> Self {
        Self::Output {
            data: encode_bytes(bytes),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::Timeout {
            code: ErrorCode::Timeout,
            message: "Session timed out due to inactivity".into(),
        }
    }

    /// Serialize to the JSON text carried in one WebSocket frame.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Console control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleControl {
    Ping,
}

impl ConsoleControl {
    /// Returns `None` for anything that is not a recognized control message;
    /// such frames are relayed to the console unchanged.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Reason attached to every rejection or failure frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidVmId,
    AuthenticationFailed,
    AuthorizationFailed,
    NotFound,
    StatusConflict,
    DownstreamUnavailable,
    Timeout,
    PortExhausted,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidVmId => "invalid_vm_id",
            Self::AuthenticationFailed => "authentication_failed",
            Self::AuthorizationFailed => "authorization_failed",
            Self::NotFound => "not_found",
            Self::StatusConflict => "status_conflict",
            Self::DownstreamUnavailable => "downstream_unavailable",
            Self::Timeout => "timeout",
            Self::PortExhausted => "port_exhausted",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_bytes(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}
