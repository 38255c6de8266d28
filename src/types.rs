//! Core protocol types: message kinds, session states, field validation,
//! configuration and the error taxonomy.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

/// Default server rendezvous port.
pub const DEFAULT_PORT: u16 = 4567;

/// Default confirmation timeout for the datagram transport.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_millis(250);

/// Default maximum number of datagram retransmissions.
pub const DEFAULT_UDP_RETRIES: u8 = 3;

/// Maximum length of a chat message body.
pub const MAX_CONTENT_LEN: usize = 1400;

/// Phase of one protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet; only an Auth is legal.
    Start,
    /// An Auth is in flight, waiting for the server's Reply.
    Auth,
    /// The server rejected the last Auth; the caller may retry.
    WaitForAuth,
    /// Authenticated; chat messages and channel joins are allowed.
    Open,
    /// Terminal. The session is over and the transport is closed.
    End,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Start => "start",
            SessionState::Auth => "auth",
            SessionState::WaitForAuth => "wait-for-auth",
            SessionState::Open => "open",
            SessionState::End => "end",
        };
        f.write_str(name)
    }
}

/// Outcome carried by a server Reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Nok,
}

/// The protocol's message vocabulary, shared by both transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Auth {
        username: String,
        display_name: String,
        secret: String,
    },
    Join {
        channel_id: String,
        display_name: String,
    },
    Msg {
        display_name: String,
        content: String,
    },
    Err {
        display_name: String,
        content: String,
    },
    Reply {
        status: ReplyStatus,
        content: String,
    },
    Bye,
}

impl Message {
    /// Short kind name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "AUTH",
            Message::Join { .. } => "JOIN",
            Message::Msg { .. } => "MSG",
            Message::Err { .. } => "ERR",
            Message::Reply { .. } => "REPLY",
            Message::Bye => "BYE",
        }
    }
}

/// Everything that can go wrong in a session, from field validation up to
/// transport failure.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A message field violates its syntactic constraints. Local and
    /// non-fatal; the caller may retry with corrected input.
    #[error("invalid {field}: {reason}")]
    FieldConstraintViolation { field: &'static str, reason: String },

    /// The attempted send is illegal in the current session state. Local and
    /// non-fatal.
    #[error("cannot send {kind} in state {state}")]
    InvalidInput {
        state: SessionState,
        kind: &'static str,
    },

    /// An inbound frame was malformed or unexpected for the current state.
    /// Fatal; the session replies with an ERR frame and terminates.
    #[error("invalid message received: {0}")]
    InvalidMessageReceived(String),

    /// The peer declared an error. Fatal; no outbound frame is sent.
    #[error("error from {display_name}: {content}")]
    ServerException {
        display_name: String,
        content: String,
    },

    /// Transport-level failure: stream closed unexpectedly, retransmissions
    /// exhausted or the address did not resolve. Fatal.
    #[error("server unreachable: {0}")]
    ServerUnreachable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The session was cancelled before completing the operation.
    #[error("session cancelled")]
    Cancelled,
}

/// Connection parameters consumed by the transports.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// How long the datagram transport waits for a Confirm before
    /// retransmitting.
    pub udp_timeout: Duration,
    /// Maximum number of retransmissions before the peer is declared
    /// unreachable.
    pub udp_retries: u8,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            udp_retries: DEFAULT_UDP_RETRIES,
        }
    }
}

/// Session state cell shared between the engine and the datagram transport.
///
/// Only the engine's send/receive transition logic writes to it; the
/// datagram transport reads it to gate peer endpoint migration. The lock is
/// never held across an await.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<SessionState>>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionState::Start)))
    }

    pub fn get(&self) -> SessionState {
        *self.0.lock().expect("state cell poisoned")
    }

    pub fn set(&self, next: SessionState) {
        *self.0.lock().expect("state cell poisoned") = next;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks a message's fields against the protocol's syntactic constraints.
///
/// Pure and stateless. Applied to outbound messages before transmission and
/// to inbound messages right after decoding, before they reach the state
/// machine.
pub fn validate(message: &Message) -> Result<(), ChatError> {
    match message {
        Message::Auth {
            username,
            display_name,
            secret,
        } => {
            check_ident("username", username, 20)?;
            check_display_name(display_name)?;
            check_ident("secret", secret, 128)
        }
        Message::Join {
            channel_id,
            display_name,
        } => {
            check_ident("channelId", channel_id, 20)?;
            check_display_name(display_name)
        }
        Message::Msg {
            display_name,
            content,
        }
        | Message::Err {
            display_name,
            content,
        } => {
            check_display_name(display_name)?;
            check_content(content)
        }
        // Reply content is unconstrained beyond the wire framing.
        Message::Reply { .. } | Message::Bye => Ok(()),
    }
}

fn check_ident(field: &'static str, value: &str, max_len: usize) -> Result<(), ChatError> {
    if value.is_empty() || value.len() > max_len {
        return Err(ChatError::FieldConstraintViolation {
            field,
            reason: format!("length must be 1 to {max_len} characters"),
        });
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(ChatError::FieldConstraintViolation {
            field,
            reason: "only ASCII letters, digits and '-' are allowed".into(),
        });
    }
    Ok(())
}

fn check_display_name(value: &str) -> Result<(), ChatError> {
    if value.is_empty() || value.len() > 20 {
        return Err(ChatError::FieldConstraintViolation {
            field: "displayName",
            reason: "length must be 1 to 20 characters".into(),
        });
    }
    if !value.bytes().all(|b| (0x21..=0x7E).contains(&b)) {
        return Err(ChatError::FieldConstraintViolation {
            field: "displayName",
            reason: "only printable ASCII characters are allowed".into(),
        });
    }
    Ok(())
}

fn check_content(value: &str) -> Result<(), ChatError> {
    if value.len() > MAX_CONTENT_LEN {
        return Err(ChatError::FieldConstraintViolation {
            field: "content",
            reason: format!("length must be at most {MAX_CONTENT_LEN} characters"),
        });
    }
    if !value.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(ChatError::FieldConstraintViolation {
            field: "content",
            reason: "only printable ASCII characters and spaces are allowed".into(),
        });
    }
    Ok(())
}
