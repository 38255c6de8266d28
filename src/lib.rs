//! # Parley
//!
//! A client for a request-reply chat protocol that runs over either a
//! reliable stream transport (TCP, CRLF-terminated text lines) or an
//! unreliable datagram transport (UDP, tagged binary records with explicit
//! acknowledgment and retransmission).
//!
//! ## Architecture
//!
//! * [`types`]: the message vocabulary, field validation, session states
//!   and the error taxonomy.
//! * [`tcp`]: text framing and the stream transport driver.
//! * [`udp`]: the binary wire format and the reliability sublayer with
//!   message identifiers, Confirm acknowledgment, bounded retransmission,
//!   inbound deduplication and peer endpoint migration.
//! * [`session`]: the protocol engine, built on `(state, kind)` transition
//!   tables and delivered/processed correlation.
//! * [`client`]: a thin interactive loop over stdin.
//!
//! ## Stream grammar
//!
//! ```text
//! AUTH <username> AS <displayName> USING <secret>
//! JOIN <channelId> AS <displayName>
//! MSG FROM <displayName> IS <content...>
//! ERR FROM <displayName> IS <content...>
//! REPLY OK|NOK IS <content...>
//! BYE
//! ```
//!
//! ## Datagram records
//!
//! One binary record per datagram: 1-byte type tag, 16-bit little-endian
//! message identifier, then the kind's fields (null-terminated ASCII
//! strings, single status byte). `Confirm` carries only the identifier it
//! acknowledges. At most one outbound message is unacknowledged at a time,
//! so the sublayer never reorders; it only retries and deduplicates.
//!
//! ## Example
//!
//! ```no_run
//! use parley::{ClientConfig, Message, Session, StateCell, Transport};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), parley::ChatError> {
//! let config = ClientConfig::new("chat.example.org", parley::DEFAULT_PORT);
//! let cancel = CancellationToken::new();
//! let state = StateCell::new();
//!
//! let transport = Transport::tcp(config, cancel.clone());
//! let (session, driver, mut events) = Session::new(transport, state, cancel);
//! let engine = tokio::spawn(driver.run());
//!
//! session
//!     .send(Message::Auth {
//!         username: "pepa".into(),
//!         display_name: "Pepa".into(),
//!         secret: "s3cret".into(),
//!     })
//!     .await?;
//! session.disconnect().await?;
//! # let _ = events.recv().await;
//! # let _ = engine.await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod session;
pub mod tcp;
pub mod transport;
pub mod types;
pub mod udp;

pub use session::{Session, SessionDriver, SessionEvent};
pub use transport::{Transport, TransportEvent};
pub use types::{
    validate, ChatError, ClientConfig, Message, ReplyStatus, SessionState, StateCell,
    DEFAULT_PORT, DEFAULT_UDP_RETRIES, DEFAULT_UDP_TIMEOUT,
};
