//! Datagram transport: a reliability sublayer over UDP.
//!
//! Adds what the lossy, unordered, duplicate-prone channel lacks: per-message
//! identifiers, explicit Confirm acknowledgment, bounded retransmission on a
//! timeout, inbound deduplication and one-time peer endpoint migration.
//! Because the engine keeps at most one message pending at a time, the
//! sublayer never reorders; it only retries and deduplicates.

pub mod wire;

use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::TransportEvent;
use crate::types::{validate, ChatError, ClientConfig, Message, SessionState, StateCell};

const RECV_BUFFER: usize = 4096;

/// The single currently-unacknowledged outbound message.
struct Pending {
    id: u16,
    /// Encoded datagram, kept so every retransmission is byte-identical.
    datagram: Vec<u8>,
    retries: u8,
}

/// Driver task: owns the socket, the pending record, the retransmission
/// deadline, the processed-identifier set and the current peer endpoint.
pub(crate) async fn run(
    config: ClientConfig,
    state: StateCell,
    mut outbound: mpsc::Receiver<Message>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) -> Result<(), ChatError> {
    let mut peer = resolve(&config).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    info!(%peer, local = %socket.local_addr()?, "datagram transport ready");
    let _ = events.send(TransportEvent::Connected).await;

    let mut next_id: u16 = 0;
    let mut pending: Option<Pending> = None;
    let mut deadline = Instant::now();
    let mut processed: HashSet<u16> = HashSet::new();
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            // The engine serializes sends on the delivery signal, so a new
            // request only arrives once the previous one is resolved; the
            // guard makes the invariant local as well.
            Some(message) = outbound.recv(), if pending.is_none() => {
                let id = next_id;
                next_id = next_id.wrapping_add(1);
                let datagram = wire::encode(&message, id);
                debug!(kind = message.kind(), id, "sending datagram");
                socket
                    .send_to(&datagram, peer)
                    .await
                    .map_err(|e| send_failed(peer, e))?;
                pending = Some(Pending { id, datagram, retries: 0 });
                deadline = Instant::now() + config.udp_timeout;
            }

            _ = sleep_until(deadline), if pending.is_some() => {
                let record = pending.as_mut().expect("pending checked by guard");
                if record.retries < config.udp_retries {
                    record.retries += 1;
                    warn!(id = record.id, retry = record.retries, "no confirm, retransmitting");
                    socket
                        .send_to(&record.datagram, peer)
                        .await
                        .map_err(|e| send_failed(peer, e))?;
                    deadline = Instant::now() + config.udp_timeout;
                } else {
                    return Err(ChatError::ServerUnreachable(format!(
                        "message {} not confirmed after {} retransmissions",
                        record.id, record.retries,
                    )));
                }
            }

            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                match wire::decode(&buf[..len]) {
                    Ok(wire::Record::Confirm { ref_id }) => {
                        if pending.as_ref().map(|p| p.id) == Some(ref_id) {
                            debug!(id = ref_id, "confirmed");
                            pending = None;
                            let _ = events.send(TransportEvent::Delivered).await;
                        } else {
                            // The peer may still be re-acknowledging an
                            // already-cleared message.
                            debug!(id = ref_id, "stray confirm ignored");
                        }
                    }
                    Ok(wire::Record::Message { id, message }) => {
                        // Always re-acknowledge; our earlier Confirm may
                        // have been lost.
                        socket
                            .send_to(&wire::encode_confirm(id), from)
                            .await
                            .map_err(|e| send_failed(from, e))?;
                        if !processed.insert(id) {
                            debug!(id, "duplicate datagram suppressed");
                            continue;
                        }

                        if let Err(e) = validate(&message) {
                            let _ = events.send(TransportEvent::Fault(
                                ChatError::InvalidMessageReceived(e.to_string()),
                            )).await;
                            continue;
                        }

                        // The first Reply of the Auth phase carries the
                        // server-chosen ephemeral endpoint; all further
                        // traffic goes there. Protocol assumption: the first
                        // responder's source address is trusted.
                        if matches!(message, Message::Reply { .. })
                            && state.get() == SessionState::Auth
                            && from != peer
                        {
                            info!(old = %peer, new = %from, "migrating to server endpoint");
                            peer = from;
                        }

                        debug!(kind = message.kind(), id, "received datagram");
                        let _ = events.send(TransportEvent::Received(message)).await;
                    }
                    Err(e) => {
                        warn!(%from, error = %e, "malformed datagram");
                        let _ = events.send(TransportEvent::Fault(e)).await;
                    }
                }
            }
        }
    }
}

/// A datagram the OS refuses to send means the peer cannot be reached.
fn send_failed(peer: SocketAddr, error: std::io::Error) -> ChatError {
    ChatError::ServerUnreachable(format!("send to {peer}: {error}"))
}

async fn resolve(config: &ClientConfig) -> Result<SocketAddr, ChatError> {
    let mut addrs = lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|e| ChatError::ServerUnreachable(format!("{}: {e}", config.host)))?;
    addrs.find(SocketAddr::is_ipv4).ok_or_else(|| {
        ChatError::ServerUnreachable(format!("{}: no IPv4 address", config.host))
    })
}
