//! Stream transport: reliable ordered delivery over TCP with CRLF text
//! framing. No retransmission; the stream write itself is the delivery
//! proof.

mod codec;

pub use codec::LineCodec;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportEvent;
use crate::types::{validate, ChatError, ClientConfig, Message};
use tracing::{debug, info, warn};

/// Driver task: connects, then serves outbound sends and the inbound
/// receive loop until cancellation or a fatal transport condition.
pub(crate) async fn run(
    config: ClientConfig,
    mut outbound: mpsc::Receiver<Message>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) -> Result<(), ChatError> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        connected = TcpStream::connect((config.host.as_str(), config.port)) => {
            connected.map_err(|e| {
                ChatError::ServerUnreachable(format!("{}:{}: {e}", config.host, config.port))
            })?
        }
    };
    info!(host = %config.host, port = config.port, "connected over tcp");
    let _ = events.send(TransportEvent::Connected).await;

    let mut framed = Framed::new(stream, LineCodec);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            Some(message) = outbound.recv() => {
                debug!(kind = message.kind(), "sending frame");
                framed.send(message).await?;
                // The write is the delivery proof at this layer.
                let _ = events.send(TransportEvent::Delivered).await;
            }

            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    debug!(kind = message.kind(), "received frame");
                    let event = match validate(&message) {
                        Ok(()) => TransportEvent::Received(message),
                        Err(e) => TransportEvent::Fault(
                            ChatError::InvalidMessageReceived(e.to_string()),
                        ),
                    };
                    let _ = events.send(event).await;
                }
                // A malformed line is a protocol fault, not a dead stream;
                // the engine still gets a chance to flush an ERR frame.
                Some(Err(e @ ChatError::InvalidMessageReceived(_))) => {
                    warn!(error = %e, "malformed inbound line");
                    let _ = events.send(TransportEvent::Fault(e)).await;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ChatError::ServerUnreachable(
                        "server closed the connection".into(),
                    ))
                }
            },
        }
    }
}
