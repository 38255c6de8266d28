//! Channel seam between the transports and the protocol engine.
//!
//! Each transport runs as one spawned driver task that owns its socket.
//! Outbound messages flow down through an mpsc sender, transport events flow
//! back up through an mpsc receiver; the driver's join handle carries the
//! terminal result of the receive loop.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{ChatError, ClientConfig, Message, StateCell};
use crate::{tcp, udp};

/// Buffered event capacity between a transport driver and the engine.
pub(crate) const EVENT_BUFFER: usize = 64;

/// Notifications a transport raises towards the protocol engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport is connected and ready to send.
    Connected,
    /// The most recent outbound message left the sender (stream) or was
    /// acknowledged by the peer (datagram).
    Delivered,
    /// A validated inbound message.
    Received(Message),
    /// A non-transport-fatal protocol fault detected on the inbound path,
    /// e.g. a malformed frame. The driver keeps running so the engine can
    /// still flush an ERR frame before tearing the session down.
    Fault(ChatError),
}

/// A running transport: the engine's half of both channels plus the driver
/// task handle.
pub struct Transport {
    pub(crate) outbound: mpsc::Sender<Message>,
    pub(crate) events: mpsc::Receiver<TransportEvent>,
    pub(crate) driver: JoinHandle<Result<(), ChatError>>,
}

impl Transport {
    /// Spawns the stream transport driver.
    pub fn tcp(config: ClientConfig, cancel: CancellationToken) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let driver = tokio::spawn(tcp::run(config, outbound_rx, event_tx, cancel));
        Self {
            outbound: outbound_tx,
            events: event_rx,
            driver,
        }
    }

    /// Spawns the datagram transport driver. The shared state cell lets the
    /// driver detect the Auth phase for peer endpoint migration.
    pub fn udp(config: ClientConfig, state: StateCell, cancel: CancellationToken) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let driver = tokio::spawn(udp::run(config, state, outbound_rx, event_tx, cancel));
        Self {
            outbound: outbound_tx,
            events: event_rx,
            driver,
        }
    }
}
