//! Protocol engine: the session state machine and send/receive correlation.
//!
//! The engine pairs two finite transition tables, one over outbound
//! `(state, kind)` and one over inbound, with two counting signals:
//! "delivered" (the transport-level acknowledgment) and "processed" (a
//! semantically matching Reply). Auth and Join block on both; chat messages
//! block on delivery only.
//!
//! All state transitions happen on the driver's dispatch task or inside
//! `send` once the transport has accepted the message; the state cell is
//! shared with the datagram transport read-only (see [`StateCell`]).

use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::transport::{Transport, TransportEvent};
use crate::types::{
    validate, ChatError, Message, ReplyStatus, SessionState, StateCell, MAX_CONTENT_LEN,
};

/// Notifications surfaced to the caller.
#[derive(Debug)]
pub enum SessionEvent {
    /// The transport is connected.
    Connected,
    /// An inbound chat message or reply, delivered verbatim.
    Message(Message),
}

/// Display name used for outbound ERR frames before any Auth was sent.
const FALLBACK_DISPLAY_NAME: &str = "client";

struct Shared {
    state: StateCell,
    delivered: Semaphore,
    processed: Semaphore,
    /// Display name of the last Auth sent, used when emitting ERR frames.
    display_name: Mutex<String>,
}

/// Caller-side handle: drives sends and graceful shutdown. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// Engine-side half: consumes transport events, applies receive transitions
/// and funnels fatal conditions into the result of [`SessionDriver::run`].
pub struct SessionDriver {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    events: mpsc::Receiver<TransportEvent>,
    transport: JoinHandle<Result<(), ChatError>>,
    notify: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl Session {
    /// Binds the engine to a running transport. Returns the caller handle,
    /// the driver to run, and the caller's notification stream.
    pub fn new(
        transport: Transport,
        state: StateCell,
        cancel: CancellationToken,
    ) -> (Session, SessionDriver, mpsc::UnboundedReceiver<SessionEvent>) {
        let shared = Arc::new(Shared {
            state,
            delivered: Semaphore::new(0),
            processed: Semaphore::new(0),
            display_name: Mutex::new(FALLBACK_DISPLAY_NAME.to_string()),
        });
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let session = Session {
            shared: Arc::clone(&shared),
            outbound: transport.outbound.clone(),
            cancel: cancel.clone(),
        };
        let driver = SessionDriver {
            shared,
            outbound: transport.outbound,
            events: transport.events,
            transport: transport.driver,
            notify: notify_tx,
            cancel,
        };
        (session, driver, notify_rx)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Validates and transmits one message according to the send transition
    /// table, blocking until its delivery outcome (and, for Auth and Join,
    /// its processing Reply) is resolved.
    pub async fn send(&self, message: Message) -> Result<(), ChatError> {
        validate(&message)?;

        let state = self.shared.state.get();
        let (next_state, wait_processed) = match (state, &message) {
            (SessionState::Start | SessionState::WaitForAuth, Message::Auth { .. }) => {
                (Some(SessionState::Auth), true)
            }
            (SessionState::Open, Message::Join { .. }) => (None, true),
            (SessionState::Open, Message::Msg { .. }) => (None, false),
            (
                SessionState::Auth | SessionState::WaitForAuth | SessionState::Open,
                Message::Bye,
            ) => (Some(SessionState::End), false),
            (state, message) => {
                return Err(ChatError::InvalidInput {
                    state,
                    kind: message.kind(),
                })
            }
        };

        let kind = message.kind();
        let auth_name = match &message {
            Message::Auth { display_name, .. } => Some(display_name.clone()),
            _ => None,
        };

        self.outbound
            .send(message)
            .await
            .map_err(|_| ChatError::Cancelled)?;
        // The transition commits only once the transport has the message; a
        // send refused at the channel leaves the session where it was.
        if let Some(name) = auth_name {
            *self.shared.display_name.lock().expect("name cell poisoned") = name;
        }
        if let Some(next) = next_state {
            self.shared.state.set(next);
        }
        debug!(kind, wait_processed, "message handed to transport");

        self.wait(&self.shared.delivered).await?;
        if wait_processed {
            self.wait(&self.shared.processed).await?;
        }
        if next_state == Some(SessionState::End) {
            // Bye round-trip done; tear the transport down.
            self.cancel.cancel();
        }
        Ok(())
    }

    /// Graceful shutdown: a Bye round-trip when the session is live, then
    /// cancellation either way.
    pub async fn disconnect(&self) -> Result<(), ChatError> {
        let result = match self.shared.state.get() {
            SessionState::Auth | SessionState::WaitForAuth | SessionState::Open => {
                self.send(Message::Bye).await
            }
            SessionState::Start | SessionState::End => Ok(()),
        };
        self.cancel.cancel();
        result
    }

    async fn wait(&self, signal: &Semaphore) -> Result<(), ChatError> {
        // A permit that raced with cancellation still counts as resolved.
        tokio::select! {
            biased;

            permit = signal.acquire() => {
                permit.map_err(|_| ChatError::Cancelled)?.forget();
                Ok(())
            }
            _ = self.cancel.cancelled() => Err(ChatError::Cancelled),
        }
    }
}

impl SessionDriver {
    /// Runs the session until clean end, cancellation or a fatal condition.
    /// Fatal conditions detected on the asynchronous receive path surface
    /// here as the returned error.
    pub async fn run(mut self) -> Result<(), ChatError> {
        let result = self.dispatch().await;
        // Unblocks anything still waiting on a signal and stops the
        // transport driver.
        self.cancel.cancel();
        if let Err(e) = &result {
            error!(error = %e, "session ended with a fatal condition");
        } else {
            info!("session ended");
        }
        result
    }

    async fn dispatch(&mut self) -> Result<(), ChatError> {
        let mut events_open = true;
        loop {
            // Buffered events are drained before the transport's terminal
            // result is consumed, so a final inbound Bye is not shadowed by
            // the teardown of the connection that carried it.
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(()),

                event = self.events.recv(), if events_open => match event {
                    Some(TransportEvent::Connected) => {
                        let _ = self.notify.send(SessionEvent::Connected);
                    }
                    Some(TransportEvent::Delivered) => {
                        self.shared.delivered.add_permits(1);
                    }
                    Some(TransportEvent::Received(message)) => {
                        if let Err(fatal) = self.receive(message) {
                            return self.unwind(fatal).await;
                        }
                        if self.shared.state.get() == SessionState::End {
                            // Clean end: the peer said Bye.
                            return Ok(());
                        }
                    }
                    Some(TransportEvent::Fault(fatal)) => return self.unwind(fatal).await,
                    None => events_open = false,
                },

                finished = &mut self.transport => {
                    let result = flatten(finished);
                    // Teardown noise after a clean end is not a failure.
                    if self.shared.state.get() == SessionState::End {
                        return Ok(());
                    }
                    return result;
                }
            }
        }
    }

    /// Inbound transition table over `(state, kind)`.
    fn receive(&mut self, message: Message) -> Result<(), ChatError> {
        let state = self.shared.state.get();
        debug!(%state, kind = message.kind(), "dispatching inbound message");

        match (state, message) {
            (
                SessionState::Auth,
                reply @ Message::Reply {
                    status: ReplyStatus::Ok,
                    ..
                },
            ) => {
                self.shared.state.set(SessionState::Open);
                self.shared.processed.add_permits(1);
                let _ = self.notify.send(SessionEvent::Message(reply));
                Ok(())
            }
            (SessionState::Auth, reply @ Message::Reply { .. }) => {
                self.shared.state.set(SessionState::WaitForAuth);
                self.shared.processed.add_permits(1);
                let _ = self.notify.send(SessionEvent::Message(reply));
                Ok(())
            }
            (
                SessionState::Auth | SessionState::Open,
                Message::Err {
                    display_name,
                    content,
                },
            ) => {
                self.shared.state.set(SessionState::End);
                Err(ChatError::ServerException {
                    display_name,
                    content,
                })
            }
            (SessionState::Open, msg @ Message::Msg { .. }) => {
                let _ = self.notify.send(SessionEvent::Message(msg));
                Ok(())
            }
            (SessionState::Open, reply @ Message::Reply { .. }) => {
                // A reply nobody consumed yet means nothing is awaited;
                // further ones are spurious and ignored.
                if self.shared.processed.available_permits() != 0 {
                    debug!("spurious reply ignored");
                    return Ok(());
                }
                self.shared.processed.add_permits(1);
                let _ = self.notify.send(SessionEvent::Message(reply));
                Ok(())
            }
            (SessionState::Open, Message::Bye) => {
                self.shared.state.set(SessionState::End);
                Ok(())
            }
            (state, message) => {
                self.shared.state.set(SessionState::End);
                Err(ChatError::InvalidMessageReceived(format!(
                    "unexpected {} in state {state}",
                    message.kind()
                )))
            }
        }
    }

    /// Terminates the session on a fatal condition. For malformed or
    /// unexpected inbound messages an ERR frame naming the violation is
    /// flushed first; a peer-declared error gets no response.
    async fn unwind(&mut self, fatal: ChatError) -> Result<(), ChatError> {
        self.shared.state.set(SessionState::End);

        if matches!(fatal, ChatError::InvalidMessageReceived(_)) {
            let display_name = self
                .shared
                .display_name
                .lock()
                .expect("name cell poisoned")
                .clone();
            let frame = Message::Err {
                display_name,
                content: printable(&fatal.to_string()),
            };
            if self.outbound.send(frame).await.is_ok() {
                self.flush_delivery().await;
            }
        }

        Err(fatal)
    }

    /// Waits until the ERR frame is delivered or the transport gives up
    /// (e.g. retransmissions exhausted).
    async fn flush_delivery(&mut self) {
        loop {
            tokio::select! {
                _ = &mut self.transport => return,
                event = self.events.recv() => match event {
                    Some(TransportEvent::Delivered) => return,
                    Some(_) => continue,
                    None => {
                        let _ = (&mut self.transport).await;
                        return;
                    }
                },
            }
        }
    }
}

fn flatten(finished: Result<Result<(), ChatError>, tokio::task::JoinError>) -> Result<(), ChatError> {
    match finished {
        Ok(result) => result,
        Err(join_error) => Err(ChatError::Io(io::Error::other(join_error))),
    }
}

/// Clamps arbitrary text into a legal ERR frame body.
fn printable(input: &str) -> String {
    input
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .take(MAX_CONTENT_LEN)
        .collect()
}
