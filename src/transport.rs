// Message-oriented transport over one client connection.
//
// The transport owns framing only: it parses inbound text frames into
// `Message`s and serializes outbound `Message`s to text. Malformed frames
// are logged and dropped without touching the connection. Everything above
// (correlation, dispatch) lives in `Peer`.
//
// Exactly one `Close` event is delivered per transport, whichever side
// closes first. A server-initiated `close()` sends a close frame with code
// 1000 before tearing down.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::message::Message;

/// Close code sent when the server closes a connection.
pub const CLOSE_CODE_NORMAL: u16 = 1000;
const CLOSE_REASON: &str = "closed by server";

/// Events a transport delivers to its single subscriber.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport is ready. Always the first event a subscriber sees.
    Open,
    /// A well-formed inbound message.
    Message(Message),
    /// The transport is gone, whichever side closed it.
    Close,
}

/// One client connection, seen as a stream of `Message`s.
pub trait SignalTransport: Send + Sync {
    /// Queue a message for delivery. Fails only if the transport is closed;
    /// socket write failures surface as a later `Close` event instead.
    fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Close from the server side. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Install the subscriber and receive events. The transport supports
    /// one subscriber; frames arriving before `subscribe` are dropped.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}

// ---------------------------------------------------------------------------
// Shared delivery state
// ---------------------------------------------------------------------------

struct DeliveryState {
    closed: AtomicBool,
    subscriber: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl DeliveryState {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            subscriber: Mutex::new(None),
        }
    }

    fn deliver(&self, event: TransportEvent) {
        match self.subscriber.lock().unwrap().as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("transport subscriber gone, dropping event");
                }
            }
            None => debug!("no transport subscriber yet, dropping event"),
        }
    }

    fn handle_incoming(&self, text: &str) {
        match Message::parse(text) {
            Ok(message) => self.deliver(TransportEvent::Message(message)),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    /// Returns true for the first close only.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // The open event is delivered through the channel rather than at
        // construction time, so the subscriber never misses it.
        let _ = tx.send(TransportEvent::Open);
        *self.subscriber.lock().unwrap() = Some(tx);
        rx
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// `SignalTransport` over one axum WebSocket.
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<WsMessage>,
    state: Arc<DeliveryState>,
    cancel: CancellationToken,
}

impl WebSocketTransport {
    /// Take ownership of `socket` and start its reader and writer tasks.
    pub fn new(socket: WebSocket) -> Arc<Self> {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let state = Arc::new(DeliveryState::new());
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let is_close = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = stream.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                state.handle_incoming(&text);
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                if state.mark_closed() {
                                    state.deliver(TransportEvent::Close);
                                }
                                break;
                            }
                            // Pings are answered by axum itself.
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                debug!(error = %e, "websocket read failed");
                                if state.mark_closed() {
                                    state.deliver(TransportEvent::Close);
                                }
                                break;
                            }
                        }
                    }
                }
            });
        }

        Arc::new(Self {
            outbound,
            state,
            cancel,
        })
    }
}

impl SignalTransport for WebSocketTransport {
    fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = message.to_json().to_string();
        self.outbound
            .send(WsMessage::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.state.mark_closed() {
            return;
        }
        let _ = self.outbound.send(WsMessage::Close(Some(CloseFrame {
            code: CLOSE_CODE_NORMAL,
            reason: CLOSE_REASON.into(),
        })));
        self.cancel.cancel();
        self.state.deliver(TransportEvent::Close);
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.state.subscribe()
    }
}

// ---------------------------------------------------------------------------
// In-memory transport (tests)
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
