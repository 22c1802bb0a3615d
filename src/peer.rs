// One participant connection.
//
// A `Peer` sits on top of a `SignalTransport` and adds request/response
// correlation: server-initiated requests get a generated id, wait in a
// pending table and settle exactly once (response, timeout, or peer close).
// Inbound requests and notifications are forwarded to the conference loop
// as `PeerEvent`s; each inbound request carries a `Responder` that
// guarantees exactly one Response goes back, even if the handler bails out
// without answering.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{RequestError, SignalError};
use crate::events::Listeners;
use crate::media::{MediaConsumer, MediaProducer, MediaTransport};
use crate::message::{Message, Notification, Request, RequestMethod, NotificationMethod};
use crate::transport::{SignalTransport, TransportEvent};

pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

// ─── Responder ──────────────────────────────────────────────────────────────

/// Answering handle for one inbound request.
///
/// Exactly one Response leaves per request: the first `accept` or `reject`
/// wins, later calls are logged and ignored, and dropping an unanswered
/// responder sends an error Response so the client never waits forever.
pub struct Responder {
    transport: Arc<dyn SignalTransport>,
    request: Request,
    answered: AtomicBool,
}

impl Responder {
    fn new(transport: Arc<dyn SignalTransport>, request: Request) -> Self {
        Self {
            transport,
            request,
            answered: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn accept(&self, data: Value) {
        if self.answered.swap(true, Ordering::SeqCst) {
            warn!(
                method = %self.request.method,
                id = %self.request.id,
                "request already answered"
            );
            return;
        }
        let response = Message::success_response(&self.request, data);
        if self.transport.send(&Message::Response(response)).is_err() {
            debug!(method = %self.request.method, "response dropped, transport closed");
        }
    }

    pub fn reject(&self, reason: &str) {
        if self.answered.swap(true, Ordering::SeqCst) {
            warn!(
                method = %self.request.method,
                id = %self.request.id,
                "request already answered"
            );
            return;
        }
        let response = Message::error_response(&self.request, reason);
        if self.transport.send(&Message::Response(response)).is_err() {
            debug!(method = %self.request.method, "response dropped, transport closed");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.answered.swap(true, Ordering::SeqCst) {
            warn!(
                method = %self.request.method,
                id = %self.request.id,
                "request dropped without an answer"
            );
            let response = Message::error_response(&self.request, "request not handled");
            let _ = self.transport.send(&Message::Response(response));
        }
    }
}

// ─── Peer events ────────────────────────────────────────────────────────────

/// What a peer forwards to the conference loop. Responses never appear
/// here; they settle the pending table internally.
pub enum PeerEvent {
    Request(Request, Responder),
    Notification(Notification),
    Close,
}

// ─── Media-side session state ───────────────────────────────────────────────

/// Direction a WebRTC transport was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Producing,
    Consuming,
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producing => f.write_str("producing"),
            Self::Consuming => f.write_str("consuming"),
        }
    }
}

#[derive(Default)]
struct MediaState {
    transports: HashMap<String, (TransportRole, Arc<dyn MediaTransport>)>,
    producers: HashMap<String, Arc<dyn MediaProducer>>,
    consumers: HashMap<String, Arc<dyn MediaConsumer>>,
}

struct SessionState {
    joined: bool,
    display_name: String,
    device: Value,
    rtp_capabilities: Option<Value>,
    sctp_capabilities: Option<Value>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            joined: false,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            device: Value::Null,
            rtp_capabilities: None,
            sctp_capabilities: None,
        }
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, RequestError>>,
}

// ─── Peer ───────────────────────────────────────────────────────────────────

pub struct Peer {
    id: String,
    transport: Arc<dyn SignalTransport>,
    request_timeout: Duration,
    closed: AtomicBool,
    pending: Mutex<HashMap<String, PendingRequest>>,
    session: Mutex<SessionState>,
    media: Mutex<MediaState>,
    close_listeners: Listeners<()>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Peer {
    /// Build a peer over `transport` and start pumping its events. The
    /// returned receiver is the conference loop's inbox.
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn SignalTransport>,
        request_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id: id.into(),
            transport: Arc::clone(&transport),
            request_timeout,
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            session: Mutex::new(SessionState::new()),
            media: Mutex::new(MediaState::default()),
            close_listeners: Listeners::new(),
            events,
        });

        let mut transport_events = transport.subscribe();
        let weak = Arc::downgrade(&peer);
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                let Some(peer) = weak.upgrade() else { break };
                match event {
                    TransportEvent::Open => debug!(peer = %peer.id, "transport open"),
                    TransportEvent::Message(message) => peer.handle_message(message),
                    TransportEvent::Close => {
                        peer.close();
                        break;
                    }
                }
            }
        });

        (peer, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a close observer. Fires once, in registration order.
    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.close_listeners.add(move |_| listener());
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Request(request) => {
                let responder = Responder::new(Arc::clone(&self.transport), request.clone());
                let _ = self.events.send(PeerEvent::Request(request, responder));
            }
            Message::Response(response) => {
                let pending = self.pending.lock().unwrap().remove(&response.id);
                match pending {
                    Some(pending) => {
                        let outcome = if response.success {
                            Ok(response.data)
                        } else {
                            Err(RequestError::Rejected(
                                response.error.unwrap_or_default(),
                            ))
                        };
                        let _ = pending.tx.send(outcome);
                    }
                    None => warn!(
                        peer = %self.id,
                        id = %response.id,
                        method = %response.method,
                        "response matches no pending request, dropping"
                    ),
                }
            }
            Message::Notification(notification) => {
                let _ = self.events.send(PeerEvent::Notification(notification));
            }
        }
    }

    /// Send a server-initiated request and wait for its terminal outcome.
    pub async fn request(
        &self,
        method: RequestMethod,
        data: Value,
    ) -> Result<Value, RequestError> {
        if self.is_closed() {
            return Err(RequestError::PeerClosed);
        }

        let request = Message::request(method, data);
        let id = request.id.clone();
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id.clone(),
            PendingRequest {
                method: request.method.clone(),
                tx,
            },
        );

        if self.transport.send(&Message::Request(request)).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(RequestError::TransportClosed);
        }

        match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without settling; only close() does that, and
            // it settles first, so this arm is unreachable in practice.
            Ok(Err(_)) => Err(RequestError::PeerClosed),
            Err(_) => {
                match self.pending.lock().unwrap().remove(&id) {
                    Some(pending) => {
                        warn!(
                            peer = %self.id,
                            method = %pending.method,
                            "request timed out"
                        );
                        Err(RequestError::Timeout)
                    }
                    // A settlement raced the timeout and won.
                    None => rx.try_recv().unwrap_or(Err(RequestError::PeerClosed)),
                }
            }
        }
    }

    /// Fire-and-forget notification. Silently dropped if the transport is
    /// already closed.
    pub fn notify(&self, method: NotificationMethod, data: Value) {
        let notification = Message::notification(method, data);
        if self.transport.send(&Message::Notification(notification)).is_err() {
            debug!(peer = %self.id, method = %method, "notification dropped, transport closed");
        }
    }

    /// Close the peer: settle every in-flight request with `PeerClosed`,
    /// close the transport and fire close listeners. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.id, "peer closed");

        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            let _ = pending.tx.send(Err(RequestError::PeerClosed));
        }

        self.transport.close();
        self.close_listeners.emit(&());
        let _ = self.events.send(PeerEvent::Close);
    }

    // ── Session ─────────────────────────────────────────────────────────

    pub fn is_joined(&self) -> bool {
        self.session.lock().unwrap().joined
    }

    /// Record a successful join. Fails if already joined.
    pub fn set_joined(
        &self,
        display_name: Option<String>,
        device: Value,
        rtp_capabilities: Value,
        sctp_capabilities: Option<Value>,
    ) -> Result<(), SignalError> {
        let mut session = self.session.lock().unwrap();
        if session.joined {
            return Err(SignalError::AlreadyJoined);
        }
        session.joined = true;
        if let Some(name) = display_name.filter(|n| !n.is_empty()) {
            session.display_name = name;
        }
        session.device = device;
        session.rtp_capabilities = Some(rtp_capabilities);
        session.sctp_capabilities = sctp_capabilities;
        Ok(())
    }

    pub fn display_name(&self) -> String {
        self.session.lock().unwrap().display_name.clone()
    }

    pub fn device(&self) -> Value {
        self.session.lock().unwrap().device.clone()
    }

    pub fn rtp_capabilities(&self) -> Option<Value> {
        self.session.lock().unwrap().rtp_capabilities.clone()
    }

    pub fn sctp_capabilities(&self) -> Option<Value> {
        self.session.lock().unwrap().sctp_capabilities.clone()
    }

    // ── Media handles ───────────────────────────────────────────────────

    /// Register a transport under its role. One transport per role.
    pub fn add_transport(
        &self,
        role: TransportRole,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<(), SignalError> {
        let mut media = self.media.lock().unwrap();
        if media.transports.values().any(|(r, _)| *r == role) {
            return Err(SignalError::BadRequest(format!(
                "peer already has a {role} transport"
            )));
        }
        media.transports.insert(transport.id(), (role, transport));
        Ok(())
    }

    pub fn transport(&self, id: &str) -> Option<Arc<dyn MediaTransport>> {
        self.media
            .lock()
            .unwrap()
            .transports
            .get(id)
            .map(|(_, t)| Arc::clone(t))
    }

    pub fn consuming_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.media
            .lock()
            .unwrap()
            .transports
            .values()
            .find(|(role, _)| *role == TransportRole::Consuming)
            .map(|(_, t)| Arc::clone(t))
    }

    pub fn remove_transport(&self, id: &str) -> Option<Arc<dyn MediaTransport>> {
        self.media
            .lock()
            .unwrap()
            .transports
            .remove(id)
            .map(|(_, t)| t)
    }

    pub fn add_producer(&self, producer: Arc<dyn MediaProducer>) {
        self.media
            .lock()
            .unwrap()
            .producers
            .insert(producer.id(), producer);
    }

    pub fn producer(&self, id: &str) -> Option<Arc<dyn MediaProducer>> {
        self.media.lock().unwrap().producers.get(id).cloned()
    }

    pub fn remove_producer(&self, id: &str) -> Option<Arc<dyn MediaProducer>> {
        self.media.lock().unwrap().producers.remove(id)
    }

    pub fn producers(&self) -> Vec<Arc<dyn MediaProducer>> {
        self.media.lock().unwrap().producers.values().cloned().collect()
    }

    pub fn add_consumer(&self, consumer: Arc<dyn MediaConsumer>) {
        self.media
            .lock()
            .unwrap()
            .consumers
            .insert(consumer.id(), consumer);
    }

    pub fn consumer(&self, id: &str) -> Option<Arc<dyn MediaConsumer>> {
        self.media.lock().unwrap().consumers.get(id).cloned()
    }

    pub fn remove_consumer(&self, id: &str) -> Option<Arc<dyn MediaConsumer>> {
        self.media.lock().unwrap().consumers.remove(id)
    }

    /// Close every media transport of this peer. The engine cascades the
    /// closes to the producers and consumers living on them.
    pub fn close_media(&self) {
        let state = {
            let mut media = self.media.lock().unwrap();
            std::mem::take(&mut *media)
        };
        for (_, (_, transport)) in state.transports {
            transport.close();
        }
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
