// Media-engine collaborator interface.
//
// The signaling layer never touches packets: ICE/DTLS/SRTP, RTP forwarding
// and codec work live in an external media engine that the embedding
// bootstrap injects behind these traits. The surface mirrors what the
// orchestrator consumes: a worker creates routers, a router creates WebRTC
// transports and answers capability queries, transports create producers
// and consumers, and producer/consumer lifecycle events flow back through
// registered listeners.
//
// The traits are object-safe (`async_trait`) so the whole layer holds
// `Arc<dyn ...>` handles keyed by engine-assigned ids.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::MediaError;

// ─── Shared data types ──────────────────────────────────────────────────────

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One codec the router is willing to route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub parameters: Value,
}

/// Options for `MediaRouter::create_webrtc_transport`.
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

/// Options for `MediaTransport::consume`.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: String,
    pub rtp_capabilities: Value,
    /// Consumers start paused; the orchestrator resumes them once the
    /// client's receive pipeline is installed.
    pub paused: bool,
    pub enable_rtx: bool,
}

/// DTLS state of a WebRTC transport, reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Preferred spatial/temporal layers of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    #[serde(default)]
    pub temporal_layer: Option<u8>,
}

/// Lifecycle events of a consumer, driven by its transport and the producer
/// it is attached to.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    TransportClose,
    ProducerClose,
    ProducerPause,
    ProducerResume,
    LayersChange(Option<ConsumerLayers>),
}

// ─── Collaborator traits ────────────────────────────────────────────────────

/// One engine worker process. Routers created on it share its resources.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn MediaRouter>, MediaError>;

    /// Register a listener for the worker becoming unusable. The embedding
    /// bootstrap treats this as fatal to the process.
    fn on_died(&self, listener: Box<dyn Fn() + Send + Sync>);
}

/// Routing context for one conference.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn rtp_capabilities(&self) -> Value;

    /// Whether a peer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    fn close(&self);
}

/// A secured media path to one client.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;
    fn ice_parameters(&self) -> Value;
    fn ice_candidates(&self) -> Value;
    fn dtls_parameters(&self) -> Value;

    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaError>;

    /// Returns refreshed ICE parameters.
    async fn restart_ice(&self) -> Result<Value, MediaError>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    async fn consume(
        &self,
        options: ConsumeOptions,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    fn on_dtls_state_change(&self, listener: Box<dyn Fn(DtlsState) + Send + Sync>);

    /// Closing a transport tears down every producer and consumer created
    /// on it; their listeners observe the cascade.
    fn close(&self);
}

/// A peer's outbound media stream handle.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;

    async fn pause(&self) -> Result<(), MediaError>;
    async fn resume(&self) -> Result<(), MediaError>;

    fn close(&self);
}

/// A peer's inbound handle receiving another peer's producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    /// Engine consumer type: "simple", "simulcast", "svc" or "pipe".
    fn consumer_type(&self) -> String;
    fn producer_paused(&self) -> bool;
    fn app_data(&self) -> Value;

    async fn pause(&self) -> Result<(), MediaError>;
    async fn resume(&self) -> Result<(), MediaError>;
    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), MediaError>;
    async fn set_priority(&self, priority: u8) -> Result<(), MediaError>;
    async fn request_key_frame(&self) -> Result<(), MediaError>;

    fn on_event(&self, listener: Box<dyn Fn(ConsumerEvent) + Send + Sync>);

    fn close(&self);
}

// ─── Mock engine (tests) ────────────────────────────────────────────────────

/// In-process mock of the collaborator, with real event cascades: closing a
/// producer fires `ProducerClose` on every consumer attached to it, closing
/// a transport fires `TransportClose` on its consumers and cascades its
/// producers. Tests drive the signaling layer end to end against it.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::events::Listeners;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct EngineState {
        next_id: AtomicUsize,
        /// producer id -> consumers attached to it
        links: Mutex<HashMap<String, Vec<Arc<MockConsumer>>>>,
        /// producer id -> producer (for pause/resume/close cascades)
        producers: Mutex<HashMap<String, Arc<MockProducer>>>,
        /// every consumer ever created, by id, so tests can drive events
        consumers: Mutex<HashMap<String, Arc<MockConsumer>>>,
        /// every transport ever created, by id
        transports: Mutex<HashMap<String, Arc<MockTransport>>>,
        pub can_consume: AtomicBool,
        pub consume_calls: AtomicUsize,
        pub produce_calls: AtomicUsize,
        pub connect_calls: AtomicUsize,
    }

    impl EngineState {
        fn next_id(&self, prefix: &str) -> String {
            format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        pub fn consumer(&self, id: &str) -> Option<Arc<MockConsumer>> {
            self.consumers.lock().unwrap().get(id).cloned()
        }

        pub fn transport(&self, id: &str) -> Option<Arc<MockTransport>> {
            self.transports.lock().unwrap().get(id).cloned()
        }
    }

    pub struct MockWorker {
        pub state: Arc<EngineState>,
        died: Listeners<()>,
    }

    impl MockWorker {
        pub fn new() -> Arc<Self> {
            let state = Arc::new(EngineState {
                can_consume: AtomicBool::new(true),
                ..EngineState::default()
            });
            Arc::new(Self {
                state,
                died: Listeners::new(),
            })
        }

        pub fn kill(&self) {
            self.died.emit(&());
        }
    }

    #[async_trait]
    impl MediaWorker for MockWorker {
        async fn create_router(
            &self,
            media_codecs: Vec<RtpCodecCapability>,
        ) -> Result<Arc<dyn MediaRouter>, MediaError> {
            Ok(Arc::new(MockRouter {
                state: Arc::clone(&self.state),
                media_codecs,
                closed: AtomicBool::new(false),
            }))
        }

        fn on_died(&self, listener: Box<dyn Fn() + Send + Sync>) {
            self.died.add(move |_| listener());
        }
    }

    pub struct MockRouter {
        pub state: Arc<EngineState>,
        media_codecs: Vec<RtpCodecCapability>,
        pub closed: AtomicBool,
    }

    #[async_trait]
    impl MediaRouter for MockRouter {
        fn rtp_capabilities(&self) -> Value {
            json!({ "codecs": self.media_codecs })
        }

        fn can_consume(&self, _producer_id: &str, _rtp_capabilities: &Value) -> bool {
            self.state.can_consume.load(Ordering::SeqCst)
        }

        async fn create_webrtc_transport(
            &self,
            _options: WebRtcTransportOptions,
        ) -> Result<Arc<dyn MediaTransport>, MediaError> {
            let transport = Arc::new(MockTransport {
                state: Arc::clone(&self.state),
                id: self.state.next_id("transport"),
                closed: AtomicBool::new(false),
                owned_producers: Mutex::new(Vec::new()),
                owned_consumers: Mutex::new(Vec::new()),
                dtls_listeners: Listeners::new(),
            });
            self.state
                .transports
                .lock()
                .unwrap()
                .insert(transport.id.clone(), Arc::clone(&transport));
            Ok(transport)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub struct MockTransport {
        state: Arc<EngineState>,
        id: String,
        pub closed: AtomicBool,
        owned_producers: Mutex<Vec<Arc<MockProducer>>>,
        owned_consumers: Mutex<Vec<Arc<MockConsumer>>>,
        dtls_listeners: Listeners<DtlsState>,
    }

    impl MockTransport {
        pub fn fire_dtls_state(&self, dtls_state: DtlsState) {
            self.dtls_listeners.emit(&dtls_state);
        }
    }

    #[async_trait]
    impl MediaTransport for MockTransport {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn ice_parameters(&self) -> Value {
            json!({ "usernameFragment": self.id, "password": "mock" })
        }

        fn ice_candidates(&self) -> Value {
            json!([{ "ip": "127.0.0.1", "port": 40000 }])
        }

        fn dtls_parameters(&self) -> Value {
            json!({ "role": "auto", "fingerprints": [] })
        }

        async fn connect(&self, _dtls_parameters: Value) -> Result<(), MediaError> {
            self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn restart_ice(&self) -> Result<Value, MediaError> {
            Ok(json!({ "usernameFragment": self.id, "password": "mock-restarted" }))
        }

        async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> Result<(), MediaError> {
            Ok(())
        }

        async fn produce(
            &self,
            kind: MediaKind,
            _rtp_parameters: Value,
            app_data: Value,
        ) -> Result<Arc<dyn MediaProducer>, MediaError> {
            self.state.produce_calls.fetch_add(1, Ordering::SeqCst);
            let producer = Arc::new(MockProducer {
                state: Arc::clone(&self.state),
                id: self.state.next_id("producer"),
                kind,
                app_data,
                closed: AtomicBool::new(false),
            });
            self.state
                .producers
                .lock()
                .unwrap()
                .insert(producer.id.clone(), Arc::clone(&producer));
            self.owned_producers.lock().unwrap().push(Arc::clone(&producer));
            Ok(producer)
        }

        async fn consume(
            &self,
            options: ConsumeOptions,
        ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
            self.state.consume_calls.fetch_add(1, Ordering::SeqCst);
            let producer = self
                .state
                .producers
                .lock()
                .unwrap()
                .get(&options.producer_id)
                .cloned()
                .ok_or_else(|| MediaError::new("producer not found"))?;
            let consumer = Arc::new(MockConsumer {
                id: self.state.next_id("consumer"),
                kind: producer.kind,
                producer_id: producer.id.clone(),
                app_data: producer.app_data.clone(),
                paused: AtomicBool::new(options.paused),
                closed: AtomicBool::new(false),
                listeners: Listeners::new(),
            });
            self.state
                .links
                .lock()
                .unwrap()
                .entry(options.producer_id.clone())
                .or_default()
                .push(Arc::clone(&consumer));
            self.state
                .consumers
                .lock()
                .unwrap()
                .insert(consumer.id.clone(), Arc::clone(&consumer));
            self.owned_consumers.lock().unwrap().push(Arc::clone(&consumer));
            Ok(consumer)
        }

        fn on_dtls_state_change(&self, listener: Box<dyn Fn(DtlsState) + Send + Sync>) {
            self.dtls_listeners.add(move |s| listener(*s));
        }

        fn close(&self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            // This transport's consumers observe the transport close, not
            // the producer cascade that follows.
            for consumer in self.owned_consumers.lock().unwrap().drain(..) {
                if !consumer.closed.swap(true, Ordering::SeqCst) {
                    consumer.listeners.emit(&ConsumerEvent::TransportClose);
                }
            }
            for producer in self.owned_producers.lock().unwrap().drain(..) {
                producer.close();
            }
        }
    }

    pub struct MockProducer {
        state: Arc<EngineState>,
        id: String,
        kind: MediaKind,
        app_data: Value,
        closed: AtomicBool,
    }

    impl MockProducer {
        fn emit_to_consumers(&self, event: ConsumerEvent) {
            let consumers = self
                .state
                .links
                .lock()
                .unwrap()
                .get(&self.id)
                .cloned()
                .unwrap_or_default();
            for consumer in consumers {
                if consumer.closed.load(Ordering::SeqCst) {
                    continue;
                }
                if matches!(event, ConsumerEvent::ProducerClose) {
                    consumer.closed.store(true, Ordering::SeqCst);
                }
                consumer.listeners.emit(&event);
            }
        }
    }

    #[async_trait]
    impl MediaProducer for MockProducer {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn kind(&self) -> MediaKind {
            self.kind
        }

        async fn pause(&self) -> Result<(), MediaError> {
            self.emit_to_consumers(ConsumerEvent::ProducerPause);
            Ok(())
        }

        async fn resume(&self) -> Result<(), MediaError> {
            self.emit_to_consumers(ConsumerEvent::ProducerResume);
            Ok(())
        }

        fn close(&self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.emit_to_consumers(ConsumerEvent::ProducerClose);
            self.state.producers.lock().unwrap().remove(&self.id);
            self.state.links.lock().unwrap().remove(&self.id);
        }
    }

    pub struct MockConsumer {
        id: String,
        kind: MediaKind,
        pub producer_id: String,
        app_data: Value,
        pub paused: AtomicBool,
        pub closed: AtomicBool,
        listeners: Listeners<ConsumerEvent>,
    }

    impl MockConsumer {
        pub fn fire_layers_change(&self, layers: Option<ConsumerLayers>) {
            self.listeners.emit(&ConsumerEvent::LayersChange(layers));
        }
    }

    #[async_trait]
    impl MediaConsumer for MockConsumer {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn kind(&self) -> MediaKind {
            self.kind
        }

        fn rtp_parameters(&self) -> Value {
            json!({ "codecs": [], "encodings": [] })
        }

        fn consumer_type(&self) -> String {
            "simple".to_string()
        }

        fn producer_paused(&self) -> bool {
            false
        }

        fn app_data(&self) -> Value {
            self.app_data.clone()
        }

        async fn pause(&self) -> Result<(), MediaError> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self) -> Result<(), MediaError> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn set_preferred_layers(
            &self,
            _layers: ConsumerLayers,
        ) -> Result<(), MediaError> {
            Ok(())
        }

        async fn set_priority(&self, _priority: u8) -> Result<(), MediaError> {
            Ok(())
        }

        async fn request_key_frame(&self) -> Result<(), MediaError> {
            Ok(())
        }

        fn on_event(&self, listener: Box<dyn Fn(ConsumerEvent) + Send + Sync>) {
            self.listeners.add(move |e| listener(e.clone()));
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
