// Inbound request dispatch for one request of one peer.
//
// Every handler runs in its own task and ends in exactly one Response: a
// returned `Ok(Some(data))` becomes the success Response, an `Err` becomes
// the error Response with the error's display string as reason, and
// `Ok(None)` means the handler already answered mid-flow (join and produce
// respond before their fan-out so the client never waits on other peers).
//
// Lookups only ever search the calling peer's own handle maps. A foreign
// transportId/producerId/consumerId is indistinguishable from an unknown
// one: "not found".

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::conference::Conference;
use crate::error::SignalError;
use crate::media::{ConsumerLayers, DtlsState, MediaKind};
use crate::message::{NotificationMethod, Request};
use crate::peer::{Peer, Responder, TransportRole};

// ─── Request payloads ───────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWebRtcTransportRequest {
    #[serde(default)]
    force_tcp: bool,
    #[serde(default)]
    producing: bool,
    #[serde(default)]
    consuming: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectWebRtcTransportRequest {
    transport_id: String,
    dtls_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartIceRequest {
    transport_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    device: Value,
    rtp_capabilities: Value,
    #[serde(default)]
    sctp_capabilities: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceRequest {
    transport_id: String,
    kind: String,
    rtp_parameters: Value,
    #[serde(default)]
    app_data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerRequest {
    producer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerRequest {
    consumer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetConsumerPreferredLayersRequest {
    consumer_id: String,
    spatial_layer: u8,
    #[serde(default)]
    temporal_layer: Option<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetConsumerPriorityRequest {
    consumer_id: String,
    priority: u8,
}

// ─── Handler ────────────────────────────────────────────────────────────────

pub struct PeerRequestHandler {
    conference: Arc<Conference>,
    peer: Arc<Peer>,
    request: Request,
    responder: Responder,
}

impl PeerRequestHandler {
    pub fn new(
        conference: Arc<Conference>,
        peer: Arc<Peer>,
        request: Request,
        responder: Responder,
    ) -> Self {
        Self {
            conference,
            peer,
            request,
            responder,
        }
    }

    pub async fn handle(self) {
        match self.dispatch().await {
            Ok(Some(data)) => self.responder.accept(data),
            // Already answered mid-flow.
            Ok(None) => {}
            Err(e) => {
                debug!(
                    peer = %self.peer.id(),
                    method = %self.request.method,
                    code = e.code(),
                    "request rejected: {e}"
                );
                self.responder.reject(&e.to_string());
            }
        }
    }

    async fn dispatch(&self) -> Result<Option<Value>, SignalError> {
        if self.peer.is_closed() {
            return Err(SignalError::PeerClosed);
        }

        match self.request.method.as_str() {
            "getRouterRtpCapabilities" => self.get_router_rtp_capabilities(),
            "createWebRtcTransport" => self.create_webrtc_transport().await,
            "connectWebRtcTransport" => self.connect_webrtc_transport().await,
            "restartIce" => self.restart_ice().await,
            "join" => self.join().await,
            "produce" => self.produce().await,
            "closeProducer" => self.close_producer(),
            "pauseProducer" => self.pause_producer().await,
            "resumeProducer" => self.resume_producer().await,
            "pauseConsumer" => self.pause_consumer().await,
            "resumeConsumer" => self.resume_consumer().await,
            "setConsumerPreferredLayers" => self.set_consumer_preferred_layers().await,
            "setConsumerPriority" => self.set_consumer_priority().await,
            "requestConsumerKeyFrame" => self.request_consumer_key_frame().await,
            other => Err(SignalError::UnsupportedMethod(other.to_string())),
        }
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, SignalError> {
        serde_json::from_value(self.request.data.clone())
            .map_err(|e| SignalError::BadRequest(e.to_string()))
    }

    fn require_joined(&self) -> Result<(), SignalError> {
        if self.peer.is_joined() {
            Ok(())
        } else {
            Err(SignalError::NotJoined)
        }
    }

    // ── Pre-join surface ────────────────────────────────────────────────

    fn get_router_rtp_capabilities(&self) -> Result<Option<Value>, SignalError> {
        Ok(Some(self.conference.router().rtp_capabilities()))
    }

    async fn create_webrtc_transport(&self) -> Result<Option<Value>, SignalError> {
        let req: CreateWebRtcTransportRequest = self.payload()?;
        let role = match (req.producing, req.consuming) {
            (true, false) => TransportRole::Producing,
            (false, true) => TransportRole::Consuming,
            _ => {
                return Err(SignalError::BadRequest(
                    "exactly one of producing/consuming must be set".into(),
                ))
            }
        };

        let config = self.conference.config();
        let transport = self
            .conference
            .router()
            .create_webrtc_transport(config.transport_options(req.force_tcp))
            .await?;

        if self.peer.is_closed() {
            transport.close();
            return Err(SignalError::PeerClosed);
        }
        if let Err(e) = self.peer.add_transport(role, Arc::clone(&transport)) {
            transport.close();
            return Err(e);
        }

        // Capping inbound bandwidth is best effort.
        if config.max_incoming_bitrate > 0 {
            if let Err(e) = transport
                .set_max_incoming_bitrate(config.max_incoming_bitrate)
                .await
            {
                warn!(
                    transport = %transport.id(),
                    error = %e,
                    "set_max_incoming_bitrate failed"
                );
            }
        }

        {
            let transport_id = transport.id();
            transport.on_dtls_state_change(Box::new(move |state| {
                if matches!(state, DtlsState::Failed | DtlsState::Closed) {
                    warn!(transport = %transport_id, ?state, "dtls state degraded");
                }
            }));
        }

        Ok(Some(json!({
            "id": transport.id(),
            "iceParameters": transport.ice_parameters(),
            "iceCandidates": transport.ice_candidates(),
            "dtlsParameters": transport.dtls_parameters(),
        })))
    }

    async fn connect_webrtc_transport(&self) -> Result<Option<Value>, SignalError> {
        let req: ConnectWebRtcTransportRequest = self.payload()?;
        let transport =
            self.peer
                .transport(&req.transport_id)
                .ok_or(SignalError::NotFound {
                    kind: "transport",
                    id: req.transport_id.clone(),
                })?;
        transport.connect(req.dtls_parameters).await?;
        Ok(Some(json!({})))
    }

    async fn restart_ice(&self) -> Result<Option<Value>, SignalError> {
        let req: RestartIceRequest = self.payload()?;
        let transport =
            self.peer
                .transport(&req.transport_id)
                .ok_or(SignalError::NotFound {
                    kind: "transport",
                    id: req.transport_id.clone(),
                })?;
        let ice_parameters = transport.restart_ice().await?;
        Ok(Some(json!({ "iceParameters": ice_parameters })))
    }

    // ── Join ────────────────────────────────────────────────────────────

    /// Strict ordering: answer the joiner, attach it to every existing
    /// producer, then announce it. The joiner never receives its own
    /// `newPeer`.
    async fn join(&self) -> Result<Option<Value>, SignalError> {
        let req: JoinRequest = self.payload()?;
        self.peer.set_joined(
            req.display_name,
            req.device,
            req.rtp_capabilities,
            req.sctp_capabilities,
        )?;

        let others = self.conference.joined_peers(Some(self.peer.id()));
        let peers: Vec<Value> = others
            .iter()
            .map(|p| {
                json!({
                    "id": p.id(),
                    "displayName": p.display_name(),
                    "device": p.device(),
                })
            })
            .collect();
        self.responder.accept(json!({ "peers": peers }));

        for other in &others {
            for producer in other.producers() {
                self.conference
                    .create_consumer(&self.peer, other.id(), &producer)
                    .await;
            }
        }

        self.conference.broadcast(
            NotificationMethod::NewPeer,
            json!({
                "id": self.peer.id(),
                "displayName": self.peer.display_name(),
                "device": self.peer.device(),
            }),
            Some(self.peer.id()),
        );

        Ok(None)
    }

    // ── Producer surface ────────────────────────────────────────────────

    async fn produce(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: ProduceRequest = self.payload()?;

        // The room carries video only; audio never reaches the engine.
        let kind = match req.kind.as_str() {
            "video" => MediaKind::Video,
            other => return Err(SignalError::UnsupportedMediaKind(other.to_string())),
        };

        let transport =
            self.peer
                .transport(&req.transport_id)
                .ok_or(SignalError::NotFound {
                    kind: "transport",
                    id: req.transport_id.clone(),
                })?;

        let mut app_data = match req.app_data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        app_data.insert("peerId".into(), Value::String(self.peer.id().to_string()));

        let producer = transport
            .produce(kind, req.rtp_parameters, Value::Object(app_data))
            .await?;

        if self.peer.is_closed() {
            producer.close();
            return Err(SignalError::PeerClosed);
        }
        self.peer.add_producer(Arc::clone(&producer));
        self.responder.accept(json!({ "producerId": producer.id() }));

        for other in self.conference.joined_peers(Some(self.peer.id())) {
            self.conference
                .create_consumer(&other, self.peer.id(), &producer)
                .await;
        }

        Ok(None)
    }

    fn close_producer(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: ProducerRequest = self.payload()?;
        let producer = self
            .peer
            .producer(&req.producer_id)
            .ok_or(SignalError::NotFound {
                kind: "producer",
                id: req.producer_id.clone(),
            })?;
        producer.close();
        self.peer.remove_producer(&req.producer_id);
        Ok(Some(json!({})))
    }

    async fn pause_producer(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: ProducerRequest = self.payload()?;
        let producer = self
            .peer
            .producer(&req.producer_id)
            .ok_or(SignalError::NotFound {
                kind: "producer",
                id: req.producer_id.clone(),
            })?;
        producer.pause().await?;
        Ok(Some(json!({})))
    }

    async fn resume_producer(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: ProducerRequest = self.payload()?;
        let producer = self
            .peer
            .producer(&req.producer_id)
            .ok_or(SignalError::NotFound {
                kind: "producer",
                id: req.producer_id.clone(),
            })?;
        producer.resume().await?;
        Ok(Some(json!({})))
    }

    // ── Consumer surface ────────────────────────────────────────────────

    async fn pause_consumer(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: ConsumerRequest = self.payload()?;
        let consumer = self.lookup_consumer(&req.consumer_id)?;
        consumer.pause().await?;
        Ok(Some(json!({})))
    }

    async fn resume_consumer(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: ConsumerRequest = self.payload()?;
        let consumer = self.lookup_consumer(&req.consumer_id)?;
        consumer.resume().await?;
        Ok(Some(json!({})))
    }

    async fn set_consumer_preferred_layers(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: SetConsumerPreferredLayersRequest = self.payload()?;
        let consumer = self.lookup_consumer(&req.consumer_id)?;
        consumer
            .set_preferred_layers(ConsumerLayers {
                spatial_layer: req.spatial_layer,
                temporal_layer: req.temporal_layer,
            })
            .await?;
        Ok(Some(json!({})))
    }

    async fn set_consumer_priority(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: SetConsumerPriorityRequest = self.payload()?;
        let consumer = self.lookup_consumer(&req.consumer_id)?;
        consumer.set_priority(req.priority).await?;
        Ok(Some(json!({})))
    }

    async fn request_consumer_key_frame(&self) -> Result<Option<Value>, SignalError> {
        self.require_joined()?;
        let req: ConsumerRequest = self.payload()?;
        let consumer = self.lookup_consumer(&req.consumer_id)?;
        consumer.request_key_frame().await?;
        Ok(Some(json!({})))
    }

    fn lookup_consumer(
        &self,
        id: &str,
    ) -> Result<Arc<dyn crate::media::MediaConsumer>, SignalError> {
        self.peer.consumer(id).ok_or(SignalError::NotFound {
            kind: "consumer",
            id: id.to_string(),
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
