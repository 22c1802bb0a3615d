// One live conference: a room of peers plus the media router that carries
// their streams. The conference owns the downward close cascade
// (conference -> room -> peer -> transport) and the consumer fan-out that
// connects every joined peer to every other peer's producers.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::MediaError;
use crate::events::Listeners;
use crate::handler::PeerRequestHandler;
use crate::media::{ConsumeOptions, ConsumerEvent, MediaProducer, MediaRouter, MediaWorker};
use crate::message::{NotificationMethod, RequestMethod};
use crate::peer::{Peer, PeerEvent};
use crate::room::Room;
use crate::transport::SignalTransport;

pub struct Conference {
    id: String,
    closed: AtomicBool,
    room: Arc<Room>,
    router: Arc<dyn MediaRouter>,
    config: Arc<Config>,
    close_listeners: Listeners<()>,
}

impl Conference {
    /// Create a conference for `room_id`, with its router provisioned on
    /// `worker`.
    pub async fn create(
        room_id: &str,
        worker: Arc<dyn MediaWorker>,
        config: Arc<Config>,
    ) -> Result<Arc<Self>, MediaError> {
        let router = worker.create_router(config.media_codecs()).await?;
        let room = Room::new(room_id);

        let conference = Arc::new(Self {
            id: room_id.to_string(),
            closed: AtomicBool::new(false),
            room: Arc::clone(&room),
            router,
            config,
            close_listeners: Listeners::new(),
        });

        // A room that closes on its own takes the conference with it.
        let weak = Arc::downgrade(&conference);
        room.on_close(move || {
            if let Some(conference) = weak.upgrade() {
                conference.close();
            }
        });

        info!(room = %room_id, "conference created");
        Ok(conference)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.router
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.room.peer_count()
    }

    /// Observe conference close. Fires exactly once.
    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.close_listeners.add(move |_| listener());
    }

    /// Admit a connection as `peer_id`. A still-registered peer with the
    /// same id is a stale session (reconnect); it is closed and the new
    /// connection wins.
    pub fn handle_new_peer(self: &Arc<Self>, peer_id: &str, transport: Arc<dyn SignalTransport>) {
        if self.is_closed() {
            transport.close();
            return;
        }

        if let Some(stale) = self.room.peer(peer_id) {
            warn!(room = %self.id, peer = %peer_id, "closing stale session for reconnect");
            stale.close();
        }

        let (peer, events) = match self.room.add_peer(
            peer_id,
            Arc::clone(&transport),
            self.config.request_timeout(),
        ) {
            Ok(added) => added,
            Err(e) => {
                // Reachable when the deferred empty-room close wins the
                // race against a reconnect and closes the room first.
                warn!(room = %self.id, error = %e, "peer admission failed");
                transport.close();
                return;
            }
        };

        // Runs after the room's own deregistration listener, so the empty
        // check below already excludes the closing peer.
        {
            let weak_conference = Arc::downgrade(self);
            let weak_peer = Arc::downgrade(&peer);
            peer.on_close(move || {
                let Some(conference) = weak_conference.upgrade() else {
                    return;
                };
                if let Some(peer) = weak_peer.upgrade() {
                    if peer.is_joined() {
                        conference.broadcast(
                            NotificationMethod::PeerClosed,
                            json!({ "peerId": peer.id() }),
                            Some(peer.id()),
                        );
                    }
                    peer.close_media();
                }
                // Deferred, so a reconnect that just closed this stale
                // session gets to admit its replacement before the empty
                // check runs.
                if !conference.is_closed() && conference.room.peer_count() == 0 {
                    tokio::spawn(async move {
                        if !conference.is_closed() && conference.room.peer_count() == 0 {
                            info!(room = %conference.id, "last peer left, closing conference");
                            conference.close();
                        }
                    });
                }
            });
        }

        tokio::spawn(conference_peer_loop(
            Arc::downgrade(self),
            Arc::clone(&peer),
            events,
        ));
    }

    /// Notify every joined peer, except `exclude`.
    pub fn broadcast(
        &self,
        method: NotificationMethod,
        data: serde_json::Value,
        exclude: Option<&str>,
    ) {
        for peer in self.room.peers() {
            if !peer.is_joined() {
                continue;
            }
            if exclude.is_some_and(|id| id == peer.id()) {
                continue;
            }
            peer.notify(method, data.clone());
        }
    }

    /// Joined peers other than `exclude`.
    pub fn joined_peers(&self, exclude: Option<&str>) -> Vec<Arc<Peer>> {
        self.room
            .peers()
            .into_iter()
            .filter(|p| p.is_joined() && exclude.map_or(true, |id| id != p.id()))
            .collect()
    }

    /// Attach `consumer_peer` to one producer of `producer_peer`.
    ///
    /// Skips silently when the peer cannot receive it (no capabilities,
    /// router says no, or no consuming transport yet): that is a normal
    /// state, not an error. The consumer starts paused and is resumed only
    /// after the client acknowledges the `newConsumer` request.
    pub async fn create_consumer(
        self: &Arc<Self>,
        consumer_peer: &Arc<Peer>,
        producer_peer_id: &str,
        producer: &Arc<dyn MediaProducer>,
    ) {
        let Some(rtp_capabilities) = consumer_peer.rtp_capabilities() else {
            return;
        };
        if !self.router.can_consume(&producer.id(), &rtp_capabilities) {
            debug!(
                peer = %consumer_peer.id(),
                producer = %producer.id(),
                "peer cannot consume producer, skipping"
            );
            return;
        }
        let Some(transport) = consumer_peer.consuming_transport() else {
            debug!(peer = %consumer_peer.id(), "no consuming transport yet, skipping");
            return;
        };

        let consumer = match transport
            .consume(ConsumeOptions {
                producer_id: producer.id(),
                rtp_capabilities,
                paused: true,
                enable_rtx: true,
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(
                    peer = %consumer_peer.id(),
                    producer = %producer.id(),
                    error = %e,
                    "transport.consume failed"
                );
                return;
            }
        };

        consumer_peer.add_consumer(Arc::clone(&consumer));

        // Engine-side lifecycle flows back to the consuming client.
        {
            let weak_peer = Arc::downgrade(consumer_peer);
            let consumer_id = consumer.id();
            let producer_peer_id = producer_peer_id.to_string();
            consumer.on_event(Box::new(move |event| {
                let Some(peer) = weak_peer.upgrade() else { return };
                if peer.is_closed() {
                    return;
                }
                match event {
                    ConsumerEvent::TransportClose | ConsumerEvent::ProducerClose => {
                        peer.remove_consumer(&consumer_id);
                        peer.notify(
                            NotificationMethod::ConsumerClosed,
                            json!({
                                "consumerId": consumer_id,
                                "peerId": producer_peer_id,
                            }),
                        );
                    }
                    ConsumerEvent::ProducerPause => {
                        peer.notify(
                            NotificationMethod::ConsumerPaused,
                            json!({ "consumerId": consumer_id }),
                        );
                    }
                    ConsumerEvent::ProducerResume => {
                        peer.notify(
                            NotificationMethod::ConsumerResumed,
                            json!({ "consumerId": consumer_id }),
                        );
                    }
                    ConsumerEvent::LayersChange(layers) => {
                        peer.notify(
                            NotificationMethod::ConsumerLayersChanged,
                            json!({
                                "consumerId": consumer_id,
                                "spatialLayer": layers.map(|l| l.spatial_layer),
                                "temporalLayer": layers.and_then(|l| l.temporal_layer),
                            }),
                        );
                    }
                }
            }));
        }

        // Round trip: the client must install its receive pipeline before
        // the stream starts flowing.
        let outcome = consumer_peer
            .request(
                RequestMethod::NewConsumer,
                json!({
                    "peerId": producer_peer_id,
                    "producerId": producer.id(),
                    "id": consumer.id(),
                    "kind": consumer.kind(),
                    "rtpParameters": consumer.rtp_parameters(),
                    "type": consumer.consumer_type(),
                    "appData": consumer.app_data(),
                    "producerPaused": consumer.producer_paused(),
                }),
            )
            .await;

        match outcome {
            Ok(_) => {
                if consumer_peer.is_closed() {
                    return;
                }
                if let Err(e) = consumer.resume().await {
                    warn!(consumer = %consumer.id(), error = %e, "consumer resume failed");
                }
            }
            Err(e) => {
                warn!(
                    peer = %consumer_peer.id(),
                    consumer = %consumer.id(),
                    error = %e,
                    "newConsumer request failed, dropping consumer"
                );
                consumer_peer.remove_consumer(&consumer.id());
                consumer.close();
            }
        }
    }

    /// Close the conference: notify observers, close the router, close the
    /// room. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(room = %self.id, "conference closed");
        self.close_listeners.emit(&());
        self.router.close();
        self.room.close();
    }
}

/// Per-peer event pump. Each request gets its own task so one slow media
/// call cannot block the peer's other requests.
async fn conference_peer_loop(
    conference: Weak<Conference>,
    peer: Arc<Peer>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Request(request, responder) => {
                let Some(conference) = conference.upgrade() else {
                    break;
                };
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    PeerRequestHandler::new(conference, peer, request, responder)
                        .handle()
                        .await;
                });
            }
            PeerEvent::Notification(notification) => {
                debug!(
                    peer = %peer.id(),
                    method = %notification.method,
                    "ignoring client notification"
                );
            }
            PeerEvent::Close => break,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockWorker;
    use crate::testutil::TestClient;
    use crate::testutil::settle;
    use crate::transport::memory::MemoryTransport;

    async fn make_conference() -> (Arc<Conference>, Arc<MockWorker>) {
        let worker = MockWorker::new();
        let conference = Conference::create(
            "room1",
            Arc::clone(&worker) as Arc<dyn MediaWorker>,
            Arc::new(Config::default()),
        )
        .await
        .unwrap();
        (conference, worker)
    }

    #[tokio::test]
    async fn join_returns_existing_peers_and_notifies_them() {
        let (conference, _worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        let joined = alice.join("Alice").await.unwrap();
        assert_eq!(joined["peers"], serde_json::json!([]));

        let mut bob = TestClient::connect(&conference, "bob", true).await;
        let joined = bob.join("Bob").await.unwrap();
        let peers = joined["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["id"], "alice");
        assert_eq!(peers[0]["displayName"], "Alice");

        // Alice hears about Bob, and the payload excludes Bob's own entry
        // from anything Bob received.
        let n = alice.next_notification().await;
        assert_eq!(n.method, "newPeer");
        assert_eq!(n.data["id"], "bob");
        assert_eq!(n.data["displayName"], "Bob");
    }

    #[tokio::test]
    async fn stale_session_is_replaced_by_reconnect() {
        let (conference, _worker) = make_conference().await;

        let (first_server, first_client) = MemoryTransport::pair();
        conference.handle_new_peer("alice", first_server);
        assert_eq!(conference.peer_count(), 1);

        let (second_server, second_client) = MemoryTransport::pair();
        conference.handle_new_peer("alice", second_server);
        settle().await;

        assert!(first_client.is_closed());
        assert!(!second_client.is_closed());
        assert_eq!(conference.peer_count(), 1);
        assert!(!conference.is_closed());
    }

    #[tokio::test]
    async fn producer_fans_out_exactly_one_consumer_per_receiver() {
        let (conference, worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        alice.create_transports().await;

        let mut bob = TestClient::connect(&conference, "bob", true).await;
        bob.join("Bob").await.unwrap();
        bob.create_transports().await;

        let producer_id = alice.produce().await.unwrap();

        // Bob gets exactly one newConsumer for Alice's producer.
        let request = bob.next_request().await;
        assert_eq!(request.method, "newConsumer");
        assert_eq!(request.data["peerId"], "alice");
        assert_eq!(request.data["producerId"], producer_id);
        assert_eq!(request.data["producerPaused"], false);

        // One engine consume call total: alice does not consume herself.
        assert_eq!(
            worker
                .state
                .consume_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn incompatible_capabilities_skip_consumer_silently() {
        let (conference, worker) = make_conference().await;
        worker
            .state
            .can_consume
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        alice.create_transports().await;

        let mut bob = TestClient::connect(&conference, "bob", true).await;
        bob.join("Bob").await.unwrap();
        bob.create_transports().await;

        alice.produce().await.unwrap();
        settle().await;

        assert_eq!(
            worker
                .state
                .consume_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert!(bob.no_pending_requests());
    }

    #[tokio::test]
    async fn rejected_new_consumer_is_dropped() {
        let (conference, _worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        alice.create_transports().await;

        // Bob rejects every server-initiated request.
        let mut bob = TestClient::connect(&conference, "bob", false).await;
        bob.join("Bob").await.unwrap();
        bob.create_transports().await;

        alice.produce().await.unwrap();

        let request = bob.next_request().await;
        assert_eq!(request.method, "newConsumer");

        // The consumer was removed from bob's server-side peer.
        let consumer_id = request.data["id"].as_str().unwrap();
        let bob_peer = conference.room().peer("bob").unwrap();
        settle().await;
        assert!(bob_peer.consumer(consumer_id).is_none());
    }

    #[tokio::test]
    async fn last_joined_peer_leaving_collapses_the_conference() {
        let (conference, _worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        let mut bob = TestClient::connect(&conference, "bob", true).await;
        bob.join("Bob").await.unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        {
            let closed = Arc::clone(&closed);
            conference.on_close(move || closed.store(true, Ordering::SeqCst));
        }

        // Skip the newPeer notification from bob's join.
        let n = alice.next_notification().await;
        assert_eq!(n.method, "newPeer");

        conference.room().peer("bob").unwrap().close();
        let n = alice.next_notification().await;
        assert_eq!(n.method, "peerClosed");
        assert_eq!(n.data["peerId"], "bob");
        assert!(!conference.is_closed());

        conference.room().peer("alice").unwrap().close();
        settle().await;
        assert!(conference.is_closed());
        assert!(closed.load(Ordering::SeqCst));

        // Closing again is a no-op.
        conference.close();
    }

    #[tokio::test]
    async fn producer_pause_and_close_reach_consumers() {
        let (conference, _worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        alice.create_transports().await;

        let mut bob = TestClient::connect(&conference, "bob", true).await;
        bob.join("Bob").await.unwrap();
        bob.create_transports().await;

        let producer_id = alice.produce().await.unwrap();
        let request = bob.next_request().await;
        let consumer_id = request.data["id"].as_str().unwrap().to_string();

        alice
            .request(
                RequestMethod::PauseProducer,
                serde_json::json!({ "producerId": producer_id }),
            )
            .await
            .unwrap();
        let n = bob.next_notification().await;
        assert_eq!(n.method, "consumerPaused");
        assert_eq!(n.data["consumerId"], consumer_id.as_str());

        alice
            .request(
                RequestMethod::CloseProducer,
                serde_json::json!({ "producerId": producer_id }),
            )
            .await
            .unwrap();
        let n = bob.next_notification().await;
        assert_eq!(n.method, "consumerClosed");
        assert_eq!(n.data["consumerId"], consumer_id.as_str());
        assert_eq!(n.data["peerId"], "alice");
    }

    #[tokio::test]
    async fn layers_changes_reach_the_consuming_client() {
        let (conference, worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        alice.create_transports().await;

        let mut bob = TestClient::connect(&conference, "bob", true).await;
        bob.join("Bob").await.unwrap();
        bob.create_transports().await;

        alice.produce().await.unwrap();
        let request = bob.next_request().await;
        let consumer_id = request.data["id"].as_str().unwrap().to_string();
        settle().await;

        // The owning peer can drive its consumer.
        bob.request(
            RequestMethod::PauseConsumer,
            serde_json::json!({ "consumerId": consumer_id }),
        )
        .await
        .unwrap();
        bob.request(
            RequestMethod::SetConsumerPreferredLayers,
            serde_json::json!({ "consumerId": consumer_id, "spatialLayer": 1 }),
        )
        .await
        .unwrap();

        let consumer = worker.state.consumer(&consumer_id).unwrap();
        consumer.fire_layers_change(Some(crate::media::ConsumerLayers {
            spatial_layer: 2,
            temporal_layer: Some(1),
        }));

        let n = bob.next_notification().await;
        assert_eq!(n.method, "consumerLayersChanged");
        assert_eq!(n.data["consumerId"], consumer_id.as_str());
        assert_eq!(n.data["spatialLayer"], 2);
        assert_eq!(n.data["temporalLayer"], 1);
    }

    #[tokio::test]
    async fn closing_conference_closes_router_room_and_peers() {
        let (conference, _worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        let alice_peer = conference.room().peer("alice").unwrap();

        conference.close();

        assert!(conference.is_closed());
        assert!(conference.room().is_closed());
        assert!(alice_peer.is_closed());
    }

    #[tokio::test]
    async fn admission_after_close_closes_the_transport() {
        let (conference, _worker) = make_conference().await;
        conference.close();

        let (server_end, client_end) = MemoryTransport::pair();
        conference.handle_new_peer("late", server_end);
        assert!(client_end.is_closed());
        assert_eq!(conference.peer_count(), 0);
    }

    #[tokio::test]
    async fn joiner_never_sees_its_own_new_peer() {
        let (conference, _worker) = make_conference().await;

        let mut alice = TestClient::connect(&conference, "alice", true).await;
        alice.join("Alice").await.unwrap();
        settle().await;
        assert!(alice.no_pending_notifications());
    }
}
