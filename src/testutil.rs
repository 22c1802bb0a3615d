// Test harness: a protocol client living on the far end of an in-memory
// transport pair. It reuses `Peer` for its own request correlation, so the
// wire format is exercised in both directions.

use serde_json::{json, Value};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::conference::Conference;
use crate::error::RequestError;
use crate::message::{Notification, Request, RequestMethod};
use crate::peer::{Peer, PeerEvent};
use crate::transport::memory::MemoryTransport;

static TRACING: Once = Once::new();

/// Install a `RUST_LOG`-driven subscriber once, so a failing test can be
/// rerun with the crate's logs visible.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Let every ready task run to completion. Cheap under the single-threaded
/// test runtime.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub(crate) struct TestClient {
    peer: Arc<Peer>,
    requests: mpsc::UnboundedReceiver<Request>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    producing_transport_id: Option<String>,
}

impl TestClient {
    /// Connect to `conference` as `peer_id`. Server-initiated requests are
    /// auto-answered: accepted when `accept_requests`, rejected otherwise.
    /// Either way they are recorded and observable via `next_request`.
    pub async fn connect(
        conference: &Arc<Conference>,
        peer_id: &str,
        accept_requests: bool,
    ) -> Self {
        init_tracing();
        let (server_end, client_end) = MemoryTransport::pair();
        conference.handle_new_peer(peer_id, server_end);

        let (peer, mut events) = Peer::new(
            format!("client-{peer_id}"),
            client_end,
            Duration::from_secs(10),
        );

        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (notifications_tx, notifications) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::Request(request, responder) => {
                        if accept_requests {
                            responder.accept(json!({}));
                        } else {
                            responder.reject("refused by test client");
                        }
                        let _ = requests_tx.send(request);
                    }
                    PeerEvent::Notification(notification) => {
                        let _ = notifications_tx.send(notification);
                    }
                    PeerEvent::Close => break,
                }
            }
        });

        settle().await;
        Self {
            peer,
            requests,
            notifications,
            producing_transport_id: None,
        }
    }

    pub async fn request(
        &self,
        method: RequestMethod,
        data: Value,
    ) -> Result<Value, RequestError> {
        self.peer.request(method, data).await
    }

    pub async fn join(&self, display_name: &str) -> Result<Value, RequestError> {
        self.request(
            RequestMethod::Join,
            json!({
                "displayName": display_name,
                "device": { "name": "test" },
                "rtpCapabilities": { "codecs": [] },
            }),
        )
        .await
    }

    /// Create one producing and one consuming transport.
    pub async fn create_transports(&mut self) {
        let created = self
            .request(
                RequestMethod::CreateWebRtcTransport,
                json!({ "producing": true }),
            )
            .await
            .unwrap();
        self.producing_transport_id =
            Some(created["id"].as_str().unwrap().to_string());

        self.request(
            RequestMethod::CreateWebRtcTransport,
            json!({ "consuming": true }),
        )
        .await
        .unwrap();
    }

    /// Produce a video stream on the producing transport, returning the
    /// producer id. The call resolves on the Response; any fan-out runs
    /// afterwards, so callers observe it via `next_request`.
    pub async fn produce(&self) -> Result<String, RequestError> {
        let transport_id = self
            .producing_transport_id
            .clone()
            .unwrap_or_else(|| "missing".to_string());
        let produced = self
            .request(
                RequestMethod::Produce,
                json!({
                    "transportId": transport_id,
                    "kind": "video",
                    "rtpParameters": { "codecs": [] },
                }),
            )
            .await?;
        Ok(produced["producerId"].as_str().unwrap_or_default().to_string())
    }

    /// Next server-initiated request (already auto-answered).
    pub async fn next_request(&mut self) -> Request {
        self.requests.recv().await.expect("client event loop ended")
    }

    pub async fn next_notification(&mut self) -> Notification {
        self.notifications
            .recv()
            .await
            .expect("client event loop ended")
    }

    pub fn no_pending_requests(&mut self) -> bool {
        self.requests.try_recv().is_err()
    }

    pub fn no_pending_notifications(&mut self) -> bool {
        self.notifications.try_recv().is_err()
    }
}
