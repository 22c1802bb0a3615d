// Peer registry for one room. Purely a membership structure: media wiring
// and broadcast policy live in `Conference`. A peer that closes, for any
// reason, deregisters itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RoomError;
use crate::events::Listeners;
use crate::peer::{Peer, PeerEvent};
use crate::transport::SignalTransport;

pub struct Room {
    id: String,
    closed: AtomicBool,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    close_listeners: Listeners<()>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            closed: AtomicBool::new(false),
            peers: Mutex::new(HashMap::new()),
            close_listeners: Listeners::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Build a peer over `transport` and register it. A closed room admits
    /// nobody; if a peer with the same id already exists the existing peer
    /// is left untouched. On either error the offered transport is closed.
    pub fn add_peer(
        self: &Arc<Self>,
        peer_id: &str,
        transport: Arc<dyn SignalTransport>,
        request_timeout: Duration,
    ) -> Result<(Arc<Peer>, mpsc::UnboundedReceiver<PeerEvent>), RoomError> {
        if self.is_closed() {
            transport.close();
            return Err(RoomError::RoomClosed {
                room_id: self.id.clone(),
            });
        }

        {
            let peers = self.peers.lock().unwrap();
            if peers.contains_key(peer_id) {
                drop(peers);
                transport.close();
                return Err(RoomError::DuplicatePeer {
                    peer_id: peer_id.to_string(),
                    room_id: self.id.clone(),
                });
            }
        }

        let (peer, events) = Peer::new(peer_id, transport, request_timeout);
        self.peers
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), Arc::clone(&peer));

        // Deregistration must run before any other close listener, so
        // observers that fire later see the membership already updated.
        let weak = Arc::downgrade(self);
        let peer_id = peer_id.to_string();
        peer.on_close(move || {
            if let Some(room) = weak.upgrade() {
                room.remove_peer(&peer_id);
            }
        });

        Ok((peer, events))
    }

    pub fn remove_peer(&self, id: &str) -> bool {
        self.peers.lock().unwrap().remove(id).is_some()
    }

    pub fn has_peer(&self, id: &str) -> bool {
        self.peers.lock().unwrap().contains_key(id)
    }

    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Observe room close. Fires exactly once.
    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.close_listeners.add(move |_| listener());
    }

    /// Close every peer, then the room itself. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(room = %self.id, "room closed");

        // Snapshot outside the lock: each close re-enters remove_peer.
        let peers = self.peers();
        for peer in peers {
            peer.close();
        }

        self.close_listeners.emit(&());
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
