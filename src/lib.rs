//! SignalCast — WebSocket signaling for multi-party video conferencing.
//!
//! The crate speaks a small JSON RPC protocol over one WebSocket per peer
//! (requests with correlation ids, fire-and-forget notifications) and
//! orchestrates rooms of peers against an external media engine that does
//! the actual packet work. The engine is injected behind the traits in
//! [`media`]; the embedding bootstrap provisions workers, builds a
//! [`ConferenceManager`] and serves [`server::router`].

pub mod conference;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod manager;
pub mod media;
pub mod message;
pub mod peer;
pub mod room;
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use conference::Conference;
pub use config::Config;
pub use error::{MediaError, ProtocolError, RequestError, RoomError, SignalError, TransportError};
pub use manager::{ConferenceManager, WorkerPool};
pub use message::{Message, Notification, Request, RequestMethod, Response, NotificationMethod};
pub use peer::{Peer, PeerEvent, Responder, TransportRole};
pub use room::Room;
pub use transport::{SignalTransport, TransportEvent, WebSocketTransport};
