// Error taxonomy for the signaling layer.
//
// Frame-level problems (`ProtocolError`) never surface to the remote side:
// the offending frame is dropped and logged, the connection stays up.
// Request-level problems (`SignalError`) always become an error Response so
// the caller gets a terminal answer. `RequestError` is the outcome space of
// a server-initiated request (`Peer::request`): exactly one of its variants
// fires per request.

use std::fmt;

// ─── ProtocolError ──────────────────────────────────────────────────────────

/// A frame that could not be decoded into one of the three message shapes.
///
/// Never fatal: the transport logs it and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload is not valid JSON.
    InvalidJson(String),
    /// The payload decoded, but is not a JSON object (arrays included).
    NotAnObject,
    /// `method` is missing or not a string.
    InvalidMethod,
    /// `type` is missing or not a number.
    InvalidType,
    /// `id` is missing or not a string (Request / Response frames).
    InvalidId,
    /// `success` is missing or not a boolean (Response frames).
    InvalidSuccess,
    /// `type` is a number outside the known tag set.
    UnknownType(u64),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "invalid JSON: {e}"),
            Self::NotAnObject => write!(f, "message is not an object"),
            Self::InvalidMethod => write!(f, "missing/invalid method field"),
            Self::InvalidType => write!(f, "missing/invalid type field"),
            Self::InvalidId => write!(f, "missing/invalid id field"),
            Self::InvalidSuccess => write!(f, "missing/invalid success field"),
            Self::UnknownType(t) => write!(f, "unsupported message type {t}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ─── TransportError ─────────────────────────────────────────────────────────

/// Sending on a transport can only fail one way that the caller must see:
/// the transport is already closed. Underlying socket write failures are
/// logged inside the transport and never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

// ─── RequestError ───────────────────────────────────────────────────────────

/// Terminal outcomes of a server-initiated request that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The remote side answered with an error Response.
    Rejected(String),
    /// No Response arrived within the request timeout.
    Timeout,
    /// The sending peer was closed while the request was in flight.
    PeerClosed,
    /// The underlying transport was already closed when sending.
    TransportClosed,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "request rejected: {reason}"),
            Self::Timeout => write!(f, "request timeout"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::TransportClosed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for RequestError {}

// ─── RoomError ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// A peer with the same id is already registered in the room. The
    /// offered transport has been closed before this error is returned.
    DuplicatePeer { peer_id: String, room_id: String },
    /// The room already closed and admits no further peers. The offered
    /// transport has been closed before this error is returned.
    RoomClosed { room_id: String },
}

impl fmt::Display for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicatePeer { peer_id, room_id } => write!(
                f,
                "peer '{peer_id}' already exists in room '{room_id}'"
            ),
            Self::RoomClosed { room_id } => {
                write!(f, "room '{room_id}' is closed")
            }
        }
    }
}

impl std::error::Error for RoomError {}

// ─── MediaError ─────────────────────────────────────────────────────────────

/// A media-engine call failed. Carries the engine's own description; the
/// signaling layer does not interpret it beyond converting it into an error
/// Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaError {
    pub message: String,
}

impl MediaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media engine failure: {}", self.message)
    }
}

impl std::error::Error for MediaError {}

// ─── SignalError ────────────────────────────────────────────────────────────

/// Why an inbound client request was rejected. The `Display` string is what
/// goes on the wire as the error Response reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The request method is not part of the protocol.
    UnsupportedMethod(String),
    /// The method requires a joined peer.
    NotJoined,
    /// `join` was called twice.
    AlreadyJoined,
    /// An id was not present in the calling peer's own handle maps. This
    /// doubles as the authorization boundary: other peers' maps are never
    /// searched.
    NotFound { kind: &'static str, id: String },
    /// `produce` with a media kind the room does not carry.
    UnsupportedMediaKind(String),
    /// Malformed or inconsistent request payload.
    BadRequest(String),
    /// The calling peer was closed while its request was being handled.
    PeerClosed,
    /// A media-engine call failed mid-handler.
    Media(MediaError),
}

impl SignalError {
    /// Stable snake_case identifier, used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedMethod(_) => "unsupported_method",
            Self::NotJoined => "not_joined",
            Self::AlreadyJoined => "already_joined",
            Self::NotFound { .. } => "not_found",
            Self::UnsupportedMediaKind(_) => "unsupported_media_kind",
            Self::BadRequest(_) => "bad_request",
            Self::PeerClosed => "peer_closed",
            Self::Media(_) => "media_engine_failure",
        }
    }
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedMethod(m) => write!(f, "unsupported method '{m}'"),
            Self::NotJoined => write!(f, "peer not joined"),
            Self::AlreadyJoined => write!(f, "peer already joined"),
            Self::NotFound { kind, id } => write!(f, "{kind} '{id}' not found"),
            Self::UnsupportedMediaKind(k) => {
                write!(f, "unsupported media kind '{k}'")
            }
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Media(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SignalError {}

impl From<MediaError> for SignalError {
    fn from(e: MediaError) -> Self {
        Self::Media(e)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
