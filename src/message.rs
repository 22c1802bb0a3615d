// Wire protocol codec.
//
// Every frame on the WebSocket is one JSON object in one of three shapes,
// discriminated by a numeric `type` tag:
//
//   Request      {"type":0, "method":"join", "id":"ab12..", "data":{..}}
//   Response     {"type":1, "method":"join", "id":"ab12..", "success":true, "data":{..}}
//                {"type":1, "method":"join", "id":"ab12..", "success":false, "error":".."}
//   Notification {"type":2, "method":"newPeer", "data":{..}}
//
// `parse` validates field by field and fails without panicking; the caller
// (the transport) logs the failure and drops the frame. Inbound methods are
// kept as raw strings so an unknown method still produces a Request frame
// that the orchestrator can reject with "unsupported method". Outbound
// constructors only accept the closed method enumerations.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::ProtocolError;

// ─── Message type tags ──────────────────────────────────────────────────────

pub const MSG_TYPE_REQUEST: u64 = 0;
pub const MSG_TYPE_RESPONSE: u64 = 1;
pub const MSG_TYPE_NOTIFICATION: u64 = 2;

/// Length of generated request ids. 12 alphanumeric characters give 62^12
/// combinations, plenty for the set of in-flight requests of one peer.
const REQUEST_ID_LEN: usize = 12;

// ─── Method enumerations ────────────────────────────────────────────────────

/// Methods that travel as Request frames and expect a Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMethod {
    GetRouterRtpCapabilities,
    CreateWebRtcTransport,
    ConnectWebRtcTransport,
    RestartIce,
    Join,
    Produce,
    CloseProducer,
    PauseProducer,
    ResumeProducer,
    PauseConsumer,
    ResumeConsumer,
    SetConsumerPreferredLayers,
    SetConsumerPriority,
    RequestConsumerKeyFrame,
    /// Server-initiated: installs a receive pipeline on the client.
    NewConsumer,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Self::CreateWebRtcTransport => "createWebRtcTransport",
            Self::ConnectWebRtcTransport => "connectWebRtcTransport",
            Self::RestartIce => "restartIce",
            Self::Join => "join",
            Self::Produce => "produce",
            Self::CloseProducer => "closeProducer",
            Self::PauseProducer => "pauseProducer",
            Self::ResumeProducer => "resumeProducer",
            Self::PauseConsumer => "pauseConsumer",
            Self::ResumeConsumer => "resumeConsumer",
            Self::SetConsumerPreferredLayers => "setConsumerPreferredLayers",
            Self::SetConsumerPriority => "setConsumerPriority",
            Self::RequestConsumerKeyFrame => "requestConsumerKeyFrame",
            Self::NewConsumer => "newConsumer",
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Methods that travel as Notification frames (fire-and-forget).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationMethod {
    PeerClosed,
    NewPeer,
    ConsumerClosed,
    ConsumerPaused,
    ConsumerResumed,
    ConsumerLayersChanged,
}

impl NotificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peerClosed",
            Self::NewPeer => "newPeer",
            Self::ConsumerClosed => "consumerClosed",
            Self::ConsumerPaused => "consumerPaused",
            Self::ConsumerResumed => "consumerResumed",
            Self::ConsumerLayersChanged => "consumerLayersChanged",
        }
    }
}

impl fmt::Display for NotificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Frame shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub method: String,
    pub success: bool,
    /// Present (possibly empty) on success.
    pub data: Value,
    /// Present on failure.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

// ─── Codec ──────────────────────────────────────────────────────────────────

impl Message {
    /// Decode and validate one raw frame.
    pub fn parse(raw: &str) -> Result<Message, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        let method = object
            .get("method")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::InvalidMethod)?
            .to_string();

        let msg_type = object
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::InvalidType)?;

        match msg_type {
            MSG_TYPE_REQUEST => {
                let id = object
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::InvalidId)?
                    .to_string();
                let data = data_or_empty(object.get("data"));
                Ok(Message::Request(Request { id, method, data }))
            }
            MSG_TYPE_RESPONSE => {
                let id = object
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::InvalidId)?
                    .to_string();
                let success = object
                    .get("success")
                    .and_then(Value::as_bool)
                    .ok_or(ProtocolError::InvalidSuccess)?;
                let data = if success {
                    data_or_empty(object.get("data"))
                } else {
                    json!({})
                };
                let error = object
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Message::Response(Response {
                    id,
                    method,
                    success,
                    data,
                    error,
                }))
            }
            MSG_TYPE_NOTIFICATION => {
                let data = data_or_empty(object.get("data"));
                Ok(Message::Notification(Notification { method, data }))
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    /// Build a fresh Request frame with a generated id.
    pub fn request(method: RequestMethod, data: Value) -> Request {
        Request {
            id: generate_request_id(),
            method: method.as_str().to_string(),
            data: data_or_empty(Some(&data)),
        }
    }

    /// Build the success Response for `request`.
    pub fn success_response(request: &Request, data: Value) -> Response {
        Response {
            id: request.id.clone(),
            method: request.method.clone(),
            success: true,
            data: data_or_empty(Some(&data)),
            error: None,
        }
    }

    /// Build the error Response for `request`.
    pub fn error_response(request: &Request, reason: &str) -> Response {
        Response {
            id: request.id.clone(),
            method: request.method.clone(),
            success: false,
            data: json!({}),
            error: Some(reason.to_string()),
        }
    }

    /// Build a Notification frame.
    pub fn notification(method: NotificationMethod, data: Value) -> Notification {
        Notification {
            method: method.as_str().to_string(),
            data: data_or_empty(Some(&data)),
        }
    }

    /// Serialize into the wire JSON object.
    pub fn to_json(&self) -> Value {
        match self {
            Message::Request(r) => json!({
                "type": MSG_TYPE_REQUEST,
                "method": r.method,
                "id": r.id,
                "data": r.data,
            }),
            Message::Response(r) => {
                if r.success {
                    json!({
                        "type": MSG_TYPE_RESPONSE,
                        "method": r.method,
                        "id": r.id,
                        "success": true,
                        "data": r.data,
                    })
                } else {
                    json!({
                        "type": MSG_TYPE_RESPONSE,
                        "method": r.method,
                        "id": r.id,
                        "success": false,
                        "error": r.error.clone().unwrap_or_default(),
                    })
                }
            }
            Message::Notification(n) => json!({
                "type": MSG_TYPE_NOTIFICATION,
                "method": n.method,
                "data": n.data,
            }),
        }
    }
}

/// Absent or null `data` defaults to an empty object.
fn data_or_empty(data: Option<&Value>) -> Value {
    match data {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(v) => v.clone(),
    }
}

/// Collision-resistant short id for request correlation.
fn generate_request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(char::from)
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
