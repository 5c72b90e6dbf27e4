use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{CastError, Result};

/// Virtual connection management
pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
/// Keepalive
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
/// Device status and application control
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
/// Media playback status and control
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

/// Destination id of the device's platform receiver
pub const PLATFORM_DESTINATION_ID: &str = "receiver-0";
/// Default sender id for this client
pub const DEFAULT_SENDER_ID: &str = "sender-0";

/// Application id of the default media receiver
pub const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";

/// Message type names
pub mod msg {
    pub const CONNECT: &str = "CONNECT";
    pub const CLOSE: &str = "CLOSE";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const GET_STATUS: &str = "GET_STATUS";
    pub const RECEIVER_STATUS: &str = "RECEIVER_STATUS";
    pub const MEDIA_STATUS: &str = "MEDIA_STATUS";
    pub const LAUNCH: &str = "LAUNCH";
    pub const LAUNCH_ERROR: &str = "LAUNCH_ERROR";
    pub const STOP: &str = "STOP";
    pub const SET_VOLUME: &str = "SET_VOLUME";
    pub const LOAD: &str = "LOAD";
    pub const LOAD_FAILED: &str = "LOAD_FAILED";
    pub const LOAD_CANCELLED: &str = "LOAD_CANCELLED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const INVALID_PLAYER_STATE: &str = "INVALID_PLAYER_STATE";
    pub const PLAY: &str = "PLAY";
    pub const PAUSE: &str = "PAUSE";
    pub const SEEK: &str = "SEEK";
}

/// Outbound message: a JSON payload addressed to a namespace and destination
#[derive(Debug, Clone)]
pub struct Request {
    pub namespace: String,
    pub destination_id: String,
    pub payload: Map<String, Value>,
}

impl Request {
    /// Create a new request with the given namespace, destination and message type
    pub fn new(
        namespace: impl Into<String>,
        destination_id: impl Into<String>,
        msg_type: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("type".to_string(), Value::String(msg_type.to_string()));
        Self {
            namespace: namespace.into(),
            destination_id: destination_id.into(),
            payload,
        }
    }

    /// Request addressed to the platform receiver
    pub fn platform(namespace: impl Into<String>, msg_type: &str) -> Self {
        Self::new(namespace, PLATFORM_DESTINATION_ID, msg_type)
    }

    /// Add a payload field
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Set the correlation id
    pub fn with_request_id(self, id: i64) -> Self {
        self.with_field("requestId", Value::from(id))
    }

    /// Get the correlation id, if one was set
    pub fn request_id(&self) -> Option<i64> {
        self.payload.get("requestId").and_then(Value::as_i64)
    }

    /// Get the message type
    pub fn msg_type(&self) -> &str {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Serialize the payload to its wire text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Inbound JSON payload
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(rename = "requestId", default)]
    pub request_id: Option<i64>,

    /// Remaining fields
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Response {
    /// Parse a text payload
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Get a data field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get an integer data field
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_i64)
    }

    /// Check if the message type signals a failed request
    pub fn is_error(&self) -> bool {
        matches!(
            self.msg_type.as_str(),
            msg::LAUNCH_ERROR
                | msg::LOAD_FAILED
                | msg::LOAD_CANCELLED
                | msg::INVALID_REQUEST
                | msg::INVALID_PLAYER_STATE
        )
    }

    /// Human readable failure reason, if any
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        match self.data.get("reason").and_then(Value::as_str) {
            Some(reason) => Some(format!("{}: {}", self.msg_type, reason)),
            None => Some(self.msg_type.clone()),
        }
    }

    /// Turn an error message type into `Err(RequestFailed)`
    pub fn into_result(self) -> Result<Self> {
        match self.error_message() {
            Some(reason) => Err(CastError::RequestFailed { reason }),
            None => Ok(self),
        }
    }
}
