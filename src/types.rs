use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::protocol::NS_MEDIA;

/// Default Cast control port
pub const DEFAULT_CAST_PORT: u16 = 8009;

/// A discovered, addressable cast device
///
/// Records are immutable. A newer advertisement for the same `uuid`
/// replaces the record instead of mutating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub friendly_name: String,
    pub host: IpAddr,
    pub port: u16,
    pub uuid: Uuid,

    /// Model advertised by the device (e.g. "Chromecast Audio")
    #[serde(default)]
    pub model_name: Option<String>,
}

impl DeviceRecord {
    /// Create a record without model information
    pub fn new(friendly_name: impl Into<String>, host: IpAddr, port: u16, uuid: Uuid) -> Self {
        Self {
            friendly_name: friendly_name.into(),
            host,
            port,
            uuid,
            model_name: None,
        }
    }

    /// Set the model name
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    /// Socket address of the device's control channel
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.friendly_name, self.host, self.port)
    }
}

/// Lifecycle of a connection to one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal; reached on transport error or remote close
    Failed,
}

impl ConnectionState {
    /// Whether the connection can still carry traffic
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Observer category a registration belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    DeviceStatus,
    MediaStatus,
    LoadFailed,
    Connection,
}

/// Device volume
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    /// Level in `0.0..=1.0`
    pub level: f64,
    pub muted: bool,
}

/// Namespace supported by a running application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppNamespace {
    pub name: String,
}

/// Application running on the receiver
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Application {
    pub app_id: String,
    pub display_name: String,
    pub session_id: String,
    pub transport_id: String,
    pub status_text: String,
    pub namespaces: Vec<AppNamespace>,
    pub is_idle_screen: bool,
}

impl Application {
    /// Whether the application speaks the given namespace
    pub fn supports(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|ns| ns.name == namespace)
    }
}

/// Device status snapshot (receiver namespace)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CastStatus {
    pub is_active_input: Option<bool>,
    pub is_stand_by: Option<bool>,
    pub volume: Volume,
    pub applications: Vec<Application>,
}

impl CastStatus {
    /// The foreground application, if any
    pub fn app(&self) -> Option<&Application> {
        self.applications.first()
    }

    /// The first running application that accepts media commands
    pub fn media_app(&self) -> Option<&Application> {
        self.applications.iter().find(|app| app.supports(NS_MEDIA))
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app().map(|app| app.app_id.as_str())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.app().map(|app| app.display_name.as_str())
    }

    pub fn status_text(&self) -> Option<&str> {
        self.app().map(|app| app.status_text.as_str())
    }
}

/// Media player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Idle,
    Buffering,
    Playing,
    Paused,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Media stream description
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaInformation {
    pub content_id: String,
    pub content_type: String,
    pub stream_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MediaInformation {
    /// Buffered stream description for a URL
    pub fn new(content_id: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: content_type.into(),
            stream_type: "BUFFERED".to_string(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.metadata = Some(serde_json::json!({ "metadataType": 0, "title": title.into() }));
        self
    }

    /// Title from the generic metadata block
    pub fn title(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("title")?.as_str()
    }
}

/// Entry of the media queue
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueItem {
    pub item_id: i64,
    pub media: Option<MediaInformation>,
    pub autoplay: Option<bool>,
}

/// Media status snapshot (media namespace)
///
/// A default value means no active media session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaStatus {
    pub media_session_id: Option<i64>,
    pub player_state: PlayerState,
    pub idle_reason: Option<String>,
    pub current_time: f64,
    pub playback_rate: f64,
    pub volume: Option<Volume>,
    pub media: Option<MediaInformation>,
    pub current_item_id: Option<i64>,
    pub loading_item_id: Option<i64>,
    pub preloaded_item_id: Option<i64>,
    pub items: Vec<QueueItem>,
    pub supported_media_commands: u64,
    pub repeat_mode: Option<String>,
}

impl MediaStatus {
    pub fn title(&self) -> Option<&str> {
        self.media.as_ref()?.title()
    }

    pub fn content_id(&self) -> Option<&str> {
        self.media.as_ref().map(|media| media.content_id.as_str())
    }

    pub fn duration(&self) -> Option<f64> {
        self.media.as_ref()?.duration
    }

    pub fn is_active(&self) -> bool {
        self.media_session_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cast_status_from_receiver_payload() {
        let status: CastStatus = serde_json::from_value(json!({
            "applications": [{
                "appId": "CC1AD845",
                "displayName": "Default Media Receiver",
                "namespaces": [{"name": "urn:x-cast:com.google.cast.media"}],
                "sessionId": "abc",
                "statusText": "Ready To Cast",
                "transportId": "web-5"
            }],
            "isActiveInput": true,
            "volume": {"controlType": "attenuation", "level": 0.25, "muted": false, "stepInterval": 0.05}
        }))
        .unwrap();

        assert_eq!(status.app_id(), Some("CC1AD845"));
        assert_eq!(status.volume.level, 0.25);
        assert_eq!(status.is_active_input, Some(true));
        assert_eq!(status.media_app().unwrap().transport_id, "web-5");
    }

    #[test]
    fn media_status_tolerates_unknown_player_state() {
        let status: MediaStatus = serde_json::from_value(json!({
            "mediaSessionId": 3,
            "playerState": "SOMETHING_NEW",
            "currentItemId": 12,
            "media": {"contentId": "http://x/a.mp3", "duration": 31.5, "metadata": {"title": "Song"}}
        }))
        .unwrap();

        assert_eq!(status.player_state, PlayerState::Unknown);
        assert_eq!(status.current_item_id, Some(12));
        assert_eq!(status.title(), Some("Song"));
        assert_eq!(status.duration(), Some(31.5));
        assert!(status.is_active());
    }
}
