use std::net::IpAddr;

use thiserror::Error;

/// Result type for cast operations
pub type Result<T> = std::result::Result<T, CastError>;

/// Errors that can occur when discovering or talking to cast devices
#[derive(Error, Debug)]
pub enum CastError {
    /// No device with the requested friendly name appeared before the deadline
    #[error("No device named \"{name}\" was discovered")]
    DeviceNotFound {
        /// Friendly name that was waited for
        name: String,
    },

    /// The device was found but the transport could not be established
    #[error("Device at {host}:{port} is unreachable: {reason}")]
    ConnectionFailed {
        /// Device address
        host: IpAddr,
        /// Device port
        port: u16,
        /// What went wrong
        reason: String,
    },

    /// Connection was closed by the device or failed after being established
    #[error("Connection closed")]
    ConnectionClosed,

    /// The operation was cancelled by `stop()` or `disconnect()`
    #[error("Operation cancelled")]
    Cancelled,

    /// Request timed out waiting for response
    #[error("Request timeout")]
    Timeout,

    /// The device rejected a media load request
    #[error("Load failed for queue item {queue_item_id} with code {error_code}")]
    LoadFailed {
        /// Queue item the load was for
        queue_item_id: i64,
        /// Device-reported detailed error code
        error_code: i64,
    },

    /// The device answered a request with an error message type
    #[error("Request failed: {reason}")]
    RequestFailed {
        /// Message type or reason reported by the device
        reason: String,
    },

    /// Media command issued while no media application is running
    #[error("No active media session")]
    NoMediaSession,

    /// Malformed frame on the wire
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame length prefix exceeds the configured maximum
    #[error("Frame of {0} bytes exceeds maximum size")]
    FrameTooLarge(usize),

    /// Invalid or unexpected response payload
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// mDNS daemon error
    #[error("mDNS error: {0}")]
    Mdns(String),

    /// Channel communication error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// HTTP error while probing a known host
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CastError {
    /// True when the device was never discovered
    pub fn is_not_found(&self) -> bool {
        matches!(self, CastError::DeviceNotFound { .. })
    }

    /// True when the device was discovered but could not be reached
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            CastError::ConnectionFailed { .. } | CastError::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_unreachable_are_distinct() {
        let missing = CastError::DeviceNotFound {
            name: "Kitchen".into(),
        };
        let unreachable = CastError::ConnectionFailed {
            host: "10.0.0.5".parse().unwrap(),
            port: 8009,
            reason: "connection refused".into(),
        };

        assert!(missing.is_not_found());
        assert!(!missing.is_unreachable());
        assert!(unreachable.is_unreachable());
        assert!(!unreachable.is_not_found());
        assert_eq!(
            unreachable.to_string(),
            "Device at 10.0.0.5:8009 is unreachable: connection refused"
        );
    }
}
