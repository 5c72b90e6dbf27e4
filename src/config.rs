use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::protocol::DEFAULT_SENDER_ID;

/// Service type browsed for cast devices
pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Port of the device's HTTP setup endpoint used to probe known hosts
pub const SETUP_HTTP_PORT: u16 = 8008;

/// Settings for one device connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on TCP connect and TLS handshake, each
    pub connect_timeout: Duration,

    /// How long `request` waits for the correlated response
    pub request_timeout: Duration,

    /// Interval between outbound PINGs
    pub heartbeat_interval: Duration,

    /// The connection fails if no frame arrives within this window
    pub heartbeat_timeout: Duration,

    /// Time `disconnect` gives the writer to flush queued frames
    pub disconnect_grace: Duration,

    /// Source id stamped on outbound frames
    pub sender_id: String,

    /// Largest accepted frame body
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(2),
            sender_id: DEFAULT_SENDER_ID.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }
}

/// Settings passed to `Discovery::start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Only keep devices with one of these friendly names (all if `None`)
    pub friendly_names: Option<BTreeSet<String>>,

    /// Hosts probed directly, for devices that miss multicast announcements
    pub known_hosts: Vec<IpAddr>,

    /// Delay between probes of the same known host
    pub probe_interval: Duration,

    /// Bound on a single probe
    pub probe_timeout: Duration,

    /// HTTP port used for probing
    pub probe_port: u16,

    /// DNS-SD service type to browse
    pub service_type: String,

    /// Time `stop` waits for background tasks before aborting them
    pub shutdown_grace: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            friendly_names: None,
            known_hosts: Vec::new(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            probe_port: SETUP_HTTP_PORT,
            service_type: CAST_SERVICE_TYPE.to_string(),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_friendly_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.friendly_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_known_hosts(mut self, hosts: impl IntoIterator<Item = IpAddr>) -> Self {
        self.known_hosts = hosts.into_iter().collect();
        self
    }

    /// Whether a friendly name passes the filter
    pub fn accepts(&self, friendly_name: &str) -> bool {
        self.friendly_names
            .as_ref()
            .map_or(true, |names| names.contains(friendly_name))
    }
}
