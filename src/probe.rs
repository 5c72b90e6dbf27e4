//! Direct probing of known hosts.
//!
//! Some networks drop multicast, so devices listed in
//! [`DiscoveryConfig::known_hosts`](crate::DiscoveryConfig) are asked for
//! their identity over the setup HTTP endpoint instead.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{DeviceRecord, DEFAULT_CAST_PORT};

/// Source of device records for a single address
#[async_trait]
pub trait HostProber: Send + Sync {
    /// Identify the device at `host`.
    ///
    /// `Ok(None)` means something answered but it is not a usable cast
    /// device; an error means nothing answered.
    async fn probe(&self, host: IpAddr) -> Result<Option<DeviceRecord>>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EurekaInfo {
    name: Option<String>,
    device_info: EurekaDeviceInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EurekaDeviceInfo {
    model_name: Option<String>,
    ssdp_udn: Option<String>,
}

/// Prober using the device's `/setup/eureka_info` endpoint
pub struct EurekaProber {
    client: reqwest::Client,
    port: u16,
}

impl EurekaProber {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, port })
    }
}

#[async_trait]
impl HostProber for EurekaProber {
    async fn probe(&self, host: IpAddr) -> Result<Option<DeviceRecord>> {
        let authority = match host {
            IpAddr::V4(ip) => format!("{ip}:{}", self.port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.port),
        };
        let url = format!("http://{authority}/setup/eureka_info?params=name,device_info");
        tracing::trace!("Probing {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!("{} answered probe with {}", host, status);
            return Ok(None);
        }

        let body = response.text().await?;
        Ok(parse_eureka_info(host, &body))
    }
}

/// Build a record from an `eureka_info` body; the cast port is assumed
fn parse_eureka_info(host: IpAddr, body: &str) -> Option<DeviceRecord> {
    let info: EurekaInfo = match serde_json::from_str(body) {
        Ok(info) => info,
        Err(e) => {
            tracing::debug!("Unparseable probe response from {}: {}", host, e);
            return None;
        }
    };

    let name = info.name.filter(|name| !name.is_empty())?;
    let uuid = info
        .device_info
        .ssdp_udn
        .as_deref()
        .map(Uuid::parse_str)
        .and_then(|parsed| {
            parsed
                .map_err(|e| tracing::debug!("Bad udn from {}: {}", host, e))
                .ok()
        })?;

    let mut record = DeviceRecord::new(name, host, DEFAULT_CAST_PORT, uuid);
    if let Some(model) = info.device_info.model_name {
        record = record.with_model_name(model);
    }
    Some(record)
}
