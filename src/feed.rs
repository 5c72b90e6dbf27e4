//! mDNS browse adapter.
//!
//! Turns `mdns-sd` service events into [`FeedEvent`]s. The registry only
//! sees the [`FeedEvent`] stream, so tests and alternative sources can feed
//! it directly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CastError, Result};
use crate::types::DeviceRecord;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One observation from a discovery source
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A device advertised itself (possibly again)
    Resolved(DeviceRecord),
    /// A device withdrew its advertisement
    Removed(Uuid),
}

/// Live mDNS browse for cast devices
pub struct MdnsFeed {
    daemon: ServiceDaemon,
    service_type: String,
    events: mpsc::Receiver<FeedEvent>,
    cancel: CancellationToken,
}

impl MdnsFeed {
    /// Start browsing for `service_type` (for example `_googlecast._tcp.local.`)
    pub fn browse(service_type: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| CastError::Mdns(format!("failed to create mDNS daemon: {e}")))?;
        let receiver = match daemon.browse(service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(CastError::Mdns(format!("failed to browse {service_type}: {e}")));
            }
        };

        let (tx, events) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        tokio::spawn(pump(receiver, tx, cancel.clone()));
        tracing::info!("Browsing for {}", service_type);

        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            events,
            cancel,
        })
    }
}

impl Stream for MdnsFeed {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedEvent>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for MdnsFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            tracing::debug!("Failed to stop mDNS browse cleanly: {}", e);
        }
        let _ = self.daemon.shutdown();
    }
}

/// Forward daemon events until cancelled or the consumer goes away
async fn pump(
    receiver: mdns_sd::Receiver<ServiceEvent>,
    tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
) {
    // Removal events only carry the instance name
    let mut instances: HashMap<String, Uuid> = HashMap::new();

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = tokio::task::spawn_blocking({
                let receiver = receiver.clone();
                move || receiver.recv_timeout(POLL_INTERVAL)
            }) => polled,
        };

        let event = match polled {
            Ok(Ok(event)) => event,
            // recv timeout; poll again
            Ok(Err(_)) if !receiver.is_disconnected() => continue,
            Ok(Err(_)) => {
                tracing::debug!("mDNS daemon channel closed");
                break;
            }
            Err(e) => {
                tracing::warn!("mDNS poll task failed: {}", e);
                break;
            }
        };

        let feed_event = match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(record) = record_from_service(&info) else {
                    continue;
                };
                instances.insert(info.get_fullname().to_string(), record.uuid);
                tracing::debug!("Resolved {} as {}", info.get_fullname(), record);
                FeedEvent::Resolved(record)
            }
            ServiceEvent::ServiceRemoved(_, fullname) => match instances.remove(&fullname) {
                Some(uuid) => {
                    tracing::debug!("{} withdrew its advertisement", fullname);
                    FeedEvent::Removed(uuid)
                }
                None => continue,
            },
            other => {
                tracing::trace!("Ignoring mDNS event {:?}", other);
                continue;
            }
        };

        if tx.send(feed_event).await.is_err() {
            break;
        }
    }
}

/// Build a record from a resolved advertisement.
///
/// Returns `None` for advertisements without a usable address or device id.
pub(crate) fn record_from_service(info: &ServiceInfo) -> Option<DeviceRecord> {
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    // Prefer IPv4, then lowest address, so repeated resolutions pick the same host
    addresses.sort_by_key(|ip| (!ip.is_ipv4(), *ip));
    let Some(host) = addresses.first().copied() else {
        tracing::debug!("{} resolved without addresses", info.get_fullname());
        return None;
    };

    let txt = |key: &str| {
        info.get_property_val_str(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let uuid = match txt("id").map(Uuid::parse_str) {
        Some(Ok(uuid)) => uuid,
        Some(Err(e)) => {
            tracing::warn!("{} advertised an invalid id: {}", info.get_fullname(), e);
            return None;
        }
        None => {
            tracing::warn!("{} advertised no id", info.get_fullname());
            return None;
        }
    };

    let friendly_name = txt("fn")
        .map(ToString::to_string)
        .unwrap_or_else(|| instance_name(info.get_fullname()));

    let mut record = DeviceRecord::new(friendly_name, host, info.get_port(), uuid);
    if let Some(model) = txt("md") {
        record = record.with_model_name(model);
    }
    Some(record)
}

/// Instance label of a full service name
fn instance_name(fullname: &str) -> String {
    fullname
        .split_once("._")
        .map_or(fullname, |(instance, _)| instance)
        .trim_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "_googlecast._tcp.local.";

    fn service(ip: &str, properties: &[(&str, &str)]) -> ServiceInfo {
        let properties: HashMap<String, String> = properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceInfo::new(
            SERVICE,
            "Chromecast-Audio-5d2a",
            "5d2a.local.",
            ip,
            8009,
            properties,
        )
        .unwrap()
    }

    #[test]
    fn record_uses_txt_fields() {
        let info = service(
            "192.168.1.20",
            &[
                ("id", "5d2a8e0b3c1f4e7a9b6d2c4e8f0a1b3c"),
                ("fn", "LivingRoom"),
                ("md", "Chromecast Audio"),
            ],
        );

        let record = record_from_service(&info).unwrap();
        assert_eq!(record.friendly_name, "LivingRoom");
        assert_eq!(record.host, "192.168.1.20".parse::<IpAddr>().unwrap());
        assert_eq!(record.port, 8009);
        assert_eq!(
            record.uuid,
            Uuid::parse_str("5d2a8e0b-3c1f-4e7a-9b6d-2c4e8f0a1b3c").unwrap()
        );
        assert_eq!(record.model_name.as_deref(), Some("Chromecast Audio"));
    }

    #[test]
    fn missing_friendly_name_falls_back_to_instance() {
        let info = service("192.168.1.20", &[("id", "5d2a8e0b3c1f4e7a9b6d2c4e8f0a1b3c")]);
        let record = record_from_service(&info).unwrap();
        assert_eq!(record.friendly_name, "Chromecast-Audio-5d2a");
        assert!(record.model_name.is_none());
    }

    #[test]
    fn advertisement_without_valid_id_is_skipped() {
        assert!(record_from_service(&service("192.168.1.20", &[("fn", "Kitchen")])).is_none());
        assert!(record_from_service(&service(
            "192.168.1.20",
            &[("fn", "Kitchen"), ("id", "not-a-uuid")]
        ))
        .is_none());
    }

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(instance_name("Kitchen-abc._googlecast._tcp.local."), "Kitchen-abc");
        assert_eq!(instance_name("bare"), "bare");
    }
}
