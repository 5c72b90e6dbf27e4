use crate::config::DiscoveryConfig;
use crate::error::{CastError, Result};
use crate::feed::{FeedEvent, MdnsFeed};
use crate::probe::{EurekaProber, HostProber};
use crate::types::DeviceRecord;
use futures_util::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Change to the set of discovered devices
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryUpdate {
    Added(DeviceRecord),
    /// A newer advertisement replaced the record for the same uuid
    Updated(DeviceRecord),
    Removed(DeviceRecord),
}

impl DiscoveryUpdate {
    pub fn device(&self) -> &DeviceRecord {
        match self {
            Self::Added(device) | Self::Updated(device) | Self::Removed(device) => device,
        }
    }
}

struct Entry {
    record: DeviceRecord,
    /// Arrival order, used to prefer the most recent record on name lookups
    seen: u64,
}

/// Live device set shared with the background tasks
struct Registry {
    config: DiscoveryConfig,
    devices: Mutex<BTreeMap<Uuid, Entry>>,
    next_seen: AtomicU64,
    changes: watch::Sender<u64>,
    update_tx: broadcast::Sender<DiscoveryUpdate>,
}

impl Registry {
    fn new(config: DiscoveryConfig) -> Self {
        let (update_tx, _) = broadcast::channel(100);
        Self {
            config,
            devices: Mutex::new(BTreeMap::new()),
            next_seen: AtomicU64::new(0),
            changes: watch::Sender::new(0),
            update_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Uuid, Entry>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&self, record: DeviceRecord) {
        if !self.config.accepts(&record.friendly_name) {
            tracing::trace!("Ignoring {} (not in friendly-name filter)", record);
            return;
        }

        let seen = self.next_seen.fetch_add(1, Ordering::Relaxed);

        let update = {
            let mut devices = self.lock();
            match devices.get_mut(&record.uuid) {
                Some(entry) if entry.record == record => {
                    entry.seen = seen;
                    None
                }
                Some(entry) => {
                    tracing::info!("Device {} is now {}", record.uuid, record);
                    entry.record = record.clone();
                    entry.seen = seen;
                    Some(DiscoveryUpdate::Updated(record))
                }
                None => {
                    tracing::info!("Discovered {}", record);
                    devices.insert(
                        record.uuid,
                        Entry {
                            record: record.clone(),
                            seen,
                        },
                    );
                    Some(DiscoveryUpdate::Added(record))
                }
            }
        };

        if let Some(update) = update {
            self.notify(update);
        }
    }

    /// Remove a record, optionally only while it still points at `host`
    fn remove(&self, uuid: Uuid, host: Option<IpAddr>) {
        let removed = {
            let mut devices = self.lock();
            match devices.get(&uuid) {
                Some(entry) if host.map_or(true, |host| entry.record.host == host) => {
                    devices.remove(&uuid).map(|entry| entry.record)
                }
                _ => None,
            }
        };

        if let Some(record) = removed {
            tracing::info!("Lost {}", record);
            self.notify(DiscoveryUpdate::Removed(record));
        }
    }

    fn clear(&self) {
        let removed: Vec<DeviceRecord> = std::mem::take(&mut *self.lock())
            .into_values()
            .map(|entry| entry.record)
            .collect();
        for record in removed {
            self.notify(DiscoveryUpdate::Removed(record));
        }
    }

    fn notify(&self, update: DiscoveryUpdate) {
        self.changes.send_modify(|version| *version += 1);
        // No subscribers is fine
        let _ = self.update_tx.send(update);
    }
}

/// Registry of cast devices on the local network
///
/// Consumes a discovery feed (mDNS by default) and periodically probes
/// known hosts in the background until stopped or dropped.
///
/// # Example
///
/// ```no_run
/// use castlink::{Discovery, DiscoveryConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let discovery = Discovery::start_mdns(DiscoveryConfig::default())?;
///
///     let device = discovery
///         .wait_for("Living Room Speaker", Some(Duration::from_secs(10)))
///         .await?;
///     println!("Found {} at {}", device.friendly_name, device.socket_addr());
///
///     discovery.stop().await;
///     Ok(())
/// }
/// ```
pub struct Discovery {
    registry: Arc<Registry>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl Discovery {
    /// Start consuming `feed` and probing the configured known hosts
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(config: DiscoveryConfig, feed: F, prober: Arc<dyn HostProber>) -> Self
    where
        F: Stream<Item = FeedEvent> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let shutdown_grace = config.shutdown_grace;
        let known_hosts = config.known_hosts.clone();
        let (probe_interval, probe_timeout) = (config.probe_interval, config.probe_timeout);
        let registry = Arc::new(Registry::new(config));

        let mut tasks = vec![tokio::spawn(consume_feed(
            feed,
            registry.clone(),
            cancel.clone(),
        ))];
        for host in known_hosts {
            tasks.push(tokio::spawn(probe_host(
                host,
                prober.clone(),
                registry.clone(),
                cancel.clone(),
                probe_interval,
                probe_timeout,
            )));
        }

        tracing::info!("Discovery started");
        Self {
            registry,
            cancel,
            tasks: Mutex::new(tasks),
            shutdown_grace,
        }
    }

    /// Start with the mDNS feed and the HTTP known-host prober
    pub fn start_mdns(config: DiscoveryConfig) -> Result<Self> {
        let feed = MdnsFeed::browse(&config.service_type)?;
        let prober = EurekaProber::new(config.probe_port, config.probe_timeout)?;
        Ok(Self::start(config, feed, Arc::new(prober)))
    }

    /// Subscribe to device additions, updates and removals
    pub fn subscribe_updates(&self) -> broadcast::Receiver<DiscoveryUpdate> {
        self.registry.update_tx.subscribe()
    }

    /// Get a snapshot of currently known devices
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry
            .lock()
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn device(&self, uuid: &Uuid) -> Option<DeviceRecord> {
        self.registry.lock().get(uuid).map(|entry| entry.record.clone())
    }

    /// Most recently advertised device with exactly this friendly name
    pub fn device_by_name(&self, name: &str) -> Option<DeviceRecord> {
        self.registry
            .lock()
            .values()
            .filter(|entry| entry.record.friendly_name == name)
            .max_by_key(|entry| entry.seen)
            .map(|entry| entry.record.clone())
    }

    pub fn devices_by_host(&self, host: IpAddr) -> Vec<DeviceRecord> {
        self.registry
            .lock()
            .values()
            .filter(|entry| entry.record.host == host)
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Wait until a device with this exact friendly name is known
    ///
    /// Returns `DeviceNotFound` once `limit` elapses (`None` waits without
    /// bound) and `Cancelled` if discovery is stopped first.
    pub async fn wait_for(&self, name: &str, limit: Option<Duration>) -> Result<DeviceRecord> {
        if !self.registry.config.accepts(name) {
            tracing::warn!("Waiting for \"{}\", which the friendly-name filter excludes", name);
        }

        // Subscribe before the first lookup so no change is missed
        let mut changes = self.registry.changes.subscribe();
        let search = async {
            loop {
                if self.cancel.is_cancelled() {
                    return Err(CastError::Cancelled);
                }
                if let Some(device) = self.device_by_name(name) {
                    return Ok(device);
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(CastError::Cancelled),
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return Err(CastError::Cancelled);
                        }
                    }
                }
            }
        };

        match limit {
            Some(limit) => timeout(limit, search).await.unwrap_or_else(|_| {
                Err(CastError::DeviceNotFound {
                    name: name.to_string(),
                })
            }),
            None => search.await,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the discovery process
    ///
    /// Cancels feed consumption and in-flight probes, waits up to the
    /// configured grace period for the background tasks, then clears the
    /// device list. Calling it again is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return;
        }

        let deadline = Instant::now() + self.shutdown_grace;
        for mut task in tasks {
            if timeout(deadline.saturating_duration_since(Instant::now()), &mut task)
                .await
                .is_err()
            {
                tracing::debug!("Discovery task did not stop in time, aborting");
                task.abort();
            }
        }

        self.registry.clear();
        tracing::info!("Discovery stopped");
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn consume_feed<F>(feed: F, registry: Arc<Registry>, cancel: CancellationToken)
where
    F: Stream<Item = FeedEvent> + Send + 'static,
{
    let mut feed = std::pin::pin!(feed);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = feed.next() => event,
        };

        match event {
            Some(FeedEvent::Resolved(record)) => registry.upsert(record),
            Some(FeedEvent::Removed(uuid)) => registry.remove(uuid, None),
            None => {
                tracing::debug!("Discovery feed ended");
                break;
            }
        }
    }
}

async fn probe_host(
    host: IpAddr,
    prober: Arc<dyn HostProber>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    interval: Duration,
    probe_timeout: Duration,
) {
    // Uuid of the record this task injected
    let mut injected: Option<Uuid> = None;
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = timeout(probe_timeout, prober.probe(host)) => outcome,
        };

        match outcome {
            Ok(Ok(Some(record))) => {
                if let Some(previous) = injected.filter(|uuid| *uuid != record.uuid) {
                    registry.remove(previous, Some(host));
                }
                injected = Some(record.uuid);
                registry.upsert(record);
            }
            outcome => {
                match outcome {
                    Ok(Ok(_)) => tracing::debug!("{} is not a cast device", host),
                    Ok(Err(e)) => tracing::debug!("Probe of {} failed: {}", host, e),
                    Err(_) => tracing::debug!("Probe of {} timed out", host),
                }
                if let Some(uuid) = injected.take() {
                    tracing::info!("Known host {} stopped responding", host);
                    registry.remove(uuid, Some(host));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn record(name: &str, uuid: u128, port: u16) -> DeviceRecord {
        DeviceRecord::new(name, "192.168.1.20".parse().unwrap(), port, Uuid::from_u128(uuid))
    }

    /// Prober answering for a single host while `online`
    struct FakeProber {
        device: DeviceRecord,
        online: AtomicBool,
    }

    #[async_trait]
    impl HostProber for FakeProber {
        async fn probe(&self, host: IpAddr) -> Result<Option<DeviceRecord>> {
            if host == self.device.host && self.online.load(Ordering::SeqCst) {
                Ok(Some(self.device.clone()))
            } else {
                Err(CastError::ConnectionFailed {
                    host,
                    port: 8008,
                    reason: "refused".to_string(),
                })
            }
        }
    }

    fn offline() -> Arc<dyn HostProber> {
        Arc::new(FakeProber {
            device: record("unused", 0, 8009),
            online: AtomicBool::new(false),
        })
    }

    fn start(config: DiscoveryConfig, prober: Arc<dyn HostProber>) -> (Discovery, mpsc::Sender<FeedEvent>) {
        let (tx, mut rx) = mpsc::channel(16);
        let feed = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        (Discovery::start(config, feed, prober), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sees_device_announced_later() {
        let (discovery, feed) = start(DiscoveryConfig::default(), offline());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            feed.send(FeedEvent::Resolved(record("LivingRoom", 1, 8009)))
                .await
                .unwrap();
        });

        let device = discovery
            .wait_for("LivingRoom", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(device.uuid, Uuid::from_u128(1));
        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out_with_not_found() {
        let (discovery, feed) = start(DiscoveryConfig::default(), offline());
        feed.send(FeedEvent::Resolved(record("Kitchen", 1, 8009)))
            .await
            .unwrap();

        let err = discovery
            .wait_for("livingroom", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_uuid_keeps_latest_record() {
        let (discovery, feed) = start(DiscoveryConfig::default(), offline());
        let mut updates = discovery.subscribe_updates();

        feed.send(FeedEvent::Resolved(record("LivingRoom", 1, 8009))).await.unwrap();
        feed.send(FeedEvent::Resolved(record("LivingRoom", 1, 8009))).await.unwrap();
        feed.send(FeedEvent::Resolved(record("LivingRoom", 1, 8010))).await.unwrap();

        assert!(matches!(updates.recv().await.unwrap(), DiscoveryUpdate::Added(_)));
        match updates.recv().await.unwrap() {
            DiscoveryUpdate::Updated(device) => assert_eq!(device.port, 8010),
            other => panic!("unexpected update {other:?}"),
        }

        assert_eq!(discovery.device_count(), 1);
        assert_eq!(discovery.device_by_name("LivingRoom").unwrap().port, 8010);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_and_filter() {
        let config = DiscoveryConfig::default().with_friendly_names(["LivingRoom"]);
        let (discovery, feed) = start(config, offline());
        let mut updates = discovery.subscribe_updates();

        feed.send(FeedEvent::Resolved(record("Kitchen", 2, 8009))).await.unwrap();
        feed.send(FeedEvent::Resolved(record("LivingRoom", 1, 8009))).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().device().friendly_name, "LivingRoom");
        assert_eq!(discovery.devices().len(), 1);

        feed.send(FeedEvent::Removed(Uuid::from_u128(1))).await.unwrap();
        assert!(matches!(updates.recv().await.unwrap(), DiscoveryUpdate::Removed(_)));
        assert!(discovery.device(&Uuid::from_u128(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_unblocks_waiters_and_clears() {
        let (discovery, feed) = start(DiscoveryConfig::default(), offline());
        let discovery = Arc::new(discovery);
        feed.send(FeedEvent::Resolved(record("Kitchen", 2, 8009))).await.unwrap();
        discovery.wait_for("Kitchen", None).await.unwrap();

        let waiter = {
            let discovery = discovery.clone();
            tokio::spawn(async move { discovery.wait_for("LivingRoom", None).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        discovery.stop().await;
        discovery.stop().await;

        assert!(matches!(waiter.await.unwrap(), Err(CastError::Cancelled)));
        assert!(discovery.devices().is_empty());
        assert!(discovery.is_stopped());
        assert!(matches!(
            discovery.wait_for("Kitchen", Some(Duration::from_secs(1))).await,
            Err(CastError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn known_host_is_injected_and_withdrawn() {
        let device = DeviceRecord::new(
            "Kitchen speaker",
            "10.0.0.7".parse().unwrap(),
            8009,
            Uuid::from_u128(7),
        );
        let prober = Arc::new(FakeProber {
            device: device.clone(),
            online: AtomicBool::new(true),
        });
        let config = DiscoveryConfig::default().with_known_hosts([device.host]);
        let (discovery, _feed) = start(config, prober.clone());
        let mut updates = discovery.subscribe_updates();

        let found = discovery
            .wait_for("Kitchen speaker", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(found, device);
        assert_eq!(discovery.devices_by_host(device.host), vec![device.clone()]);

        prober.online.store(false, Ordering::SeqCst);
        loop {
            if let DiscoveryUpdate::Removed(removed) = updates.recv().await.unwrap() {
                assert_eq!(removed, device);
                break;
            }
        }
        assert!(discovery.devices().is_empty());
    }
}
