use crate::config::ConnectionConfig;
use crate::connection::{Connection, NamespaceHandler, OutboundQueue, Outbox, Routes};
use crate::dispatcher::Registration;
use crate::error::Result;
use crate::listener::{CastStatusListener, ConnectionListener};
use crate::media::{MediaController, MediaSession};
use crate::receiver::{ReceiverController, ReceiverState};
use crate::subscription::{EventForwarder, EventReceiver};
use crate::types::{CastStatus, Category, ConnectionState, DeviceRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Session with one cast device
///
/// Owns the connection and the per-category dispatchers. Cloning is cheap and
/// every clone refers to the same session.
///
/// # Example
///
/// ```no_run
/// use castlink::{CastStatus, Chromecast, ConnectionConfig, DeviceRecord};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = DeviceRecord::new(
///         "Living Room Speaker",
///         "192.168.1.20".parse()?,
///         8009,
///         "5d2a8e0b-3c1f-4e7a-9b6d-2c4e8f0a1b3c".parse()?,
///     );
///
///     let cast = Chromecast::connect(device, ConnectionConfig::default()).await?;
///     cast.wait(Some(Duration::from_secs(10))).await?;
///     println!("Volume: {:?}", cast.status().map(|s| s.volume.level));
///
///     cast.register_status_listener(Arc::new(|status: &CastStatus| {
///         println!("Now running: {:?}", status.display_name());
///     }));
///
///     cast.disconnect().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Chromecast {
    device: DeviceRecord,
    connection: Connection,
    receiver: ReceiverController,
    media: MediaController,
    events: Arc<EventForwarder>,
}

/// Controllers and routes assembled before the transport is up
struct Session {
    outbox: Outbox,
    receiver: ReceiverController,
    media: MediaController,
    events: Arc<EventForwarder>,
}

impl Session {
    fn new(config: &ConnectionConfig) -> (Self, OutboundQueue, Routes) {
        let (outbox, queue) = Outbox::new(config);
        let receiver_state = Arc::new(ReceiverState::new());
        let media_session = Arc::new(MediaSession::new(outbox.clone()));

        // The media session must see device status before any caller does
        receiver_state.register(media_session.clone());

        let receiver = ReceiverController::new(outbox.clone(), receiver_state.clone());
        let media = MediaController::new(outbox.clone(), media_session.clone());

        let events = Arc::new(EventForwarder::new(EVENT_CAPACITY));
        receiver.register_status_listener(events.clone());
        media.register_status_listener(events.clone());
        media.register_load_failed_listener(events.clone());

        let handlers: Vec<Arc<dyn NamespaceHandler>> = vec![receiver_state, media_session];
        let listeners: Vec<Arc<dyn ConnectionListener>> = vec![events.clone()];
        let routes = Routes {
            handlers,
            listeners,
        };
        let session = Self {
            outbox,
            receiver,
            media,
            events,
        };
        (session, queue, routes)
    }

    fn finish(self, device: DeviceRecord, connection: Connection) -> Chromecast {
        if let Err(e) = self.receiver.update_status() {
            tracing::warn!("Failed to request status from {}: {}", device, e);
        }

        Chromecast {
            device,
            connection,
            receiver: self.receiver,
            media: self.media,
            events: self.events,
        }
    }
}

impl Chromecast {
    /// Connect to a device over TLS and request its status
    ///
    /// Fails with `ConnectionFailed` if the device cannot be reached.
    pub async fn connect(device: DeviceRecord, config: ConnectionConfig) -> Result<Self> {
        let (session, queue, routes) = Session::new(&config);
        let connection =
            Connection::connect(&device, config, session.outbox.clone(), queue, routes).await?;
        Ok(session.finish(device, connection))
    }

    /// Run the session over an already established transport
    pub fn with_transport<S>(device: DeviceRecord, stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, queue, routes) = Session::new(&config);
        let connection = Connection::start(
            stream,
            device.to_string(),
            config,
            session.outbox.clone(),
            queue,
            routes,
        );
        session.finish(device, connection)
    }

    pub fn device(&self) -> &DeviceRecord {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.device.friendly_name
    }

    pub fn uuid(&self) -> Uuid {
        self.device.uuid
    }

    /// Wait for the first device status
    ///
    /// Register observers after this returns so they start from a known
    /// baseline. `None` waits without bound.
    pub async fn wait(&self, limit: Option<Duration>) -> Result<()> {
        self.connection.wait_initial_status(limit).await
    }

    /// Latest device status
    pub fn status(&self) -> Option<Arc<CastStatus>> {
        self.receiver.status()
    }

    pub fn register_status_listener(&self, listener: Arc<dyn CastStatusListener>) -> Registration {
        self.receiver.register_status_listener(listener)
    }

    /// Remove an observer registered on any category of this session
    pub fn unregister_status_listener(&self, registration: &Registration) -> bool {
        match registration.category() {
            Category::DeviceStatus => self.receiver.unregister_status_listener(registration),
            Category::MediaStatus => self.media.unregister_status_listener(registration),
            Category::LoadFailed => self.media.unregister_load_failed_listener(registration),
            Category::Connection => self.connection.unregister_connection_listener(registration),
        }
    }

    pub fn register_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> Registration {
        self.connection.register_connection_listener(listener)
    }

    pub fn media_controller(&self) -> &MediaController {
        &self.media
    }

    pub fn receiver_controller(&self) -> &ReceiverController {
        &self.receiver
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Subscribe to every event of this session as a single stream
    ///
    /// The stream opens with the current connection state.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Close the session; pending waits and requests return `Cancelled`
    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }
}

/// Registry of device sessions, at most one live session per device uuid
#[derive(Default)]
pub struct CastClient {
    config: ConnectionConfig,
    sessions: Mutex<HashMap<Uuid, Chromecast>>,
}

impl CastClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Return the live session for this device or open a new one
    ///
    /// Concurrent calls are serialized, so two callers never open two
    /// connections to the same device.
    pub async fn connect(&self, device: &DeviceRecord) -> Result<Chromecast> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = live_session(&sessions, &device.uuid) {
            return Ok(existing);
        }

        let session = Chromecast::connect(device.clone(), self.config.clone()).await?;
        sessions.insert(device.uuid, session.clone());
        Ok(session)
    }

    /// Like `connect`, over a caller-supplied transport
    ///
    /// If a live session already exists, `stream` is dropped unused.
    pub async fn connect_with_transport<S>(&self, device: &DeviceRecord, stream: S) -> Chromecast
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = live_session(&sessions, &device.uuid) {
            return existing;
        }

        let session = Chromecast::with_transport(device.clone(), stream, self.config.clone());
        sessions.insert(device.uuid, session.clone());
        session
    }

    /// Live session for a device, if any
    pub async fn session(&self, uuid: &Uuid) -> Option<Chromecast> {
        live_session(&*self.sessions.lock().await, uuid)
    }

    /// Disconnect and forget every session
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Chromecast> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.disconnect().await;
        }
    }
}

fn live_session(sessions: &HashMap<Uuid, Chromecast>, uuid: &Uuid) -> Option<Chromecast> {
    sessions
        .get(uuid)
        .filter(|session| session.state().is_open())
        .cloned()
}
