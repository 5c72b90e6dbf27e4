use crate::error::{CastError, Result};
use crate::listener::{CastStatusListener, ConnectionListener, LoadFailedListener, MediaStatusListener};
use crate::types::{CastStatus, ConnectionState, MediaStatus};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Event from a device session
#[derive(Debug, Clone)]
pub enum CastEvent {
    /// Device status was updated
    CastStatus(Arc<CastStatus>),

    /// Media status was updated
    MediaStatus(Arc<MediaStatus>),

    /// The device rejected a media load
    LoadFailed { queue_item_id: i64, error_code: i64 },

    /// The connection changed state
    Connection(ConnectionState),
}

/// Receiver for session events
///
/// The first event is the connection state current at subscription time.
pub struct EventReceiver {
    current: Option<CastEvent>,
    rx: broadcast::Receiver<CastEvent>,
}

impl EventReceiver {
    pub(crate) fn new(current: Option<CastEvent>, rx: broadcast::Receiver<CastEvent>) -> Self {
        Self { current, rx }
    }

    /// Receive the next event
    ///
    /// Returns `ConnectionClosed` once the session has been dropped.
    pub async fn recv(&mut self) -> Result<CastEvent> {
        if let Some(event) = self.current.take() {
            return Ok(event);
        }
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => CastError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                CastError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<CastEvent>> {
        if let Some(event) = self.current.take() {
            return Ok(Some(event));
        }
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(CastError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(CastError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}

/// Observer on every category that republishes into a broadcast channel
pub(crate) struct EventForwarder {
    tx: broadcast::Sender<CastEvent>,
    /// Last connection state, held while it is forwarded
    connection: Mutex<Option<ConnectionState>>,
}

impl EventForwarder {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            connection: Mutex::new(None),
        }
    }

    /// New receiver starting from the current connection state
    pub(crate) fn subscribe(&self) -> EventReceiver {
        let connection = self.lock_connection();
        let rx = self.tx.subscribe();
        EventReceiver::new(connection.map(CastEvent::Connection), rx)
    }

    fn forward(&self, event: CastEvent) {
        // Nobody subscribed yet
        let _ = self.tx.send(event);
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<ConnectionState>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CastStatusListener for EventForwarder {
    fn new_cast_status(&self, status: &CastStatus) {
        self.forward(CastEvent::CastStatus(Arc::new(status.clone())));
    }

    fn new_shared_cast_status(&self, status: &Arc<CastStatus>) {
        self.forward(CastEvent::CastStatus(status.clone()));
    }
}

impl MediaStatusListener for EventForwarder {
    fn new_media_status(&self, status: &MediaStatus) {
        self.forward(CastEvent::MediaStatus(Arc::new(status.clone())));
    }

    fn new_shared_media_status(&self, status: &Arc<MediaStatus>) {
        self.forward(CastEvent::MediaStatus(status.clone()));
    }
}

impl LoadFailedListener for EventForwarder {
    fn load_media_failed(&self, queue_item_id: i64, error_code: i64) {
        self.forward(CastEvent::LoadFailed {
            queue_item_id,
            error_code,
        });
    }
}

impl ConnectionListener for EventForwarder {
    fn new_connection_state(&self, state: ConnectionState) {
        // Subscribers see the state either replayed or forwarded, never both
        let mut connection = self.lock_connection();
        *connection = Some(state);
        self.forward(CastEvent::Connection(state));
    }
}
