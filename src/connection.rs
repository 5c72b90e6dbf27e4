use crate::config::ConnectionConfig;
use crate::dispatcher::{Registration, StatusDispatcher};
use crate::error::{CastError, Result};
use crate::frame::{read_frame, write_frame, CastMessage};
use crate::listener::ConnectionListener;
use crate::protocol::{
    msg, Request, Response, NS_CONNECTION, NS_HEARTBEAT, NS_RECEIVER, PLATFORM_DESTINATION_ID,
};
use crate::types::{Category, ConnectionState, DeviceRecord};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

const OPEN: u8 = 0;
const CLOSED_BY_CALLER: u8 = 1;
const CLOSED_BY_FAILURE: u8 = 2;

/// Item on the writer queue
pub(crate) enum Outbound {
    Frame(CastMessage),
    /// Flush everything queued before this, then close the write half
    Shutdown,
}

/// Receiving end of the writer queue, consumed by `Connection::start`
pub(crate) struct OutboundQueue(mpsc::UnboundedReceiver<Outbound>);

#[cfg(test)]
impl OutboundQueue {
    /// Next queued frame, if any
    pub(crate) fn try_next(&mut self) -> Option<CastMessage> {
        match self.0.try_recv().ok()? {
            Outbound::Frame(frame) => Some(frame),
            Outbound::Shutdown => None,
        }
    }
}

/// Write side of a connection: FIFO frame queue plus pending-request table
///
/// Cloned into controllers so they can issue commands without owning the
/// connection.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

struct OutboxInner {
    sender_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    /// Pending requests waiting for responses
    pending: Mutex<HashMap<i64, oneshot::Sender<Response>>>,
    next_request_id: AtomicI64,
    request_timeout: Duration,
    closed: CancellationToken,
    close_reason: AtomicU8,
}

impl Outbox {
    pub(crate) fn new(config: &ConnectionConfig) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Self {
            inner: Arc::new(OutboxInner {
                sender_id: config.sender_id.clone(),
                tx,
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicI64::new(1),
                request_timeout: config.request_timeout,
                closed: CancellationToken::new(),
                close_reason: AtomicU8::new(OPEN),
            }),
        };
        (outbox, OutboundQueue(rx))
    }

    /// Source id stamped on outbound frames
    pub fn sender_id(&self) -> &str {
        &self.inner.sender_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Queue a request without waiting for a response (fire and forget)
    pub fn send(&self, request: Request) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let frame = CastMessage::text(
            self.inner.sender_id.clone(),
            request.destination_id.clone(),
            request.namespace.clone(),
            request.to_json()?,
        );
        tracing::trace!(
            namespace = %request.namespace,
            destination = %request.destination_id,
            "Queueing {}",
            request.msg_type()
        );

        self.inner
            .tx
            .send(Outbound::Frame(frame))
            .map_err(|_| CastError::ConnectionClosed)
    }

    /// Queue a request stamped with a fresh `requestId` without waiting.
    ///
    /// The answer is only observed through status dispatch.
    pub(crate) fn send_numbered(&self, request: Request) -> Result<()> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.send(request.with_request_id(request_id))
    }

    /// Send a request and wait for the response with the same `requestId`
    pub async fn request(&self, request: Request) -> Result<Response> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = request.with_request_id(request_id);
        let (tx, rx) = oneshot::channel();

        // Register the pending request before it can possibly be answered
        self.lock_pending().insert(request_id, tx);
        if let Err(e) = self.send(request) {
            self.forget(request_id);
            return Err(e);
        }

        let outcome = tokio::select! {
            biased;
            outcome = timeout(self.inner.request_timeout, rx) => outcome,
            _ = self.inner.closed.cancelled() => {
                self.forget(request_id);
                return Err(self.closed_error());
            }
        };

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.forget(request_id);
                Err(CastError::Timeout)
            }
        }
    }

    /// Resolves once the outbox has been closed by disconnect or failure
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Error describing why the outbox is closed
    pub(crate) fn closed_error(&self) -> CastError {
        match self.inner.close_reason.load(Ordering::Acquire) {
            CLOSED_BY_FAILURE => CastError::ConnectionClosed,
            _ => CastError::Cancelled,
        }
    }

    /// Hand a response to its waiting request. Returns false if nobody waits.
    pub(crate) fn resolve(&self, request_id: i64, response: Response) -> bool {
        match self.lock_pending().remove(&request_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn shutdown_writer(&self) {
        let _ = self.inner.tx.send(Outbound::Shutdown);
    }

    /// Refuse further sends and cancel every pending request
    fn close(&self, failed: bool) {
        let reason = if failed {
            CLOSED_BY_FAILURE
        } else {
            CLOSED_BY_CALLER
        };
        let _ = self.inner.close_reason.compare_exchange(
            OPEN,
            reason,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.closed.cancel();
        // Dropping the senders wakes every waiter
        self.lock_pending().clear();
    }

    fn forget(&self, request_id: i64) {
        self.lock_pending().remove(&request_id);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<i64, oneshot::Sender<Response>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A decoded inbound JSON message
#[derive(Debug, Clone)]
pub(crate) struct InboundMessage {
    pub source_id: String,
    pub namespace: String,
    pub response: Response,
}

/// What a namespace handler did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handled {
    /// A status snapshot was published
    Status,
    /// Consumed without producing a snapshot
    Other,
    /// Not understood; dropped
    Ignored,
}

/// Consumer of all messages for one namespace, invoked on the read loop
pub(crate) trait NamespaceHandler: Send + Sync {
    fn namespace(&self) -> &'static str;

    fn handle(&self, message: &InboundMessage) -> Handled;
}

/// Namespace handlers and connection listeners installed before the session starts
#[derive(Default)]
pub(crate) struct Routes {
    pub handlers: Vec<Arc<dyn NamespaceHandler>>,
    pub listeners: Vec<Arc<dyn ConnectionListener>>,
}

struct Shared {
    peer: String,
    config: ConnectionConfig,
    outbox: Outbox,
    state: watch::Sender<ConnectionState>,
    initial_status: watch::Sender<bool>,
    listeners: StatusDispatcher<dyn ConnectionListener>,
    /// Held while a frame is handed to its namespace handler; state changes wait for it
    delivery: Mutex<()>,
    /// Stops the reader and heartbeat tasks, and the writer without flushing
    shutdown: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `to` if the current state satisfies `from`
    fn transition(&self, to: ConnectionState, from: impl Fn(ConnectionState) -> bool) -> bool {
        let mut previous = None;
        {
            let _delivery = self.lock_delivery();
            self.state.send_if_modified(|current| {
                if *current == to || !from(*current) {
                    return false;
                }
                previous = Some(*current);
                *current = to;
                true
            });
        }

        let Some(previous) = previous else {
            return false;
        };
        tracing::debug!("Connection to {}: {:?} -> {:?}", self.peer, previous, to);
        self.listeners.publish(|l| l.new_connection_state(to));
        true
    }

    /// Enter the terminal `Failed` state; only the first caller wins
    fn fail(&self, reason: &str) -> bool {
        if !self.transition(ConnectionState::Failed, ConnectionState::is_open) {
            return false;
        }
        tracing::error!("Connection to {} failed: {}", self.peer, reason);
        self.outbox.close(true);
        self.shutdown.cancel();
        true
    }

    fn lock_delivery(&self) -> std::sync::MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Persistent connection to one device
///
/// Owns a read loop, a FIFO writer and a heartbeat task. Frames are routed
/// by namespace to the handlers given at start; the connection never
/// reconnects on its own.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Open the TLS transport to a device and start the session on it
    pub(crate) async fn connect(
        device: &DeviceRecord,
        config: ConnectionConfig,
        outbox: Outbox,
        queue: OutboundQueue,
        routes: Routes,
    ) -> Result<Self> {
        let stream =
            crate::transport::connect_tls(device.host, device.port, config.connect_timeout).await?;
        Ok(Self::start(
            stream,
            device.to_string(),
            config,
            outbox,
            queue,
            routes,
        ))
    }

    /// Start the session on an established transport
    ///
    /// The initial connection listeners in `routes` see every transition,
    /// starting with `Connected`.
    pub(crate) fn start<S>(
        stream: S,
        peer: String,
        config: ConnectionConfig,
        outbox: Outbox,
        queue: OutboundQueue,
        routes: Routes,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let Routes {
            handlers,
            listeners,
        } = routes;
        let routes: HashMap<&'static str, Arc<dyn NamespaceHandler>> = handlers
            .into_iter()
            .map(|handler| (handler.namespace(), handler))
            .collect();

        let shared = Arc::new(Shared {
            peer,
            config,
            outbox,
            state: watch::Sender::new(ConnectionState::Connecting),
            initial_status: watch::Sender::new(false),
            listeners: StatusDispatcher::new(Category::Connection),
            delivery: Mutex::new(()),
            shutdown: CancellationToken::new(),
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        for listener in listeners {
            shared.listeners.register(listener);
        }

        let writer = tokio::spawn(write_loop(writer, queue, shared.clone()));
        *shared.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);

        // Open the virtual connection to the platform receiver
        let connect = Request::platform(NS_CONNECTION, msg::CONNECT).with_field("origin", json!({}));
        if let Err(e) = shared.outbox.send(connect) {
            tracing::warn!("Failed to queue CONNECT to {}: {}", shared.peer, e);
        }

        let reader = tokio::spawn(read_loop(reader, shared.clone(), routes));
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone()));
        shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([reader, heartbeat]);

        shared.transition(ConnectionState::Connected, |s| {
            s == ConnectionState::Connecting
        });
        tracing::info!("Connected to {}", shared.peer);

        Self { shared }
    }

    /// Device label used in logs
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Write side shared with controllers
    pub fn outbox(&self) -> &Outbox {
        &self.shared.outbox
    }

    pub fn register_connection_listener(
        &self,
        listener: Arc<dyn ConnectionListener>,
    ) -> Registration {
        self.shared.listeners.register(listener)
    }

    pub fn unregister_connection_listener(&self, registration: &Registration) -> bool {
        self.shared.listeners.unregister(registration)
    }

    /// Wait until the first device status has been received and dispatched.
    ///
    /// `None` waits without bound. Returns `Cancelled` if the connection is
    /// disconnected meanwhile and `ConnectionClosed` if it fails.
    pub async fn wait_initial_status(&self, limit: Option<Duration>) -> Result<()> {
        let mut ready = self.shared.initial_status.subscribe();
        if *ready.borrow_and_update() {
            return Ok(());
        }

        let outbox = &self.shared.outbox;
        let wait = async {
            ready
                .wait_for(|received| *received)
                .await
                .map(|_| ())
                .map_err(|_| CastError::ConnectionClosed)
        };

        tokio::select! {
            biased;
            result = with_timeout(limit, wait) => result,
            _ = outbox.closed() => Err(outbox.closed_error()),
        }
    }

    /// Whether a device status has been dispatched yet
    pub fn has_initial_status(&self) -> bool {
        *self.shared.initial_status.borrow()
    }

    /// Queue a request without waiting for a response
    pub fn send(&self, request: Request) -> Result<()> {
        self.shared.outbox.send(request)
    }

    /// Send a request and wait for its correlated response
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.shared.outbox.request(request).await
    }

    /// Close the connection.
    ///
    /// Queued frames are flushed within `disconnect_grace`, then all tasks
    /// are stopped. Calling this again, or after a failure, is harmless.
    pub async fn disconnect(&self) {
        let shared = &self.shared;

        if !shared.transition(ConnectionState::Disconnecting, ConnectionState::is_open) {
            tracing::debug!(
                "Disconnect from {} ignored in state {:?}",
                shared.peer,
                shared.state()
            );
            shared.shutdown.cancel();
            return;
        }

        tracing::info!("Disconnecting from {}", shared.peer);

        let close = Request::platform(NS_CONNECTION, msg::CLOSE);
        if let Err(e) = shared.outbox.send(close) {
            tracing::debug!("Could not queue CLOSE to {}: {}", shared.peer, e);
        }
        shared.outbox.shutdown_writer();
        shared.outbox.close(false);

        let writer = shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            if timeout(shared.config.disconnect_grace, &mut writer)
                .await
                .is_err()
            {
                tracing::warn!(
                    "Write queue to {} not flushed within {:?}",
                    shared.peer,
                    shared.config.disconnect_grace
                );
                writer.abort();
            }
        }

        shared.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut task in tasks {
            if timeout(shared.config.disconnect_grace, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        shared.transition(ConnectionState::Disconnected, |s| {
            s == ConnectionState::Disconnecting
        });
        tracing::info!("Disconnected from {}", shared.peer);
    }
}

/// Apply an optional bound to a fallible future
pub(crate) async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => timeout(limit, fut).await.map_err(|_| CastError::Timeout)?,
        None => fut.await,
    }
}

async fn write_loop<W>(mut writer: W, queue: OutboundQueue, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    let OutboundQueue(mut rx) = queue;

    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = rx.recv() => next,
        };

        match next {
            Some(Outbound::Frame(frame)) => {
                tracing::debug!(
                    namespace = %frame.namespace,
                    destination = %frame.destination_id,
                    "Sending: {}",
                    frame.text_payload().unwrap_or("<binary>")
                );
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    shared.fail(&format!("write error: {e}"));
                    break;
                }
            }
            Some(Outbound::Shutdown) => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Closing write half to {}: {}", shared.peer, e);
                }
                break;
            }
            None => break,
        }
    }

    rx.close();
    let mut dropped = 0usize;
    while let Ok(item) = rx.try_recv() {
        if matches!(item, Outbound::Frame(_)) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        tracing::warn!(
            "Dropped {} queued frame(s) to {} after the writer stopped",
            dropped,
            shared.peer
        );
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    routes: HashMap<&'static str, Arc<dyn NamespaceHandler>>,
) where
    R: AsyncRead + Unpin,
{
    let heartbeat_timeout = shared.config.heartbeat_timeout;
    let deadline = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(deadline);

    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            () = &mut deadline => {
                shared.fail(&format!("no frame received within {:?}", heartbeat_timeout));
                break;
            }
            frame = read_frame(&mut reader, shared.config.max_frame_size) => frame,
        };

        let message = match frame {
            Ok(Some(message)) => message,
            Ok(None) => {
                shared.fail("connection closed by device");
                break;
            }
            Err(e) => {
                shared.fail(&format!("read error: {e}"));
                break;
            }
        };

        deadline
            .as_mut()
            .reset(Instant::now() + heartbeat_timeout);

        // No deliveries once the connection is closing or closed
        if !shared.state().is_open() {
            break;
        }
        if !handle_frame(&shared, &routes, message) {
            break;
        }
    }

    tracing::debug!("Read loop for {} stopped", shared.peer);
}

/// Route one frame. Returns false when the read loop must stop.
fn handle_frame(
    shared: &Shared,
    routes: &HashMap<&'static str, Arc<dyn NamespaceHandler>>,
    message: CastMessage,
) -> bool {
    let Some(text) = message.text_payload() else {
        tracing::debug!("Dropping binary frame on {}", message.namespace);
        return true;
    };
    tracing::debug!(namespace = %message.namespace, source = %message.source_id, "Received: {}", text);

    let response = match Response::parse(text) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Dropping unparseable frame on {}: {}", message.namespace, e);
            return true;
        }
    };

    match message.namespace.as_str() {
        NS_HEARTBEAT => {
            if response.msg_type == msg::PING {
                let pong = Request::new(NS_HEARTBEAT, message.source_id.clone(), msg::PONG);
                if let Err(e) = shared.outbox.send(pong) {
                    tracing::debug!("Could not answer PING: {}", e);
                }
            }
            return true;
        }
        NS_CONNECTION => {
            if response.msg_type == msg::CLOSE {
                if message.source_id == PLATFORM_DESTINATION_ID {
                    shared.fail("virtual connection closed by device");
                    return false;
                }
                tracing::debug!("Transport {} closed by device", message.source_id);
            }
            return true;
        }
        _ => {}
    }

    let inbound = InboundMessage {
        source_id: message.source_id,
        namespace: message.namespace,
        response,
    };

    match routes.get(inbound.namespace.as_str()) {
        Some(handler) => {
            let handled = {
                let _delivery = shared.lock_delivery();
                // The writer may have failed the connection since the read loop checked
                if !shared.state().is_open() {
                    return false;
                }
                handler.handle(&inbound)
            };
            if handled == Handled::Status && inbound.namespace == NS_RECEIVER {
                shared.initial_status.send_if_modified(|received| !std::mem::replace(received, true));
            }
        }
        None => tracing::trace!("Dropping frame for unhandled namespace {}", inbound.namespace),
    }

    // Broadcast status updates carry requestId 0
    if let Some(request_id) = inbound.response.request_id.filter(|id| *id > 0) {
        shared.outbox.resolve(request_id, inbound.response);
    }

    true
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let period = shared.config.heartbeat_interval.max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    // Skip immediate first tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                if shared.outbox.send(Request::platform(NS_HEARTBEAT, msg::PING)).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
    use crate::protocol::NS_MEDIA;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    struct CountingHandler {
        namespace: &'static str,
        seen: AtomicUsize,
        result: Handled,
    }

    impl NamespaceHandler for CountingHandler {
        fn namespace(&self) -> &'static str {
            self.namespace
        }

        fn handle(&self, _message: &InboundMessage) -> Handled {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    fn handler(namespace: &'static str, result: Handled) -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            namespace,
            seen: AtomicUsize::new(0),
            result,
        })
    }

    fn start(
        config: ConnectionConfig,
        handlers: Vec<Arc<dyn NamespaceHandler>>,
    ) -> (Connection, DuplexStream) {
        start_with(
            config,
            Routes {
                handlers,
                ..Routes::default()
            },
        )
    }

    fn start_with(config: ConnectionConfig, routes: Routes) -> (Connection, DuplexStream) {
        let (client, device) = tokio::io::duplex(64 * 1024);
        let (outbox, queue) = Outbox::new(&config);
        let connection = Connection::start(
            client,
            "test-device".to_string(),
            config,
            outbox,
            queue,
            routes,
        );
        (connection, device)
    }

    async fn device_send(device: &mut DuplexStream, namespace: &str, payload: Value) {
        let frame = CastMessage::text(
            PLATFORM_DESTINATION_ID,
            "sender-0",
            namespace,
            payload.to_string(),
        );
        write_frame(device, &frame).await.unwrap();
    }

    async fn device_recv(device: &mut DuplexStream) -> (String, Value) {
        let frame = read_frame(device, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .expect("frame");
        let payload = serde_json::from_str(frame.text_payload().unwrap()).unwrap();
        (frame.namespace, payload)
    }

    #[tokio::test]
    async fn opens_virtual_connection_first() {
        let (connection, mut device) = start(ConnectionConfig::default(), vec![]);
        assert_eq!(connection.state(), ConnectionState::Connected);

        let (namespace, payload) = device_recv(&mut device).await;
        assert_eq!(namespace, NS_CONNECTION);
        assert_eq!(payload["type"], "CONNECT");
    }

    #[tokio::test]
    async fn request_is_resolved_by_matching_request_id() {
        let (connection, mut device) = start(ConnectionConfig::default(), vec![]);
        device_recv(&mut device).await; // CONNECT

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .request(Request::platform(NS_MEDIA, msg::GET_STATUS))
                    .await
            })
        };

        let (_, payload) = device_recv(&mut device).await;
        let request_id = payload["requestId"].as_i64().unwrap();
        // An unrelated response first
        device_send(&mut device, NS_MEDIA, json!({"type": "MEDIA_STATUS", "requestId": request_id + 100, "status": []})).await;
        device_send(&mut device, NS_MEDIA, json!({"type": "MEDIA_STATUS", "requestId": request_id, "status": []})).await;

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.request_id, Some(request_id));
        assert_eq!(connection.outbox().pending_count(), 0);
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let (_connection, mut device) = start(ConnectionConfig::default(), vec![]);
        device_recv(&mut device).await; // CONNECT

        device_send(&mut device, NS_HEARTBEAT, json!({"type": "PING"})).await;
        let (namespace, payload) = device_recv(&mut device).await;
        assert_eq!(namespace, NS_HEARTBEAT);
        assert_eq!(payload["type"], "PONG");
    }

    #[tokio::test]
    async fn unknown_namespace_is_dropped() {
        let receiver = handler(NS_RECEIVER, Handled::Status);
        let (connection, mut device) =
            start(ConnectionConfig::default(), vec![receiver.clone() as Arc<dyn NamespaceHandler>]);

        device_send(&mut device, "urn:x-cast:com.example.future", json!({"type": "HELLO"})).await;
        device_send(&mut device, NS_RECEIVER, json!({"type": "RECEIVER_STATUS", "status": {}})).await;

        connection
            .wait_initial_status(Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(receiver.seen.load(Ordering::SeqCst), 1);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn initial_listeners_see_every_transition() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        let listener: Arc<dyn ConnectionListener> =
            Arc::new(move |state: ConnectionState| sink.lock().unwrap().push(state));
        let (connection, _device) = start_with(
            ConnectionConfig::default(),
            Routes {
                listeners: vec![listener],
                ..Routes::default()
            },
        );

        connection.disconnect().await;
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn frame_read_before_a_failure_is_not_handled_after_it() {
        let receiver = handler(NS_RECEIVER, Handled::Status);
        let (connection, _device) = start(ConnectionConfig::default(), vec![]);
        let routes: HashMap<&'static str, Arc<dyn NamespaceHandler>> =
            HashMap::from([(NS_RECEIVER, receiver.clone() as Arc<dyn NamespaceHandler>)]);

        // As if the writer failed between the read and the dispatch
        assert!(connection.shared.fail("write error"));
        let frame = CastMessage::text(
            PLATFORM_DESTINATION_ID,
            "sender-0",
            NS_RECEIVER,
            json!({"type": "RECEIVER_STATUS", "status": {}}).to_string(),
        );

        assert!(!handle_frame(&connection.shared, &routes, frame));
        assert_eq!(receiver.seen.load(Ordering::SeqCst), 0);
        assert!(!connection.has_initial_status());
    }

    #[tokio::test]
    async fn wait_initial_status_times_out() {
        let (connection, _device) = start(ConnectionConfig::default(), vec![]);
        let err = connection
            .wait_initial_status(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::Timeout));
    }

    #[tokio::test]
    async fn silent_device_fails_on_heartbeat_timeout() {
        let config = ConnectionConfig::default()
            .with_heartbeat(Duration::from_secs(5), Duration::from_millis(100));
        let (connection, _device) = start(config, vec![]);

        let mut states = connection.state_changes();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == ConnectionState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn send_after_disconnect_is_rejected() {
        let (connection, _device) = start(ConnectionConfig::default(), vec![]);
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let err = connection
            .send(Request::platform(NS_RECEIVER, msg::GET_STATUS))
            .unwrap_err();
        assert!(matches!(err, CastError::Cancelled));

        // idempotent
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
