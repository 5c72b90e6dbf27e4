use crate::connection::{Handled, InboundMessage, NamespaceHandler, Outbox};
use crate::dispatcher::{Registration, StatusDispatcher};
use crate::error::{CastError, Result};
use crate::listener::{CastStatusListener, LoadFailedListener, MediaStatusListener};
use crate::protocol::{msg, Request, Response, NS_CONNECTION, NS_MEDIA};
use crate::types::{CastStatus, Category, MediaInformation, MediaStatus};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};

/// Virtual connection to the running media application
#[derive(Debug, Clone, PartialEq, Eq)]
struct MediaTransport {
    transport_id: String,
    session_id: String,
}

/// Media-status and load-failure categories for one device
pub(crate) struct MediaSession {
    outbox: Outbox,
    transport: Mutex<Option<MediaTransport>>,
    status: Mutex<Option<Arc<MediaStatus>>>,
    /// Queue item the device last reported as loading
    loading_item_id: Mutex<Option<i64>>,
    status_listeners: StatusDispatcher<dyn MediaStatusListener>,
    load_failed_listeners: StatusDispatcher<dyn LoadFailedListener>,
}

impl MediaSession {
    pub(crate) fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            transport: Mutex::new(None),
            status: Mutex::new(None),
            loading_item_id: Mutex::new(None),
            status_listeners: StatusDispatcher::new(Category::MediaStatus),
            load_failed_listeners: StatusDispatcher::new(Category::LoadFailed),
        }
    }

    pub(crate) fn status(&self) -> Option<Arc<MediaStatus>> {
        lock(&self.status).clone()
    }

    fn transport(&self) -> Option<MediaTransport> {
        lock(&self.transport).clone()
    }

    /// Deliver a rejected load to the load-failure observers only
    pub(crate) fn notify_load_failed(&self, queue_item_id: i64, error_code: i64) {
        tracing::warn!(
            queue_item_id,
            error_code,
            "Device rejected media load"
        );
        self.load_failed_listeners
            .publish(|l| l.load_media_failed(queue_item_id, error_code));
    }

    /// Queue item id and error code carried by a LOAD_FAILED message
    fn load_failure(&self, response: &Response) -> (i64, i64) {
        let queue_item_id = response
            .get_i64("itemId")
            .or(*lock(&self.loading_item_id))
            .unwrap_or(-1);
        let error_code = response.get_i64("detailedErrorCode").unwrap_or(-1);
        (queue_item_id, error_code)
    }

    fn publish(&self, status: MediaStatus) {
        if let Some(item_id) = status.loading_item_id {
            *lock(&self.loading_item_id) = Some(item_id);
        }

        let status = Arc::new(status);
        *lock(&self.status) = Some(status.clone());
        self.status_listeners.publish(|l| l.new_shared_media_status(&status));
    }

    /// Open the virtual connection to a media application and ask for its status
    fn attach(&self, transport: &MediaTransport) {
        let connect = Request::new(NS_CONNECTION, transport.transport_id.clone(), msg::CONNECT)
            .with_field("origin", json!({}));
        let get_status = Request::new(NS_MEDIA, transport.transport_id.clone(), msg::GET_STATUS);

        let queued = self
            .outbox
            .send(connect)
            .and_then(|_| self.outbox.send_numbered(get_status));
        if let Err(e) = queued {
            tracing::debug!("Could not attach to {}: {}", transport.transport_id, e);
        }
    }

    fn detach(&self, transport: &MediaTransport) {
        let close = Request::new(NS_CONNECTION, transport.transport_id.clone(), msg::CLOSE);
        if let Err(e) = self.outbox.send(close) {
            tracing::debug!("Could not close {}: {}", transport.transport_id, e);
        }
    }
}

impl NamespaceHandler for MediaSession {
    fn namespace(&self) -> &'static str {
        NS_MEDIA
    }

    fn handle(&self, message: &InboundMessage) -> Handled {
        let response = &message.response;
        match response.msg_type.as_str() {
            msg::MEDIA_STATUS => {
                let entries = response.get("status").and_then(Value::as_array);
                let status = match entries.and_then(|entries| entries.first()) {
                    Some(entry) => match serde_json::from_value::<MediaStatus>(entry.clone()) {
                        Ok(status) => status,
                        Err(e) => {
                            tracing::warn!("Failed to parse media status: {}", e);
                            return Handled::Ignored;
                        }
                    },
                    // No media session on the device
                    None => MediaStatus::default(),
                };
                tracing::debug!(
                    player_state = ?status.player_state,
                    current_time = status.current_time,
                    "Received media status"
                );
                self.publish(status);
                Handled::Status
            }
            msg::LOAD_FAILED => {
                let (queue_item_id, error_code) = self.load_failure(response);
                self.notify_load_failed(queue_item_id, error_code);
                Handled::Other
            }
            msg::LOAD_CANCELLED | msg::INVALID_REQUEST | msg::INVALID_PLAYER_STATE => {
                tracing::warn!(
                    "Media request {:?} rejected: {}",
                    response.request_id,
                    response.error_message().unwrap_or_default()
                );
                Handled::Other
            }
            other => {
                tracing::debug!("Ignoring media message {}", other);
                Handled::Ignored
            }
        }
    }
}

/// Follows the media application through device status updates
impl CastStatusListener for MediaSession {
    fn new_cast_status(&self, status: &CastStatus) {
        let next = status.media_app().map(|app| MediaTransport {
            transport_id: app.transport_id.clone(),
            session_id: app.session_id.clone(),
        });

        let previous = {
            let mut current = lock(&self.transport);
            if *current == next {
                return;
            }
            std::mem::replace(&mut *current, next.clone())
        };

        if let Some(previous) = previous {
            tracing::info!("Media application {} went away", previous.transport_id);
            self.detach(&previous);
            *lock(&self.loading_item_id) = None;
            let had_status = lock(&self.status).is_some();
            if had_status {
                // Observers must not keep the departed application's last snapshot
                self.publish(MediaStatus::default());
            }
        }
        if let Some(next) = next {
            tracing::info!("Media application available on {}", next.transport_id);
            self.attach(&next);
        }
    }
}

/// Media commands and media-status subscriptions
#[derive(Clone)]
pub struct MediaController {
    outbox: Outbox,
    session: Arc<MediaSession>,
}

impl MediaController {
    pub(crate) fn new(outbox: Outbox, session: Arc<MediaSession>) -> Self {
        Self { outbox, session }
    }

    /// Latest media status, if one has arrived
    pub fn status(&self) -> Option<Arc<MediaStatus>> {
        self.session.status()
    }

    /// Whether a media application is running
    pub fn has_session(&self) -> bool {
        self.session.transport().is_some()
    }

    pub fn register_status_listener(&self, listener: Arc<dyn MediaStatusListener>) -> Registration {
        self.session.status_listeners.register(listener)
    }

    pub fn unregister_status_listener(&self, registration: &Registration) -> bool {
        self.session.status_listeners.unregister(registration)
    }

    pub fn register_load_failed_listener(
        &self,
        listener: Arc<dyn LoadFailedListener>,
    ) -> Registration {
        self.session.load_failed_listeners.register(listener)
    }

    pub fn unregister_load_failed_listener(&self, registration: &Registration) -> bool {
        self.session.load_failed_listeners.unregister(registration)
    }

    /// Ask the media application for its status
    pub async fn update_status(&self) -> Result<Arc<MediaStatus>> {
        let transport = self.session.transport().ok_or(CastError::NoMediaSession)?;
        let request = Request::new(NS_MEDIA, transport.transport_id, msg::GET_STATUS);
        self.outbox.request(request).await?.into_result()?;
        Ok(self.current_status())
    }

    /// Load a media item and start playback if `autoplay` is set
    ///
    /// A rejected load is also delivered to the load-failure observers.
    pub async fn load(&self, media: MediaInformation, autoplay: bool) -> Result<Arc<MediaStatus>> {
        let transport = self.session.transport().ok_or(CastError::NoMediaSession)?;
        tracing::info!("Loading {} ({})", media.content_id, media.content_type);

        let request = Request::new(NS_MEDIA, transport.transport_id, msg::LOAD)
            .with_field("sessionId", json!(transport.session_id))
            .with_field("media", serde_json::to_value(&media)?)
            .with_field("autoplay", json!(autoplay))
            .with_field("currentTime", json!(0.0));
        let response = self.outbox.request(request).await?;

        if response.msg_type == msg::LOAD_FAILED {
            let (queue_item_id, error_code) = self.session.load_failure(&response);
            return Err(CastError::LoadFailed {
                queue_item_id,
                error_code,
            });
        }
        response.into_result()?;
        Ok(self.current_status())
    }

    pub async fn play(&self) -> Result<Arc<MediaStatus>> {
        self.command(msg::PLAY, None).await
    }

    pub async fn pause(&self) -> Result<Arc<MediaStatus>> {
        self.command(msg::PAUSE, None).await
    }

    /// Stop playback and end the media session
    pub async fn stop(&self) -> Result<Arc<MediaStatus>> {
        self.command(msg::STOP, None).await
    }

    /// Seek to a position in seconds
    pub async fn seek(&self, position: f64) -> Result<Arc<MediaStatus>> {
        self.command(msg::SEEK, Some(("currentTime", json!(position.max(0.0)))))
            .await
    }

    async fn command(&self, msg_type: &str, field: Option<(&str, Value)>) -> Result<Arc<MediaStatus>> {
        let transport = self.session.transport().ok_or(CastError::NoMediaSession)?;
        let media_session_id = self
            .status()
            .and_then(|status| status.media_session_id)
            .ok_or(CastError::NoMediaSession)?;

        let mut request = Request::new(NS_MEDIA, transport.transport_id, msg_type)
            .with_field("mediaSessionId", json!(media_session_id));
        if let Some((key, value)) = field {
            request = request.with_field(key, value);
        }

        self.outbox.request(request).await?.into_result()?;
        Ok(self.current_status())
    }

    fn current_status(&self) -> Arc<MediaStatus> {
        self.status().unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::OutboundQueue;
    use crate::types::PlayerState;

    fn session() -> (Arc<MediaSession>, OutboundQueue) {
        let (outbox, queue) = Outbox::new(&ConnectionConfig::default());
        (Arc::new(MediaSession::new(outbox)), queue)
    }

    fn message(payload: Value) -> InboundMessage {
        InboundMessage {
            source_id: "web-5".to_string(),
            namespace: NS_MEDIA.to_string(),
            response: Response::parse(&payload.to_string()).unwrap(),
        }
    }

    fn media_app_status(transport_id: &str) -> CastStatus {
        serde_json::from_value(json!({
            "applications": [{
                "appId": "CC1AD845",
                "sessionId": "session-1",
                "transportId": transport_id,
                "namespaces": [{"name": NS_MEDIA}]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn load_failure_is_delivered_without_any_status() {
        let (session, _queue) = session();
        let statuses = Arc::new(Mutex::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));

        let counter = statuses.clone();
        session
            .status_listeners
            .register(Arc::new(move |_: &MediaStatus| *counter.lock().unwrap() += 1));
        let sink = failures.clone();
        session
            .load_failed_listeners
            .register(Arc::new(move |item: i64, code: i64| sink.lock().unwrap().push((item, code))));

        let handled = session.handle(&message(json!({
            "type": "LOAD_FAILED",
            "requestId": 3,
            "itemId": 42,
            "detailedErrorCode": 7
        })));

        assert_eq!(handled, Handled::Other);
        assert_eq!(*failures.lock().unwrap(), vec![(42, 7)]);
        assert_eq!(*statuses.lock().unwrap(), 0);
        assert!(session.status().is_none());
    }

    #[test]
    fn load_failure_falls_back_to_loading_item() {
        let (session, _queue) = session();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        session
            .load_failed_listeners
            .register(Arc::new(move |item: i64, code: i64| sink.lock().unwrap().push((item, code))));

        session.handle(&message(json!({"type": "LOAD_FAILED"})));
        session.handle(&message(json!({
            "type": "MEDIA_STATUS",
            "status": [{"mediaSessionId": 1, "playerState": "BUFFERING", "loadingItemId": 5}]
        })));
        session.handle(&message(json!({"type": "LOAD_FAILED", "detailedErrorCode": 104})));

        assert_eq!(*failures.lock().unwrap(), vec![(-1, -1), (5, 104)]);
    }

    #[test]
    fn empty_status_list_means_no_media_session() {
        let (session, _queue) = session();
        session.handle(&message(json!({
            "type": "MEDIA_STATUS",
            "status": [{"mediaSessionId": 1, "playerState": "PLAYING"}]
        })));
        assert_eq!(session.status().unwrap().player_state, PlayerState::Playing);

        let handled = session.handle(&message(json!({"type": "MEDIA_STATUS", "status": []})));
        assert_eq!(handled, Handled::Status);
        let status = session.status().unwrap();
        assert!(!status.is_active());
        assert_eq!(*status, MediaStatus::default());
    }

    #[test]
    fn media_app_gets_a_virtual_connection_once() {
        let (session, mut queue) = session();

        session.new_cast_status(&media_app_status("web-5"));
        session.new_cast_status(&media_app_status("web-5"));

        let connect = queue.try_next().unwrap();
        assert_eq!(connect.namespace, NS_CONNECTION);
        assert_eq!(connect.destination_id, "web-5");
        let get_status = queue.try_next().unwrap();
        assert_eq!(get_status.namespace, NS_MEDIA);
        let payload: Value = serde_json::from_str(get_status.text_payload().unwrap()).unwrap();
        assert_eq!(payload["type"], "GET_STATUS");
        assert!(payload["requestId"].as_i64().unwrap() > 0);
        assert!(queue.try_next().is_none());

        session.new_cast_status(&CastStatus::default());
        let close = queue.try_next().unwrap();
        assert_eq!(close.destination_id, "web-5");
        assert!(close.text_payload().unwrap().contains("CLOSE"));
    }

    #[test]
    fn departed_media_app_resets_media_observers() {
        let (session, _queue) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.status_listeners.register(Arc::new(move |status: &MediaStatus| {
            sink.lock().unwrap().push(status.player_state)
        }));

        session.new_cast_status(&media_app_status("web-5"));
        session.handle(&message(json!({
            "type": "MEDIA_STATUS",
            "status": [{"mediaSessionId": 1, "playerState": "PLAYING", "loadingItemId": 9}]
        })));
        session.new_cast_status(&CastStatus::default());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![PlayerState::Playing, PlayerState::Unknown]
        );
        let status = session.status().unwrap();
        assert!(!status.is_active());
        assert_eq!(*status, MediaStatus::default());

        // The departed application's loading item no longer applies
        let failed = Response::parse(r#"{"type":"LOAD_FAILED"}"#).unwrap();
        assert_eq!(session.load_failure(&failed), (-1, -1));
    }

    #[tokio::test]
    async fn commands_need_a_media_session() {
        let (session, _queue) = session();
        let controller = MediaController::new(session.outbox.clone(), session.clone());

        assert!(matches!(controller.play().await, Err(CastError::NoMediaSession)));
        let load = controller
            .load(MediaInformation::new("http://x/a.mp3", "audio/mpeg"), true)
            .await;
        assert!(matches!(load, Err(CastError::NoMediaSession)));

        // An application without an active media item still rejects playback commands
        session.new_cast_status(&media_app_status("web-5"));
        assert!(controller.has_session());
        assert!(matches!(controller.pause().await, Err(CastError::NoMediaSession)));
    }
}
