use crate::connection::{Handled, InboundMessage, NamespaceHandler, Outbox};
use crate::dispatcher::{Registration, StatusDispatcher};
use crate::error::{CastError, Result};
use crate::listener::CastStatusListener;
use crate::protocol::{msg, Request, NS_RECEIVER};
use crate::types::{CastStatus, Category};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};

/// Device-status category: latest snapshot plus its observers
pub(crate) struct ReceiverState {
    status: Mutex<Option<Arc<CastStatus>>>,
    listeners: StatusDispatcher<dyn CastStatusListener>,
}

impl ReceiverState {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(None),
            listeners: StatusDispatcher::new(Category::DeviceStatus),
        }
    }

    pub(crate) fn status(&self) -> Option<Arc<CastStatus>> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn register(&self, listener: Arc<dyn CastStatusListener>) -> Registration {
        self.listeners.register(listener)
    }

    pub(crate) fn unregister(&self, registration: &Registration) -> bool {
        self.listeners.unregister(registration)
    }

    /// Replace the snapshot and fan it out
    fn publish(&self, status: CastStatus) {
        let status = Arc::new(status);
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
        self.listeners.publish(|l| l.new_shared_cast_status(&status));
    }
}

impl NamespaceHandler for ReceiverState {
    fn namespace(&self) -> &'static str {
        NS_RECEIVER
    }

    fn handle(&self, message: &InboundMessage) -> Handled {
        let response = &message.response;
        match response.msg_type.as_str() {
            msg::RECEIVER_STATUS => {
                let Some(raw) = response.get("status") else {
                    tracing::warn!("RECEIVER_STATUS without status body");
                    return Handled::Ignored;
                };
                match serde_json::from_value::<CastStatus>(raw.clone()) {
                    Ok(status) => {
                        tracing::debug!(
                            app = ?status.display_name(),
                            volume = status.volume.level,
                            "Received device status"
                        );
                        self.publish(status);
                        Handled::Status
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse device status: {}", e);
                        Handled::Ignored
                    }
                }
            }
            msg::LAUNCH_ERROR | msg::INVALID_REQUEST => {
                tracing::warn!(
                    "Receiver rejected request {:?}: {}",
                    response.request_id,
                    response.error_message().unwrap_or_default()
                );
                Handled::Other
            }
            other => {
                tracing::debug!("Ignoring receiver message {}", other);
                Handled::Ignored
            }
        }
    }
}

/// Device-level commands and device-status subscriptions
#[derive(Clone)]
pub struct ReceiverController {
    outbox: Outbox,
    state: Arc<ReceiverState>,
}

impl ReceiverController {
    pub(crate) fn new(outbox: Outbox, state: Arc<ReceiverState>) -> Self {
        Self { outbox, state }
    }

    /// Latest device status, if one has arrived
    pub fn status(&self) -> Option<Arc<CastStatus>> {
        self.state.status()
    }

    pub fn register_status_listener(&self, listener: Arc<dyn CastStatusListener>) -> Registration {
        self.state.register(listener)
    }

    pub fn unregister_status_listener(&self, registration: &Registration) -> bool {
        self.state.unregister(registration)
    }

    /// Ask the device to publish its status
    pub fn update_status(&self) -> Result<()> {
        self.outbox
            .send_numbered(Request::platform(NS_RECEIVER, msg::GET_STATUS))
    }

    /// Set the device volume, clamped to `0.0..=1.0`
    pub async fn set_volume(&self, level: f64) -> Result<()> {
        let level = level.clamp(0.0, 1.0);
        let request = Request::platform(NS_RECEIVER, msg::SET_VOLUME)
            .with_field("volume", json!({ "level": level }));
        self.outbox.request(request).await?.into_result()?;
        Ok(())
    }

    pub async fn set_volume_muted(&self, muted: bool) -> Result<()> {
        let request = Request::platform(NS_RECEIVER, msg::SET_VOLUME)
            .with_field("volume", json!({ "muted": muted }));
        self.outbox.request(request).await?.into_result()?;
        Ok(())
    }

    /// Launch an application and return the status that reports it
    pub async fn launch_app(&self, app_id: &str) -> Result<Arc<CastStatus>> {
        let request = Request::platform(NS_RECEIVER, msg::LAUNCH).with_field("appId", json!(app_id));
        self.outbox.request(request).await?.into_result()?;

        // The response was dispatched as a status before it resolved the request
        self.status()
            .filter(|status| status.applications.iter().any(|app| app.app_id == app_id))
            .ok_or_else(|| {
                CastError::InvalidResponse(format!("{app_id} not running after launch"))
            })
    }

    /// Stop the foreground application
    pub async fn quit_app(&self) -> Result<()> {
        let Some(session_id) = self
            .status()
            .and_then(|status| status.app().map(|app| app.session_id.clone()))
        else {
            return Ok(());
        };

        let request =
            Request::platform(NS_RECEIVER, msg::STOP).with_field("sessionId", json!(session_id));
        self.outbox.request(request).await?.into_result()?;
        Ok(())
    }
}
