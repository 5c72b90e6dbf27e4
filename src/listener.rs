//! Observer capabilities.
//!
//! Each trait is one delivery path. Closures of the matching shape implement
//! the traits directly, so `Arc::new(|status: &CastStatus| ...)` can be
//! registered without a wrapper type.

use crate::types::{CastStatus, ConnectionState, MediaStatus};
use std::sync::Arc;

/// Receives device status snapshots
pub trait CastStatusListener: Send + Sync {
    fn new_cast_status(&self, status: &CastStatus);

    /// Receives the snapshot as shared with every other observer.
    ///
    /// Override to keep the snapshot without copying it.
    fn new_shared_cast_status(&self, status: &Arc<CastStatus>) {
        self.new_cast_status(status)
    }
}

/// Receives media status snapshots
pub trait MediaStatusListener: Send + Sync {
    fn new_media_status(&self, status: &MediaStatus);

    /// Receives the snapshot as shared with every other observer.
    ///
    /// Override to keep the snapshot without copying it.
    fn new_shared_media_status(&self, status: &Arc<MediaStatus>) {
        self.new_media_status(status)
    }
}

/// Receives rejected media load requests
pub trait LoadFailedListener: Send + Sync {
    fn load_media_failed(&self, queue_item_id: i64, error_code: i64);
}

/// Receives connection state transitions
pub trait ConnectionListener: Send + Sync {
    fn new_connection_state(&self, state: ConnectionState);
}

impl<F> CastStatusListener for F
where
    F: Fn(&CastStatus) + Send + Sync,
{
    fn new_cast_status(&self, status: &CastStatus) {
        self(status)
    }
}

impl<F> MediaStatusListener for F
where
    F: Fn(&MediaStatus) + Send + Sync,
{
    fn new_media_status(&self, status: &MediaStatus) {
        self(status)
    }
}

impl<F> LoadFailedListener for F
where
    F: Fn(i64, i64) + Send + Sync,
{
    fn load_media_failed(&self, queue_item_id: i64, error_code: i64) {
        self(queue_item_id, error_code)
    }
}

impl<F> ConnectionListener for F
where
    F: Fn(ConnectionState) + Send + Sync,
{
    fn new_connection_state(&self, state: ConnectionState) {
        self(state)
    }
}
