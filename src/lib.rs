//! Rust library for discovering and observing Google Cast devices
//!
//! This library provides an async API for finding cast devices on the local
//! network and keeping a live session with one of them. It supports:
//!
//! - Discovery via mDNS (`_googlecast._tcp`) plus direct probing of known hosts
//! - A persistent TLS connection speaking the Cast v2 protocol, with heartbeat
//! - Device status, media status, load-failure and connection-state observers
//! - Volume, application and media commands
//! - A single event stream as an alternative to observer traits
//!
//! # Quick Start
//!
//! ```no_run
//! use castlink::{CastStatus, Chromecast, ConnectionConfig, Discovery, DiscoveryConfig, MediaStatus};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DiscoveryConfig::default().with_friendly_names(["Living Room Speaker"]);
//!     let discovery = Discovery::start_mdns(config)?;
//!
//!     let device = discovery
//!         .wait_for("Living Room Speaker", Some(Duration::from_secs(10)))
//!         .await?;
//!
//!     let cast = Chromecast::connect(device, ConnectionConfig::default()).await?;
//!     cast.wait(Some(Duration::from_secs(10))).await?;
//!
//!     cast.register_status_listener(Arc::new(|status: &CastStatus| {
//!         println!("Device status: {:?}", status.display_name());
//!     }));
//!     cast.media_controller()
//!         .register_status_listener(Arc::new(|status: &MediaStatus| {
//!             println!("Media status: {:?}", status.player_state);
//!         }));
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!
//!     cast.disconnect().await;
//!     discovery.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Event Stream
//!
//! ```no_run
//! use castlink::{CastClient, CastEvent, DeviceRecord};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = DeviceRecord::new(
//!         "Kitchen",
//!         "192.168.1.21".parse()?,
//!         castlink::DEFAULT_CAST_PORT,
//!         "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9".parse()?,
//!     );
//!
//!     let client = CastClient::default();
//!     let cast = client.connect(&device).await?;
//!     let mut events = cast.subscribe();
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             CastEvent::MediaStatus(status) => println!("{:?}", status.player_state),
//!             CastEvent::Connection(state) if !state.is_open() => break,
//!             _ => {}
//!         }
//!     }
//!
//!     client.disconnect_all().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Discovery**: device registry fed by an mDNS feed and a known-host prober
//! - **Client**: per-device sessions and the one-session-per-device registry
//! - **Receiver / Media**: status categories and their commands
//! - **Dispatcher**: ordered observer fan-out with failure isolation
//! - **Connection**: TLS transport, read/write/heartbeat tasks, request correlation
//! - **Frame / Protocol**: Cast v2 framing and JSON message envelopes

mod client;
mod config;
mod connection;
mod discovery;
mod dispatcher;
mod error;
mod feed;
mod frame;
mod listener;
mod media;
mod probe;
mod protocol;
mod receiver;
mod subscription;
mod transport;
mod types;

// Public exports
pub use client::{CastClient, Chromecast};
pub use config::{ConnectionConfig, DiscoveryConfig, CAST_SERVICE_TYPE, SETUP_HTTP_PORT};
pub use connection::{Connection, Outbox};
pub use discovery::{Discovery, DiscoveryUpdate};
pub use dispatcher::Registration;
pub use error::{CastError, Result};
pub use feed::{FeedEvent, MdnsFeed};
pub use frame::{read_frame, write_frame, CastMessage, Payload, DEFAULT_MAX_FRAME_SIZE};
pub use listener::{CastStatusListener, ConnectionListener, LoadFailedListener, MediaStatusListener};
pub use media::MediaController;
pub use probe::{EurekaProber, HostProber};
pub use protocol::{
    msg, Request, Response, DEFAULT_MEDIA_RECEIVER_APP_ID, NS_CONNECTION, NS_HEARTBEAT, NS_MEDIA,
    NS_RECEIVER, PLATFORM_DESTINATION_ID,
};
pub use receiver::ReceiverController;
pub use subscription::{CastEvent, EventReceiver};
pub use types::{
    AppNamespace, Application, CastStatus, Category, ConnectionState, DeviceRecord,
    MediaInformation, MediaStatus, PlayerState, QueueItem, Volume, DEFAULT_CAST_PORT,
};
