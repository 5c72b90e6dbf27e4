//! Simple cast event listener.
//!
//! Finds a device by friendly name, waits for its first status, then prints
//! device and media status changes until Enter is pressed.
//!
//! ```text
//! cargo run --example simple_listener -- --cast "Kitchen" --known-host 192.168.1.21
//! ```

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use castlink::{
    CastStatus, CastStatusListener, Chromecast, ConnectionConfig, Discovery, DiscoveryConfig,
    LoadFailedListener, MediaStatus, MediaStatusListener,
};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CAST_NAME: &str = "Living Room Speaker";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Example on how to create a simple cast event listener.
#[derive(Parser, Debug)]
struct Args {
    /// Name of cast device
    #[arg(long, default_value = DEFAULT_CAST_NAME)]
    cast: String,

    /// Add known host (IP), can be used multiple times
    #[arg(long = "known-host")]
    known_host: Vec<IpAddr>,

    /// Enable debug log
    #[arg(long)]
    show_debug: bool,

    /// Enable discovery debug log
    #[arg(long)]
    show_discovery_debug: bool,

    /// Enable zeroconf debug log
    #[arg(long)]
    show_zeroconf_debug: bool,
}

fn init_tracing(args: &Args) {
    let mut directives = vec!["warn".to_string()];
    if args.show_debug {
        directives.push("castlink=debug".to_string());
        for target in ["castlink::discovery", "castlink::feed", "castlink::probe"] {
            directives.push(format!("{target}=info"));
        }
    }
    if args.show_discovery_debug {
        for target in ["castlink::discovery", "castlink::feed", "castlink::probe"] {
            directives.push(format!("{target}=debug"));
        }
    }
    if args.show_zeroconf_debug {
        directives.push("mdns_sd=debug".to_string());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives.join(",")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .init();
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

struct CastPrinter {
    name: String,
}

impl CastStatusListener for CastPrinter {
    fn new_cast_status(&self, status: &CastStatus) {
        println!("[{} - {}] status chromecast change:", timestamp(), self.name);
        println!("{:#?}", status);
    }
}

struct MediaPrinter {
    name: String,
}

impl MediaStatusListener for MediaPrinter {
    fn new_media_status(&self, status: &MediaStatus) {
        println!("[{} - {}] status media change:", timestamp(), self.name);
        println!("{:#?}", status);
    }
}

impl LoadFailedListener for MediaPrinter {
    fn load_media_failed(&self, queue_item_id: i64, error_code: i64) {
        println!(
            "[{} - {}] load media failed for queue item id: {} with code: {}",
            timestamp(),
            self.name,
            queue_item_id,
            error_code
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    let config = DiscoveryConfig::default()
        .with_friendly_names([args.cast.clone()])
        .with_known_hosts(args.known_host.iter().copied());
    let discovery = match Discovery::start_mdns(config) {
        Ok(discovery) => discovery,
        Err(e) => {
            eprintln!("Failed to start discovery: {e}");
            return ExitCode::FAILURE;
        }
    };

    let device = match discovery.wait_for(&args.cast, Some(DISCOVERY_TIMEOUT)).await {
        Ok(device) => device,
        Err(e) => {
            if e.is_not_found() {
                println!("No chromecast with name \"{}\" discovered", args.cast);
            } else {
                eprintln!("Discovery failed: {e}");
            }
            discovery.stop().await;
            return ExitCode::FAILURE;
        }
    };

    let cast = match Chromecast::connect(device.clone(), ConnectionConfig::default()).await {
        Ok(cast) => cast,
        Err(e) => {
            if e.is_unreachable() {
                println!("Chromecast \"{}\" was found at {} but is unreachable: {e}", args.cast, device.socket_addr());
            } else {
                eprintln!("Failed to connect to {device}: {e}");
            }
            discovery.stop().await;
            return ExitCode::FAILURE;
        }
    };

    // Observers start from the first status
    if let Err(e) = cast.wait(Some(STATUS_TIMEOUT)).await {
        eprintln!("No status from {device}: {e}");
        cast.disconnect().await;
        discovery.stop().await;
        return ExitCode::FAILURE;
    }

    cast.register_status_listener(Arc::new(CastPrinter {
        name: cast.name().to_string(),
    }));
    let media_printer = Arc::new(MediaPrinter {
        name: cast.name().to_string(),
    });
    cast.media_controller()
        .register_status_listener(media_printer.clone());
    cast.media_controller()
        .register_load_failed_listener(media_printer);

    println!("Listening for Chromecast events...\n");
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    if let Err(e) = stdin.read_line(&mut line).await {
        eprintln!("Failed to read stdin: {e}");
    }

    cast.disconnect().await;
    discovery.stop().await;
    ExitCode::SUCCESS
}
