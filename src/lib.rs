#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Diaper Monitor
//!
//! A diagnostic Bluetooth Low Energy client for the `DiaperSensorESP32`
//! moisture sensor.
//!
//! The sensor advertises under a fixed name and pushes short colon-delimited
//! text frames through a single notification characteristic. This crate finds
//! the sensor, validates its service table, subscribes to the frame stream and
//! turns every frame into a typed [`TelemetryEvent`] handed to an
//! [`EventSink`]. Wet alerts additionally trigger [`EventSink::alert`].
//!
//! ## Session lifecycle
//!
//! ```text
//! Idle -> Scanning -> Connecting -> ValidatingService -> Subscribing -> Monitoring
//!                                                                          |
//!                                                 Closed <- Disconnecting <-
//! ```
//!
//! Any failure during the connect phase releases the connection and closes
//! the session. While monitoring, the link is polled once per second; losing
//! it, or cancelling the run, goes through the same single teardown.
//!
//! ## Wire format
//!
//! | Frame                               | Event                |
//! |-------------------------------------|----------------------|
//! | `ALERTA:HUMEDO:VAL=<n>`             | `AlertWet`           |
//! | `ESTADO:SECO:VAL=<n>`               | `StatusDry`          |
//! | `STATUS:<state>:VAL=<n>:BASE=<n>`   | `StatusPeriodic`     |
//! | `BASELINE_UPDATE:<n>`               | `BaselineUpdate`     |
//! | `INICIO:<detail>`                   | `Started`            |
//! | `CONECTADO:<detail>`                | `Connected`          |
//! | anything else                       | `Unrecognized`       |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use diaper_monitor::{BleTransport, ClientConfig, ConsoleSink, Session};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let session = Session::new(transport, ClientConfig::default(), Arc::new(ConsoleSink::stdout()));
//!
//!     let cancel = CancellationToken::new();
//!     let summary = session.run(&cancel).await?;
//!     println!("Messages received: {}", summary.stats.message_count);
//!     Ok(())
//! }
//! ```

/// `btleplug` transport backend
pub mod ble;
/// Error types and handling
pub mod error;
/// Logging setup for the command-line client
pub mod logging;
/// Sensor frame decoding
pub mod protocol;
/// Discovery of the sensor
pub mod scanner;
/// Session state machine
pub mod session;
/// Event presentation
pub mod sink;
/// Transport abstraction over the Bluetooth stack
pub mod transport;
/// Type definitions and data structures
pub mod types;

pub use ble::{BleLink, BleTransport};
pub use error::{ConnectError, DiscoveryError, Result, SensorError, TransportError};
pub use protocol::{decode, decode_bytes, Reading, TelemetryEvent};
pub use scanner::Scanner;
pub use session::{Session, SubscribedSession};
pub use sink::{ConsoleSink, EventSink, JsonLinesSink};
pub use transport::{CharacteristicInfo, Link, Peer, ServiceInfo, Transport};
pub use types::{
    ClientConfig, DeviceHandle, LivenessStatus, SessionEnd, SessionState, SessionStats,
    SessionSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name the sensor firmware advertises
pub const DEVICE_NAME: &str = "DiaperSensorESP32";

/// Sensor GATT service
pub const SERVICE_UUID: uuid::Uuid = uuid::uuid!("12345678-1234-1234-1234-123456789abc");

/// Characteristic carrying the sensor's status frames
///
/// The sensor notifies on it and accepts writes, which the client uses for
/// the post-subscription handshake.
pub const CHARACTERISTIC_UUID: uuid::Uuid = uuid::uuid!("87654321-4321-4321-4321-cba987654321");

/// Token written once subscribed so the firmware can log the connection
pub const HANDSHAKE_TOKEN: &str = "CLIENT_CONNECTED";
