use crate::error::SensorError;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

/// A discovered sensor, as handed from the scanner to the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Advertised name
    pub name: String,
    /// Transport-level address
    pub address: String,
}

impl DeviceHandle {
    /// Create a new device handle
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Lifecycle of a diagnostic session
///
/// Transitions only move forward, with the exception of the teardown path
/// (`Monitoring -> Disconnecting -> Closed`) which can be entered from any
/// state that holds a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing has happened yet
    Idle,
    /// Discovery scan in progress
    Scanning,
    /// Establishing the transport connection
    Connecting,
    /// Checking the peer's service table
    ValidatingService,
    /// Registering for notifications
    Subscribing,
    /// Receiving notifications
    Monitoring,
    /// Releasing the connection
    Disconnecting,
    /// Terminal state
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ValidatingService => write!(f, "Validating Service"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Monitoring => write!(f, "Monitoring"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessStatus {
    /// The link is still up
    Alive,
    /// The link is gone
    Lost,
}

/// Why the monitoring phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEnd {
    /// The transport reported the link as disconnected
    LinkLost,
    /// The operator interrupted the run
    Cancelled,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkLost => write!(f, "connection lost"),
            Self::Cancelled => write!(f, "interrupted by user"),
        }
    }
}

/// Counters read at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Number of decoded notifications
    pub message_count: u64,
}

/// What a completed run reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Device the session was attached to
    pub device: DeviceHandle,
    /// Final counters
    pub stats: SessionStats,
    /// Exit cause
    pub end: SessionEnd,
}

/// Client configuration
///
/// Defaults match the identifiers flashed into the sensor firmware.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Advertised name to look for
    pub device_name: String,
    /// Sensor service identifier
    pub service_uuid: Uuid,
    /// Notification characteristic identifier
    pub characteristic_uuid: Uuid,
    /// Duration of the discovery scan
    pub scan_timeout: Duration,
    /// Liveness check cadence
    pub poll_interval: Duration,
    /// Token written to the characteristic once subscribed, if any
    pub handshake: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: crate::DEVICE_NAME.to_string(),
            service_uuid: crate::SERVICE_UUID,
            characteristic_uuid: crate::CHARACTERISTIC_UUID,
            scan_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            handshake: Some(crate::HANDSHAKE_TOKEN.to_string()),
        }
    }
}

impl ClientConfig {
    /// Check that the configuration can drive a session
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::InvalidConfig`] for an empty device name or a
    /// zero scan timeout or poll interval.
    pub fn validate(&self) -> Result<(), SensorError> {
        if self.device_name.is_empty() {
            return Err(SensorError::InvalidConfig(
                "device name must not be empty".to_string(),
            ));
        }
        if self.scan_timeout.is_zero() {
            return Err(SensorError::InvalidConfig(
                "scan timeout must be positive".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SensorError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
