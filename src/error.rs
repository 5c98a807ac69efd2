use thiserror::Error;

/// Failures reported by the underlying Bluetooth stack
#[derive(Error, Debug)]
pub enum TransportError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// The requested address was never seen during discovery
    #[error("Unknown peer address: {0}")]
    UnknownPeer(String),

    /// The requested characteristic is not exposed by the peer
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(uuid::Uuid),

    /// Other transport errors
    #[error("Transport error: {0}")]
    Other(String),
}

/// Errors produced by the discovery scan
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The target device was not advertising during the scan window
    #[error("Device not found ({} other named peer(s) seen)", .candidates.len())]
    NotFound {
        /// Every named peer observed, as `(name, address)`, in first-seen order
        candidates: Vec<(String, String)>,
    },

    /// The scan itself could not run
    #[error("Scan failed: {0}")]
    Transport(#[from] TransportError),

    /// The run was interrupted before the scan completed
    #[error("Scan interrupted")]
    Cancelled,
}

/// Errors that keep a session from reaching the monitoring state
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The transport-level connection could not be established
    #[error("Failed to connect to device: {0}")]
    LinkFailure(#[source] TransportError),

    /// The peer does not expose the sensor service
    #[error("Service {0} not found")]
    ServiceNotFound(uuid::Uuid),

    /// The sensor service lacks the notification characteristic
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    /// Subscribing to notifications failed
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(#[source] TransportError),

    /// The run was interrupted before monitoring started
    #[error("Connection interrupted")]
    Cancelled,

    /// `connect` was called on a session that already left the idle states
    #[error("Session cannot connect from state {0}")]
    InvalidState(crate::types::SessionState),
}

/// Errors that can occur while running the diagnostic client
#[derive(Error, Debug)]
pub enum SensorError {
    /// Discovery failed
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Connection setup failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Transport failure outside the connect phase
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sensor client operations
pub type Result<T> = std::result::Result<T, SensorError>;

impl SensorError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Connect(ConnectError::LinkFailure(_) | ConnectError::SubscriptionFailed(_))
                | Self::Discovery(DiscoveryError::Transport(_))
        )
    }

    /// Check if rerunning the whole client may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !self.is_cancelled()
            && matches!(self, Self::Discovery(_) | Self::Connect(_) | Self::Transport(_))
    }

    /// Check if the run stopped because the user interrupted it
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Discovery(DiscoveryError::Cancelled) | Self::Connect(ConnectError::Cancelled)
        )
    }

    /// Peers seen during a scan that missed the target, if any
    #[must_use]
    pub fn candidates(&self) -> Option<&[(String, String)]> {
        match self {
            Self::Discovery(DiscoveryError::NotFound { candidates }) => Some(candidates),
            _ => None,
        }
    }
}
