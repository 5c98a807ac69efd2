use bytes::Bytes;
use chrono::Local;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ConnectError, DiscoveryError, Result},
    protocol::decode_bytes,
    scanner::Scanner,
    sink::EventSink,
    transport::{Link, Transport},
    types::{
        ClientConfig, DeviceHandle, LivenessStatus, SessionEnd, SessionState, SessionStats,
        SessionSummary,
    },
};

/// How long teardown waits for already-delivered notifications to be dispatched
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared, observable session state
#[derive(Clone)]
struct StateCell(Arc<watch::Sender<SessionState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(watch::Sender::new(SessionState::Idle)))
    }

    fn get(&self) -> SessionState {
        *self.0.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.0.subscribe()
    }

    /// Move to `next`; backward moves and moves out of `Closed` are ignored
    fn advance(&self, next: SessionState) {
        self.0.send_if_modified(|current| {
            if next <= *current {
                if next != *current {
                    warn!("Ignoring backward transition {current} -> {next}");
                }
                return false;
            }
            debug!("Session state {current} -> {next}");
            *current = next;
            true
        });
    }
}

/// Drives a sensor from discovery up to an active subscription
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use diaper_monitor::{BleTransport, ClientConfig, ConsoleSink, Session};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(BleTransport::new().await?);
///     let session = Session::new(transport, ClientConfig::default(), Arc::new(ConsoleSink::stdout()));
///
///     let summary = session.run(&CancellationToken::new()).await?;
///     println!("Messages received: {}", summary.stats.message_count);
///     Ok(())
/// }
/// ```
pub struct Session<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    sink: Arc<dyn EventSink>,
    state: StateCell,
}

impl<T: Transport> Session<T> {
    /// Create an idle session
    pub fn new(transport: Arc<T>, config: ClientConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            transport,
            config,
            sink,
            state: StateCell::new(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Observe every state transition, including those after `connect`
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Look for the configured sensor with a single bounded scan
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotFound`] if the sensor did not advertise,
    /// after which the session is closed.
    pub async fn scan(&self) -> std::result::Result<DeviceHandle, DiscoveryError> {
        self.state.advance(SessionState::Scanning);

        let scanner = Scanner::new(Arc::clone(&self.transport));
        let result = scanner
            .scan(&self.config.device_name, self.config.scan_timeout)
            .await;

        match &result {
            Ok(handle) => self.sink.notice(&format!("✓ Device found: {handle}")),
            Err(e) => {
                self.sink.notice(&format!("✗ {e}"));
                self.state.advance(SessionState::Closed);
            }
        }

        result
    }

    /// Connect, validate the service table and subscribe to notifications
    ///
    /// Every notification is decoded, counted and forwarded to the sink from
    /// a dedicated task. Once subscribed, the configured handshake token is
    /// written to the characteristic; a failed write is only reported.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::LinkFailure`] if the connection cannot be
    /// opened, [`ConnectError::ServiceNotFound`] or
    /// [`ConnectError::CharacteristicNotFound`] if the peer does not expose
    /// the sensor endpoints, or [`ConnectError::SubscriptionFailed`]. In every
    /// case the connection has been released and the session is closed.
    pub async fn connect(
        self,
        handle: DeviceHandle,
    ) -> std::result::Result<SubscribedSession<T::Link>, ConnectError> {
        self.connect_until(handle, &CancellationToken::new()).await
    }

    /// Same as [`Session::connect`], giving up as soon as `cancel` fires
    ///
    /// An interrupted connection attempt is abandoned; a link that was
    /// already opened is released before this returns. Nothing is written to
    /// the sensor once `cancel` has fired.
    ///
    /// # Errors
    ///
    /// Everything [`Session::connect`] returns, plus [`ConnectError::Cancelled`].
    pub async fn connect_until(
        self,
        handle: DeviceHandle,
        cancel: &CancellationToken,
    ) -> std::result::Result<SubscribedSession<T::Link>, ConnectError> {
        let current = self.state.get();
        if !matches!(current, SessionState::Idle | SessionState::Scanning) {
            return Err(ConnectError::InvalidState(current));
        }

        self.state.advance(SessionState::Connecting);
        self.sink.notice(&format!("Connecting to {}...", handle.address));

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = self.transport.connect(&handle.address) => Some(result),
        };

        let link = match connected {
            Some(Ok(link)) => link,
            Some(Err(e)) => {
                warn!("Connection error: {e}");
                self.sink.notice(&format!("✗ Connection error: {e}"));
                self.state.advance(SessionState::Closed);
                return Err(ConnectError::LinkFailure(e));
            }
            None => {
                self.interrupted();
                return Err(ConnectError::Cancelled);
            }
        };

        info!("Connected to device: {}", handle.address);
        self.sink.notice("✓ Connected");
        self.release_if_cancelled(&link, cancel).await?;

        let characteristic = match self.validate(&link).await {
            Ok(characteristic) => characteristic,
            Err(e) => {
                self.abort(&link, &e).await;
                return Err(e);
            }
        };
        self.release_if_cancelled(&link, cancel).await?;

        self.state.advance(SessionState::Subscribing);
        let receiver = match link.subscribe(characteristic).await {
            Ok(receiver) => receiver,
            Err(e) => {
                let e = ConnectError::SubscriptionFailed(e);
                self.abort(&link, &e).await;
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            drop(receiver);
            if let Err(e) = link.unsubscribe(characteristic).await {
                warn!("Error during unsubscribe: {e}");
            }
            self.abort(&link, &ConnectError::Cancelled).await;
            return Err(ConnectError::Cancelled);
        }

        let message_count = Arc::new(AtomicU64::new(0));
        let dispatcher = tokio::spawn(dispatch(
            receiver,
            Arc::clone(&self.sink),
            Arc::clone(&message_count),
        ));

        self.state.advance(SessionState::Monitoring);
        info!("Subscribed to {characteristic}");
        self.sink.notice("✓ Subscribed to notifications");

        if let Some(token) = &self.config.handshake {
            match link.write(characteristic, token.as_bytes()).await {
                Ok(()) => self.sink.notice("✓ Handshake sent to sensor"),
                Err(e) => {
                    warn!("Handshake write failed: {e}");
                    self.sink
                        .notice(&format!("Note: could not send handshake message: {e}"));
                }
            }
        }

        Ok(SubscribedSession {
            link: Arc::new(link),
            device: handle,
            characteristic,
            poll_interval: self.config.poll_interval,
            sink: self.sink,
            state: self.state,
            message_count,
            dispatcher: Some(dispatcher),
            subscribed: true,
        })
    }

    /// Scan, connect and monitor until the link drops or `cancel` fires
    ///
    /// The connection is torn down exactly once whatever ends the run.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SensorError::InvalidConfig`], a discovery error or a
    /// connect error. Losing the link while monitoring is a normal exit;
    /// being cancelled before monitoring starts is reported as
    /// [`DiscoveryError::Cancelled`] or [`ConnectError::Cancelled`].
    pub async fn run(self, cancel: &CancellationToken) -> Result<SessionSummary> {
        self.config.validate()?;

        let scanned = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = self.scan() => Some(result),
        };
        let Some(scanned) = scanned else {
            self.interrupted();
            return Err(DiscoveryError::Cancelled.into());
        };

        let handle = scanned?;
        let mut session = self.connect_until(handle, cancel).await?;
        let end = session.monitor(cancel).await;

        Ok(session.summary(end))
    }

    async fn validate(&self, link: &T::Link) -> std::result::Result<Uuid, ConnectError> {
        self.state.advance(SessionState::ValidatingService);

        let services = link.services().await.map_err(ConnectError::LinkFailure)?;

        let service = services
            .iter()
            .find(|s| s.uuid == self.config.service_uuid)
            .ok_or(ConnectError::ServiceNotFound(self.config.service_uuid))?;
        self.sink
            .notice(&format!("✓ Service found: {}", service.uuid));

        let characteristic = service
            .characteristic(self.config.characteristic_uuid)
            .ok_or(ConnectError::CharacteristicNotFound(
                self.config.characteristic_uuid,
            ))?;
        self.sink.notice(&format!(
            "✓ Characteristic found: {}\n  Properties: {:?}",
            characteristic.uuid, characteristic.properties
        ));

        Ok(characteristic.uuid)
    }

    /// Close a session interrupted before it held a link
    fn interrupted(&self) {
        info!("User interruption detected");
        self.sink.notice("⏹ Interrupted by user");
        self.state.advance(SessionState::Closed);
    }

    async fn release_if_cancelled(
        &self,
        link: &T::Link,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ConnectError> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        self.abort(link, &ConnectError::Cancelled).await;
        Err(ConnectError::Cancelled)
    }

    /// Release a link that never reached monitoring
    async fn abort(&self, link: &T::Link, reason: &ConnectError) {
        warn!("Connect phase failed: {reason}");
        self.sink.notice(&format!("✗ {reason}"));

        self.state.advance(SessionState::Disconnecting);
        if let Err(e) = link.disconnect().await {
            warn!("Error during disconnection: {e}");
        }
        self.state.advance(SessionState::Closed);
    }
}

/// Decode, count and forward every notification until the channel closes
async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
    sink: Arc<dyn EventSink>,
    message_count: Arc<AtomicU64>,
) {
    while let Some(payload) = receiver.recv().await {
        let event = decode_bytes(&payload);
        let number = message_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Message #{number}: {}", String::from_utf8_lossy(&payload));

        sink.emit(&event, Local::now());
        if event.is_alert() {
            sink.alert(&event);
        }
    }
    debug!("Notification channel closed");
}

/// A session receiving notifications
///
/// Dropping it without calling [`SubscribedSession::disconnect`] schedules the
/// teardown on the current runtime.
pub struct SubscribedSession<L: Link> {
    link: Arc<L>,
    device: DeviceHandle,
    characteristic: Uuid,
    poll_interval: Duration,
    sink: Arc<dyn EventSink>,
    state: StateCell,
    message_count: Arc<AtomicU64>,
    dispatcher: Option<JoinHandle<()>>,
    subscribed: bool,
}

impl<L: Link> SubscribedSession<L> {
    /// Device this session is attached to
    #[must_use]
    pub const fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Observe state transitions
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            message_count: self.message_count.load(Ordering::Relaxed),
        }
    }

    /// Final report for this session
    #[must_use]
    pub fn summary(&self, end: SessionEnd) -> SessionSummary {
        SessionSummary {
            device: self.device.clone(),
            stats: self.stats(),
            end,
        }
    }

    /// Check whether the link is still up
    ///
    /// A lost link is torn down before this returns.
    pub async fn poll(&mut self) -> LivenessStatus {
        if self.state.get() != SessionState::Monitoring {
            return LivenessStatus::Lost;
        }

        if self.link.is_connected().await {
            return LivenessStatus::Alive;
        }

        warn!("Connection lost");
        self.sink.notice("✗ Connection lost");
        self.disconnect().await;
        LivenessStatus::Lost
    }

    /// Poll liveness on the configured cadence until the link drops or
    /// `cancel` fires, then tear the session down
    pub async fn monitor(&mut self, cancel: &CancellationToken) -> SessionEnd {
        if self.state.get() >= SessionState::Disconnecting {
            return SessionEnd::LinkLost;
        }

        self.sink
            .notice("\n=== Listening for notifications (Ctrl+C to exit) ===\n");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let end = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("User interruption detected");
                    self.sink.notice("⏹ Interrupted by user");
                    break SessionEnd::Cancelled;
                }
                _ = ticker.tick() => {
                    if self.poll().await == LivenessStatus::Lost {
                        break SessionEnd::LinkLost;
                    }
                }
            }
        };

        self.disconnect().await;
        end
    }

    /// Unsubscribe and release the connection
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub async fn disconnect(&mut self) {
        if self.state.get() >= SessionState::Disconnecting {
            return;
        }
        self.state.advance(SessionState::Disconnecting);

        if self.subscribed {
            if let Err(e) = self.link.unsubscribe(self.characteristic).await {
                warn!("Error during unsubscribe: {e}");
            }
            self.subscribed = false;
        }

        if let Err(e) = self.link.disconnect().await {
            warn!("Error during disconnection: {e}");
            self.sink.notice(&format!("Error during disconnection: {e}"));
        }

        if let Some(mut dispatcher) = self.dispatcher.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut dispatcher).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Notification dispatcher failed: {e}"),
                Err(_) => {
                    warn!("Notification dispatcher did not drain in time");
                    dispatcher.abort();
                }
            }
        }

        self.state.advance(SessionState::Closed);
        info!("Disconnected from device");
        self.sink.notice("✓ Disconnected from device");
    }
}

impl<L: Link> fmt::Debug for SubscribedSession<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribedSession")
            .field("device", &self.device)
            .field("characteristic", &self.characteristic)
            .field("state", &self.state.get())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<L: Link> Drop for SubscribedSession<L> {
    fn drop(&mut self) {
        if self.state.get() >= SessionState::Disconnecting {
            return;
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Session dropped outside a runtime; connection not released");
            return;
        };

        self.state.advance(SessionState::Disconnecting);
        let link = Arc::clone(&self.link);
        let state = self.state.clone();
        let characteristic = self.characteristic;
        let subscribed = self.subscribed;

        runtime.spawn(async move {
            if subscribed {
                if let Err(e) = link.unsubscribe(characteristic).await {
                    warn!("Error during unsubscribe: {e}");
                }
            }
            if let Err(e) = link.disconnect().await {
                warn!("Error during disconnection: {e}");
            }
            state.advance(SessionState::Closed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{Reading, TelemetryEvent},
        transport::mock::{sensor_service, MockLink, MockLinkState, MockTransport},
        transport::{CharacteristicInfo, ServiceInfo},
    };
    use btleplug::api::CharPropFlags;
    use chrono::DateTime;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<TelemetryEvent>>,
        alerts: Mutex<Vec<TelemetryEvent>>,
        notices: Mutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &TelemetryEvent, _timestamp: DateTime<Local>) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn alert(&self, event: &TelemetryEvent) {
            self.alerts.lock().unwrap().push(event.clone());
        }

        fn notice(&self, message: &str) {
            self.notices.lock().unwrap().push(message.to_string());
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            poll_interval: Duration::from_millis(10),
            scan_timeout: Duration::from_millis(10),
            ..ClientConfig::default()
        }
    }

    fn sensor() -> DeviceHandle {
        DeviceHandle::new("DiaperSensorESP32", "24:6F:28:00:11:22")
    }

    fn session_over(transport: MockTransport) -> (Session<MockTransport>, MockLink, Arc<RecordingSink>) {
        let link = transport.link.clone();
        let sink = Arc::new(RecordingSink::default());
        let session = Session::new(Arc::new(transport), fast_config(), sink.clone());
        (session, link, sink)
    }

    #[tokio::test]
    async fn test_connect_reaches_monitoring_and_sends_handshake() {
        let (session, link, sink) = session_over(MockTransport::with_sensor());
        let states = session.state_watch();

        let mut subscribed = assert_ok!(session.connect(sensor()).await);

        assert_eq!(subscribed.state(), SessionState::Monitoring);
        assert_eq!(*states.borrow(), SessionState::Monitoring);
        assert_eq!(link.subscribes(), 1);
        assert_eq!(
            *link.state.writes.lock().unwrap(),
            vec![b"CLIENT_CONNECTED".to_vec()]
        );
        assert!(sink
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.starts_with("✓ Service found")));

        subscribed.disconnect().await;
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let (session, link, sink) = session_over(MockTransport::with_sensor());
        let handle = assert_ok!(session.scan().await);
        assert_eq!(session.state(), SessionState::Scanning);

        let mut subscribed = assert_ok!(session.connect(handle).await);
        link.notify("INICIO:v1.0");
        link.notify("ESTADO:SECO:VAL=12");
        link.notify("ALERTA:HUMEDO:VAL=88");
        link.drop_link();

        let end = subscribed.monitor(&CancellationToken::new()).await;
        assert_eq!(end, SessionEnd::LinkLost);

        assert_eq!(
            *sink.events.lock().unwrap(),
            vec![
                TelemetryEvent::Started {
                    detail: "v1.0".to_string()
                },
                TelemetryEvent::StatusDry {
                    raw_value: Reading::Value(12)
                },
                TelemetryEvent::AlertWet {
                    raw_value: Reading::Value(88)
                },
            ]
        );
        assert_eq!(
            *sink.alerts.lock().unwrap(),
            vec![TelemetryEvent::AlertWet {
                raw_value: Reading::Value(88)
            }]
        );
        assert_eq!(subscribed.stats().message_count, 3);
        assert_eq!(subscribed.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_message_count_includes_unrecognized() {
        let (session, link, sink) = session_over(MockTransport::with_sensor());
        let mut subscribed = assert_ok!(session.connect(sensor()).await);

        for raw in ["garbage", "", "ALERTA:HUMEDO", "STATUS:WET:VAL=1:BASE=2", "\u{7f}"] {
            link.notify(raw);
        }
        subscribed.disconnect().await;

        assert_eq!(subscribed.stats().message_count, 5);
        assert_eq!(sink.events.lock().unwrap().len(), 5);
        assert!(sink.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_liveness_loss_tears_down_once() {
        let (session, link, _sink) = session_over(MockTransport::with_sensor());
        let mut subscribed = assert_ok!(session.connect(sensor()).await);

        assert_eq!(subscribed.poll().await, LivenessStatus::Alive);
        link.drop_link();
        assert_eq!(subscribed.poll().await, LivenessStatus::Lost);
        assert_eq!(subscribed.state(), SessionState::Closed);

        subscribed.disconnect().await;
        drop(subscribed);
        tokio::task::yield_now().await;

        assert_eq!(link.unsubscribes(), 1);
        assert_eq!(link.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_monitor_on_closed_session_returns_immediately() {
        let (session, link, sink) = session_over(MockTransport::with_sensor());
        let mut subscribed = assert_ok!(session.connect(sensor()).await);
        subscribed.disconnect().await;

        assert_eq!(subscribed.monitor(&CancellationToken::new()).await, SessionEnd::LinkLost);
        assert!(!sink
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.contains("Listening for notifications")));
        assert_eq!(link.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_once() {
        let (session, link, sink) = session_over(MockTransport::with_sensor());
        let mut subscribed = assert_ok!(session.connect(sensor()).await);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        assert_eq!(subscribed.monitor(&cancel).await, SessionEnd::Cancelled);
        subscribed.disconnect().await;
        drop(subscribed);
        tokio::task::yield_now().await;

        assert_eq!(link.disconnects(), 1);
        assert_eq!(link.unsubscribes(), 1);
        assert!(sink
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.contains("Interrupted")));
    }

    #[tokio::test]
    async fn test_drop_releases_connection() {
        let (session, link, _sink) = session_over(MockTransport::with_sensor());
        let mut states = session.state_watch();
        let subscribed = assert_ok!(session.connect(sensor()).await);

        drop(subscribed);
        states
            .wait_for(|s| *s == SessionState::Closed)
            .await
            .unwrap();

        assert_eq!(link.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_link_failure_closes_without_teardown() {
        let transport = MockTransport {
            fail_connect: true,
            ..MockTransport::with_sensor()
        };
        let (session, link, _sink) = session_over(transport);
        let states = session.state_watch();

        let error = assert_err!(session.connect(sensor()).await);
        assert!(matches!(error, ConnectError::LinkFailure(_)));
        assert_eq!(*states.borrow(), SessionState::Closed);
        assert_eq!(link.disconnects(), 0);
    }

    #[tokio::test]
    async fn test_missing_service_releases_link_once() {
        let transport = MockTransport {
            link: MockLink::with_services(vec![ServiceInfo {
                uuid: Uuid::from_u128(0x1800),
                characteristics: Vec::new(),
            }]),
            ..MockTransport::with_sensor()
        };
        let (session, link, _sink) = session_over(transport);
        let states = session.state_watch();

        let error = assert_err!(session.connect(sensor()).await);
        assert!(matches!(error, ConnectError::ServiceNotFound(uuid) if uuid == crate::SERVICE_UUID));
        assert_eq!(*states.borrow(), SessionState::Closed);
        assert_eq!(link.disconnects(), 1);
        assert_eq!(link.subscribes(), 0);
    }

    #[tokio::test]
    async fn test_missing_characteristic_releases_link_once() {
        let transport = MockTransport {
            link: MockLink::with_services(vec![ServiceInfo {
                uuid: crate::SERVICE_UUID,
                characteristics: vec![CharacteristicInfo {
                    uuid: Uuid::from_u128(0x2A19),
                    properties: CharPropFlags::READ,
                }],
            }]),
            ..MockTransport::with_sensor()
        };
        let (session, link, _sink) = session_over(transport);
        let states = session.state_watch();

        let error = assert_err!(session.connect(sensor()).await);
        assert!(matches!(error, ConnectError::CharacteristicNotFound(_)));
        assert_eq!(*states.borrow(), SessionState::Closed);
        assert_eq!(link.disconnects(), 1);
        assert_eq!(link.subscribes(), 0);
    }

    #[tokio::test]
    async fn test_subscription_failure_releases_link_once() {
        let transport = MockTransport {
            link: MockLink::from_state(MockLinkState {
                services: vec![sensor_service()],
                fail_subscribe: true,
                ..MockLinkState::default()
            }),
            ..MockTransport::with_sensor()
        };
        let (session, link, _sink) = session_over(transport);

        let error = assert_err!(session.connect(sensor()).await);
        assert!(matches!(error, ConnectError::SubscriptionFailed(_)));
        assert_eq!(link.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_handshake_failure_is_not_fatal() {
        let transport = MockTransport {
            link: MockLink::from_state(MockLinkState {
                services: vec![sensor_service()],
                fail_write: true,
                ..MockLinkState::default()
            }),
            ..MockTransport::with_sensor()
        };
        let (session, _link, sink) = session_over(transport);

        let mut subscribed = assert_ok!(session.connect(sensor()).await);
        assert_eq!(subscribed.state(), SessionState::Monitoring);
        assert!(sink
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.starts_with("Note: could not send handshake")));

        subscribed.disconnect().await;
    }

    #[tokio::test]
    async fn test_handshake_can_be_disabled() {
        let transport = MockTransport::with_sensor();
        let link = transport.link.clone();
        let config = ClientConfig {
            handshake: None,
            ..fast_config()
        };
        let session = Session::new(Arc::new(transport), config, Arc::new(RecordingSink::default()));

        let mut subscribed = assert_ok!(session.connect(sensor()).await);
        assert!(link.state.writes.lock().unwrap().is_empty());
        subscribed.disconnect().await;
    }

    #[tokio::test]
    async fn test_scan_miss_closes_session() {
        let transport = MockTransport {
            peers: Vec::new(),
            ..MockTransport::with_sensor()
        };
        let (session, _link, _sink) = session_over(transport);

        let error = assert_err!(session.scan().await);
        assert!(matches!(error, DiscoveryError::NotFound { .. }));
        assert_eq!(session.state(), SessionState::Closed);

        let error = assert_err!(session.connect(sensor()).await);
        assert!(matches!(error, ConnectError::InvalidState(SessionState::Closed)));
    }

    #[tokio::test]
    async fn test_run_until_link_lost() {
        let (session, link, _sink) = session_over(MockTransport::with_sensor());
        let mut states = session.state_watch();
        let cancel = CancellationToken::new();

        let run = tokio::spawn(async move { session.run(&cancel).await });

        states
            .wait_for(|s| *s == SessionState::Monitoring)
            .await
            .unwrap();
        link.notify("BASELINE_UPDATE:300");
        link.notify("CONECTADO:OK");
        link.drop_link();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.end, SessionEnd::LinkLost);
        assert_eq!(summary.stats.message_count, 2);
        assert_eq!(summary.device, sensor());
        assert_eq!(link.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_run_interrupted_before_scan_never_touches_sensor() {
        let (session, link, sink) = session_over(MockTransport::with_sensor());
        let states = session.state_watch();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = assert_err!(session.run(&cancel).await);
        assert!(error.is_cancelled());
        assert_eq!(*states.borrow(), SessionState::Closed);
        assert_eq!(link.subscribes(), 0);
        assert_eq!(link.disconnects(), 0);
        assert!(link.state.writes.lock().unwrap().is_empty());
        assert!(sink
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.contains("Interrupted")));
    }

    #[tokio::test]
    async fn test_connect_interrupted_before_link_opens() {
        let transport = Arc::new(MockTransport::with_sensor());
        let link = transport.link.clone();
        let session = Session::new(
            Arc::clone(&transport),
            fast_config(),
            Arc::new(RecordingSink::default()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = assert_err!(session.connect_until(sensor(), &cancel).await);
        assert!(matches!(error, ConnectError::Cancelled));
        assert_eq!(transport.connects.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(link.disconnects(), 0);
    }

    #[tokio::test]
    async fn test_connect_interrupted_after_link_opens_releases_it() {
        let cancel = CancellationToken::new();
        let transport = MockTransport {
            cancel_on_connect: Some(cancel.clone()),
            ..MockTransport::with_sensor()
        };
        let (session, link, _sink) = session_over(transport);
        let states = session.state_watch();

        let error = assert_err!(session.run(&cancel).await);
        assert!(matches!(error, crate::SensorError::Connect(ConnectError::Cancelled)));
        assert_eq!(*states.borrow(), SessionState::Closed);
        assert_eq!(link.disconnects(), 1);
        assert_eq!(link.subscribes(), 0);
        assert!(link.state.writes.lock().unwrap().is_empty());
    }

    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn emit(&self, _event: &TelemetryEvent, _timestamp: DateTime<Local>) {
            panic!("display went away");
        }

        fn alert(&self, _event: &TelemetryEvent) {}
    }

    #[tokio::test]
    async fn test_teardown_survives_failed_dispatcher() {
        let transport = MockTransport::with_sensor();
        let link = transport.link.clone();
        let session = Session::new(Arc::new(transport), fast_config(), Arc::new(PanickingSink));

        let mut subscribed = assert_ok!(session.connect(sensor()).await);
        link.notify("ESTADO:SECO:VAL=12");
        subscribed.disconnect().await;

        assert_eq!(subscribed.state(), SessionState::Closed);
        assert_eq!(subscribed.stats().message_count, 1);
        assert_eq!(link.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let transport = MockTransport::with_sensor();
        let config = ClientConfig {
            poll_interval: Duration::ZERO,
            ..ClientConfig::default()
        };
        let session = Session::new(Arc::new(transport), config, Arc::new(RecordingSink::default()));

        let result = session.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(crate::SensorError::InvalidConfig(_))));
    }

    #[test]
    fn test_state_cell_is_forward_only() {
        let cell = StateCell::new();
        cell.advance(SessionState::Connecting);
        cell.advance(SessionState::Scanning);
        assert_eq!(cell.get(), SessionState::Connecting);

        cell.advance(SessionState::Closed);
        cell.advance(SessionState::Monitoring);
        assert_eq!(cell.get(), SessionState::Closed);
    }
}
