//! MQTT connection lifecycle with startup retry and automatic reconnection.
//!
//! The manager owns the single broker connection of the process. Inbound publishes are
//! forwarded onto a bounded channel consumed by the telemetry pipeline without waiting, so
//! store latency never runs on the event loop; a full channel drops the message. Once the first connection succeeds, transport loss is
//! handled inside the event loop task: the state moves to `Reconnecting`, the loop backs
//! off and polls again, and every topic is subscribed again after the next ConnAck.

use crate::config::MqttConfig;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Errors that can occur during MQTT operations.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection refused by broker: {0}")]
    Refused(String),

    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("connection manager has been shut down")]
    Shutdown,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<MqttError> },
}

/// State of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// A publish received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Outbound publishing seam used by the command publisher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a message and wait until the broker has acknowledged it (QoS 1 and 2) or it
    /// has been written to the connection (QoS 0), bounded by the publish timeout
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;
}


/// Owns the broker connection and its event loop task.
pub struct ConnectionManager {
    config: MqttConfig,
    topics: Vec<String>,
    state: Arc<RwLock<ConnectionState>>,
    client: Mutex<Option<AsyncClient>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    messages: mpsc::Sender<InboundMessage>,
    publishes: Arc<Mutex<PublishTracker>>,
}

impl ConnectionManager {
    /// Create a manager subscribed to the configured sensor topic, and the receiver
    /// inbound messages are delivered on.
    pub fn new(config: MqttConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let topics = vec![config.sensor_topic.clone()];

        let manager = Self {
            config,
            topics,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            client: Mutex::new(None),
            event_task: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            messages: tx,
            publishes: Arc::new(Mutex::new(PublishTracker::default())),
        };

        (manager, rx)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Topics (re-)subscribed on every successful connection
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "MQTT connection state changed");
        }
    }

    /// Make a single connection attempt.
    ///
    /// Blocks until the broker acknowledges the connection or the attempt fails. Once a
    /// session has been established, later calls return immediately and transport loss is
    /// left to the event loop's own reconnection. A [`disconnect`](Self::disconnect) while
    /// the attempt is in flight wins: the new session is dropped and `Shutdown` returned.
    #[instrument(skip(self), fields(broker = %self.config.broker, client_id = %self.config.client_id))]
    pub async fn connect(&self) -> Result<(), MqttError> {
        let _guard = self.connect_lock.lock().await;

        if self.shutdown.is_cancelled() {
            return Err(MqttError::Shutdown);
        }
        if self.event_task.lock().is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);

        let established = tokio::select! {
            _ = self.shutdown.cancelled() => Err(MqttError::Shutdown),
            result = self.establish() => result,
        };

        let (client, eventloop) = match established {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                if !matches!(e, MqttError::Shutdown) {
                    metrics::counter!("mqtt.connect.failures").increment(1);
                }
                return Err(e);
            }
        };

        // disconnect() cancels under this lock, so the check and the spawn cannot straddle it
        let mut event_task = self.event_task.lock();
        if self.shutdown.is_cancelled() {
            drop(event_task);
            self.set_state(ConnectionState::Disconnected);
            debug!("Disconnected while connecting, dropping new session");
            return Err(MqttError::Shutdown);
        }

        let context = EventLoopContext {
            client: client.clone(),
            topics: self.topics.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            messages: self.messages.clone(),
            publishes: self.publishes.clone(),
            reconnect: reconnect_backoff(&self.config),
            reconnect_cap: self.config.reconnect_max_delay(),
        };

        *self.client.lock() = Some(client);
        self.set_state(ConnectionState::Connected);
        *event_task = Some(tokio::spawn(run_event_loop(eventloop, context)));
        drop(event_task);

        metrics::counter!("mqtt.connects").increment(1);
        info!(topics = ?self.topics, "Connected to MQTT broker");

        Ok(())
    }

    async fn establish(&self) -> Result<(AsyncClient, EventLoop), MqttError> {
        let options = mqtt_options(&self.config)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.config.channel_capacity.max(1));

        let timeout = self.config.connect_timeout();
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| MqttError::ConnectTimeout(timeout))??;

        // Queued now, sent by the event loop task once it starts polling
        for topic in &self.topics {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| MqttError::SubscribeFailed(e.to_string()))?;
        }

        Ok((client, eventloop))
    }

    /// Call [`connect`](Self::connect) up to `max_attempts` times, sleeping with exponential
    /// backoff between attempts. Returns the last error once every attempt has failed, or
    /// `Shutdown` as soon as the manager is disconnected.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<(), MqttError> {
        retry_with_backoff(
            max_attempts,
            connect_backoff(&self.config),
            &self.shutdown,
            |attempt| {
                debug!(attempt, max_attempts, "Connecting to MQTT broker");
                self.connect()
            },
        )
        .await
    }

    /// Disconnect from the broker.
    ///
    /// In-flight acknowledgments get the configured grace period, after which the event loop
    /// task is aborted. Terminal and idempotent: a shut down manager never reconnects.
    pub async fn disconnect(&self) {
        let already_shut_down = {
            let _event_task = self.event_task.lock();
            let cancelled = self.shutdown.is_cancelled();
            // Also wakes the event loop if it is sleeping between reconnect attempts
            self.shutdown.cancel();
            cancelled
        };

        if already_shut_down {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "Failed to queue MQTT disconnect");
            }
        }

        let task = self.event_task.lock().take();
        if let Some(mut task) = task {
            let grace = self.config.disconnect_grace();
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "MQTT event loop did not stop in time, aborting");
                task.abort();
            }
        }

        // Unacknowledged publishes fail now rather than at their timeout
        self.publishes.lock().clear();

        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected from MQTT broker");
    }
}

#[async_trait]
impl MessagePublisher for ConnectionManager {
    #[instrument(skip(self, payload), fields(payload_size = payload.len()))]
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.state() != ConnectionState::Connected {
            return Err(MqttError::NotConnected);
        }
        let client = self.client.lock().clone().ok_or(MqttError::NotConnected)?;

        let (waiter, delivered) = oneshot::channel();
        {
            // Held across the enqueue so waiters line up with the client's request order
            let mut publishes = self.publishes.lock();
            client
                .try_publish(topic, qos, retain, payload)
                .map_err(|e| MqttError::PublishFailed(e.to_string()))?;
            publishes.queue(qos, waiter);
        }

        let timeout = self.config.publish_timeout();
        tokio::time::timeout(timeout, delivered)
            .await
            .map_err(|_| MqttError::PublishTimeout(timeout))?
            .map_err(|_| {
                MqttError::PublishFailed("connection closed before acknowledgment".to_string())
            })?;

        metrics::counter!("mqtt.messages.published").increment(1);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Publishes waiting on the broker, matched to packet ids as the event loop sends them.
///
/// The client hands requests to the event loop in order, so every outgoing publish belongs
/// to the oldest queued waiter. Retransmissions reuse an in-flight id and claim nothing.
#[derive(Default)]
struct PublishTracker {
    queued: VecDeque<(QoS, oneshot::Sender<()>)>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl PublishTracker {
    fn queue(&mut self, qos: QoS, waiter: oneshot::Sender<()>) {
        self.queued.push_back((qos, waiter));
    }

    fn sent(&mut self, pkid: u16) {
        if self.in_flight.contains_key(&pkid) {
            return;
        }

        if let Some((qos, waiter)) = self.queued.pop_front() {
            if qos == QoS::AtMostOnce {
                let _ = waiter.send(());
            } else {
                self.in_flight.insert(pkid, waiter);
            }
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(waiter) = self.in_flight.remove(&pkid) {
            // The caller may have timed out already
            let _ = waiter.send(());
        }
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

/// Run `op` up to `max_attempts` times, sleeping with `backoff` between attempts only.
///
/// `MqttError::Shutdown` from `op`, or `shutdown` firing during a sleep, stops the loop
/// immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    max_attempts: u32,
    mut backoff: ExponentialBackoff,
    shutdown: &CancellationToken,
    mut op: F,
) -> Result<T, MqttError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, MqttError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if shutdown.is_cancelled() {
            return Err(MqttError::Shutdown);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(MqttError::Shutdown) => return Err(MqttError::Shutdown),
            Err(e) if attempt >= max_attempts => {
                error!(attempts = attempt, error = %e, "Giving up on MQTT connection");
                return Err(MqttError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "MQTT connection attempt failed, retrying"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => return Err(MqttError::Shutdown),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Startup retry schedule: doubling from the initial delay up to the cap, no jitter
pub fn connect_backoff(config: &MqttConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.connect_retry_initial())
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(config.connect_retry_max())
        .with_max_elapsed_time(None)
        .build()
}

fn reconnect_backoff(config: &MqttConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.reconnect_base_delay())
        .with_multiplier(2.0)
        .with_max_interval(config.reconnect_max_delay())
        .with_max_elapsed_time(None)
        .build()
}

fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, MqttError> {
    let (host, port) = parse_broker_url(&config.broker)?;

    let mut options = MqttOptions::new(&config.client_id, host, port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);

    if let Some(ref username) = config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    Ok(options)
}

/// Parse broker URL in format tcp://host:port, mqtt://host:port, host:port or host
pub fn parse_broker_url(url: &str) -> Result<(String, u16), MqttError> {
    let address = url
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| MqttError::InvalidBrokerUrl(url.to_string()))?;
            (host, port)
        }
        None => (address, DEFAULT_MQTT_PORT),
    };

    if host.is_empty() || host.contains('/') {
        return Err(MqttError::InvalidBrokerUrl(url.to_string()));
    }

    Ok((host.to_string(), port))
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), MqttError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(MqttError::Refused(format!("{code:?}")))
            }
            Err(e) => return Err(MqttError::ConnectionFailed(e.to_string())),
        }
    }
}

/// Hand an inbound message to ingestion without waiting; a full channel drops it
fn forward_inbound(messages: &mpsc::Sender<InboundMessage>, message: InboundMessage) {
    match messages.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            metrics::counter!("telemetry.messages.dropped", "reason" => "backpressure")
                .increment(1);
            warn!(topic = %message.topic, "Ingestion is behind, dropping message");
        }
        Err(TrySendError::Closed(message)) => {
            debug!(topic = %message.topic, "Inbound channel closed, dropping message");
        }
    }
}

struct EventLoopContext {
    client: AsyncClient,
    topics: Vec<String>,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
    messages: mpsc::Sender<InboundMessage>,
    publishes: Arc<Mutex<PublishTracker>>,
    reconnect: ExponentialBackoff,
    reconnect_cap: Duration,
}

/// Drive the connection after the first ConnAck until disconnect
async fn run_event_loop(mut eventloop: EventLoop, mut ctx: EventLoopContext) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                metrics::counter!("mqtt.messages.received").increment(1);

                forward_inbound(
                    &ctx.messages,
                    InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    },
                );
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                ctx.publishes.lock().sent(pkid);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                ctx.publishes.lock().acknowledged(ack.pkid);
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                ctx.publishes.lock().acknowledged(comp.pkid);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                *ctx.state.write() = ConnectionState::Connected;
                ctx.reconnect.reset();
                metrics::counter!("mqtt.reconnects").increment(1);
                info!("Reconnected to MQTT broker");

                // Subscriptions do not survive a clean-session reconnect
                for topic in &ctx.topics {
                    if let Err(e) = ctx.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        error!(topic = %topic, error = %e, "Failed to resubscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if ctx.shutdown.is_cancelled() {
                    break;
                }

                *ctx.state.write() = ConnectionState::Reconnecting;
                let delay = ctx.reconnect.next_backoff().unwrap_or(ctx.reconnect_cap);
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "MQTT connection lost, reconnecting"
                );

                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::Instant;

    const CONNECT: u8 = 0x10;
    const SUBSCRIBE: u8 = 0x82;
    const PUBLISH_QOS1: u8 = 0x32;
    const PINGREQ: u8 = 0xC0;

    fn unreachable_config() -> MqttConfig {
        MqttConfig {
            // Nothing listens on port 1
            broker: "tcp://127.0.0.1:1".to_string(),
            connect_timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.local:8883").unwrap(),
            ("broker.local".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("10.0.0.5").unwrap(),
            ("10.0.0.5".to_string(), 1883)
        );
        assert!(matches!(
            parse_broker_url("tcp://localhost:mqtt"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            parse_broker_url("tcp://:1883"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_connect_backoff_schedule() {
        let mut backoff = connect_backoff(&MqttConfig::default());

        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_backoff().unwrap().as_secs())
            .collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delays_and_last_error() {
        let attempts_at = Arc::new(Mutex::new(Vec::new()));
        let recorded = attempts_at.clone();
        let started = Instant::now();
        let never = CancellationToken::new();

        let result: Result<(), MqttError> =
            retry_with_backoff(3, connect_backoff(&MqttConfig::default()), &never, |attempt| {
                recorded.lock().push(Instant::now());
                async move { Err(MqttError::Refused(format!("attempt {attempt}"))) }
            })
            .await;

        let attempts_at = attempts_at.lock().clone();
        assert_eq!(attempts_at.len(), 3);

        let tolerance = Duration::from_millis(10);
        let first_gap = attempts_at[1] - attempts_at[0];
        let second_gap = attempts_at[2] - attempts_at[1];
        assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_secs(1) + tolerance);
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_secs(2) + tolerance);

        // No sleep after the final attempt
        assert!(started.elapsed() < Duration::from_secs(3) + tolerance);

        match result {
            Err(MqttError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, MqttError::Refused(ref reason) if reason == "attempt 3"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);

        let never = CancellationToken::new();

        let value = retry_with_backoff(5, connect_backoff(&MqttConfig::default()), &never, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(MqttError::ConnectionFailed("refused".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_shutdown() {
        let calls = AtomicU32::new(0);
        let never = CancellationToken::new();

        let result: Result<(), MqttError> =
            retry_with_backoff(5, connect_backoff(&MqttConfig::default()), &never, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MqttError::Shutdown) }
            })
            .await;

        assert!(matches!(result, Err(MqttError::Shutdown)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let (manager, _rx) = ConnectionManager::new(unreachable_config());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(
            err,
            MqttError::ConnectionFailed(_) | MqttError::ConnectTimeout(_)
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let (manager, _rx) = ConnectionManager::new(MqttConfig::default());

        let err = manager
            .publish("control/abc/command", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await
            .unwrap_err();

        assert!(matches!(err, MqttError::NotConnected));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_terminal() {
        let (manager, _rx) = ConnectionManager::new(unreachable_config());

        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        assert!(matches!(manager.connect().await, Err(MqttError::Shutdown)));
        assert!(matches!(
            manager.connect_with_retry(3).await,
            Err(MqttError::Shutdown)
        ));
    }

    #[test]
    fn test_manager_subscribes_sensor_topic() {
        let (manager, _rx) = ConnectionManager::new(MqttConfig::default());
        assert_eq!(manager.topics(), ["sensors/+/data".to_string()]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleep_interrupted_by_shutdown() {
        let calls = AtomicU32::new(0);
        let shutdown = CancellationToken::new();
        let started = Instant::now();

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let result: Result<(), MqttError> =
            retry_with_backoff(5, connect_backoff(&MqttConfig::default()), &shutdown, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MqttError::ConnectionFailed("refused".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(MqttError::Shutdown)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Woken mid-sleep, not after the full 1s delay
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_disconnect_stops_connect_with_retry() {
        let manager = Arc::new(ConnectionManager::new(unreachable_config()).0);
        let started = Instant::now();

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect_with_retry(5).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.disconnect().await;

        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .expect("retry did not stop after disconnect")
            .unwrap();

        assert!(matches!(result, Err(MqttError::Shutdown)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_tracker_matches_packet_ids() {
        let mut tracker = PublishTracker::default();
        let (first, mut first_done) = oneshot::channel();
        let (second, mut second_done) = oneshot::channel();
        let (fire_and_forget, fire_and_forget_done) = oneshot::channel();

        tracker.queue(QoS::AtLeastOnce, first);
        tracker.queue(QoS::AtLeastOnce, second);
        tracker.queue(QoS::AtMostOnce, fire_and_forget);

        tracker.sent(7);
        // Retransmission of 7 after a reconnect must not claim the next waiter
        tracker.sent(7);
        tracker.sent(8);
        tracker.sent(0);
        fire_and_forget_done.await.unwrap();

        tracker.acknowledged(8);
        second_done.try_recv().unwrap();
        assert!(first_done.try_recv().is_err());

        tracker.acknowledged(7);
        first_done.try_recv().unwrap();

        // Unknown ids are ignored
        tracker.acknowledged(9);
        assert!(tracker.in_flight.is_empty() && tracker.queued.is_empty());
    }

    #[test]
    fn test_forward_inbound_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let message = |topic: &str| InboundMessage {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
            received_at: Utc::now(),
        };

        forward_inbound(&tx, message("sensors/a/data"));
        forward_inbound(&tx, message("sensors/b/data"));

        assert_eq!(rx.try_recv().unwrap().topic, "sensors/a/data");
        assert!(rx.try_recv().is_err());

        drop(rx);
        forward_inbound(&tx, message("sensors/c/data"));
    }

    /// Control packet received by the test broker
    #[derive(Debug)]
    struct Captured {
        session: usize,
        header: u8,
        body: Vec<u8>,
    }

    #[derive(Debug, Clone, Copy, Default)]
    struct BrokerBehavior {
        connack_delay: Duration,
        ack_publishes: bool,
        close_first_session: bool,
        sensor_messages: usize,
    }

    /// Minimal MQTT 3.1.1 broker on a local port
    async fn spawn_broker(behavior: BrokerBehavior) -> (String, mpsc::UnboundedReceiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut session = 0;
            while let Ok((stream, _)) = listener.accept().await {
                session += 1;
                tokio::spawn(serve_session(stream, session, behavior, tx.clone()));
            }
        });

        (format!("tcp://{addr}"), rx)
    }

    async fn serve_session(
        mut stream: TcpStream,
        session: usize,
        behavior: BrokerBehavior,
        captured: mpsc::UnboundedSender<Captured>,
    ) -> std::io::Result<()> {
        loop {
            let (header, body) = read_packet(&mut stream).await?;
            let _ = captured.send(Captured {
                session,
                header,
                body: body.clone(),
            });

            match header {
                CONNECT => {
                    tokio::time::sleep(behavior.connack_delay).await;
                    stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?;
                }
                SUBSCRIBE => {
                    stream.write_all(&[0x90, 0x03, body[0], body[1], 0x01]).await?;
                    for _ in 0..behavior.sensor_messages {
                        stream
                            .write_all(&sensor_publish("sensors/SWF-0042/data", b"{}"))
                            .await?;
                    }
                    if behavior.close_first_session && session == 1 {
                        return Ok(());
                    }
                }
                PUBLISH_QOS1 if behavior.ack_publishes => {
                    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                    let pkid = &body[2 + topic_len..4 + topic_len];
                    stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await?;
                }
                PINGREQ => stream.write_all(&[0xD0, 0x00]).await?,
                _ => {}
            }
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;

        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn sensor_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    async fn next_packet(
        captured: &mut mpsc::UnboundedReceiver<Captured>,
        session: usize,
        header: u8,
    ) -> Captured {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let packet = captured.recv().await.expect("broker stopped");
                if packet.session == session && packet.header == header {
                    return packet;
                }
            }
        })
        .await
        .expect("broker never received the packet")
    }

    async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {state:?}, stuck in {:?}", manager.state()));
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle.as_bytes())
    }

    fn broker_config(broker: String) -> MqttConfig {
        MqttConfig {
            broker,
            connect_timeout_secs: 5,
            publish_timeout_secs: 1,
            reconnect_base_delay_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_times_out_without_puback() {
        let (url, mut captured) = spawn_broker(BrokerBehavior::default()).await;
        let (manager, _rx) = ConnectionManager::new(broker_config(url));
        manager.connect().await.unwrap();

        let started = Instant::now();
        let err = manager
            .publish("control/SWF-0042/command", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await
            .unwrap_err();

        assert!(matches!(err, MqttError::PublishTimeout(timeout) if timeout == Duration::from_secs(1)));
        assert!(started.elapsed() >= Duration::from_secs(1));

        // The packet did reach the broker; only the acknowledgment was missing
        let publish = next_packet(&mut captured, 1, PUBLISH_QOS1).await;
        assert!(contains(&publish.body, "control/SWF-0042/command"));

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_publish_returns_after_puback() {
        let (url, mut captured) = spawn_broker(BrokerBehavior {
            ack_publishes: true,
            ..Default::default()
        })
        .await;
        let (manager, _rx) = ConnectionManager::new(broker_config(url));
        manager.connect().await.unwrap();

        for _ in 0..3 {
            manager
                .publish("control/SWF-0042/command", b"{}".to_vec(), QoS::AtLeastOnce, false)
                .await
                .unwrap();
        }

        let publish = next_packet(&mut captured, 1, PUBLISH_QOS1).await;
        assert!(contains(&publish.body, "control/SWF-0042/command"));

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_publish() {
        let (url, _captured) = spawn_broker(BrokerBehavior::default()).await;
        let manager = Arc::new(ConnectionManager::new(broker_config(url)).0);
        manager.connect().await.unwrap();

        let publishing = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .publish("control/SWF-0042/command", b"{}".to_vec(), QoS::AtLeastOnce, false)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        manager.disconnect().await;

        let err = publishing.await.unwrap().unwrap_err();
        assert!(matches!(err, MqttError::PublishFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_wins() {
        let (url, _captured) = spawn_broker(BrokerBehavior {
            connack_delay: Duration::from_millis(300),
            ..Default::default()
        })
        .await;
        let manager = Arc::new(ConnectionManager::new(broker_config(url)).0);

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.disconnect().await;

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(MqttError::Shutdown)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Nothing comes back up once the delayed CONNACK arrives
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_sensor_topic() {
        let (url, mut captured) = spawn_broker(BrokerBehavior {
            close_first_session: true,
            ..Default::default()
        })
        .await;
        let (manager, _rx) = ConnectionManager::new(broker_config(url));

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        next_packet(&mut captured, 1, SUBSCRIBE).await;

        // The broker drops the first session right after its SUBACK
        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        wait_for_state(&manager, ConnectionState::Connected).await;

        let resubscribe = next_packet(&mut captured, 2, SUBSCRIBE).await;
        assert!(contains(&resubscribe.body, "sensors/+/data"));

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_full_inbound_channel_keeps_event_loop_running() {
        let (url, mut captured) = spawn_broker(BrokerBehavior {
            ack_publishes: true,
            sensor_messages: 5,
            ..Default::default()
        })
        .await;
        let (manager, mut rx) = ConnectionManager::new(MqttConfig {
            channel_capacity: 1,
            ..broker_config(url)
        });

        manager.connect().await.unwrap();
        next_packet(&mut captured, 1, SUBSCRIBE).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Needs the loop to read the PUBACK queued behind the sensor messages
        manager
            .publish("control/SWF-0042/command", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap().topic, "sensors/SWF-0042/data");
        assert!(rx.try_recv().is_err());

        manager.disconnect().await;
    }
}
