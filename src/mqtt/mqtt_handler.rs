//! Connection manager: drives [`ConnectionMachine`] with a real rumqttc client.
//!
//! A new `AsyncClient`/`EventLoop` pair is built for every dial so that nothing
//! from a superseded attempt survives into the next one. All machine events go
//! through [`Shared::dispatch`] under a single lock, and reading delivery checks
//! the generation under that same lock. `stop` takes the lock too, so once it
//! returns no callback can fire any more.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    NetworkOptions, Outgoing, Packet, QoS, SubscribeReasonCode, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::config::{BrokerOptions, ConnectionConfig};
use super::machine::{Command, ConnectionEvent, ConnectionMachine, ConnectionState, Generation};
use super::payload::decode_reading;
use crate::error::TransportError;
use crate::reading::SensorReading;

/// Receiving side for decoded readings.
pub type MessageSink = mpsc::UnboundedSender<SensorReading>;
/// Receiving side for every state transition.
pub type StateSink = mpsc::UnboundedSender<ConnectionState>;

struct Inner {
    machine: ConnectionMachine,
    on_message: Option<MessageSink>,
    on_state: Option<StateSink>,
    cancel: CancellationToken,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, inner: &mut Inner, event: ConnectionEvent) -> Command {
        let step = inner.machine.handle(event);
        for state in step.transitions {
            info!(state = %state, "connection state changed");
            self.state_tx.send_replace(state.clone());
            if let Some(sink) = &inner.on_state {
                if sink.send(state).is_err() {
                    debug!("state receiver dropped");
                }
            }
        }
        step.command
    }

    fn dispatch(&self, event: ConnectionEvent) -> Command {
        let mut inner = self.lock();
        self.apply(&mut inner, event)
    }

    fn deliver(&self, generation: Generation, reading: SensorReading) -> bool {
        let inner = self.lock();
        if !inner.machine.accepts(generation) {
            return false;
        }
        if let Some(sink) = &inner.on_message {
            if sink.send(reading).is_err() {
                debug!("message receiver dropped");
            }
        }
        true
    }
}

/// Owns the single logical broker connection and its retry lifecycle.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    options: BrokerOptions,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(policy: BackoffPolicy, options: BrokerOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Inner {
            machine: ConnectionMachine::new(policy),
            on_message: None,
            on_state: None,
            cancel: CancellationToken::new(),
        };
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                state_tx,
            }),
            options,
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().machine.state().clone()
    }

    /// Read-only view of the current state for display purposes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Begins the connection lifecycle. Must be called from within a tokio runtime.
    ///
    /// Does nothing while a lifecycle is already running. An invalid `config`
    /// is not returned as an error; it surfaces as a transition to `Failed`.
    pub fn start(&mut self, config: ConnectionConfig, on_message: MessageSink, on_state: StateSink) {
        let mut inner = self.shared.lock();
        if inner.machine.state().is_active() {
            debug!("start ignored, connection lifecycle already running");
            return;
        }
        inner.on_message = Some(on_message);
        inner.on_state = Some(on_state);

        if let Err(reason) = config.validate() {
            error!("cannot connect with {}: {}", config, reason);
            self.shared
                .apply(&mut inner, ConnectionEvent::ConfigRejected(reason));
            return;
        }

        let Command::Dial { generation } = self.shared.apply(&mut inner, ConnectionEvent::Start)
        else {
            return;
        };

        let cancel = CancellationToken::new();
        inner.cancel = cancel.clone();
        drop(inner);

        info!(broker = %config, "starting connection manager");
        let shared = self.shared.clone();
        let options = self.options.clone();
        self.task = Some(tokio::spawn(drive(shared, config, options, generation, cancel)));
    }

    /// Cancels any pending retry and closes a live connection. Idempotent.
    pub fn stop(&mut self) {
        let mut inner = self.shared.lock();
        inner.cancel.cancel();
        if self.shared.apply(&mut inner, ConnectionEvent::Stop) == Command::Close {
            info!("connection manager stopped");
        }
        inner.on_message = None;
        inner.on_state = None;
        // The driver task notices the cancelled token and closes its client.
        self.task.take();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SessionEnd {
    Cancelled,
    ConnectFailed(TransportError),
    Lost(TransportError),
}

async fn drive(
    shared: Arc<Shared>,
    config: ConnectionConfig,
    options: BrokerOptions,
    mut generation: Generation,
    cancel: CancellationToken,
) {
    loop {
        let event = match session(&shared, &config, &options, generation, &cancel).await {
            SessionEnd::Cancelled => return,
            SessionEnd::ConnectFailed(error) => ConnectionEvent::ConnectFailed { generation, error },
            SessionEnd::Lost(reason) => ConnectionEvent::Lost { generation, reason },
        };

        let Command::Wait {
            generation: timer,
            delay,
        } = shared.dispatch(event)
        else {
            return;
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match shared.dispatch(ConnectionEvent::RetryElapsed { generation: timer }) {
            Command::Dial { generation: next } => generation = next,
            _ => return,
        }
    }
}

fn mqtt_options(config: &ConnectionConfig, options: &BrokerOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(options.client_id(), config.uri(), config.port);
    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(options.clean_session);
    if config.use_ssl {
        mqtt_options.set_transport(Transport::wss_with_default_config());
    } else {
        mqtt_options.set_transport(Transport::Ws);
    }
    mqtt_options
}

async fn session(
    shared: &Shared,
    config: &ConnectionConfig,
    options: &BrokerOptions,
    generation: Generation,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (client, mut eventloop) =
        AsyncClient::new(mqtt_options(config, options), options.request_capacity);
    // rumqttc bounds the TCP + CONNECT exchange on its own, 5 s unless told otherwise.
    let timeout_secs = options.connect_timeout.as_secs().max(1);
    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(timeout_secs);
    eventloop.set_network_options(network_options);
    info!(generation, uri = %config.uri(), "dialing broker");

    let handshake = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        res = tokio::time::timeout(
            options.connect_timeout,
            handshake(&client, &mut eventloop, &config.topic, timeout_secs),
        ) => res,
    };
    match handshake {
        Err(_) => return SessionEnd::ConnectFailed(TransportError::Timeout(timeout_secs)),
        Ok(Err(e)) => return SessionEnd::ConnectFailed(e),
        Ok(Ok(())) => {}
    }

    shared.dispatch(ConnectionEvent::Connected { generation });
    info!(generation, topic = %config.topic, "subscribed");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                close(&client, &mut eventloop).await;
                return SessionEnd::Cancelled;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match decode_reading(&publish.payload) {
                        Ok(reading) => {
                            if !shared.deliver(generation, reading) {
                                debug!(generation, "reading from superseded connection dropped");
                            }
                        }
                        Err(e) => warn!(topic = %publish.topic, "dropping malformed payload: {}", e),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return SessionEnd::Lost(TransportError::Disconnected);
                }
                Ok(_) => {}
                Err(e) => return SessionEnd::Lost(TransportError::Connection(e.to_string())),
            }
        }
    }
}

async fn handshake(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    topic: &str,
    timeout_secs: u64,
) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if !matches!(ack.code, ConnectReturnCode::Success) {
                    return Err(TransportError::Refused(format!("{:?}", ack.code)));
                }
                debug!(topic, "connected, subscribing");
                client
                    .subscribe(topic, QoS::AtLeastOnce)
                    .await
                    .map_err(|e| TransportError::Client(e.to_string()))?;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(TransportError::SubscribeRejected(topic.to_string()));
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(TransportError::Refused(format!("{code:?}")))
            }
            Err(ConnectionError::NetworkTimeout) => {
                return Err(TransportError::Timeout(timeout_secs))
            }
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

async fn close(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.disconnect().await {
        debug!("disconnect request failed: {}", e);
        return;
    }
    let flushed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("broker did not acknowledge disconnect in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".into(),
            port: 1,
            topic: "test/readings".into(),
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn invalid_config_fails_without_dialing() {
        let mut manager = ConnectionManager::new(BackoffPolicy::default(), BrokerOptions::default());
        let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();

        let config = ConnectionConfig {
            host: String::new(),
            ..ConnectionConfig::default()
        };
        manager.start(config, msg_tx, state_tx);

        assert_eq!(state_rx.try_recv().unwrap(), ConnectionState::Failed);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.task.is_none());
    }

    #[tokio::test]
    async fn second_start_while_running_is_ignored() {
        let mut manager = ConnectionManager::new(BackoffPolicy::default(), BrokerOptions::default());
        let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();

        manager.start(unreachable_config(), msg_tx.clone(), state_tx.clone());
        assert_eq!(state_rx.try_recv().unwrap(), ConnectionState::Connecting);
        let generation = manager.shared.lock().machine.generation();

        manager.start(unreachable_config(), msg_tx, state_tx);
        assert_eq!(manager.shared.lock().machine.generation(), generation);

        manager.stop();
    }

    #[tokio::test]
    async fn no_callbacks_after_stop() {
        let mut manager = ConnectionManager::new(BackoffPolicy::default(), BrokerOptions::default());
        let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let watcher = manager.subscribe_state();

        manager.start(unreachable_config(), msg_tx, state_tx);
        manager.stop();
        manager.stop();

        let mut seen = Vec::new();
        while let Ok(state) = state_rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen.first(), Some(&ConnectionState::Connecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
        assert_eq!(*watcher.borrow(), ConnectionState::Disconnected);

        // The sender side was released by stop, so the channel ends here.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            state_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_reconnecting_never_dials_again() {
        let mut manager = ConnectionManager::new(BackoffPolicy::default(), BrokerOptions::default());
        let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let watcher = manager.subscribe_state();

        manager.start(unreachable_config(), msg_tx, state_tx);
        assert_eq!(state_rx.recv().await, Some(ConnectionState::Connecting));
        assert_eq!(
            state_rx.recv().await,
            Some(ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(2),
            })
        );

        manager.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut after_stop = Vec::new();
        while let Some(state) = state_rx.recv().await {
            after_stop.push(state);
        }
        assert_eq!(after_stop, vec![ConnectionState::Disconnected]);
        assert_eq!(*watcher.borrow(), ConnectionState::Disconnected);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_dial_is_reported_as_connect_failure() {
        let manager = ConnectionManager::new(BackoffPolicy::default(), BrokerOptions::default());
        let end = session(
            &manager.shared,
            &unreachable_config(),
            &BrokerOptions::default(),
            1,
            &CancellationToken::new(),
        )
        .await;

        match end {
            SessionEnd::ConnectFailed(error @ TransportError::Connect(_)) => {
                assert!(error.to_string().starts_with("could not reach broker"));
            }
            SessionEnd::ConnectFailed(other) => panic!("unexpected connect error: {other}"),
            _ => panic!("dial to a closed port did not fail"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_times_out_after_configured_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts the TCP connection and never answers the websocket upgrade.
        let silent = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let manager = ConnectionManager::new(BackoffPolicy::default(), BrokerOptions::default());
        let options = BrokerOptions {
            connect_timeout: Duration::from_secs(12),
            ..BrokerOptions::default()
        };
        let config = ConnectionConfig {
            port,
            ..unreachable_config()
        };

        let started = tokio::time::Instant::now();
        let end = session(&manager.shared, &config, &options, 1, &CancellationToken::new()).await;

        assert!(started.elapsed() >= Duration::from_secs(12));
        assert!(matches!(
            end,
            SessionEnd::ConnectFailed(TransportError::Timeout(12))
        ));
        silent.abort();
    }

    #[tokio::test]
    async fn stale_generation_is_not_delivered() {
        let manager = ConnectionManager::new(BackoffPolicy::default(), BrokerOptions::default());
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        {
            let mut inner = manager.shared.lock();
            inner.on_message = Some(msg_tx);
            inner.machine.handle(ConnectionEvent::Start);
            let generation = inner.machine.generation();
            inner.machine.handle(ConnectionEvent::Connected { generation });
        }
        let current = manager.shared.lock().machine.generation();

        let reading = crate::reading::fixtures::reading(20.0);
        assert!(!manager.shared.deliver(current - 1, reading.clone()));
        assert!(manager.shared.deliver(current, reading));
        assert_eq!(msg_rx.try_recv().unwrap().temperature, 20.0);
        assert!(msg_rx.try_recv().is_err());
    }
}
