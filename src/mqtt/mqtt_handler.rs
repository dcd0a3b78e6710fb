//! Connection lifecycle and event dispatch for the subscriber session.
//!
//! The network side ([`MqttHandler`]) owns the rumqttc event loop on its own
//! tokio task and forwards [`SessionEvent`]s over a bounded channel. The
//! consumer side ([`Session`]) reacts to each event to completion on the main
//! task; [`supervise`] ties both together until interrupt or a fatal error.
//!
//! ```text
//! EventLoop::poll ──► transition() ──[SessionEvent]──► Session::handle_event ──► stdout
//!   (network task)                   (mpsc, 100)          (main task)
//! ```

use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing,
    Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::{ConnectionConfig, ReconnectPolicy};
use super::error::{is_authorization_code, SessionError};
use super::message_manager::MQTTMessage;

/// Capacity of the network → session event channel.
pub const EVENT_CAPACITY: usize = 100;

const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Disconnect code reported when the connection drops without a DISCONNECT
/// from our side.
pub const CONNECTION_LOST_CODE: u8 = 7;

macro_rules! say {
    ($out:expr, $($arg:tt)*) => {
        if let Err(err) = writeln!($out, $($arg)*).and_then(|()| $out.flush()) {
            warn!("Failed to write to output: {}", err);
        }
    };
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    DisconnectedWithError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We sent DISCONNECT during shutdown.
    Requested,
    /// Broker closed the session or the transport failed.
    ConnectionLost(String),
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        match self {
            DisconnectReason::Requested => 0,
            DisconnectReason::ConnectionLost(_) => CONNECTION_LOST_CODE,
        }
    }
}

/// What the network task reports to the session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Transport could not be established before any acknowledgment.
    ConnectFailed(String),
    /// CONNACK with its numeric return code.
    ConnAck(u8),
    /// A reconnect attempt was refused with a code other than 4 or 5. The
    /// loop keeps retrying according to the reconnect policy.
    ReconnectRefused(u8),
    SubAck(Vec<SubscribeReasonCode>),
    Message(MQTTMessage),
    Disconnected(DisconnectReason),
}

/// Numeric MQTT 3.1.1 CONNACK return code.
pub fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// What the network loop does after handling one poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    /// Wait for the reconnect delay, then poll again (rumqttc reconnects).
    Backoff,
    Stop,
}

/// Maps one `EventLoop::poll` result onto the connection state machine.
pub fn transition(
    state: &mut ConnectionState,
    polled: Result<Event, ConnectionError>,
    reconnect: &ReconnectPolicy,
) -> (Option<SessionEvent>, Next) {
    let lost = if reconnect.enabled { Next::Backoff } else { Next::Stop };

    match polled {
        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
            let code = return_code(ack.code);
            if code == 0 {
                debug!("Connection acknowledged (session present: {})", ack.session_present);
                *state = ConnectionState::Connected;
                (Some(SessionEvent::ConnAck(code)), Next::Continue)
            } else {
                refused(state, code, lost)
            }
        }
        Ok(Event::Incoming(Packet::Publish(publish))) => (
            Some(SessionEvent::Message(MQTTMessage::from(publish))),
            Next::Continue,
        ),
        Ok(Event::Incoming(Packet::SubAck(ack))) => {
            (Some(SessionEvent::SubAck(ack.return_codes)), Next::Continue)
        }
        Ok(Event::Incoming(Packet::Disconnect)) => {
            *state = ConnectionState::DisconnectedWithError;
            let reason = DisconnectReason::ConnectionLost("broker sent DISCONNECT".into());
            (Some(SessionEvent::Disconnected(reason)), lost)
        }
        Ok(other) => {
            trace!("Ignoring {:?}", other);
            (None, Next::Continue)
        }
        Err(ConnectionError::ConnectionRefused(code)) => refused(state, return_code(code), lost),
        Err(err) => match *state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                *state = ConnectionState::DisconnectedWithError;
                (Some(SessionEvent::ConnectFailed(err.to_string())), Next::Stop)
            }
            ConnectionState::Connected => {
                *state = ConnectionState::DisconnectedWithError;
                let reason = DisconnectReason::ConnectionLost(err.to_string());
                (Some(SessionEvent::Disconnected(reason)), lost)
            }
            ConnectionState::DisconnectedWithError => {
                warn!("Reconnect attempt failed: {}", err);
                (None, lost)
            }
        },
    }
}

/// A refusal on the first connect is fatal. On a reconnect only bad
/// credentials are; anything else (a restarting broker answering 3) is retried.
fn refused(state: &mut ConnectionState, code: u8, lost: Next) -> (Option<SessionEvent>, Next) {
    let reconnecting = *state == ConnectionState::DisconnectedWithError;
    *state = ConnectionState::DisconnectedWithError;
    if reconnecting && !is_authorization_code(code) {
        warn!("Reconnect refused with code {}", code);
        (Some(SessionEvent::ReconnectRefused(code)), lost)
    } else {
        (Some(SessionEvent::ConnAck(code)), Next::Stop)
    }
}

/// Owns the rumqttc event loop. Runs on its own task until cancelled or until
/// the connection ends for good.
pub struct MqttHandler {
    client: AsyncClient,
    eventloop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    reconnect: ReconnectPolicy,
    shutdown: CancellationToken,
    state: ConnectionState,
}

impl MqttHandler {
    /// Creates the client and starts the network loop. No I/O happens before
    /// the spawned task polls for the first time.
    pub fn spawn(
        config: &ConnectionConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> (AsyncClient, NetworkHandle) {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), REQUEST_CAPACITY);
        let shutdown = CancellationToken::new();

        let handler = MqttHandler {
            client: client.clone(),
            eventloop,
            events,
            reconnect: config.reconnect,
            shutdown: shutdown.clone(),
            state: ConnectionState::default(),
        };

        let task = tokio::spawn(handler.run());
        (client, NetworkHandle::new(shutdown, task))
    }

    async fn run(mut self) {
        self.state = ConnectionState::Connecting;
        debug!("Network loop started");

        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            let previous = self.state;
            let (event, next) = transition(&mut self.state, polled, &self.reconnect);
            if previous != self.state {
                debug!("Connection state {:?} -> {:?}", previous, self.state);
            }

            if let Some(event) = event {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    sent = self.events.send(event) => {
                        if sent.is_err() {
                            debug!("Session receiver dropped, stopping network loop");
                            return;
                        }
                    }
                }
            }

            match next {
                Next::Continue => {}
                Next::Backoff => {
                    debug!("Retrying in {:?}", self.reconnect.delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect.delay) => {}
                    }
                }
                Next::Stop => {
                    info!("Network loop stopped in state {:?}", self.state);
                    return;
                }
            }
        }

        self.disconnect().await;
    }

    /// Queues DISCONNECT and drives the event loop until it is written.
    async fn disconnect(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("Not connected ({:?}), skipping DISCONNECT", self.state);
            return;
        }

        if let Err(err) = self.client.try_disconnect() {
            warn!("Failed to queue DISCONNECT: {}", err);
            return;
        }

        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!("Event loop ended while disconnecting: {}", err);
                        break;
                    }
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Timed out after {:?} waiting to send DISCONNECT", DISCONNECT_TIMEOUT);
        }

        self.state = ConnectionState::Disconnected;
        let event = SessionEvent::Disconnected(DisconnectReason::Requested);
        if let Err(err) = self.events.try_send(event) {
            debug!("Could not report graceful disconnect: {}", err);
        }
    }
}

/// Stop switch for the network task.
pub struct NetworkHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl NetworkHandle {
    pub fn new(shutdown: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Cancels the loop and waits for it to finish its DISCONNECT.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            error!("Network task failed: {}", err);
        }
    }
}

/// The part of the MQTT client the session needs.
pub trait SubscriptionClient {
    fn request_subscription(&self, filter: &str, qos: QoS) -> Result<(), ClientError>;
}

impl SubscriptionClient for AsyncClient {
    fn request_subscription(&self, filter: &str, qos: QoS) -> Result<(), ClientError> {
        self.try_subscribe(filter, qos)
    }
}

/// Consumer side of the subscriber: reacts to lifecycle and message events
/// and writes operator-facing lines to `out`.
pub struct Session<C, W> {
    config: ConnectionConfig,
    client: C,
    out: W,
    messages_received: usize,
}

impl<C: SubscriptionClient, W: Write> Session<C, W> {
    pub fn new(config: ConnectionConfig, client: C, out: W) -> Self {
        Self {
            config,
            client,
            out,
            messages_received: 0,
        }
    }

    pub fn messages_received(&self) -> usize {
        self.messages_received
    }

    #[cfg(test)]
    pub fn output(&self) -> &W {
        &self.out
    }

    /// Handles one event to completion. An `Err` is fatal for the process.
    pub fn handle_event(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::ConnectFailed(reason) => {
                say!(self.out, "Error connecting to MQTT broker: {reason}");
                Err(SessionError::Connect(reason))
            }
            SessionEvent::ConnAck(0) => self.on_connected(),
            SessionEvent::ConnAck(code) => {
                say!(self.out, "Connection failed with error code: {code}");
                let err = SessionError::BrokerRejected { code };
                if err.is_authorization_failure() {
                    say!(self.out, "Authentication error. Check username/password.");
                }
                Err(err)
            }
            SessionEvent::ReconnectRefused(code) => {
                say!(self.out, "Reconnect refused with error code: {code}.");
                Ok(())
            }
            SessionEvent::SubAck(codes) => {
                debug!("Subscription acknowledged: {:?}", codes);
                if codes.contains(&SubscribeReasonCode::Failure) {
                    say!(
                        self.out,
                        "Subscription to {} rejected by broker.",
                        self.config.subscription_filter()
                    );
                }
                Ok(())
            }
            SessionEvent::Message(message) => {
                self.messages_received += 1;
                debug!("Received {}", message);
                if let Err(err) = message.render(&mut self.out, self.config.verbose) {
                    warn!("Failed to print message on {}: {}", message.topic(), err);
                }
                Ok(())
            }
            SessionEvent::Disconnected(reason) => {
                let code = reason.code();
                say!(self.out, "Disconnected from MQTT Broker (rc: {code}).");
                if let DisconnectReason::ConnectionLost(cause) = &reason {
                    warn!("Connection lost: {}", cause);
                    if self.config.reconnect.enabled {
                        say!(self.out, "Unexpected disconnection. Attempting to reconnect...");
                    } else {
                        say!(
                            self.out,
                            "Unexpected disconnection. Automatic reconnect is disabled; press Ctrl+C to exit."
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Exactly one subscribe request per successful acknowledgment.
    fn on_connected(&mut self) -> Result<(), SessionError> {
        say!(
            self.out,
            "Connected successfully to MQTT Broker: {}:{}",
            self.config.host,
            self.config.port
        );

        let filter = self.config.subscription_filter();
        if let Err(source) = self.client.request_subscription(&filter, self.config.qos) {
            say!(self.out, "Failed to subscribe to {filter}: {source}");
            return Err(SessionError::Subscribe { filter, source });
        }
        say!(self.out, "Subscribed to topic: {filter}");
        Ok(())
    }

    fn announce(&mut self, line: &str) {
        say!(self.out, "{line}");
    }
}

/// How the session ended.
#[derive(Debug)]
pub enum Outcome {
    Interrupted,
    Failed(SessionError),
}

impl Outcome {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Outcome::Interrupted => ExitCode::SUCCESS,
            Outcome::Failed(_) => ExitCode::FAILURE,
        }
    }
}

/// Runs the session until `interrupt` resolves or an event is fatal.
///
/// On interrupt the network loop is stopped (which disconnects), events still
/// in the channel are handled, and `Exited.` is printed.
pub async fn supervise<C, W>(
    session: &mut Session<C, W>,
    mut events: mpsc::Receiver<SessionEvent>,
    network: NetworkHandle,
    interrupt: impl Future<Output = ()>,
) -> Outcome
where
    C: SubscriptionClient,
    W: Write,
{
    let target = format!("{}:{}", session.config.host, session.config.port);
    session.announce(&format!("Attempting to connect to {target}..."));

    tokio::pin!(interrupt);
    let mut events_open = true;

    let failure = loop {
        tokio::select! {
            () = &mut interrupt => break None,
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    if let Err(err) = session.handle_event(event) {
                        break Some(err);
                    }
                }
                None => {
                    events_open = false;
                    info!("Network loop ended; waiting for interrupt");
                }
            },
        }
    };

    if let Some(err) = failure {
        error!("Session failed: {}", err);
        network.stop().await;
        return Outcome::Failed(err);
    }

    session.announce("\nDisconnecting...");
    network.stop().await;

    events.close();
    while let Some(event) = events.recv().await {
        if let Err(err) = session.handle_event(event) {
            debug!("Ignoring event error during shutdown: {}", err);
        }
    }

    info!(
        "Session to {} ended after {} messages",
        target,
        session.messages_received()
    );
    session.announce("Exited.");
    Outcome::Interrupted
}
