use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use shared::{BookingId, Encoding, Frame, Location, PeerCommand, RelayEvent};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::SessionError;
use crate::source::LocationSource;
use crate::state::{Phase, SessionSnapshot, TrackingSession};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every attempt.
    pub jitter: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay websocket endpoint, e.g. `ws://relay.local:3000/ws`.
    pub server_url: String,
    pub booking_id: BookingId,
    pub encoding: Encoding,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, booking_id: BookingId) -> Self {
        Self {
            server_url: server_url.into(),
            booking_id,
            encoding: Encoding::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    fn connect_url(&self) -> String {
        match self.encoding {
            Encoding::Json => self.server_url.clone(),
            Encoding::MessagePack => {
                let sep = if self.server_url.contains('?') { '&' } else { '?' };
                format!("{}{sep}encoding={}", self.server_url, self.encoding)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    Acknowledge(Option<String>),
    Pause,
    Resume,
}

/// Owner of a running session. Dropping it ends the session the same way
/// `close` does, without waiting for the task.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    task: JoinHandle<Result<(), SessionError>>,
}

impl SessionHandle {
    /// Dispatcher action. The room, this session included, sees the
    /// acknowledgement once the relay fans it out.
    pub async fn acknowledge(&self, message: Option<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::Acknowledge(message)).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Resume).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Resolve with the first snapshot matching `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }

    /// Leave the room and tear the connection down.
    pub async fn close(self) -> Result<(), SessionError> {
        self.cancel.cancel();
        self.task.await?
    }

    /// Wait for the session to end on its own (reconnects given up).
    pub async fn finished(self) -> Result<(), SessionError> {
        self.task.await?
    }

    async fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Start a session on the current runtime. Pass a source to stream this
/// device's position, or `None` for a watch-only session.
pub fn spawn(config: SessionConfig, source: Option<Box<dyn LocationSource>>) -> SessionHandle {
    let session = TrackingSession::new(config.booking_id.clone(), source.is_some());
    let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run(
        config,
        session,
        source,
        command_rx,
        snapshot_tx,
        cancel.clone(),
    ));

    SessionHandle {
        commands: command_tx,
        snapshots: snapshot_rx,
        _cancel_on_drop: cancel.clone().drop_guard(),
        cancel,
        task,
    }
}

struct Driver {
    config: SessionConfig,
    session: TrackingSession,
    source: Option<Box<dyn LocationSource>>,
    commands: mpsc::Receiver<SessionCommand>,
    commands_open: bool,
    snapshots: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
}

enum Exit {
    Cancelled,
    Lost,
}

async fn run(
    config: SessionConfig,
    session: TrackingSession,
    source: Option<Box<dyn LocationSource>>,
    commands: mpsc::Receiver<SessionCommand>,
    snapshots: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let mut driver = Driver {
        config,
        session,
        source,
        commands,
        commands_open: true,
        snapshots,
        cancel,
    };
    let result = driver.run().await;
    driver.session.close();
    driver.publish();
    result
}

impl Driver {
    async fn run(&mut self) -> Result<(), SessionError> {
        let url = self.config.connect_url();
        let booking_id = self.config.booking_id.clone();

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    tracing::info!(booking_id = %booking_id, url = %url, "connected to relay");
                    if let Exit::Cancelled = self.drive(ws).await {
                        return Ok(());
                    }
                    tracing::warn!(booking_id = %booking_id, "relay connection lost");
                }
                Err(err) => {
                    tracing::warn!(booking_id = %booking_id, %err, "relay connection failed");
                }
            }

            self.session.on_transport_lost();
            self.publish();

            let Phase::Reconnecting { attempt } = self.session.phase() else {
                return Ok(());
            };
            if let Some(max) = self.config.reconnect.max_attempts {
                if attempt > max {
                    return Err(SessionError::ReconnectExhausted { attempts: max });
                }
            }

            let delay = self.config.reconnect.delay_for(attempt);
            tracing::debug!(booking_id = %booking_id, attempt, ?delay, "reconnecting");
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Serve one live connection until it drops or the session is cancelled.
    async fn drive(&mut self, ws: WsStream) -> Exit {
        let encoding = self.config.encoding;
        let (mut sink, mut stream) = ws.split();

        let join = self.session.on_connected();
        self.publish();
        if let Err(err) = send_command(&mut sink, &join, encoding).await {
            tracing::warn!(%err, "failed to join room");
            return Exit::Lost;
        }

        loop {
            let streaming = self.session.is_streaming();
            let outgoing = tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Some(leave) = self.session.close() {
                        let _ = send_command(&mut sink, &leave, encoding).await;
                    }
                    let _ = sink.close().await;
                    return Exit::Cancelled;
                }
                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(SessionCommand::Acknowledge(message)) => self.session.acknowledge(message),
                        Some(SessionCommand::Pause) => {
                            self.session.pause();
                            None
                        }
                        Some(SessionCommand::Resume) => {
                            self.session.resume();
                            None
                        }
                        None => {
                            self.commands_open = false;
                            None
                        }
                    }
                }
                fix = next_fix(&mut self.source), if streaming => {
                    match fix {
                        Some(location) => self.session.location_fix(location),
                        None => {
                            tracing::info!(booking_id = %self.session.booking_id(), "location source finished");
                            self.session.source_exhausted();
                            None
                        }
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.apply(shared::decode_text::<RelayEvent>(text.as_str()));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            self.apply(shared::decode_binary::<RelayEvent>(&bytes));
                        }
                        Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::debug!(%err, "socket error");
                            return Exit::Lost;
                        }
                    }
                    None
                }
            };

            if let Some(command) = outgoing {
                if let Err(err) = send_command(&mut sink, &command, encoding).await {
                    tracing::debug!(%err, "send failed");
                    self.publish();
                    return Exit::Lost;
                }
            }
            self.publish();
        }
    }

    fn apply(&mut self, decoded: Result<RelayEvent, shared::ProtocolError>) {
        match decoded {
            Ok(event) => {
                self.session.on_event(event);
            }
            Err(err) => tracing::debug!(%err, "ignoring undecodable frame"),
        }
    }

    fn publish(&self) {
        let next = self.session.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn next_fix(source: &mut Option<Box<dyn LocationSource>>) -> Option<Location> {
    match source {
        Some(source) => source.next_fix().await,
        None => std::future::pending().await,
    }
}

async fn send_command(
    sink: &mut WsSink,
    command: &PeerCommand,
    encoding: Encoding,
) -> Result<(), SessionError> {
    let message = match shared::encode(command, encoding)? {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
    };
    sink.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            jitter: Duration::ZERO,
            max_attempts: None,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(700));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(700));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(50),
            max_attempts: None,
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn msgpack_sessions_ask_for_binary_frames() {
        let booking = BookingId::new("B1").unwrap();
        let mut config = SessionConfig::new("ws://relay:3000/ws", booking.clone());
        assert_eq!(config.connect_url(), "ws://relay:3000/ws");

        config.encoding = Encoding::MessagePack;
        assert_eq!(config.connect_url(), "ws://relay:3000/ws?encoding=msgpack");

        let mut with_query = SessionConfig::new("ws://relay:3000/ws?region=south", booking);
        with_query.encoding = Encoding::MessagePack;
        assert_eq!(
            with_query.connect_url(),
            "ws://relay:3000/ws?region=south&encoding=msgpack"
        );
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_cap() {
        // reserve a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = SessionConfig::new(format!("ws://{addr}/ws"), BookingId::new("B1").unwrap());
        config.reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            jitter: Duration::ZERO,
            max_attempts: Some(2),
        };

        let handle = spawn(config, None);
        let mut snapshots = handle.subscribe();
        let result = handle.finished().await;

        assert!(matches!(result, Err(SessionError::ReconnectExhausted { attempts: 2 })));
        assert_eq!(snapshots.borrow_and_update().phase, Phase::Disconnected);
    }
}
