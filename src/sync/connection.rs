// Live stream connection management for AutoSync
// Contains the connection state machine, reconnection timer and the websocket connector

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::ClientError;
use crate::models::ConnectionState;
use crate::sync::{parse_stream_payload, StreamEvent};

/// Shortest reconnect period; tokio intervals reject a zero period.
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(1);

/// Raw events produced by a connector session, plus the internal reconnect tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened { session: u64 },
    Payload { session: u64, raw: String },
    Failed { session: u64, reason: String },
    Closed { session: u64 },
    ReconnectDue,
}

/// What the manager reports to its consumer.
#[derive(Debug)]
pub enum SyncUpdate {
    State(ConnectionState),
    Stream(StreamEvent),
    /// Contained fault: logged and dropped, never fatal
    Fault(ClientError),
}

/// Opens one stream session. Implementations report everything that happens on the
/// session through `events`, always finishing with `Closed`.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str, session: u64, events: mpsc::UnboundedSender<TransportEvent>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub timers_armed: u64,
    pub parse_failures: u64,
}

/// Owns the stream lifecycle: `connecting -> open -> closed -> connecting ...`.
///
/// From `closed` a recurring reconnection timer is armed, guarded by a single handle so
/// at most one exists at a time. Reaching `open` cancels it. Retries are unbounded.
pub struct ConnectionManager<C: Connector> {
    url: String,
    connector: C,
    state: ConnectionState,
    session: u64,
    reconnect_interval: Duration,
    reconnect_timer: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    updates: mpsc::UnboundedSender<SyncUpdate>,
    stats: ConnectionStats,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        url: impl Into<String>,
        connector: C,
        reconnect_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SyncUpdate>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();

        if reconnect_interval < MIN_RECONNECT_INTERVAL {
            warn!(
                "Reconnect interval {:?} too short, using {:?}",
                reconnect_interval, MIN_RECONNECT_INTERVAL
            );
        }

        (
            Self {
                url: url.into(),
                connector,
                // Nothing is open before the first connect()
                state: ConnectionState::Closed,
                session: 0,
                reconnect_interval: reconnect_interval.max(MIN_RECONNECT_INTERVAL),
                reconnect_timer: None,
                events_tx,
                events_rx,
                updates,
                stats: ConnectionStats::default(),
            },
            updates_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_reconnect_timer(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Open a new session. Only valid from `closed`; while a session is connecting or
    /// open this does nothing, so a live socket is never orphaned.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!("Connect ignored, session {} is {:?}", self.session, self.state);
            return;
        }
        self.session += 1;
        self.stats.attempts += 1;
        info!("Connecting to {} (session {})", self.url, self.session);
        self.set_state(ConnectionState::Connecting);
        self.connector.open(&self.url, self.session, self.events_tx.clone());
    }

    /// Connect, then process events until the consumer goes away.
    pub async fn run(mut self) {
        self.connect();
        while !self.updates.is_closed() {
            if !self.step().await {
                break;
            }
        }
        debug!("Update consumer dropped, stopping connection manager");
        self.shutdown();
    }

    /// Wait for the next transport event and handle it. Returns false if the event
    /// channel is gone.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle(event);
                true
            }
            None => false,
        }
    }

    /// Handle a pending transport event without waiting. Returns false if none was queued.
    pub fn try_step(&mut self) -> bool {
        match self.events_rx.try_recv() {
            Ok(event) => {
                self.handle(event);
                true
            }
            Err(_) => false,
        }
    }

    pub fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ReconnectDue => self.on_reconnect_due(),
            TransportEvent::Opened { session } if session == self.session => self.on_open(),
            TransportEvent::Payload { session, raw } if session == self.session => self.on_payload(&raw),
            TransportEvent::Failed { session, reason } if session == self.session => {
                warn!("Stream error on session {}: {}", session, reason);
                self.emit(SyncUpdate::Fault(ClientError::Transport(reason)));
            }
            TransportEvent::Closed { session } if session == self.session => self.on_close(),
            stale => debug!("Ignoring event from superseded session: {:?}", stale),
        }
    }

    /// Cancel the reconnection timer. The manager stays usable; `connect()` may be
    /// called again.
    pub fn shutdown(&mut self) {
        self.cancel_reconnect();
    }

    fn on_open(&mut self) {
        info!("Stream open (session {})", self.session);
        self.cancel_reconnect();
        self.set_state(ConnectionState::Open);
    }

    fn on_payload(&mut self, raw: &str) {
        match parse_stream_payload(raw) {
            Ok(StreamEvent::Unknown) => {}
            Ok(event) => self.emit(SyncUpdate::Stream(event)),
            Err(e) => {
                // Bad payloads are dropped; the connection stays up
                self.stats.parse_failures += 1;
                warn!("Dropping stream payload: {}", e);
                self.emit(SyncUpdate::Fault(e));
            }
        }
    }

    fn on_close(&mut self) {
        info!("Stream closed (session {})", self.session);
        self.set_state(ConnectionState::Closed);
        self.arm_reconnect();
    }

    fn on_reconnect_due(&mut self) {
        match self.state {
            ConnectionState::Closed => {
                info!("Attempting to reconnect...");
                self.connect();
            }
            ConnectionState::Connecting => debug!("Reconnect tick skipped, attempt still in flight"),
            ConnectionState::Open => debug!("Stale reconnect tick ignored"),
        }
    }

    fn arm_reconnect(&mut self) {
        if self.reconnect_timer.is_some() {
            return;
        }

        let events = self.events_tx.clone();
        let period = self.reconnect_interval;
        self.stats.timers_armed += 1;
        debug!("Reconnecting every {:?} until the stream is open", period);

        self.reconnect_timer = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(TransportEvent::ReconnectDue).is_err() {
                    break;
                }
            }
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(SyncUpdate::State(state));
        }
    }

    fn emit(&self, update: SyncUpdate) {
        if self.updates.send(update).is_err() {
            debug!("No consumer for sync update");
        }
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}

/// Production connector: one tokio-tungstenite session per `open`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: &str, session: u64, events: mpsc::UnboundedSender<TransportEvent>) {
        tokio::spawn(run_session(url.to_string(), session, events));
    }
}

async fn run_session(url: String, session: u64, events: mpsc::UnboundedSender<TransportEvent>) {
    let (stream, _) = match connect_async(url.as_str()).await {
        Ok(ok) => ok,
        Err(e) => {
            error!("Failed to open stream to {}: {}", url, e);
            let _ = events.send(TransportEvent::Failed { session, reason: e.to_string() });
            let _ = events.send(TransportEvent::Closed { session });
            return;
        }
    };

    if events.send(TransportEvent::Opened { session }).is_err() {
        return;
    }

    // Inbound only; the write half is kept so pings get answered by tungstenite
    let (_write, mut read) = stream.split();
    while let Some(frame) = read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let raw = text.as_str().to_string();
                if events.send(TransportEvent::Payload { session, raw }).is_err() {
                    return;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                debug!("Server closed stream: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(TransportEvent::Failed { session, reason: e.to_string() });
                break;
            }
        }
    }

    let _ = events.send(TransportEvent::Closed { session });
}
