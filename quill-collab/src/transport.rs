//! Reconnecting WebSocket transport for one document.
//!
//! State machine:
//! ```text
//! idle ──► connecting ──► open ──► closed / error
//!              ▲                         │
//!              └──── backoff (jitter) ◄──┘
//! ```
//!
//! The transport only moves envelopes. It never touches the document:
//! failures are reported as [`TransportEvent`]s and the session decides what
//! they mean. Messages sent while disconnected are dropped; the next
//! handshake recovers whatever they carried.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ProtocolError, SyncMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Exponential backoff with equal jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    pub fn for_testing() -> Self {
        Self {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(200),
        }
    }

    /// Un-jittered delay for the given attempt: `base * 2^attempt`, capped.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }
}

/// Where to connect and how to retry.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:9090`
    pub endpoint: String,
    pub document_id: String,
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
    /// Capacity of the command and event channels
    pub channel_capacity: usize,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            document_id: document_id.into(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }

    pub fn for_testing(endpoint: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            backoff: BackoffConfig::for_testing(),
            connect_timeout: Duration::from_secs(2),
            ..Self::new(endpoint, document_id)
        }
    }

    /// Full URL of the document room: `{endpoint}/{document_id}`.
    pub fn url(&self) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), self.document_id)
    }
}

/// Transport failures. Reported as events, never returned into document code.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Connect(String),
    Timeout,
    WebSocket(String),
    Protocol(ProtocolError),
    /// The transport task has stopped
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Connect failed: {}", e),
            Self::Timeout => write!(f, "Connect timed out"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// What the transport task reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting { attempt: u32 },
    Open,
    Message(SyncMessage),
    Closed { reason: Option<String> },
    Error(TransportError),
    ReconnectScheduled { attempt: u32, delay: Duration },
}

#[derive(Debug)]
enum TransportCommand {
    Send(SyncMessage),
    Close,
}

/// Owner side of a running transport.
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
    task: Option<JoinHandle<()>>,
}

/// Start the transport task. Events arrive on the returned receiver.
pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(run(config, cmd_rx, event_tx));
    (
        TransportHandle {
            commands: cmd_tx,
            task: Some(task),
        },
        event_rx,
    )
}

impl TransportHandle {
    /// Queue a message for the open connection. Dropped if there is none.
    pub async fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        self.commands
            .send(TransportCommand::Send(msg))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&mut self) {
        let _ = self.commands.send(TransportCommand::Close).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─── Task ────────────────────────────────────────────────────────

enum ConnectionEnd {
    /// Owner asked to close
    Requested,
    /// Owner dropped its channels
    Abandoned,
    /// Peer or network went away
    Dropped(Option<String>),
}

async fn run(
    config: TransportConfig,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let url = config.url();
    let mut rng = StdRng::from_entropy();
    let mut attempt: u32 = 0;

    loop {
        if !notify(TransportEvent::Connecting { attempt }, &events, &mut commands).await {
            return;
        }
        debug!("Connecting to {} (attempt {})", url, attempt);

        match tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                info!("Connected to {}", url);
                attempt = 0;
                if !notify(TransportEvent::Open, &events, &mut commands).await {
                    return;
                }
                match pump(ws, &mut commands, &events).await {
                    ConnectionEnd::Requested => {
                        // The owner is waiting for this task to finish, not
                        // reading events.
                        let _ = events.try_send(TransportEvent::Closed { reason: None });
                        return;
                    }
                    ConnectionEnd::Abandoned => return,
                    ConnectionEnd::Dropped(reason) => {
                        info!("Connection to {} lost: {:?}", url, reason);
                        if !notify(TransportEvent::Closed { reason }, &events, &mut commands).await {
                            return;
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", url, e);
                let event = TransportEvent::Error(TransportError::Connect(e.to_string()));
                if !notify(event, &events, &mut commands).await {
                    return;
                }
            }
            Err(_) => {
                debug!("Connect to {} timed out", url);
                if !notify(TransportEvent::Error(TransportError::Timeout), &events, &mut commands).await {
                    return;
                }
            }
        }

        let delay = config.backoff.delay(attempt, &mut rng);
        attempt = attempt.saturating_add(1);
        let scheduled = TransportEvent::ReconnectScheduled { attempt, delay };
        if !notify(scheduled, &events, &mut commands).await {
            return;
        }
        if !wait_for_retry(delay, &events, &mut commands).await {
            return;
        }
    }
}

/// A command that arrived while no connection is open. Returns false if the
/// owner asked to close or went away.
fn offline_command(cmd: Option<TransportCommand>, events: &mpsc::Sender<TransportEvent>) -> bool {
    match cmd {
        Some(TransportCommand::Send(msg)) => {
            trace!("Dropping {:?} while disconnected", msg.kind);
            true
        }
        Some(TransportCommand::Close) => {
            let _ = events.try_send(TransportEvent::Closed { reason: None });
            false
        }
        None => false,
    }
}

/// Emit an event while disconnected, draining commands until the owner has
/// room for it. Returns false if the transport should stop.
async fn notify(
    event: TransportEvent,
    events: &mpsc::Sender<TransportEvent>,
    commands: &mut mpsc::Receiver<TransportCommand>,
) -> bool {
    loop {
        tokio::select! {
            permit = events.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(event);
                        true
                    }
                    Err(_) => false,
                };
            }
            cmd = commands.recv() => {
                if !offline_command(cmd, events) {
                    return false;
                }
            }
        }
    }
}

/// Sleep out the backoff. Returns false if the owner asked to close.
async fn wait_for_retry(
    delay: Duration,
    events: &mpsc::Sender<TransportEvent>,
    commands: &mut mpsc::Receiver<TransportCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => {
                if !offline_command(cmd, events) {
                    return false;
                }
            }
        }
    }
}

/// Run one owner command against the open connection. Returns how the
/// connection ended, if it did.
async fn execute(cmd: Option<TransportCommand>, sink: &mut WsSink) -> Option<ConnectionEnd> {
    match cmd {
        Some(TransportCommand::Send(msg)) => {
            let data = match msg.encode() {
                Ok(data) => data,
                Err(e) => {
                    warn!("Failed to encode {:?}: {}", msg.kind, e);
                    return None;
                }
            };
            sink.send(Message::Binary(data.into()))
                .await
                .err()
                .map(|e| ConnectionEnd::Dropped(Some(e.to_string())))
        }
        Some(TransportCommand::Close) => {
            let _ = sink.send(Message::Close(None)).await;
            Some(ConnectionEnd::Requested)
        }
        None => {
            let _ = sink.send(Message::Close(None)).await;
            Some(ConnectionEnd::Abandoned)
        }
    }
}

/// Hand an inbound event to the owner. Commands keep flowing to the socket
/// while the event queue is full, so the owner never waits on a transport
/// that is waiting on it.
async fn deliver(
    event: TransportEvent,
    events: &mpsc::Sender<TransportEvent>,
    commands: &mut mpsc::Receiver<TransportCommand>,
    sink: &mut WsSink,
) -> Option<ConnectionEnd> {
    loop {
        tokio::select! {
            permit = events.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(event);
                        None
                    }
                    Err(_) => Some(ConnectionEnd::Abandoned),
                };
            }
            cmd = commands.recv() => {
                if let Some(end) = execute(cmd, sink).await {
                    return Some(end);
                }
            }
        }
    }
}

/// Move frames in both directions until the connection ends.
async fn pump(
    ws: WsStream,
    commands: &mut mpsc::Receiver<TransportCommand>,
    events: &mpsc::Sender<TransportEvent>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        let end = tokio::select! {
            cmd = commands.recv() => execute(cmd, &mut sink).await,
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let event = match SyncMessage::decode(&bytes) {
                        Ok(msg) => TransportEvent::Message(msg),
                        Err(e) => {
                            warn!("Dropping undecodable frame ({} bytes): {}", bytes.len(), e);
                            TransportEvent::Error(TransportError::Protocol(e))
                        }
                    };
                    deliver(event, events, commands, &mut sink).await
                }
                Some(Ok(Message::Close(frame))) => {
                    Some(ConnectionEnd::Dropped(frame.map(|f| f.reason.as_str().to_string())))
                }
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    let event = TransportEvent::Error(TransportError::WebSocket(e.to_string()));
                    match deliver(event, events, commands, &mut sink).await {
                        Some(end) => Some(end),
                        None => Some(ConnectionEnd::Dropped(Some(e.to_string()))),
                    }
                }
                None => Some(ConnectionEnd::Dropped(None)),
            },
        };
        if let Some(end) = end {
            return end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_ceiling_doubles_then_caps() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.ceiling(0), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(4), Duration::from_secs(16));
        assert_eq!(backoff.ceiling(5), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(200), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_delay_within_equal_jitter_bounds() {
        let backoff = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..10 {
            let ceiling = backoff.ceiling(attempt);
            for _ in 0..50 {
                let delay = backoff.delay(attempt, &mut rng);
                assert!(delay >= ceiling / 2, "{:?} < {:?}", delay, ceiling / 2);
                assert!(delay <= ceiling, "{:?} > {:?}", delay, ceiling);
            }
        }
    }

    #[test]
    fn test_url_joins_document_id() {
        let config = TransportConfig::new("ws://127.0.0.1:9090/", "src/main.rs");
        assert_eq!(config.url(), "ws://127.0.0.1:9090/src/main.rs");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_schedules_reconnect() {
        // Port 1 is never listening on loopback in test environments.
        let config = TransportConfig::for_testing("ws://127.0.0.1:1", "doc");
        let (mut handle, mut events) = spawn(config);

        assert_eq!(events.recv().await, Some(TransportEvent::Connecting { attempt: 0 }));
        assert!(matches!(events.recv().await, Some(TransportEvent::Error(_))));
        match events.recv().await {
            Some(TransportEvent::ReconnectScheduled { attempt, delay }) => {
                assert_eq!(attempt, 1);
                assert!(delay <= BackoffConfig::for_testing().base);
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.close().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_close_completes_while_events_unread() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let frame = SyncMessage::update(uuid::Uuid::new_v4(), "doc", vec![1, 2, 3]).encode().unwrap();
            for _ in 0..32 {
                if ws.send(Message::Binary(frame.clone().into())).await.is_err() {
                    return;
                }
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut config = TransportConfig::for_testing(endpoint, "doc");
        config.channel_capacity = 2;
        let (mut handle, events) = spawn(config);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The event queue is full; commands must still be taken off the queue.
        let sender = uuid::Uuid::new_v4();
        let sends = async {
            for _ in 0..8 {
                handle.send(SyncMessage::update(sender, "doc", vec![9])).await.unwrap();
            }
        };
        assert!(tokio::time::timeout(Duration::from_secs(2), sends).await.is_ok());
        assert!(tokio::time::timeout(Duration::from_secs(2), handle.close()).await.is_ok());
        assert!(!handle.is_running());

        drop(events);
        let _ = tokio::time::timeout(Duration::from_secs(2), relay).await;
    }
}
