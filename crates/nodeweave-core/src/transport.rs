//! Relay client over a blocking WebSocket.
//!
//! The socket lives on a worker thread. The owner sends [`ClientMessage`]s,
//! polls decoded [`ServerMessage`]s, or lets [`RelayClient::sync`] shuttle
//! traffic between the socket and a [`Session`].

use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{RelayNotice, Session};
use std::net::TcpStream;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket, connect};
use url::Url;

/// Characters of a frame that make it into debug logs.
const LOG_PREVIEW_CHARS: usize = 100;
const READ_TIMEOUT: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid WebSocket URL scheme: {0}")]
    InvalidScheme(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Failed to encode message: {0}")]
    Encode(String),
    #[error("Relay worker has stopped")]
    WorkerGone,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What the worker reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// Sent exactly once when the worker exits, however it exits.
    Disconnected,
    Message(ServerMessage),
    Error { message: String },
}

enum Outbound {
    Frame(String),
    Close,
}

/// Check that `url` is a `ws://` or `wss://` URL.
pub fn validate_url(url: &str) -> Result<Url, TransportError> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(TransportError::InvalidScheme(other.to_string())),
    }
}

/// First [`LOG_PREVIEW_CHARS`] characters of `text`, cut on a char boundary.
pub(crate) fn log_preview(text: &str) -> &str {
    match text.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Client side of the relay protocol.
pub struct RelayClient {
    state: ConnectionState,
    outbound: Option<Sender<Outbound>>,
    events: Option<Receiver<TransportEvent>>,
    _worker: Option<JoinHandle<()>>,
}

impl RelayClient {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            outbound: None,
            events: None,
            _worker: None,
        }
    }

    /// Start connecting to a relay server. Progress arrives as events.
    pub fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        if self.outbound.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let url = validate_url(url)?;

        let (outbound_tx, outbound_rx) = channel();
        let (event_tx, event_rx) = channel();
        let worker = thread::spawn(move || run_worker(url, outbound_rx, event_tx));

        self.state = ConnectionState::Connecting;
        self.outbound = Some(outbound_tx);
        self.events = Some(event_rx);
        self._worker = Some(worker);
        Ok(())
    }

    /// Close the socket and stop the worker.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Close);
        }
        self.events = None;
        // Detached: the worker exits on Close or when its channel drops.
        self._worker = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Queue a message for the server. Frames queued while connecting are
    /// sent once the handshake completes.
    pub fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        let json = msg.to_json().map_err(|e| TransportError::Encode(e.to_string()))?;
        tx.send(Outbound::Frame(json)).map_err(|_| TransportError::WorkerGone)
    }

    pub fn join(&self, graph: impl Into<String>) -> Result<(), TransportError> {
        self.send(&ClientMessage::Join { graph: graph.into() })
    }

    /// Drain pending events (non-blocking).
    pub fn poll_events(&mut self) -> Vec<TransportEvent> {
        let Some(rx) = self.events.as_ref() else {
            return Vec::new();
        };
        let events: Vec<TransportEvent> = rx.try_iter().collect();
        for event in &events {
            match event {
                TransportEvent::Connected => self.state = ConnectionState::Connected,
                TransportEvent::Error { .. } => self.state = ConnectionState::Error,
                TransportEvent::Disconnected => {
                    if self.state != ConnectionState::Error {
                        self.state = ConnectionState::Disconnected;
                    }
                    self.outbound = None;
                }
                TransportEvent::Message(_) => {}
            }
        }
        events
    }

    /// Feed received server messages into `session`, then flush its outbox.
    ///
    /// The outbox is left untouched while there is no live worker, so
    /// nothing is lost across a reconnect.
    pub fn sync(&mut self, session: &mut Session) -> Result<Vec<RelayNotice>, TransportError> {
        let notices = self
            .poll_events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Message(msg) => Some(session.handle_relay(msg)),
                _ => None,
            })
            .collect();

        if self.outbound.is_some() {
            for msg in session.take_client_messages() {
                self.send(&msg)?;
            }
        }
        Ok(notices)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reports [`TransportEvent::Disconnected`] when the worker unwinds or returns.
struct ExitNotice(Sender<TransportEvent>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(TransportEvent::Disconnected);
    }
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn run_worker(url: Url, outbound: Receiver<Outbound>, events: Sender<TransportEvent>) {
    let _exit = ExitNotice(events.clone());
    log::info!("relay: connecting to {}", url);

    let mut socket = match connect(url.as_str()) {
        Ok((socket, response)) => {
            log::info!("relay: connected, status {}", response.status());
            socket
        }
        Err(e) => {
            log::error!("relay: connection to {} failed: {}", url, e);
            let _ = events.send(TransportEvent::Error {
                message: format!("Connection failed: {}", e),
            });
            return;
        }
    };
    let _ = events.send(TransportEvent::Connected);

    match socket.get_mut() {
        MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(READ_TIMEOUT));
            let _ = tcp.set_write_timeout(Some(WRITE_TIMEOUT));
        }
        #[allow(unreachable_patterns)]
        _ => log::debug!("relay: non-plain stream, keeping default timeouts"),
    }

    while flush_outbound(&mut socket, &outbound) && read_inbound(&mut socket, &events) {}
    log::info!("relay: worker exiting");
}

/// Send every queued frame. Returns false once the worker should stop.
fn flush_outbound(socket: &mut Socket, outbound: &Receiver<Outbound>) -> bool {
    loop {
        match outbound.try_recv() {
            Ok(Outbound::Frame(json)) => {
                log::debug!("relay: sending {}", log_preview(&json));
                if let Err(e) = socket.send(Message::Text(json)) {
                    log::error!("relay: send failed: {}", e);
                    return false;
                }
            }
            Ok(Outbound::Close) => {
                log::info!("relay: close requested");
                let _ = socket.close(None);
                let _ = socket.flush();
                return false;
            }
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => {
                log::info!("relay: client dropped");
                return false;
            }
        }
    }
}

/// Read at most one frame. Returns false once the worker should stop.
fn read_inbound(socket: &mut Socket, events: &Sender<TransportEvent>) -> bool {
    match socket.read() {
        Ok(Message::Text(text)) => {
            log::debug!("relay: received {}", log_preview(&text));
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(msg) => events.send(TransportEvent::Message(msg)).is_ok(),
                Err(e) => {
                    log::warn!("relay: skipping undecodable frame {:?}: {}", log_preview(&text), e);
                    true
                }
            }
        }
        Ok(Message::Close(_)) => {
            log::info!("relay: server closed the connection");
            false
        }
        // tungstenite queues the pong reply itself
        Ok(_) => true,
        Err(tungstenite::Error::Io(ref e))
            if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
        {
            true
        }
        Err(tungstenite::Error::ConnectionClosed) => false,
        Err(e) => {
            log::error!("relay: read failed: {}", e);
            let _ = events.send(TransportEvent::Error { message: e.to_string() });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::EngineConfig;
    use crate::event::EventPayload;
    use crate::graph::{Graph, Node, NodeKind};
    use kurbo::Point;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("ws://localhost:3030/ws").is_ok());
        assert!(validate_url("wss://relay.example.com/ws").is_ok());
        assert_eq!(
            validate_url("http://localhost:3030"),
            Err(TransportError::InvalidScheme("http".into()))
        );
        assert!(matches!(validate_url("not a url"), Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_send_requires_connection() {
        let client = RelayClient::new();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.send(&ClientMessage::Save), Err(TransportError::NotConnected));
    }

    #[test]
    fn test_connect_rejects_bad_scheme() {
        let mut client = RelayClient::new();
        assert!(client.connect("https://localhost").is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.poll_events().is_empty());
    }

    #[test]
    fn test_log_preview_cuts_on_char_boundary() {
        let accented = "é".repeat(60);
        assert_eq!(log_preview(&accented), accented);

        let long = "é".repeat(150);
        let preview = log_preview(&long);
        assert_eq!(preview.chars().count(), LOG_PREVIEW_CHARS);
        assert!(long.starts_with(preview));

        let mixed = format!("{}日本語", "a".repeat(99));
        assert_eq!(log_preview(&mixed), format!("{}日", "a".repeat(99)));
    }

    #[test]
    fn test_refused_connection_reports_error_then_disconnect() {
        // Grab a free port and release it so nothing is listening there.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut client = RelayClient::new();
        client.connect(&format!("ws://127.0.0.1:{}/ws", port)).unwrap();

        let events = wait_for(&mut client, |e| *e == TransportEvent::Disconnected);
        assert!(matches!(events.first(), Some(TransportEvent::Error { .. })));
        assert_eq!(client.state(), ConnectionState::Error);
        assert_eq!(client.send(&ClientMessage::Save), Err(TransportError::NotConnected));
    }

    fn wait_for(client: &mut RelayClient, done: impl Fn(&TransportEvent) -> bool) -> Vec<TransportEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let batch = client.poll_events();
            let finished = batch.iter().any(&done);
            seen.extend(batch);
            if finished {
                return seen;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out, saw {:?}", seen);
    }

    /// Single-peer relay: answers a join with a one-node snapshot after a
    /// garbage frame, then hands every later client message to the test.
    fn spawn_relay() -> (String, Receiver<ClientMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = channel();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let Ok(mut socket) = tungstenite::accept(stream) else {
                return;
            };
            let snapshot = Graph::new()
                .add_node(Node::new("seed", NodeKind::Trigger, Point::new(1.0, 2.0)))
                .unwrap()
                .to_portable();

            loop {
                let text = match socket.read() {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg: ClientMessage = serde_json::from_str(&text).unwrap();
                if let ClientMessage::Join { graph } = &msg {
                    socket.send(Message::Text("{\"type\":\"nonsense\"}".into())).unwrap();
                    let joined = ServerMessage::Joined {
                        graph: graph.clone(),
                        peer_count: 1,
                        snapshot: snapshot.clone(),
                        version: 4,
                        presence: Vec::new(),
                    };
                    socket.send(Message::Text(joined.to_json().unwrap())).unwrap();
                }
                if seen_tx.send(msg).is_err() {
                    break;
                }
            }
        });
        (url, seen_rx)
    }

    #[test]
    fn test_session_round_trip_through_relay() {
        let (url, seen) = spawn_relay();
        let mut session = Session::new("S1", "ada", EngineConfig::default());
        let mut client = RelayClient::new();
        client.connect(&url).unwrap();
        client.join("flow").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut notices = Vec::new();
        while notices.is_empty() && Instant::now() < deadline {
            notices = client.sync(&mut session).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(client.is_connected());
        // The garbage frame was skipped; only the join came through.
        assert_eq!(
            notices,
            vec![RelayNotice::Joined {
                graph: "flow".into(),
                peer_count: 1,
                version: 4,
            }]
        );
        assert!(session.graph().contains_node("seed"));

        session
            .execute(Command::create_node(Node::new("n1", NodeKind::Task, Point::new(5.0, 5.0))))
            .unwrap();
        client.sync(&mut session).unwrap();

        let recv = |seen: &Receiver<ClientMessage>| seen.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(recv(&seen), ClientMessage::Join { graph: "flow".into() });
        let created = std::iter::repeat_with(|| recv(&seen))
            .find_map(|msg| match msg {
                ClientMessage::Event { event } => Some(event),
                _ => None,
            })
            .unwrap();
        assert_eq!(created.origin_session_id, "S1");
        assert!(matches!(created.payload, EventPayload::NodeCreated { ref node } if node.id == "n1"));

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
