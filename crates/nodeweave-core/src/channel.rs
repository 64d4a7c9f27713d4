//! In-process broadcast channel and the sequential session actor.
//!
//! Each session runs as its own task. Its graph and history are touched only
//! by that task: local requests and channel messages are processed one at a
//! time, in arrival order. Publishing never waits for subscribers.

use crate::command::Command;
use crate::event::GraphEvent;
use crate::graph::Graph;
use crate::presence::{PresenceEntry, PresenceEvent};
use crate::session::{HistorySummary, RemoteOutcome, Session, SessionError};
use kurbo::Point;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Message carried on a per-graph channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Graph diff from a session
    Graph(GraphEvent),
    /// Presence update from a session
    Presence {
        origin_session_id: String,
        presence: PresenceEvent,
    },
    /// A session's user left
    PresenceLeft {
        origin_session_id: String,
        user_id: String,
    },
}

impl ChannelMessage {
    /// Session that published this message.
    pub fn origin(&self) -> &str {
        match self {
            ChannelMessage::Graph(event) => &event.origin_session_id,
            ChannelMessage::Presence { origin_session_id, .. }
            | ChannelMessage::PresenceLeft { origin_session_id, .. } => origin_session_id,
        }
    }
}

/// Broadcast channel shared by every session editing one graph.
#[derive(Debug, Clone)]
pub struct GraphChannel {
    graph_id: String,
    tx: broadcast::Sender<ChannelMessage>,
}

impl GraphChannel {
    pub fn new(graph_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            graph_id: graph_id.into(),
            tx,
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Fire-and-forget publish. Returns how many subscribers will see it.
    pub fn publish(&self, msg: ChannelMessage) -> usize {
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

type Job = Box<dyn FnOnce(&mut Session, &GraphChannel) + Send>;

enum Request {
    Run(Job),
    Shutdown,
}

/// Handle to a running session actor.
pub struct SessionHandle {
    session_id: String,
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<Session>,
}

/// Run `session` as an actor on `channel`.
///
/// The session announces its presence on start and departs on shutdown.
pub fn spawn_session(mut session: Session, channel: &GraphChannel) -> SessionHandle {
    let session_id = session.id().to_string();
    let (requests, mut inbox) = mpsc::unbounded_channel::<Request>();
    let mut events = Some(channel.subscribe());
    let channel = channel.clone();

    let task = tokio::spawn(async move {
        session.announce();
        flush(&mut session, &channel);

        loop {
            tokio::select! {
                request = inbox.recv() => match request {
                    Some(Request::Run(job)) => job(&mut session, &channel),
                    Some(Request::Shutdown) | None => break,
                },
                msg = async {
                    match &mut events {
                        Some(rx) => Some(rx.recv().await),
                        None => std::future::pending::<Option<Result<ChannelMessage, RecvError>>>().await,
                    }
                } => match msg {
                    Some(Ok(msg)) => {
                        if let RemoteOutcome::Dropped(e) = session.receive(&msg) {
                            log::debug!("session {}: continuing after dropped event: {}", session.id(), e);
                        }
                    }
                    Some(Err(RecvError::Lagged(skipped))) => {
                        log::warn!("session {}: lagged, {} message(s) skipped", session.id(), skipped);
                    }
                    Some(Err(RecvError::Closed)) | None => {
                        log::info!("session {}: channel closed", session.id());
                        events = None;
                    }
                },
            }
            flush(&mut session, &channel);
        }

        session.depart();
        flush(&mut session, &channel);
        session
    });

    SessionHandle {
        session_id,
        requests,
        task,
    }
}

fn flush(session: &mut Session, channel: &GraphChannel) {
    for msg in session.take_outgoing() {
        channel.publish(msg);
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Run `f` on the session inside the actor and return its result.
    pub async fn call<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Session) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        // Publish before replying so callers observe their own diff on the channel.
        let job: Job = Box::new(move |session: &mut Session, channel: &GraphChannel| {
            let result = f(session);
            flush(session, channel);
            let _ = tx.send(result);
        });
        self.requests
            .send(Request::Run(job))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn execute(&self, cmd: Command) -> Result<Graph, SessionError> {
        self.call(move |s| s.execute(cmd).map(Graph::clone)).await?
    }

    pub async fn undo(&self) -> Result<Graph, SessionError> {
        self.call(|s| s.undo().map(Graph::clone)).await?
    }

    pub async fn redo(&self) -> Result<Graph, SessionError> {
        self.call(|s| s.redo().map(Graph::clone)).await?
    }

    /// Current local graph.
    pub async fn graph(&self) -> Result<Graph, SessionError> {
        self.call(|s| s.graph().clone()).await
    }

    pub async fn history_summary(&self) -> Result<HistorySummary, SessionError> {
        self.call(|s| s.history_summary()).await
    }

    pub async fn set_cursor(&self, cursor: Point) -> Result<(), SessionError> {
        self.call(move |s| s.set_cursor(cursor)).await
    }

    pub async fn lock_node(&self, node_id: impl Into<String>) -> Result<bool, SessionError> {
        let node_id = node_id.into();
        self.call(move |s| s.lock_node(&node_id)).await
    }

    pub async fn unlock_node(&self, node_id: impl Into<String>) -> Result<bool, SessionError> {
        let node_id = node_id.into();
        self.call(move |s| s.unlock_node(&node_id)).await
    }

    /// Presence of other users as seen by this session.
    pub async fn presence(&self) -> Result<Vec<PresenceEntry>, SessionError> {
        self.call(|s| s.peers()).await
    }

    pub async fn expire_stale(&self, now_ms: u64) -> Result<Vec<String>, SessionError> {
        self.call(move |s| s.expire_stale(now_ms)).await
    }

    /// Stop the actor after everything queued so far, returning the session.
    pub async fn shutdown(self) -> Result<Session, SessionError> {
        let _ = self.requests.send(Request::Shutdown);
        self.task.await.map_err(|_| SessionError::Closed)
    }
}
