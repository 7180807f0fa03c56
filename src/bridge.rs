//! Streaming bridge
//!
//! Adapts [`ResearchAgent::stream`] to a live duplex session:
//!
//! ```text
//!  client ──{"topic"}──▶ session task ──spawn──▶ producer task
//!                             ▲                       │
//!                             └──── bounded mpsc ◀────┘ StreamEvent
//! ```
//!
//! The producer performs the slow capability calls on its own task. The
//! session task only drains the channel and watches inbound frames, so a
//! disconnect is noticed even while a completion call is in flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsFrame, WebSocket};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{ResearchAgent, StreamEvent};
use crate::storage::RunLog;

/// Events buffered between producer and session task
const EVENT_BUFFER: usize = 16;

/// How long a new session may stay silent before it is dropped
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// An inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Binary, ping and other non-text frames
    Other,
}

/// Message-oriented duplex channel the bridge talks to.
#[async_trait]
pub trait SessionChannel: Send {
    /// Next inbound frame, `None` once the peer is gone.
    async fn receive(&mut self) -> Option<Inbound>;

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    /// Close from our side. Errors are ignored; the peer may already be gone.
    async fn shutdown(&mut self);
}

#[async_trait]
impl SessionChannel for WebSocket {
    async fn receive(&mut self) -> Option<Inbound> {
        match WebSocket::recv(self).await? {
            Ok(WsFrame::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
            Ok(WsFrame::Close(_)) => None,
            Ok(_) => Some(Inbound::Other),
            Err(e) => {
                debug!(error = %e, "WebSocket receive failed");
                None
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        WebSocket::send(self, WsFrame::Text(text.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = WebSocket::send(self, WsFrame::Close(None)).await;
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every stage and the final message were sent
    Completed,
    /// No usable `{"topic": ...}` start message
    RejectedStart,
    /// The client went away mid-stream
    Disconnected,
    /// The producer panicked; nothing was sent afterwards
    ProducerFailed,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    topic: String,
}

/// Parse the session start message. Blank topics are rejected.
fn parse_start(text: &str) -> Option<String> {
    let start: StartMessage = serde_json::from_str(text).ok()?;
    let topic = start.topic.trim();
    (!topic.is_empty()).then(|| topic.to_string())
}

/// Runs one streaming session per channel.
#[derive(Clone)]
pub struct StreamingBridge {
    agent: ResearchAgent,
    run_log: Option<Arc<RunLog>>,
    start_timeout: Duration,
}

impl StreamingBridge {
    pub fn new(agent: ResearchAgent) -> Self {
        Self {
            agent,
            run_log: None,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Save every completed report to this run-log
    pub fn with_run_log(mut self, run_log: Arc<RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Drive one session to its end and close the channel.
    pub async fn serve<C: SessionChannel>(&self, mut channel: C) -> SessionOutcome {
        let outcome = match self.read_topic(&mut channel).await {
            Some(topic) => self.forward(&mut channel, topic).await,
            None => {
                debug!("Session start message missing or malformed");
                SessionOutcome::RejectedStart
            }
        };

        channel.shutdown().await;
        info!(outcome = ?outcome, "Streaming session ended");
        outcome
    }

    async fn read_topic<C: SessionChannel>(&self, channel: &mut C) -> Option<String> {
        match tokio::time::timeout(self.start_timeout, channel.receive()).await {
            Ok(Some(Inbound::Text(text))) => parse_start(&text),
            Ok(_) => None,
            Err(_) => {
                debug!(timeout_secs = self.start_timeout.as_secs(), "No start message in time");
                None
            }
        }
    }

    async fn forward<C: SessionChannel>(&self, channel: &mut C, topic: String) -> SessionOutcome {
        info!(topic = %topic, "Streaming session started");

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
        let producer = tokio::spawn(produce(self.agent.clone(), topic, tx, self.run_log.clone()));

        let outcome = loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        break SessionOutcome::Completed;
                    };
                    if let Err(e) = channel.send_text(event.to_message().to_string()).await {
                        info!(error = %e, "Client disconnected during stream");
                        break SessionOutcome::Disconnected;
                    }
                }
                inbound = channel.receive() => {
                    match inbound {
                        Some(frame) => debug!(frame = ?frame, "Ignoring inbound frame after start"),
                        None => {
                            info!("Client closed the session during stream");
                            break SessionOutcome::Disconnected;
                        }
                    }
                }
            }
        };

        // Dropping the receiver makes the producer stop at its next send.
        drop(rx);

        if outcome != SessionOutcome::Completed {
            return outcome;
        }

        match producer.await {
            Ok(()) => SessionOutcome::Completed,
            Err(e) => {
                warn!(error = %e, "Research producer failed");
                SessionOutcome::ProducerFailed
            }
        }
    }
}

/// Producer task: pull the lazy stream and push each event to the session.
async fn produce(
    agent: ResearchAgent,
    topic: String,
    tx: mpsc::Sender<StreamEvent>,
    run_log: Option<Arc<RunLog>>,
) {
    let mut events = Box::pin(agent.stream(&topic));

    while let Some(event) = events.next().await {
        let finished = match &event {
            StreamEvent::Final(state) => Some(state.clone()),
            StreamEvent::Stage(_) => None,
        };

        if tx.send(event).await.is_err() {
            debug!(topic = %topic, "Session gone, producer stopping");
        }

        if let (Some(state), Some(log)) = (finished, &run_log) {
            let report = state.report().unwrap_or_default().to_string();
            let metadata = json!({
                "source": "websocket",
                "steps": state.steps_taken,
            });
            if let Err(e) = log.save(&topic, &report, metadata).await {
                warn!(error = %e, "Failed to save run");
            }
        }

        if tx.is_closed() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Capabilities;
    use crate::llm::{MockCompletion, TextCompletion};
    use crate::state::Message;
    use crate::tools::MockSearch;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory channel with a scripted inbound side
    struct MemoryChannel {
        inbound: mpsc::UnboundedReceiver<Inbound>,
        outbound: mpsc::UnboundedSender<String>,
        /// Sends succeed this many times, then the peer counts as gone
        fail_after: Option<usize>,
        attempts: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    struct Client {
        inbound: Option<mpsc::UnboundedSender<Inbound>>,
        outbound: mpsc::UnboundedReceiver<String>,
        attempts: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl Client {
        fn send(&self, text: &str) {
            if let Some(tx) = &self.inbound {
                tx.send(Inbound::Text(text.to_string())).unwrap();
            }
        }

        fn hang_up(&mut self) {
            self.inbound = None;
        }

        fn received(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(text) = self.outbound.try_recv() {
                out.push(serde_json::from_str(&text).unwrap());
            }
            out
        }
    }

    fn pair(fail_after: Option<usize>) -> (MemoryChannel, Client) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        (
            MemoryChannel {
                inbound: in_rx,
                outbound: out_tx,
                fail_after,
                attempts: attempts.clone(),
                closed: closed.clone(),
            },
            Client { inbound: Some(in_tx), outbound: out_rx, attempts, closed },
        )
    }

    #[async_trait]
    impl SessionChannel for MemoryChannel {
        async fn receive(&mut self) -> Option<Inbound> {
            self.inbound.recv().await
        }

        async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| attempt >= limit) {
                return Err(ChannelError::Closed);
            }
            self.outbound.send(text).map_err(|_| ChannelError::Closed)
        }

        async fn shutdown(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Completion that sleeps before answering
    struct Slow(Duration);

    #[async_trait]
    impl TextCompletion for Slow {
        async fn complete(&self, _turns: &[Message]) -> String {
            tokio::time::sleep(self.0).await;
            "1. only goal".to_string()
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    /// Completion that panics on the writer call
    struct PanicsOnCompose;

    #[async_trait]
    impl TextCompletion for PanicsOnCompose {
        async fn complete(&self, turns: &[Message]) -> String {
            if turns.len() == 1 {
                panic!("provider exploded");
            }
            "1. a\n2. b".to_string()
        }

        fn name(&self) -> &str {
            "panics"
        }
    }

    fn bridge_with(completion: Arc<dyn TextCompletion>) -> StreamingBridge {
        StreamingBridge::new(ResearchAgent::new(Capabilities::new(
            completion,
            Arc::new(MockSearch::new()),
            3,
        )))
    }

    #[test]
    fn test_parse_start() {
        assert_eq!(parse_start(r#"{"topic": "X"}"#), Some("X".to_string()));
        assert_eq!(parse_start(r#"{"topic": "  "}"#), None);
        assert_eq!(parse_start(r#"{"topic": 3}"#), None);
        assert_eq!(parse_start(r#"{"subject": "X"}"#), None);
        assert_eq!(parse_start("not json"), None);
    }

    #[tokio::test]
    async fn test_session_streams_stages_then_final() {
        let bridge = bridge_with(Arc::new(MockCompletion::new()));
        let (channel, mut client) = pair(None);
        client.send(r#"{"topic": "X"}"#);

        let outcome = bridge.serve(channel).await;
        assert_eq!(outcome, SessionOutcome::Completed);

        let messages = client.received();
        // plan + 3 research + compose, then final
        assert_eq!(messages.len(), 3 + 2 + 1);

        let keys: Vec<&str> = messages
            .iter()
            .map(|m| m.as_object().unwrap().keys().next().unwrap().as_str())
            .collect();
        assert_eq!(keys, vec!["plan", "research", "research", "research", "compose", "final"]);

        assert_eq!(messages[0]["plan"]["research_plan"][0], "Investigate: X - part 1");
        assert_eq!(messages[3]["research"]["steps_taken"], 3);
        assert!(messages[5]["final"].as_str().unwrap().starts_with("[mock response]"));
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_malformed_start_closes_silently() {
        let bridge = bridge_with(Arc::new(MockCompletion::new()));
        let (channel, mut client) = pair(None);
        client.send("{\"nope\": true}");

        assert_eq!(bridge.serve(channel).await, SessionOutcome::RejectedStart);
        assert!(client.received().is_empty());
        assert_eq!(client.attempts.load(Ordering::SeqCst), 0);
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_absent_start_closes_silently() {
        let bridge = bridge_with(Arc::new(MockCompletion::new()));
        let (channel, mut client) = pair(None);
        client.hang_up();

        assert_eq!(bridge.serve(channel).await, SessionOutcome::RejectedStart);
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let bridge = bridge_with(Arc::new(MockCompletion::new()))
            .with_start_timeout(Duration::from_millis(20));
        let (channel, client) = pair(None);

        assert_eq!(bridge.serve(channel).await, SessionOutcome::RejectedStart);
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_send_failure_stops_sending() {
        let bridge = bridge_with(Arc::new(MockCompletion::new()));
        let (channel, mut client) = pair(Some(2));
        client.send(r#"{"topic": "X"}"#);

        let outcome = bridge.serve(channel).await;

        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert_eq!(client.received().len(), 2);
        // the failed attempt, and nothing after it
        assert_eq!(client.attempts.load(Ordering::SeqCst), 3);
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_noticed_while_producer_blocked() {
        let bridge = bridge_with(Arc::new(Slow(Duration::from_secs(5))));
        let (channel, mut client) = pair(None);
        client.send(r#"{"topic": "X"}"#);
        client.hang_up();

        let outcome = tokio::time::timeout(Duration::from_secs(1), bridge.serve(channel))
            .await
            .expect("bridge must not wait for the blocked producer");

        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert!(client.received().is_empty());
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_producer_panic_closes_session() {
        let bridge = bridge_with(Arc::new(PanicsOnCompose));
        let (channel, mut client) = pair(None);
        client.send(r#"{"topic": "X"}"#);

        let outcome = bridge.serve(channel).await;
        assert_eq!(outcome, SessionOutcome::ProducerFailed);

        let messages = client.received();
        // plan and two research steps made it out, no compose and no final
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.get("final").is_none()));
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_completed_session_is_saved() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = Arc::new(RunLog::new(dir.path().join("runs.json")));
        let bridge = bridge_with(Arc::new(MockCompletion::new())).with_run_log(log.clone());
        let (channel, client) = pair(None);
        client.send(r#"{"topic": "saved topic"}"#);

        assert_eq!(bridge.serve(channel).await, SessionOutcome::Completed);

        let runs = log.list(10).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].topic, "saved topic");
        assert_eq!(runs[0].metadata["steps"], 3);
    }
}
