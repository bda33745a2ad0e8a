//! Persistent event channel to the server.
//!
//! [`EventChannel`] owns one tokio task that connects through an
//! [`EventTransport`], dispatches inbound event frames to a
//! [`HandlerRegistry`], and reconnects after unexpected closes while the
//! [`RetryBudget`] lasts. The task is controlled through the returned
//! [`ChannelHandle`].
//!
//! ```text
//! Connecting ──ok──▶ Open ──drop──▶ ClosedRetrying ──backoff──▶ Connecting
//!     │                │                  │
//!     └──fail──────────┼──────────────────┘ (budget exhausted)
//!                      │                         ▼
//!                      └──close()──────────▶ ClosedFinal
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lires_client_core::channel::{ChannelState, CloseOutcome, HandlerRegistry, ReconnectPolicy, RetryBudget};
use lires_client_core::events::parse_frame;
use lires_client_core::{Error, Result};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// A fresh session id: the first 16 hex digits of SHA-256 over the current
/// millisecond timestamp.
pub fn new_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let digest = Sha256::digest(millis.to_string().as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Opens connections for the channel.
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    async fn connect(&self, session_id: &str) -> Result<Box<dyn EventConnection>>;
}

/// One established connection.
#[async_trait]
pub trait EventConnection: Send {
    /// Next text frame, or `None` once the connection is gone.
    async fn next_frame(&mut self) -> Option<String>;

    async fn close(&mut self);
}

/// WebSocket transport against `<backend>/ws`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    backend: String,
    key: String,
}

impl WebSocketTransport {
    pub fn new(backend: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            key: key.into(),
        }
    }

    /// `http(s)://host` becomes `ws(s)://host/ws?key=..&session_id=..`.
    pub fn url(&self, session_id: &str) -> Result<reqwest::Url> {
        let base = self.backend.trim_end_matches('/');
        let ws_base = match base.strip_prefix("http") {
            Some(rest) => format!("ws{}", rest),
            None => base.to_string(),
        };
        let mut url = reqwest::Url::parse(&format!("{}/ws", ws_base))
            .map_err(|e| Error::InvalidArgument(format!("bad backend url {}: {}", self.backend, e)))?;
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("session_id", session_id);
        Ok(url)
    }
}

#[async_trait]
impl EventTransport for WebSocketTransport {
    async fn connect(&self, session_id: &str) -> Result<Box<dyn EventConnection>> {
        let url = self.url(session_id)?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl EventConnection for WebSocketConnection {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server closed event channel");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "event channel read failed");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type FrameCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_open: Option<Callback>,
    on_close: Option<Callback>,
    on_frame: Option<FrameCallback>,
    on_final_failure: Option<Callback>,
}

fn fire(callback: &Option<Callback>) {
    if let Some(cb) = callback {
        cb();
    }
}

/// Builder for the channel task.
pub struct EventChannel<T> {
    transport: T,
    registry: HandlerRegistry,
    policy: ReconnectPolicy,
    session_id: String,
    callbacks: Callbacks,
}

impl<T: EventTransport> EventChannel<T> {
    pub fn new(transport: T, registry: HandlerRegistry) -> Self {
        Self {
            transport,
            registry,
            policy: ReconnectPolicy::default(),
            session_id: new_session_id(),
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Called whenever a connection attempt or an open connection ends.
    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Called with every raw text frame before it is parsed.
    pub fn on_frame(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_frame = Some(Arc::new(f));
        self
    }

    /// Called exactly once if the retry budget runs out.
    pub fn on_final_failure(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_final_failure = Some(Arc::new(f));
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Start the channel task on the current tokio runtime.
    pub fn spawn(self) -> ChannelHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let session_id = self.session_id.clone();
        tokio::spawn(self.run(commands_rx, state_tx));
        ChannelHandle {
            commands: commands_tx,
            state: state_rx,
            session_id,
        }
    }

    fn handle_frame(&self, text: &str) {
        if let Some(cb) = &self.callbacks.on_frame {
            cb(text);
        }
        match parse_frame(text) {
            Ok(Some(event)) => {
                let handled = self.registry.dispatch(&event);
                debug!(kind = %event.kind(), handled, "event dispatched");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping malformed event frame"),
        }
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>, state: watch::Sender<ChannelState>) {
        let mut budget = RetryBudget::new(self.policy);
        loop {
            state.send_replace(ChannelState::Connecting);
            let attempt = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::ResetReconnect) => {
                        budget.reset();
                        continue;
                    }
                    Some(Command::Close) | None => break,
                },
                attempt = self.transport.connect(&self.session_id) => attempt,
            };

            match attempt {
                Ok(mut conn) => {
                    budget.reset();
                    state.send_replace(ChannelState::Open);
                    info!(session_id = %self.session_id, "event channel open");
                    fire(&self.callbacks.on_open);

                    let exit = loop {
                        tokio::select! {
                            command = commands.recv() => {
                                conn.close().await;
                                break match command {
                                    Some(Command::ResetReconnect) => Exit::Reconnect,
                                    Some(Command::Close) | None => Exit::Close,
                                };
                            }
                            frame = conn.next_frame() => match frame {
                                Some(text) => self.handle_frame(&text),
                                None => break Exit::Dropped,
                            },
                        }
                    };
                    fire(&self.callbacks.on_close);
                    match exit {
                        Exit::Close => break,
                        Exit::Reconnect => {
                            budget.reset();
                            continue;
                        }
                        Exit::Dropped => info!("event channel dropped"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "event channel connect failed");
                    fire(&self.callbacks.on_close);
                }
            }

            match budget.on_close() {
                CloseOutcome::Retry { after, remaining } => {
                    state.send_replace(ChannelState::ClosedRetrying);
                    info!(remaining, backoff_ms = after.as_millis() as u64, "event channel reconnecting");
                    tokio::select! {
                        command = commands.recv() => match command {
                            Some(Command::ResetReconnect) => budget.reset(),
                            Some(Command::Close) | None => break,
                        },
                        _ = tokio::time::sleep(after) => {}
                    }
                }
                CloseOutcome::GiveUp => {
                    state.send_replace(ChannelState::ClosedFinal);
                    warn!("event channel retries exhausted");
                    fire(&self.callbacks.on_final_failure);
                    return;
                }
            }
        }
        state.send_replace(ChannelState::ClosedFinal);
        info!("event channel closed");
    }
}

enum Command {
    Close,
    ResetReconnect,
}

enum Exit {
    Close,
    Reconnect,
    Dropped,
}

/// Control handle for a running [`EventChannel`]. Dropping the handle
/// closes the channel.
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    session_id: String,
}

impl ChannelHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Stop the channel without reconnecting. Safe to call repeatedly and
    /// after the task has ended.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Drop the current connection, restore the retry budget, and connect
    /// again. No effect once the channel is final.
    pub fn reset_reconnect(&self) {
        let _ = self.commands.send(Command::ResetReconnect);
    }

    /// Wait until the channel reaches [`ChannelState::ClosedFinal`].
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_final()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lires_client_core::events::EventKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    enum Script {
        Fail,
        /// Deliver frames, then drop.
        Frames(Vec<String>),
        /// Stay open until closed.
        Hold,
    }

    #[derive(Clone)]
    struct FakeTransport {
        script: Arc<Mutex<VecDeque<Script>>>,
        attempts: Arc<AtomicUsize>,
    }

    impl FakeTransport {
        fn new(script: Vec<Script>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                attempts: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    struct FakeConnection {
        frames: VecDeque<String>,
        hold: bool,
    }

    #[async_trait]
    impl EventConnection for FakeConnection {
        async fn next_frame(&mut self) -> Option<String> {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }
            if self.hold {
                futures::future::pending::<()>().await;
            }
            None
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl EventTransport for FakeTransport {
        async fn connect(&self, _session_id: &str) -> Result<Box<dyn EventConnection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Script::Fail);
            match next {
                Script::Fail => Err(Error::Transport("refused".into())),
                Script::Frames(frames) => Ok(Box::new(FakeConnection {
                    frames: frames.into(),
                    hold: false,
                })),
                Script::Hold => Ok(Box::new(FakeConnection {
                    frames: VecDeque::new(),
                    hold: true,
                })),
            }
        }
    }

    fn policy(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries,
            backoff: Duration::ZERO,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_final(handle: &ChannelHandle) {
        tokio::time::timeout(Duration::from_secs(5), handle.closed())
            .await
            .expect("channel did not reach final state");
    }

    #[tokio::test]
    async fn exhausted_budget_fails_exactly_once() {
        let transport = FakeTransport::new(vec![]);
        let (failures, on_failure) = counter();
        let (closes, on_close) = counter();
        let handle = EventChannel::new(transport.clone(), HandlerRegistry::new())
            .with_policy(policy(3))
            .on_final_failure(on_failure)
            .on_close(on_close)
            .spawn();
        wait_final(&handle).await;
        assert_eq!(handle.state(), ChannelState::ClosedFinal);
        assert_eq!(transport.attempts(), 4);
        assert_eq!(closes.load(Ordering::SeqCst), 4);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn frames_are_dispatched_and_unknown_types_ignored() {
        let frames = vec![
            r#"{"type":"event","content":{"type":"update_note","session_id":"s","uuid":"d","note":"x"}}"#.to_string(),
            r#"{"type":"event","content":{"type":"brand_new_kind","session_id":"s"}}"#.to_string(),
            "garbage".to_string(),
            r#"{"type":"event","content":{"type":"delete_tag","session_id":"s","src_tag":"a"}}"#.to_string(),
        ];
        let transport = FakeTransport::new(vec![Script::Frames(frames)]);
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            registry.on(EventKind::ALL, move |event| seen.lock().unwrap().push(event.kind()))
        };
        let raw = Arc::new(AtomicUsize::new(0));
        let raw_count = Arc::clone(&raw);
        let handle = EventChannel::new(transport, registry)
            .with_policy(policy(0))
            .on_frame(move |_| {
                raw_count.fetch_add(1, Ordering::SeqCst);
            })
            .spawn();
        wait_final(&handle).await;
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::UpdateNote, EventKind::DeleteTag]);
        assert_eq!(raw.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn close_is_final_without_failure_callback() {
        let transport = FakeTransport::new(vec![Script::Hold]);
        let (failures, on_failure) = counter();
        let (opens, on_open) = counter();
        let handle = EventChannel::new(transport.clone(), HandlerRegistry::new())
            .with_policy(policy(5))
            .on_open(on_open)
            .on_final_failure(on_failure)
            .spawn();
        let mut state = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ChannelState::Open))
            .await
            .unwrap()
            .unwrap();

        handle.close();
        handle.close();
        wait_final(&handle).await;
        handle.close();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn successful_open_restores_budget() {
        let transport = FakeTransport::new(vec![
            Script::Fail,
            Script::Fail,
            Script::Frames(vec![]),
        ]);
        let (failures, on_failure) = counter();
        let handle = EventChannel::new(transport.clone(), HandlerRegistry::new())
            .with_policy(policy(2))
            .on_final_failure(on_failure)
            .spawn();
        wait_final(&handle).await;
        // Two failures, one open (budget back to 2), then two more failures
        // before the third close gives up.
        assert_eq!(transport.attempts(), 5);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_reconnect_opens_a_new_connection() {
        let transport = FakeTransport::new(vec![Script::Hold, Script::Hold]);
        let (opens, on_open) = counter();
        let handle = EventChannel::new(transport.clone(), HandlerRegistry::new())
            .with_policy(policy(0))
            .on_open(on_open)
            .spawn();

        let wait_opens = |n: usize| {
            let opens = Arc::clone(&opens);
            async move {
                while opens.load(Ordering::SeqCst) < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait_opens(1)).await.unwrap();
        handle.reset_reconnect();
        tokio::time::timeout(Duration::from_secs(5), wait_opens(2)).await.unwrap();
        assert_eq!(transport.attempts(), 2);

        handle.close();
        wait_final(&handle).await;
    }

    #[test]
    fn websocket_url() {
        let t = WebSocketTransport::new("https://lires.example.org/", "k&y");
        let url = t.url("abc").unwrap();
        assert_eq!(url.as_str(), "wss://lires.example.org/ws?key=k%26y&session_id=abc");
        let plain = WebSocketTransport::new("http://localhost:8080", "k").url("s").unwrap();
        assert_eq!(plain.as_str(), "ws://localhost:8080/ws?key=k&session_id=s");
    }

    #[test]
    fn session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
