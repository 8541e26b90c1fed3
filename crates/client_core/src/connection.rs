//! Channel lifecycle: connect, authenticate, detect failure, reconnect.
//!
//! The socket is a low-latency delivery path, not the source of truth;
//! ordering and durability are guaranteed by the REST history endpoint, so
//! outbound frames are dropped (never queued) while disconnected.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Where the channel gets its bearer token and resolved local identity.
/// Re-read at every (re)connect attempt so refreshed tokens are honored.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn access_token(&self) -> Option<String>;
    async fn local_user_id(&self) -> Option<UserId>;
}

/// Delay before reconnect attempt `attempt` (1-based): 1s doubling per
/// attempt, capped at 30s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1u32 << exponent).min(BACKOFF_CAP)
}

pub struct ConnectionManager {
    ws_url: String,
    credentials: Arc<dyn CredentialSource>,
    pub(crate) inner: Mutex<ConnectionInner>,
    frames: broadcast::Sender<ServerFrame>,
    status: broadcast::Sender<ConnectionState>,
}

#[derive(Default)]
pub(crate) struct ConnectionInner {
    pub(crate) state: ConnectionState,
    pub(crate) retry_attempts: u32,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    pub(crate) reconnect_timer: Option<JoinHandle<()>>,
}

/// Spawns the delayed reconnect task. Defined as a free function (outside the
/// defining scope of `connect`) so the compiler can resolve `connect`'s future
/// `Send`-ness through the mutually recursive `transport_lost` -> reconnect ->
/// `connect` cycle.
fn spawn_reconnect(client: Arc<ConnectionManager>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        client.inner.lock().await.reconnect_timer = None;
        client.connect().await;
    })
}

impl ConnectionManager {
    pub fn new(ws_url: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(256);
        let (status, _) = broadcast::channel(16);
        Arc::new(Self {
            ws_url: ws_url.into(),
            credentials,
            inner: Mutex::new(ConnectionInner::default()),
            frames,
            status,
        })
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Opens the channel. No-op unless currently disconnected with a valid
    /// credential and a resolved local identity; a missing credential is not
    /// retried.
    pub async fn connect(self: &Arc<Self>) {
        let Some(token) = self.credentials.access_token().await else {
            debug!("connect skipped: no session credential");
            return;
        };
        if self.credentials.local_user_id().await.is_none() {
            debug!("connect skipped: local identity unresolved");
            return;
        }

        {
            let mut guard = self.inner.lock().await;
            if guard.state != ConnectionState::Disconnected {
                debug!(state = ?guard.state, "connect ignored: channel already active");
                return;
            }
            guard.state = ConnectionState::Connecting;
        }
        let _ = self.status.send(ConnectionState::Connecting);

        let url = match Url::parse(&self.ws_url) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("token", &token);
                url
            }
            Err(err) => {
                warn!(url = %self.ws_url, "invalid websocket url: {err}");
                self.inner.lock().await.state = ConnectionState::Disconnected;
                let _ = self.status.send(ConnectionState::Disconnected);
                return;
            }
        };
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                let (mut sink, mut source) = stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

                {
                    let mut guard = self.inner.lock().await;
                    guard.state = ConnectionState::Connected;
                    guard.retry_attempts = 0;
                    guard.outbound = Some(out_tx);
                }
                let _ = self.status.send(ConnectionState::Connected);
                info!("channel connected");

                let writer = tokio::spawn(async move {
                    while let Some(message) = out_rx.recv().await {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                });

                let client = Arc::clone(self);
                let reader = tokio::spawn(async move {
                    while let Some(received) = source.next().await {
                        match received {
                            Ok(Message::Text(text)) => client.dispatch(&text),
                            Ok(Message::Close(_)) => {
                                info!("server closed the channel");
                                break;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!("websocket receive failed: {err}");
                                break;
                            }
                        }
                    }
                    client.transport_lost().await;
                });

                let mut guard = self.inner.lock().await;
                guard.writer_task = Some(writer);
                guard.reader_task = Some(reader);
            }
            Err(err) => {
                warn!("websocket connect failed: {err}");
                self.transport_lost().await;
            }
        }
    }

    /// Cancels any pending reconnect, closes the transport, resets the retry
    /// counter. Idempotent.
    pub async fn disconnect(&self) {
        let was_active = {
            let mut guard = self.inner.lock().await;
            if let Some(timer) = guard.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(reader) = guard.reader_task.take() {
                reader.abort();
            }
            if let Some(writer) = guard.writer_task.take() {
                writer.abort();
            }
            guard.outbound = None;
            guard.retry_attempts = 0;
            let previous = guard.state;
            guard.state = ConnectionState::Disconnected;
            previous != ConnectionState::Disconnected
        };
        if was_active {
            let _ = self.status.send(ConnectionState::Disconnected);
        }
    }

    /// Transmits one envelope. Silently dropped when not connected: the
    /// caller's optimistic state is reconciled from history after reconnect.
    pub async fn send(&self, frame: &ClientFrame) {
        let guard = self.inner.lock().await;
        if guard.state != ConnectionState::Connected {
            debug!("outbound frame dropped: channel not connected");
            return;
        }
        let Some(outbound) = &guard.outbound else {
            return;
        };
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = outbound.send(Message::Text(text));
            }
            Err(err) => warn!("failed to encode outbound frame: {err}"),
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => {
                let _ = self.frames.send(frame);
            }
            // Unknown frame types are not an error.
            Err(err) => debug!("ignoring unrecognized inbound frame: {err}"),
        }
    }

    pub(crate) async fn transport_lost(self: &Arc<Self>) {
        let next_attempt = {
            let mut guard = self.inner.lock().await;
            guard.outbound = None;
            if let Some(writer) = guard.writer_task.take() {
                writer.abort();
            }
            guard.reader_task = None;
            guard.state = ConnectionState::Disconnected;
            if guard.retry_attempts < MAX_RECONNECT_ATTEMPTS {
                guard.retry_attempts += 1;
                Some(guard.retry_attempts)
            } else {
                None
            }
        };
        let _ = self.status.send(ConnectionState::Disconnected);

        match next_attempt {
            Some(attempt) => {
                let delay = backoff_delay(attempt);
                info!(attempt, "scheduling reconnect in {delay:?}");
                let timer = spawn_reconnect(Arc::clone(self), delay);
                self.inner.lock().await.reconnect_timer = Some(timer);
            }
            None => {
                warn!("reconnect ceiling reached; staying disconnected until connect() is called again")
            }
        }
    }
}
