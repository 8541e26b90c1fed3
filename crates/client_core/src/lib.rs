//! Client-side real-time messaging engine.
//!
//! Wires the connection lifecycle, the message reconciler, the notification
//! aggregator, the key store, and the REST collaborators into one
//! [`ChatClient`] with explicit dependencies. Transport and crypto failures
//! are absorbed here; only their effects (connection status, degraded
//! message flags, error strings) surface to the embedding UI.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use keystore::KeyStore;
use pairbox::KeyMaterial;
use shared::{
    domain::UserId,
    protocol::{
        ChatMessage, ClientFrame, ConversationSummary, Notification, Paginated, ServerFrame,
        TokenPair, UserProfile,
    },
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub mod connection;
pub mod notifications;
pub mod reconcile;
pub mod rest;

pub use connection::{backoff_delay, ConnectionManager, ConnectionState, CredentialSource};
pub use notifications::NotificationAggregator;
pub use reconcile::{Attachment, IngestOutcome, MessageReconciler, OPTIMISTIC_ID_THRESHOLD};
pub use rest::{ChatApi, RegisterRequest};

/// Everything the embedding UI needs to observe, as derived effects.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StatusChanged(ConnectionState),
    MessageUpserted { peer_id: UserId, message: ChatMessage },
    NotificationReceived(Notification),
    /// The server holds a public key for this identity but the device has
    /// no matching secret; history stays unreadable here and no key is
    /// fabricated.
    IdentityDegraded { user_id: UserId },
    Error(String),
}

#[derive(Default)]
struct SessionState {
    access: Option<String>,
    refresh: Option<String>,
    user_id: Option<UserId>,
}

/// Holds the bearer tokens and resolved identity for the active session.
/// The connection re-reads this at every retry, so a token refreshed
/// between attempts is honored.
#[derive(Default)]
pub struct SessionCredentials {
    inner: RwLock<SessionState>,
}

impl SessionCredentials {
    pub async fn set_tokens(&self, tokens: &TokenPair) {
        let mut state = self.inner.write().await;
        state.access = Some(tokens.access.clone());
        state.refresh = Some(tokens.refresh.clone());
    }

    pub async fn set_user(&self, user_id: UserId) {
        self.inner.write().await.user_id = Some(user_id);
    }

    pub async fn clear(&self) {
        *self.inner.write().await = SessionState::default();
    }

    pub async fn access(&self) -> Option<String> {
        self.inner.read().await.access.clone()
    }

    pub async fn refresh(&self) -> Option<String> {
        self.inner.read().await.refresh.clone()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.read().await.user_id
    }
}

#[async_trait]
impl CredentialSource for SessionCredentials {
    async fn access_token(&self) -> Option<String> {
        self.access().await
    }

    async fn local_user_id(&self) -> Option<UserId> {
        self.user_id().await
    }
}

pub struct ChatClient {
    api: ChatApi,
    credentials: Arc<SessionCredentials>,
    keys: Arc<KeyStore>,
    connection: Arc<ConnectionManager>,
    reconciler: Arc<MessageReconciler>,
    notifications: Arc<NotificationAggregator>,
    events: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    // Monotonic login counter; a key lookup finishing after a newer login
    // started is discarded rather than applied (last identity wins).
    login_epoch: AtomicU64,
}

impl ChatClient {
    pub fn new(
        rest_url: impl Into<String>,
        ws_url: impl Into<String>,
        keys: Arc<KeyStore>,
    ) -> Arc<Self> {
        let credentials = Arc::new(SessionCredentials::default());
        let connection = ConnectionManager::new(
            ws_url,
            Arc::clone(&credentials) as Arc<dyn CredentialSource>,
        );
        let reconciler = Arc::new(MessageReconciler::new(
            Arc::clone(&keys),
            Arc::clone(&connection),
        ));
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            api: ChatApi::new(rest_url),
            credentials,
            keys,
            connection,
            reconciler,
            notifications: Arc::new(NotificationAggregator::new()),
            events,
            pump: Mutex::new(None),
            login_epoch: AtomicU64::new(0),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Registers the account and stashes a fresh key pair under the email
    /// until the first login yields a durable user id.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        self.api
            .register(&RegisterRequest {
                username: username.to_owned(),
                email: email.to_owned(),
                password: password.to_owned(),
            })
            .await?;
        let material = KeyStore::generate();
        self.keys.stash_pending(email, &material).await?;
        Ok(())
    }

    /// Authenticates, resolves the messaging identity, and opens the
    /// channel. A login superseded by a newer attempt while its key material
    /// was in flight is abandoned before any conversation or identity state
    /// is applied.
    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> Result<UserProfile> {
        let epoch = self.login_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let tokens = self.api.login(email, password).await?;
        self.credentials.set_tokens(&tokens).await;
        let profile = self.api.profile(&tokens.access).await?;
        self.credentials.set_user(profile.id).await;

        if let Err(err) = self.keys.adopt_pending(email, profile.id).await {
            warn!(user_id = profile.id.0, "pending key adoption failed: {err}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("pending key adoption failed: {err}")));
        }
        let identity = self
            .bootstrap_identity(profile.id, profile.public_key.as_deref(), &tokens.access)
            .await?;

        if self.login_epoch.load(Ordering::SeqCst) != epoch {
            debug!(
                user_id = profile.id.0,
                "login superseded while key material was in flight; discarding"
            );
            bail!("login superseded by a newer attempt");
        }

        self.reconciler
            .begin_session(profile.id, identity.clone())
            .await;
        self.notifications.clear().await;
        self.start_pump().await;
        self.connection.connect().await;

        match self.api.notifications(&tokens.access).await {
            Ok(existing) => self.notifications.fill(existing).await,
            Err(err) => {
                warn!("initial notification fetch failed: {err}");
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("notification fetch failed: {err}")));
            }
        }

        Ok(profile)
    }

    pub async fn logout(&self) {
        self.connection.disconnect().await;
        if let Some(task) = self.pump.lock().await.take() {
            task.abort();
        }
        self.reconciler.end_session().await;
        self.notifications.clear().await;
        self.credentials.clear().await;
    }

    /// Exchanges the refresh token for a new pair. The next reconnect
    /// attempt picks the new access token up automatically.
    pub async fn refresh_access_token(&self) -> Result<()> {
        let refresh = self
            .credentials
            .refresh()
            .await
            .ok_or_else(|| anyhow!("not logged in: no refresh token"))?;
        let tokens = self.api.refresh_token(&refresh).await?;
        self.credentials.set_tokens(&tokens).await;
        Ok(())
    }

    /// Reconnects manually, e.g. after the retry ceiling was reached.
    pub async fn reconnect(self: &Arc<Self>) {
        self.connection.connect().await;
    }

    /// Fetches history, fills the conversation, and tells the server the
    /// conversation is active for read-receipt purposes.
    pub async fn open_conversation(&self, peer: UserId) -> Result<Vec<ChatMessage>> {
        let access = self.access().await?;
        let history = self.api.message_history(&access, peer).await?;
        self.reconciler.fill(peer, history).await;
        self.connection
            .send(&ClientFrame::OpenChat { chat_with: peer })
            .await;
        Ok(self.reconciler.conversation(peer).await)
    }

    pub async fn close_conversation(&self, peer: UserId) {
        self.connection
            .send(&ClientFrame::CloseChat { chat_with: peer })
            .await;
    }

    pub async fn send_message(
        &self,
        peer: UserId,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<ChatMessage> {
        let Some(message) = self.reconciler.send(peer, text, attachment).await else {
            bail!("not logged in");
        };
        let _ = self.events.send(ClientEvent::MessageUpserted {
            peer_id: peer,
            message: message.clone(),
        });
        Ok(message)
    }

    pub async fn conversation(&self, peer: UserId) -> Vec<ChatMessage> {
        self.reconciler.conversation(peer).await
    }

    /// One page of the user listing; published public keys feed the peer
    /// key cache.
    pub async fn refresh_users(&self, page: u32) -> Result<Paginated<UserProfile>> {
        let access = self.access().await?;
        let listing = self.api.users(&access, page).await?;
        for user in &listing.results {
            if let Some(key) = &user.public_key {
                self.keys.record_peer_public_key(user.id, key).await;
            }
        }
        Ok(listing)
    }

    /// One page of the conversation listing; carried public keys feed the
    /// peer key cache.
    pub async fn refresh_conversations(&self, page: u32) -> Result<Paginated<ConversationSummary>> {
        let access = self.access().await?;
        let listing = self.api.conversations(&access, page).await?;
        for conversation in &listing.results {
            if let Some(key) = &conversation.public_key {
                self.keys
                    .record_peer_public_key(conversation.user_id, key)
                    .await;
            }
        }
        Ok(listing)
    }

    pub async fn refresh_notifications(&self) -> Result<Vec<Notification>> {
        let access = self.access().await?;
        let existing = self.api.notifications(&access).await?;
        self.notifications.fill(existing).await;
        Ok(self.notifications.snapshot().await)
    }

    pub async fn mark_notification_read(&self, id: i64) -> Result<()> {
        let access = self.access().await?;
        self.api.mark_notification_read(&access, id).await?;
        self.notifications.mark_read(id).await;
        Ok(())
    }

    pub async fn mark_all_notifications_seen(&self) -> Result<()> {
        let access = self.access().await?;
        self.api.mark_all_notifications_seen(&access).await?;
        self.notifications.mark_all_seen().await;
        Ok(())
    }

    pub async fn unseen_notification_count(&self) -> usize {
        self.notifications.unseen_count().await
    }

    pub async fn notifications_snapshot(&self) -> Vec<Notification> {
        self.notifications.snapshot().await
    }

    async fn access(&self) -> Result<String> {
        self.credentials
            .access()
            .await
            .ok_or_else(|| anyhow!("not logged in: no access token"))
    }

    /// Resolves the device's messaging identity against the server's view.
    ///
    /// Local secret present: ready (and the public key is published if the
    /// server has none on file). Local secret absent but the server holds a
    /// public key: never fabricate or overwrite; surface the degraded state.
    /// Both absent: fresh or legacy identity; generate, persist, publish.
    async fn bootstrap_identity(
        &self,
        user_id: UserId,
        server_key: Option<&str>,
        access: &str,
    ) -> Result<Option<KeyMaterial>> {
        if let Some(material) = self.keys.ensure_identity(user_id).await? {
            if server_key.is_none() {
                self.api
                    .publish_public_key(access, &material.public_key)
                    .await?;
            }
            return Ok(Some(material));
        }

        if server_key.is_some() {
            warn!(
                user_id = user_id.0,
                "server holds a public key but this device has no secret; history unreadable here"
            );
            let _ = self.events.send(ClientEvent::IdentityDegraded { user_id });
            return Ok(None);
        }

        let material = KeyStore::generate();
        self.keys.persist_identity(user_id, &material).await?;
        self.api
            .publish_public_key(access, &material.public_key)
            .await?;
        Ok(Some(material))
    }

    async fn start_pump(self: &Arc<Self>) {
        let mut pump = self.pump.lock().await;
        if let Some(task) = pump.take() {
            task.abort();
        }

        let client = Arc::clone(self);
        let mut frames = self.connection.subscribe_frames();
        let mut status = self.connection.subscribe_status();
        *pump = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Ok(frame) => client.route_frame(frame).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "event pump lagged; inbound frames dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    state = status.recv() => match state {
                        Ok(state) => {
                            let _ = client.events.send(ClientEvent::StatusChanged(state));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));
    }

    async fn route_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::ChatMessage { message } => {
                if let Some(key) = &message.sender_public_key {
                    if self.credentials.user_id().await != Some(message.sender_id) {
                        self.keys
                            .record_peer_public_key(message.sender_id, key)
                            .await;
                    }
                }
                match self.reconciler.ingest(message).await {
                    IngestOutcome::Confirmed { peer, message }
                    | IngestOutcome::Appended { peer, message } => {
                        let _ = self.events.send(ClientEvent::MessageUpserted {
                            peer_id: peer,
                            message,
                        });
                    }
                    IngestOutcome::Duplicate { .. } | IngestOutcome::Ignored => {}
                }
            }
            ServerFrame::Notification { notification } => {
                if self.notifications.ingest(notification.clone()).await {
                    let _ = self
                        .events
                        .send(ClientEvent::NotificationReceived(notification));
                }
            }
            ServerFrame::OpenChatAck { chat_with } => {
                debug!(peer_id = chat_with.0, "open_chat acknowledged");
            }
            ServerFrame::CloseChatAck { chat_with } => {
                debug!(peer_id = chat_with.0, "close_chat acknowledged");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
