//! Per-conversation message reconciliation.
//!
//! Merges locally-optimistic sends, server echoes, and peer-originated
//! deliveries into one ordered, deduplicated, decrypted view per peer.
//! Idempotent under duplicate delivery; a plaintext or decrypted entry is
//! never regressed back to ciphertext.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use keystore::KeyStore;
use pairbox::KeyMaterial;
use shared::{
    domain::{MessageKind, UserId},
    protocol::{ChatMessage, ClientFrame},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;

/// Client-generated temporary ids are millisecond epoch timestamps; anything
/// at or above this sits outside the server's sequence-id range.
pub const OPTIMISTIC_ID_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub file_type: String,
    pub file_data: String,
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// An optimistic entry was confirmed in place by its echo.
    Confirmed { peer: UserId, message: ChatMessage },
    /// A new entry was appended to the conversation.
    Appended { peer: UserId, message: ChatMessage },
    /// The final id was already present; the event was discarded.
    Duplicate { peer: UserId },
    /// No active session; the event was dropped.
    Ignored,
}

#[derive(Default)]
pub(crate) struct Session {
    pub(crate) local_user: Option<UserId>,
    pub(crate) identity: Option<KeyMaterial>,
    /// Wire content of in-flight sends, mapped to the temporary id of the
    /// optimistic entry, so an echo pairs with exactly the send that
    /// produced it even when echoes arrive out of order.
    pub(crate) pending_wire: HashMap<String, i64>,
}

pub struct MessageReconciler {
    keys: Arc<KeyStore>,
    connection: Arc<ConnectionManager>,
    pub(crate) session: Mutex<Session>,
    conversations: Mutex<HashMap<UserId, Vec<ChatMessage>>>,
}

impl MessageReconciler {
    pub fn new(keys: Arc<KeyStore>, connection: Arc<ConnectionManager>) -> Self {
        Self {
            keys,
            connection,
            session: Mutex::new(Session::default()),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Resets conversation state for a freshly resolved identity.
    pub async fn begin_session(&self, local_user: UserId, identity: Option<KeyMaterial>) {
        {
            let mut session = self.session.lock().await;
            session.local_user = Some(local_user);
            session.identity = identity;
            session.pending_wire.clear();
        }
        self.conversations.lock().await.clear();
    }

    pub async fn end_session(&self) {
        {
            let mut session = self.session.lock().await;
            session.local_user = None;
            session.identity = None;
            session.pending_wire.clear();
        }
        self.conversations.lock().await.clear();
    }

    /// Encrypts when the pair's key material allows it, appends an
    /// optimistic entry holding the plaintext, and transmits the envelope.
    /// Returns the optimistic entry, or `None` without an active session.
    pub async fn send(
        &self,
        peer: UserId,
        plaintext: &str,
        attachment: Option<Attachment>,
    ) -> Option<ChatMessage> {
        let (local_user, identity) = {
            let session = self.session.lock().await;
            (session.local_user?, session.identity.clone())
        };

        let peer_key = self.keys.lookup_peer_public_key(peer).await;
        let (wire_content, wire_encrypted) = match (&peer_key, &identity) {
            (Some(peer_key), Some(identity)) => {
                match pairbox::encrypt(plaintext, peer_key, &identity.secret_key) {
                    Ok(ciphertext) => (ciphertext, true),
                    Err(err) => {
                        warn!(peer_id = peer.0, "encryption failed, sending plaintext: {err}");
                        (plaintext.to_owned(), false)
                    }
                }
            }
            _ => {
                debug!(peer_id = peer.0, "pair key material incomplete, sending plaintext");
                (plaintext.to_owned(), false)
            }
        };

        let message_type = attachment
            .as_ref()
            .map(|a| MessageKind::from_mime(&a.file_type))
            .unwrap_or_default();
        let now = Utc::now();
        let optimistic = ChatMessage {
            id: now.timestamp_millis(),
            sender_id: local_user,
            recipient_id: peer,
            // The local entry always holds the plaintext, never the wire
            // ciphertext.
            content: plaintext.to_owned(),
            message_type,
            timestamp: now,
            is_read: false,
            is_encrypted: false,
            file_name: attachment.as_ref().map(|a| a.file_name.clone()),
            file_type: attachment.as_ref().map(|a| a.file_type.clone()),
            file_data: attachment.as_ref().map(|a| a.file_data.clone()),
            sender_public_key: None,
        };

        self.conversations
            .lock()
            .await
            .entry(peer)
            .or_default()
            .push(optimistic.clone());
        self.session
            .lock()
            .await
            .pending_wire
            .insert(wire_content.clone(), optimistic.id);

        self.connection
            .send(&ClientFrame::ChatMessage {
                recipient_id: peer,
                content: wire_content,
                message_type,
                is_encrypted: wire_encrypted,
                file_data: attachment.as_ref().map(|a| a.file_data.clone()),
                file_name: attachment.as_ref().map(|a| a.file_name.clone()),
                file_type: attachment.as_ref().map(|a| a.file_type.clone()),
            })
            .await;

        Some(optimistic)
    }

    /// Folds one inbound `chat_message` event into the owning conversation.
    pub async fn ingest(&self, mut message: ChatMessage) -> IngestOutcome {
        let (local_user, identity) = {
            let session = self.session.lock().await;
            let Some(local_user) = session.local_user else {
                return IngestOutcome::Ignored;
            };
            (local_user, session.identity.clone())
        };

        let from_self = message.sender_id == local_user;
        let peer = if from_self {
            message.recipient_id
        } else {
            message.sender_id
        };

        if !from_self && message.is_encrypted {
            self.decrypt_in_place(&mut message, peer, identity.as_ref())
                .await;
        }

        let optimistic_hint = if from_self {
            self.session
                .lock()
                .await
                .pending_wire
                .remove(&message.content)
        } else {
            None
        };

        let mut conversations = self.conversations.lock().await;
        let entries = conversations.entry(peer).or_default();

        if from_self {
            if let Some(pos) = find_optimistic_match(entries, local_user, &message, optimistic_hint)
            {
                let entry = &mut entries[pos];
                entry.id = message.id;
                entry.timestamp = message.timestamp;
                entry.is_read = message.is_read;
                entry.message_type = message.message_type;
                if entry.file_name.is_none() {
                    entry.file_name = message.file_name.clone();
                }
                if entry.file_type.is_none() {
                    entry.file_type = message.file_type.clone();
                }
                // Content and is_encrypted stay local: the plaintext we
                // already hold is never replaced by the re-received wire
                // ciphertext.
                let confirmed = entry.clone();
                entries.sort_by_key(|m| m.timestamp);
                return IngestOutcome::Confirmed {
                    peer,
                    message: confirmed,
                };
            }
            // No optimistic counterpart (e.g. sent from another device):
            // the symmetric pair key still opens our own ciphertext.
            if message.is_encrypted {
                self.decrypt_in_place(&mut message, peer, identity.as_ref())
                    .await;
            }
        }

        if entries.iter().any(|m| m.id == message.id) {
            debug!(
                peer_id = peer.0,
                message_id = message.id,
                "duplicate delivery discarded"
            );
            return IngestOutcome::Duplicate { peer };
        }
        entries.push(message.clone());
        entries.sort_by_key(|m| m.timestamp);
        IngestOutcome::Appended { peer, message }
    }

    /// Initial fill of a conversation from the history endpoint. Entries
    /// already present by id are left untouched.
    pub async fn fill(&self, peer: UserId, history: Vec<ChatMessage>) {
        let identity = {
            let session = self.session.lock().await;
            if session.local_user.is_none() {
                return;
            }
            session.identity.clone()
        };

        let mut prepared = Vec::with_capacity(history.len());
        for mut message in history {
            if message.is_encrypted {
                self.decrypt_in_place(&mut message, peer, identity.as_ref())
                    .await;
            }
            prepared.push(message);
        }

        let mut conversations = self.conversations.lock().await;
        let entries = conversations.entry(peer).or_default();
        for message in prepared {
            if !entries.iter().any(|m| m.id == message.id) {
                entries.push(message);
            }
        }
        entries.sort_by_key(|m| m.timestamp);
    }

    pub async fn conversation(&self, peer: UserId) -> Vec<ChatMessage> {
        self.conversations
            .lock()
            .await
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn conversation_peers(&self) -> Vec<UserId> {
        self.conversations.lock().await.keys().copied().collect()
    }

    /// Opens the pair box in place. The pair key is symmetric, so this works
    /// for both directions of the conversation: our secret plus the peer's
    /// public key re-opens history entries we sent as well as ones we
    /// received. Failure leaves the ciphertext displayed as-is.
    async fn decrypt_in_place(
        &self,
        message: &mut ChatMessage,
        peer: UserId,
        identity: Option<&KeyMaterial>,
    ) {
        let Some(identity) = identity else {
            debug!(
                peer_id = peer.0,
                "no local secret key; leaving ciphertext in place"
            );
            return;
        };
        let peer_key = match &message.sender_public_key {
            Some(key) if message.sender_id == peer => Some(key.clone()),
            _ => self.keys.lookup_peer_public_key(peer).await,
        };
        let Some(peer_key) = peer_key else {
            debug!(
                peer_id = peer.0,
                "peer public key unknown; leaving ciphertext in place"
            );
            return;
        };
        match pairbox::decrypt(&message.content, &peer_key, &identity.secret_key) {
            Ok(plaintext) => {
                message.content = plaintext;
                message.is_encrypted = false;
            }
            Err(err) => {
                warn!(
                    peer_id = peer.0,
                    message_id = message.id,
                    "decrypt failed, displaying ciphertext: {err}"
                );
            }
        }
    }
}

/// Locates the optimistic entry an echo confirms. Candidates are entries we
/// sent that still carry a temporary id. The pending-wire hint pairs the
/// echo with the exact send that produced it; content equality covers
/// unencrypted echoes; the oldest unconfirmed entry is the last resort.
fn find_optimistic_match(
    entries: &[ChatMessage],
    local_user: UserId,
    incoming: &ChatMessage,
    optimistic_hint: Option<i64>,
) -> Option<usize> {
    let unconfirmed = |entry: &ChatMessage| {
        entry.sender_id == local_user && !entry.is_encrypted && entry.id >= OPTIMISTIC_ID_THRESHOLD
    };

    if let Some(hint) = optimistic_hint {
        if let Some(idx) = entries
            .iter()
            .position(|entry| unconfirmed(entry) && entry.id == hint)
        {
            return Some(idx);
        }
    }
    entries
        .iter()
        .position(|entry| unconfirmed(entry) && entry.content == incoming.content)
        .or_else(|| entries.iter().position(unconfirmed))
}
