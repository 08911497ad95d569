use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{Attachment, ChatMessage, Conversation},
    protocol::{
        AttachmentDownloadResponse, AttachmentUploadRequest, WireMessage, MAX_ATTACHMENT_BYTES,
    },
};
use storage::OfflineStore;
use tracing::{debug, info, warn};

use crate::{
    config::MessageEndpoints,
    error::RequestError,
    identity::IdentityProvider,
    lifecycle::AppLifecycleBroadcaster,
    manager::SessionLifecycleManager,
    persistent_task::{PersistentTask, RetryPolicy},
    session::SessionEvent,
    subscription::Subscription,
};

/// A received message, with its attachment when the sender declared one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message: ChatMessage,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, inbound: InboundMessage);
}

#[async_trait]
impl<F> MessageListener for F
where
    F: Fn(InboundMessage) + Send + Sync,
{
    async fn on_message(&self, inbound: InboundMessage) {
        (self)(inbound)
    }
}

pub struct MessageSyncClient {
    http: Client,
    endpoints: MessageEndpoints,
    sessions: Arc<SessionLifecycleManager>,
    lifecycle: Arc<AppLifecycleBroadcaster>,
    store: OfflineStore,
    identity: Arc<dyn IdentityProvider>,
    retry: RetryPolicy,
    globally_registered: Arc<AtomicBool>,
    active_scope: Arc<Mutex<Option<String>>>,
}

impl MessageSyncClient {
    pub fn new(
        endpoints: MessageEndpoints,
        sessions: Arc<SessionLifecycleManager>,
        lifecycle: Arc<AppLifecycleBroadcaster>,
        store: OfflineStore,
        identity: Arc<dyn IdentityProvider>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|error| {
                warn!(%error, "falling back to default http client");
                Client::new()
            });
        Arc::new(Self {
            http,
            endpoints,
            sessions,
            lifecycle,
            store,
            identity,
            retry,
            globally_registered: Arc::new(AtomicBool::new(false)),
            active_scope: Arc::new(Mutex::new(None)),
        })
    }

    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    pub fn is_globally_registered(&self) -> bool {
        self.globally_registered.load(Ordering::SeqCst)
    }

    pub fn active_scope(&self) -> Option<String> {
        scope(&self.active_scope).clone()
    }

    /// Fetches the stored backlog for `user_id` and delivers it in server order.
    ///
    /// Returns how many messages reached the listener. Failures are logged and
    /// yield zero.
    pub async fn sync(&self, user_id: &str, listener: &dyn MessageListener) -> usize {
        let backlog = match self.fetch_backlog(user_id).await {
            Ok(backlog) => backlog,
            Err(error) => {
                warn!(%error, user_id, "message backlog sync failed");
                return 0;
            }
        };
        info!(user_id, count = backlog.len(), "fetched message backlog");

        let mut delivered = 0;
        for message in &backlog {
            match self.deliver(message, listener).await {
                Ok(()) => delivered += 1,
                Err(error) => warn!(%error, message_id = %message.id, "skipping backlog message"),
            }
        }
        delivered
    }

    async fn fetch_backlog(&self, user_id: &str) -> Result<Vec<WireMessage>, RequestError> {
        Ok(self
            .http
            .get(self.endpoints.sync_url(user_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Registers the inbox-level listener. Only one may exist at a time; a
    /// second call returns `None` and registers nothing.
    ///
    /// Messages from the peer currently scoped by `listen_to_id` are left to
    /// that listener.
    pub async fn listen(
        self: &Arc<Self>,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Subscription> {
        if self.globally_registered.swap(true, Ordering::SeqCst) {
            debug!("global message listener already registered");
            return None;
        }

        let session = self.sessions.get_or_create().await;
        let client = Arc::downgrade(self);
        let inner = session.subscribe(SessionEvent::Message, move |raw| {
            let Some(client) = client.upgrade() else {
                return;
            };
            let Some(message) = parse_inbound(raw) else {
                return;
            };
            if scope(&client.active_scope).as_deref() == Some(message.sender_id.as_str()) {
                return;
            }
            client.deliver_persistently(message, Arc::clone(&listener));
        });

        let registered = Arc::clone(&self.globally_registered);
        Some(Subscription::new(move || {
            registered.store(false, Ordering::SeqCst);
            inner.unsubscribe();
        }))
    }

    /// Registers a listener for messages sent by `peer_id` and marks that peer
    /// as scoped so the global listener skips it.
    ///
    /// Only the most recent scope delivers: an older scoped listener stays
    /// silent until the marker names its peer again.
    pub async fn listen_to_id(
        self: &Arc<Self>,
        peer_id: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Subscription {
        *scope(&self.active_scope) = Some(peer_id.to_string());

        let session = self.sessions.get_or_create().await;
        let client = Arc::downgrade(self);
        let peer = peer_id.to_string();
        let inner = session.subscribe(SessionEvent::Message, move |raw| {
            let Some(client) = client.upgrade() else {
                return;
            };
            let Some(message) = parse_inbound(raw) else {
                return;
            };
            if message.sender_id != peer
                || scope(&client.active_scope).as_deref() != Some(peer.as_str())
            {
                return;
            }
            client.deliver_persistently(message, Arc::clone(&listener));
        });

        let active_scope = Arc::clone(&self.active_scope);
        let peer = peer_id.to_string();
        Subscription::new(move || {
            let mut current = scope(&active_scope);
            if current.as_deref() == Some(peer.as_str()) {
                *current = None;
            }
            drop(current);
            inner.unsubscribe();
        })
    }

    /// Sends `message` to `receiver_id` and records it locally. An attachment
    /// is uploaded in the background and retried across foreground cycles.
    pub async fn send_message(
        self: &Arc<Self>,
        receiver_id: &str,
        mut message: ChatMessage,
        attachment: Option<Attachment>,
    ) -> ChatMessage {
        let attachment = attachment.and_then(|attachment| {
            let size = decoded_len(&attachment.file);
            if size > MAX_ATTACHMENT_BYTES {
                let error = RequestError::AttachmentTooLarge {
                    size,
                    limit: MAX_ATTACHMENT_BYTES,
                };
                warn!(%error, message_id = %message.id, "dropping attachment");
                return None;
            }
            Some(attachment)
        });

        message.receiver_id = Some(receiver_id.to_string());
        let wire = WireMessage::from_chat(receiver_id, &message, attachment.as_ref());
        match wire.to_json() {
            Ok(payload) => self.sessions.get_or_create().await.send(payload),
            Err(error) => warn!(%error, message_id = %message.id, "failed to encode message"),
        }

        self.record_message(receiver_id, &mut message, attachment.as_ref())
            .await;

        if let Some(attachment) = attachment {
            let client = Arc::downgrade(self);
            let message_id = message.id.clone();
            PersistentTask::spawn(&self.lifecycle, self.retry, "attachment upload", move || {
                let client = client.clone();
                let message_id = message_id.clone();
                let attachment = attachment.clone();
                async move {
                    let Some(client) = client.upgrade() else {
                        return Ok(());
                    };
                    client
                        .try_send_attachment(&message_id, &attachment)
                        .await
                        .with_context(|| format!("uploading attachment for {message_id}"))
                }
            });
        }
        message
    }

    /// Downloads the base64 attachment of `message_id`; `None` on any failure.
    pub async fn request_attachment(&self, message_id: &str) -> Option<String> {
        match self.try_request_attachment(message_id).await {
            Ok(file) => Some(file),
            Err(error) => {
                warn!(%error, message_id, "attachment download failed");
                None
            }
        }
    }

    /// Uploads an attachment for `message_id`; `false` on any failure.
    pub async fn send_attachment(&self, message_id: &str, attachment: &Attachment) -> bool {
        match self.try_send_attachment(message_id, attachment).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, message_id, "attachment upload failed");
                false
            }
        }
    }

    async fn try_request_attachment(&self, message_id: &str) -> Result<String, RequestError> {
        let response: AttachmentDownloadResponse = self
            .http
            .get(self.endpoints.attachment_download_url(message_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.chat_message_attached_file)
    }

    async fn try_send_attachment(
        &self,
        message_id: &str,
        attachment: &Attachment,
    ) -> Result<(), RequestError> {
        self.http
            .post(self.endpoints.attachment_upload_url())
            .json(&AttachmentUploadRequest {
                chat_message_attachment_id: message_id.to_string(),
                chat_message_attached_file: attachment.file.clone(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Persists a message into its conversation, storing the attachment file
    /// first and indexing the conversation when it is new.
    pub async fn record_message(
        &self,
        conversation_id: &str,
        message: &mut ChatMessage,
        attachment: Option<&Attachment>,
    ) -> bool {
        if let Some(attachment) = attachment {
            if self.store.attach_to_message(message, attachment).await.is_none() {
                debug!(message_id = %message.id, "attachment not stored locally");
            }
        }
        let appended = self.store.append_message(conversation_id, message).await;
        if self
            .store
            .add_conversation(Conversation::named_after_id(conversation_id))
            .await
        {
            info!(conversation_id, "new conversation");
        }
        appended
    }

    /// The conversation a message belongs to from `me`'s point of view: the
    /// sender when it was addressed to me, otherwise its receiver.
    pub fn conversation_id_for<'a>(message: &'a ChatMessage, me: &str) -> &'a str {
        match message.receiver_id.as_deref() {
            Some(receiver) if receiver != me => receiver,
            _ => message.sender_id(),
        }
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.identity.current_user_id()
    }

    fn deliver_persistently(
        self: &Arc<Self>,
        message: WireMessage,
        listener: Arc<dyn MessageListener>,
    ) {
        let client: Weak<Self> = Arc::downgrade(self);
        let message = Arc::new(message);
        PersistentTask::spawn(&self.lifecycle, self.retry, "message delivery", move || {
            let client = client.clone();
            let message = Arc::clone(&message);
            let listener = Arc::clone(&listener);
            async move {
                let Some(client) = client.upgrade() else {
                    return Ok(());
                };
                client.deliver(&message, listener.as_ref()).await
            }
        });
    }

    /// Converts and hands one wire message to `listener`. A declared
    /// attachment must be fetched first; without it nothing is delivered.
    async fn deliver(
        &self,
        message: &WireMessage,
        listener: &dyn MessageListener,
    ) -> anyhow::Result<()> {
        let attachment = if message.declares_attachment() {
            let file = self
                .request_attachment(&message.id)
                .await
                .with_context(|| format!("attachment for message {} unavailable", message.id))?;
            Some(message.attachment_with(file))
        } else {
            None
        };

        listener
            .on_message(InboundMessage {
                message: message.to_chat(),
                attachment,
            })
            .await;
        Ok(())
    }
}

fn parse_inbound(raw: &str) -> Option<WireMessage> {
    match WireMessage::from_json(raw) {
        Ok(message) => Some(message),
        Err(error) => {
            warn!(%error, "ignoring malformed inbound message");
            None
        }
    }
}

fn scope(active_scope: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    active_scope.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Byte length of a base64 payload once decoded, without decoding it.
fn decoded_len(encoded: &str) -> usize {
    let trimmed = encoded.trim_end_matches('=');
    trimmed.len() * 3 / 4
}

#[cfg(test)]
#[path = "tests/message_client_tests.rs"]
mod tests;
