use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Attachment, ChatMessage, Conversation, SavedCredentials},
    timestamp::newest_first,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    backend::KeyValueBackend,
    classify::{AttachmentClassifier, FileClass, MagicBytesClassifier},
    StorageError,
};

const CONVERSATIONS_KEY: &str = "conversations";
const MESSAGES_KEY: &str = "messages";
const DEVICE_TOKEN_KEY: &str = "deviceToken";
const CREDENTIALS_KEY: &str = "session";

type HistoryMap = BTreeMap<String, Vec<ChatMessage>>;

/// Offline persistence shared by every component of the client.
///
/// All public operations log failures and degrade to an empty or falsy
/// result; "nothing stored" and "load failed" look the same to callers.
/// Every read-modify-write of the history blob is serialized through
/// `writer`, so concurrent appends never lose each other's updates.
#[derive(Clone)]
pub struct OfflineStore {
    backend: Arc<dyn KeyValueBackend>,
    attachments_dir: PathBuf,
    classifier: Arc<dyn AttachmentClassifier>,
    writer: Arc<Mutex<()>>,
}

impl OfflineStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>, attachments_dir: impl Into<PathBuf>) -> Self {
        Self::with_classifier(backend, attachments_dir, Arc::new(MagicBytesClassifier))
    }

    pub fn with_classifier(
        backend: Arc<dyn KeyValueBackend>,
        attachments_dir: impl Into<PathBuf>,
        classifier: Arc<dyn AttachmentClassifier>,
    ) -> Self {
        Self {
            backend,
            attachments_dir: attachments_dir.into(),
            classifier,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn attachments_dir(&self) -> &Path {
        &self.attachments_dir
    }

    pub async fn load_conversations(&self) -> Vec<Conversation> {
        match self.read_json::<Vec<Conversation>>(CONVERSATIONS_KEY).await {
            Ok(conversations) => conversations.unwrap_or_default(),
            Err(error) => {
                warn!(%error, "failed to load conversations");
                Vec::new()
            }
        }
    }

    pub async fn save_conversations(&self, conversations: &[Conversation]) -> bool {
        match self.write_json(CONVERSATIONS_KEY, &conversations).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "failed to save conversations");
                false
            }
        }
    }

    /// Appends `conversation` to the index unless one with the same id exists.
    /// Returns true only when the index grew.
    pub async fn add_conversation(&self, conversation: Conversation) -> bool {
        let _guard = self.writer.lock().await;
        let mut conversations = match self.read_json::<Vec<Conversation>>(CONVERSATIONS_KEY).await
        {
            Ok(existing) => existing.unwrap_or_default(),
            Err(error) => {
                warn!(%error, conversation_id = %conversation.id, "failed to load conversations");
                return false;
            }
        };
        if conversations.iter().any(|known| known.id == conversation.id) {
            return false;
        }
        conversations.push(conversation);
        match self.write_json(CONVERSATIONS_KEY, &conversations).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "failed to save conversations");
                false
            }
        }
    }

    pub async fn load_history(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let mut histories = match self.read_json::<HistoryMap>(MESSAGES_KEY).await {
            Ok(histories) => histories.unwrap_or_default(),
            Err(error) => {
                warn!(%error, conversation_id, "failed to load message history");
                return Vec::new();
            }
        };
        let mut history = histories.remove(conversation_id).unwrap_or_default();
        for message in &mut history {
            if let (Some(path), None) = (&message.attachment_path, &message.document_name) {
                message.image = Some(format!("file://{path}"));
            }
        }
        history
    }

    /// Adds `message` to the conversation and keeps the history newest first.
    ///
    /// Messages already present (same id) are skipped. Among equal
    /// timestamps the most recently appended message comes first.
    pub async fn append_message(&self, conversation_id: &str, message: &ChatMessage) -> bool {
        let _guard = self.writer.lock().await;
        match self.append_locked(conversation_id, message).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    %error,
                    conversation_id,
                    message_id = %message.id,
                    "failed to append message"
                );
                false
            }
        }
    }

    async fn append_locked(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
    ) -> Result<(), StorageError> {
        let mut histories = self
            .read_json::<HistoryMap>(MESSAGES_KEY)
            .await?
            .unwrap_or_default();
        let history = histories.entry(conversation_id.to_string()).or_default();
        if history.iter().any(|existing| existing.id == message.id) {
            debug!(conversation_id, message_id = %message.id, "message already stored");
            return Ok(());
        }

        let mut stored = message.clone();
        // Images are rehydrated from the attachment path on load.
        stored.image = None;
        history.insert(0, stored);
        history.sort_by(|a, b| newest_first(&a.created_at, &b.created_at));

        self.write_json(MESSAGES_KEY, &histories).await
    }

    /// Writes a base64 attachment to `<attachments_dir>/<id>.<ext>`.
    ///
    /// Returns `None` when the payload cannot be decoded or classified.
    pub async fn save_attachment_blob(&self, id: &str, base64_payload: &str) -> Option<PathBuf> {
        self.store_blob(id, base64_payload)
            .await
            .map(|(path, _)| path)
    }

    /// Stores the attachment file and points `message` at it: images get an
    /// inline data uri for immediate display, anything else a document name.
    pub async fn attach_to_message(
        &self,
        message: &mut ChatMessage,
        attachment: &Attachment,
    ) -> Option<PathBuf> {
        let (path, class) = self.store_blob(&message.id, &attachment.file).await?;
        if attachment.is_image() {
            message.image = Some(format!("data:{};base64,{}", class.mime, attachment.file));
        } else {
            message.document_name = Some(attachment.file_name.clone());
        }
        message.attachment_path = Some(path.display().to_string());
        Some(path)
    }

    async fn store_blob(&self, id: &str, base64_payload: &str) -> Option<(PathBuf, FileClass)> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            warn!(attachment_id = id, "refusing attachment id that is not a plain file name");
            return None;
        }
        let bytes = match STANDARD.decode(base64_payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, attachment_id = id, "attachment payload is not valid base64");
                return None;
            }
        };
        let Some(class) = self.classifier.classify(&bytes) else {
            debug!(attachment_id = id, "attachment type not recognised; not saved");
            return None;
        };

        let path = self
            .attachments_dir
            .join(format!("{id}.{}", class.extension));
        let written: Result<(), StorageError> = async {
            tokio::fs::create_dir_all(&self.attachments_dir).await?;
            tokio::fs::write(&path, &bytes).await?;
            Ok(())
        }
        .await;
        match written {
            Ok(()) => Some((path, class)),
            Err(error) => {
                warn!(%error, path = %path.display(), "failed to write attachment");
                None
            }
        }
    }

    pub async fn load_device_token(&self) -> Option<String> {
        match self.backend.get(DEVICE_TOKEN_KEY).await {
            Ok(token) => token.filter(|token| !token.is_empty()),
            Err(error) => {
                warn!(%error, "failed to load device token");
                None
            }
        }
    }

    pub async fn save_device_token(&self, token: &str) -> bool {
        match self.backend.put(DEVICE_TOKEN_KEY, token).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "failed to save device token");
                false
            }
        }
    }

    pub async fn load_saved_credentials(&self) -> Option<SavedCredentials> {
        match self.read_json::<SavedCredentials>(CREDENTIALS_KEY).await {
            Ok(credentials) => credentials,
            Err(error) => {
                warn!(%error, "failed to load saved credentials");
                None
            }
        }
    }

    pub async fn save_saved_credentials(&self, email: &str, secret: &str) -> bool {
        let credentials = SavedCredentials {
            email: email.to_string(),
            password: secret.to_string(),
        };
        match self.write_json(CREDENTIALS_KEY, &credentials).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "failed to save credentials");
                false
            }
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.backend.put(key, &raw).await
    }
}

#[cfg(test)]
#[path = "tests/offline_store_tests.rs"]
mod tests;
