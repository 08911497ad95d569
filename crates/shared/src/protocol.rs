use serde::{Deserialize, Serialize};

use crate::{
    domain::{Attachment, ChatMessage, ChatUser},
    error::ConversionError,
};

/// Largest attachment accepted for upload (20 MiB of decoded content).
pub const MAX_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;

/// Message as carried over the websocket and returned by the sync endpoint.
///
/// Absent optional fields travel as the literal string `"null"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    #[serde(default)]
    pub is_voice: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default, with = "null_sentinel")]
    pub file_name: Option<String>,
    #[serde(default, with = "null_sentinel")]
    pub file_type: Option<String>,
    pub created_at: String,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default, with = "null_sentinel")]
    pub group_id: Option<String>,
}

impl WireMessage {
    pub fn from_chat(
        receiver_id: &str,
        message: &ChatMessage,
        attachment: Option<&Attachment>,
    ) -> Self {
        Self {
            id: message.id.clone(),
            is_voice: false,
            text: Some(message.text.clone()),
            is_file: attachment.is_some(),
            file_name: attachment.map(|a| a.file_name.clone()),
            file_type: attachment.map(|a| a.file_type.clone()),
            created_at: message.created_at.clone(),
            sender_id: message.user.id.clone(),
            receiver_id: receiver_id.to_string(),
            group_id: None,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConversionError> {
        let message: Self = serde_json::from_str(raw)?;
        if message.id.is_empty() {
            return Err(ConversionError::MissingField("id"));
        }
        if message.sender_id.is_empty() {
            return Err(ConversionError::MissingField("senderId"));
        }
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, ConversionError> {
        Ok(serde_json::to_string(self)?)
    }

    /// True when the sender attached a file that has to be fetched separately.
    pub fn declares_attachment(&self) -> bool {
        self.is_file && self.file_name.is_some()
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            id: self.id.clone(),
            text: self.text.clone().unwrap_or_default(),
            created_at: self.created_at.clone(),
            user: ChatUser {
                id: self.sender_id.clone(),
            },
            voice: self.is_voice,
            receiver_id: Some(self.receiver_id.clone()).filter(|id| !id.is_empty()),
            attachment_path: None,
            image: None,
            document_name: None,
        }
    }

    /// Rebuilds the transient attachment from a downloaded base64 payload.
    pub fn attachment_with(&self, file: String) -> Attachment {
        Attachment {
            file,
            file_name: self.file_name.clone().unwrap_or_default(),
            file_type: self.file_type.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDownloadResponse {
    pub chat_message_attached_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUploadRequest {
    pub chat_message_attachment_id: String,
    pub chat_message_attached_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenUpdate {
    pub device_token: String,
}

mod null_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    const NULL: &str = "null";

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_deref().unwrap_or(NULL))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.filter(|value| value != NULL && !value.is_empty()))
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
