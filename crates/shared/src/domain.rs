use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FILE_TYPE_IMAGE: &str = "image";
pub const FILE_TYPE_DOCUMENT: &str = "document";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    #[serde(rename = "_id")]
    pub id: String,
}

/// Message shape handed to the UI and kept in the offline history.
///
/// Binary attachment content never lives here; only the local file path
/// (`attachment_path`) and the display hints derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub created_at: String,
    pub user: ChatUser,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub voice: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_name: Option<String>,
}

impl ChatMessage {
    /// Builds an outgoing message with a fresh id stamped with the current time.
    pub fn new(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            user: ChatUser {
                id: sender_id.into(),
            },
            voice: false,
            receiver_id: None,
            attachment_path: None,
            image: None,
            document_name: None,
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.user.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Base64 encoded file content.
    pub file: String,
    pub file_name: String,
    pub file_type: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.file_type == FILE_TYPE_IMAGE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: String,
}

impl Conversation {
    pub fn named_after_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCredentials {
    pub email: String,
    pub password: String,
}
