use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use url::Url;

use crate::{error::SessionError, persistent_task::RetryPolicy};

pub const DEFAULT_MESSAGE_PORT: u16 = 8763;
pub const DEFAULT_ACCOUNT_PORT: u16 = 8762;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_host: String,
    pub message_port: u16,
    pub account_port: u16,
    pub use_tls: bool,
    pub data_dir: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub task_max_attempts: Option<u32>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".into(),
            message_port: DEFAULT_MESSAGE_PORT,
            account_port: DEFAULT_ACCOUNT_PORT,
            use_tls: false,
            data_dir: PathBuf::from("./data"),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            task_max_attempts: None,
        }
    }
}

impl ClientSettings {
    pub fn endpoints(&self) -> Result<MessageEndpoints, SessionError> {
        Ok(MessageEndpoints::for_host(
            &self.server_host,
            self.message_port,
            self.account_port,
            self.use_tls,
        )?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.task_max_attempts,
        }
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply(&mut settings, |key| file_cfg.get(key).cloned());
        }
    }

    apply(&mut settings, |key| env(&format!("APP__{}", key.to_ascii_uppercase())));
    settings
}

fn apply(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_host") {
        settings.server_host = v;
    }
    if let Some(v) = lookup("message_port").and_then(|v| v.parse().ok()) {
        settings.message_port = v;
    }
    if let Some(v) = lookup("account_port").and_then(|v| v.parse().ok()) {
        settings.account_port = v;
    }
    if let Some(v) = lookup("use_tls") {
        settings.use_tls = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    if let Some(v) = lookup("data_dir") {
        settings.data_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("connect_timeout_secs").and_then(|v| v.parse().ok()) {
        settings.connect_timeout = Duration::from_secs(v);
    }
    if let Some(v) = lookup("request_timeout_secs").and_then(|v| v.parse().ok()) {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = lookup("task_max_attempts") {
        settings.task_max_attempts = v.parse().ok().filter(|attempts| *attempts > 0);
    }
}

/// Resolved server addresses for the message socket and the HTTP endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEndpoints {
    socket_base: Url,
    http_base: Url,
    account_base: Url,
}

impl MessageEndpoints {
    pub fn for_host(
        host: &str,
        message_port: u16,
        account_port: u16,
        use_tls: bool,
    ) -> Result<Self, url::ParseError> {
        let (ws, http) = if use_tls { ("wss", "https") } else { ("ws", "http") };
        Self::from_bases(
            &format!("{ws}://{host}:{message_port}"),
            &format!("{http}://{host}:{message_port}"),
            &format!("{http}://{host}:{account_port}"),
        )
    }

    pub fn from_bases(
        socket_base: &str,
        http_base: &str,
        account_base: &str,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            socket_base: Url::parse(socket_base)?,
            http_base: Url::parse(http_base)?,
            account_base: Url::parse(account_base)?,
        })
    }

    /// `ws(s)://host:port/message?<userId>`; the server reads the raw query.
    pub fn message_socket_url(&self, user_id: &str) -> Url {
        let mut url = with_segments(&self.socket_base, &["message"]);
        url.set_query(Some(user_id));
        url
    }

    pub fn sync_url(&self, user_id: &str) -> Url {
        with_segments(&self.http_base, &["sync", "messages", user_id])
    }

    pub fn attachment_download_url(&self, message_id: &str) -> Url {
        with_segments(&self.http_base, &["attachment", "download", message_id])
    }

    pub fn attachment_upload_url(&self) -> Url {
        with_segments(&self.http_base, &["attachment", "upload"])
    }

    pub fn user_url(&self, user_id: &str) -> Url {
        with_segments(&self.account_base, &["user", user_id])
    }
}

fn with_segments(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
