//! In-process stand-in for the message server used by the async tests.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, RawQuery, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::ChatMessage,
    protocol::{AttachmentDownloadResponse, AttachmentUploadRequest, DeviceTokenUpdate, WireMessage},
};
use storage::{MemoryBackend, OfflineStore};
use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    config::MessageEndpoints,
    identity::Identity,
    lifecycle::{AppLifecycleBroadcaster, AppPhase},
    manager::SessionLifecycleManager,
    message_client::{InboundMessage, MessageListener, MessageSyncClient},
    persistent_task::RetryPolicy,
};

pub(crate) const ME: &str = "me";

#[derive(Debug, Clone)]
pub(crate) enum Push {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Clone)]
pub(crate) struct FakeServer {
    pub addr: SocketAddr,
    pub push: broadcast::Sender<Push>,
    pub connections: Arc<AtomicUsize>,
    pub socket_queries: Arc<Mutex<Vec<String>>>,
    pub received: Arc<Mutex<Vec<String>>>,
    pub backlog: Arc<Mutex<Vec<WireMessage>>>,
    pub sync_requests: Arc<Mutex<Vec<String>>>,
    pub attachments: Arc<Mutex<HashMap<String, String>>>,
    pub download_requests: Arc<AtomicUsize>,
    pub download_failures: Arc<AtomicUsize>,
    pub uploads: Arc<Mutex<Vec<AttachmentUploadRequest>>>,
    pub upload_failures: Arc<AtomicUsize>,
    pub device_tokens: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeServer {
    pub async fn spawn() -> Self {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let (push, _) = broadcast::channel(64);
        let server = Self {
            addr: listener.local_addr().expect("addr"),
            push,
            connections: Arc::new(AtomicUsize::new(0)),
            socket_queries: Arc::default(),
            received: Arc::default(),
            backlog: Arc::default(),
            sync_requests: Arc::default(),
            attachments: Arc::default(),
            download_requests: Arc::new(AtomicUsize::new(0)),
            download_failures: Arc::new(AtomicUsize::new(0)),
            uploads: Arc::default(),
            upload_failures: Arc::new(AtomicUsize::new(0)),
            device_tokens: Arc::default(),
        };

        let app = Router::new()
            .route("/message", get(socket))
            .route("/sync/messages/:user_id", get(sync_messages))
            .route("/attachment/download/:id", get(download))
            .route("/attachment/upload", post(upload))
            .route("/user/:user_id", put(update_user))
            .with_state(server.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        server
    }

    pub fn endpoints(&self) -> MessageEndpoints {
        MessageEndpoints::from_bases(
            &format!("ws://{}", self.addr),
            &format!("http://{}", self.addr),
            &format!("http://{}", self.addr),
        )
        .expect("endpoints")
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().expect("received").clone()
    }

    pub fn received_wire(&self) -> Vec<WireMessage> {
        self.received()
            .iter()
            .map(|raw| WireMessage::from_json(raw).expect("wire message"))
            .collect()
    }

    pub fn push_text(&self, payload: impl Into<String>) {
        self.push.send(Push::Text(payload.into())).expect("a socket is listening");
    }

    pub fn push_wire(&self, message: &WireMessage) {
        self.push_text(message.to_json().expect("json"));
    }

    pub fn push(&self, frame: Push) {
        self.push.send(frame).expect("a socket is listening");
    }

    pub fn set_attachment(&self, message_id: &str, file: &str) {
        self.attachments
            .lock()
            .expect("attachments")
            .insert(message_id.to_string(), file.to_string());
    }

    pub fn fail_downloads(&self, times: usize) {
        self.download_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, times: usize) {
        self.upload_failures.store(times, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<AttachmentUploadRequest> {
        self.uploads.lock().expect("uploads").clone()
    }
}

/// Endpoints for a port nothing listens on.
pub(crate) async fn unreachable_endpoints() -> MessageEndpoints {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    MessageEndpoints::from_bases(
        &format!("ws://{addr}"),
        &format!("http://{addr}"),
        &format!("http://{addr}"),
    )
    .expect("endpoints")
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn socket(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(server): State<FakeServer>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(server, socket, query.unwrap_or_default()))
}

async fn connection(server: FakeServer, socket: WebSocket, query: String) {
    let mut pushes = server.push.subscribe();
    server.socket_queries.lock().expect("queries").push(query);
    server.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sender, mut receiver) = socket.split();
    let forward = tokio::spawn(async move {
        while let Ok(frame) = pushes.recv().await {
            let result = match frame {
                Push::Text(text) => sender.send(Message::Text(text)).await,
                Push::Binary(bytes) => sender.send(Message::Binary(bytes)).await,
                Push::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Message::Text(text) => server.received.lock().expect("received").push(text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    forward.abort();
}

async fn sync_messages(
    State(server): State<FakeServer>,
    Path(user_id): Path<String>,
) -> Json<Vec<WireMessage>> {
    server.sync_requests.lock().expect("sync").push(user_id);
    Json(server.backlog.lock().expect("backlog").clone())
}

async fn download(
    State(server): State<FakeServer>,
    Path(id): Path<String>,
) -> Result<Json<AttachmentDownloadResponse>, StatusCode> {
    server.download_requests.fetch_add(1, Ordering::SeqCst);
    if take_failure(&server.download_failures) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let file = server
        .attachments
        .lock()
        .expect("attachments")
        .get(&id)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(AttachmentDownloadResponse {
        chat_message_attached_file: file,
    }))
}

async fn upload(
    State(server): State<FakeServer>,
    Json(request): Json<AttachmentUploadRequest>,
) -> StatusCode {
    if take_failure(&server.upload_failures) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    server.uploads.lock().expect("uploads").push(request);
    StatusCode::OK
}

async fn update_user(
    State(server): State<FakeServer>,
    Path(user_id): Path<String>,
    Json(update): Json<DeviceTokenUpdate>,
) -> StatusCode {
    server
        .device_tokens
        .lock()
        .expect("tokens")
        .push((user_id, update.device_token));
    StatusCode::OK
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until nothing new arrives for a short while.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

pub(crate) fn memory_store(dir: &tempfile::TempDir) -> OfflineStore {
    OfflineStore::new(Arc::new(MemoryBackend::new()), dir.path().join("attachments"))
}

pub(crate) fn wire(id: &str, sender: &str, receiver: &str, created_at: &str) -> WireMessage {
    WireMessage {
        id: id.to_string(),
        is_voice: false,
        text: Some(format!("text of {id}")),
        is_file: false,
        file_name: None,
        file_type: None,
        created_at: created_at.to_string(),
        sender_id: sender.to_string(),
        receiver_id: receiver.to_string(),
        group_id: None,
    }
}

pub(crate) fn wire_with_file(
    id: &str,
    sender: &str,
    file_name: &str,
    file_type: &str,
) -> WireMessage {
    WireMessage {
        is_file: true,
        file_name: Some(file_name.to_string()),
        file_type: Some(file_type.to_string()),
        ..wire(id, sender, ME, "2024-01-01T10:00:00")
    }
}

/// Base64 of a minimal png header, enough for the magic-byte classifier.
pub(crate) const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAE=";

/// Collects every delivery for later assertions.
#[derive(Default)]
pub(crate) struct Inbox {
    pub delivered: Mutex<Vec<InboundMessage>>,
}

impl Inbox {
    pub fn ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .expect("inbox")
            .iter()
            .map(|inbound| inbound.message.id.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<InboundMessage> {
        self.delivered.lock().expect("inbox").clone()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().expect("inbox").len()
    }
}

#[async_trait::async_trait]
impl MessageListener for Inbox {
    async fn on_message(&self, inbound: InboundMessage) {
        self.delivered.lock().expect("inbox").push(inbound);
    }
}

/// A signed-in client wired to a [`FakeServer`] with an in-memory store.
pub(crate) struct Harness {
    pub server: FakeServer,
    pub lifecycle: Arc<AppLifecycleBroadcaster>,
    pub sessions: Arc<SessionLifecycleManager>,
    pub client: Arc<MessageSyncClient>,
    pub store: OfflineStore,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_policy(RetryPolicy::default()).await
    }

    pub async fn with_policy(retry: RetryPolicy) -> Self {
        let server = FakeServer::spawn().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let store = memory_store(&dir);
        let identity = Arc::new(Identity::signed_in(ME));
        let lifecycle = AppLifecycleBroadcaster::new(AppPhase::Active);
        let sessions = SessionLifecycleManager::new(
            server.endpoints(),
            identity.clone(),
            Duration::from_secs(2),
        );
        lifecycle.attach_session_hooks(sessions.clone());
        let client = MessageSyncClient::new(
            server.endpoints(),
            Arc::clone(&sessions),
            Arc::clone(&lifecycle),
            store.clone(),
            identity,
            retry,
            Duration::from_secs(2),
        );
        Self {
            server,
            lifecycle,
            sessions,
            client,
            store,
            _dir: dir,
        }
    }

    /// Background then foreground, as the host would report it.
    pub async fn cycle_foreground(&self) {
        self.lifecycle.handle(AppPhase::Background).await;
        self.lifecycle.handle(AppPhase::Active).await;
    }
}

pub(crate) fn outgoing(id: &str, text: &str) -> ChatMessage {
    let mut message = ChatMessage::new(ME, text);
    message.id = id.to_string();
    message
}
