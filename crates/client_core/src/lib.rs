use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use storage::{OfflineStore, SqliteBackend};
use tokio::sync::mpsc;
use tracing::info;

pub mod config;
pub mod device_token;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod lifecycle;
pub mod manager;
pub mod message_client;
pub mod persistent_task;
pub mod session;
pub mod subscription;

pub use config::{load_settings, ClientSettings, MessageEndpoints};
pub use device_token::DeviceTokenSync;
pub use error::{RequestError, SessionError};
pub use identity::{Identity, IdentityProvider};
pub use inbox::RecordingListener;
pub use lifecycle::{AppLifecycleBroadcaster, AppPhase, LifecycleCallback, SessionHooks};
pub use manager::SessionLifecycleManager;
pub use message_client::{InboundMessage, MessageListener, MessageSyncClient};
pub use persistent_task::{PersistentTask, RetryPolicy, TaskOutcome};
pub use session::{ConnectionSession, ConnectionState, SessionEvent};
pub use subscription::{Registry, Subscription};

/// Everything one signed-in client needs, wired together once.
///
/// Replaces process-wide singletons: components receive what they use from
/// here, and `shutdown` tears the whole graph down explicitly.
pub struct MessagingContext {
    settings: ClientSettings,
    identity: Arc<dyn IdentityProvider>,
    lifecycle: Arc<AppLifecycleBroadcaster>,
    sessions: Arc<SessionLifecycleManager>,
    store: OfflineStore,
    client: Arc<MessageSyncClient>,
    device_tokens: DeviceTokenSync,
    inbox: Mutex<Option<Arc<Subscription>>>,
}

impl MessagingContext {
    /// Builds a context backed by the sqlite store under `settings.data_dir`.
    pub async fn open(
        settings: ClientSettings,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let database_url = SqliteBackend::sqlite_url_for_data_dir(&settings.data_dir);
        let backend = SqliteBackend::new(&database_url)
            .await
            .with_context(|| format!("failed to open offline store at {database_url}"))?;
        let store = OfflineStore::new(Arc::new(backend), settings.attachments_dir());
        Self::with_store(settings, identity, store)
    }

    pub fn with_store(
        settings: ClientSettings,
        identity: Arc<dyn IdentityProvider>,
        store: OfflineStore,
    ) -> Result<Self> {
        let endpoints = settings
            .endpoints()
            .context("invalid message server address")?;
        let lifecycle = AppLifecycleBroadcaster::new(AppPhase::Active);
        let sessions = SessionLifecycleManager::new(
            endpoints.clone(),
            Arc::clone(&identity),
            settings.connect_timeout,
        );
        lifecycle.attach_session_hooks(sessions.clone());

        let client = MessageSyncClient::new(
            endpoints.clone(),
            Arc::clone(&sessions),
            Arc::clone(&lifecycle),
            store.clone(),
            Arc::clone(&identity),
            settings.retry_policy(),
            settings.request_timeout,
        );
        let device_tokens = DeviceTokenSync::new(
            endpoints,
            store.clone(),
            Arc::clone(&identity),
            settings.request_timeout,
        );

        Ok(Self {
            settings,
            identity,
            lifecycle,
            sessions,
            store,
            client,
            device_tokens,
            inbox: Mutex::new(None),
        })
    }

    /// Connects, starts following host lifecycle signals, catches up on the
    /// backlog when nothing is stored yet, and registers the inbox listener.
    ///
    /// Every inbound message is recorded before `listener` sees it. Returns
    /// `None` if a global listener was already registered. The listener is
    /// also released by `shutdown`.
    pub async fn start(
        &self,
        signals: mpsc::UnboundedReceiver<AppPhase>,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Subscription> {
        self.sessions.get_or_create().await;
        self.lifecycle.init(signals);

        let inbox = RecordingListener::new(&self.client, listener);
        if let Some(user_id) = self.identity.current_user_id() {
            if self.store.load_conversations().await.is_empty() {
                let delivered = self.client.sync(&user_id, inbox.as_ref()).await;
                info!(%user_id, delivered, "initial backlog sync complete");
            }
        }
        let registered = Arc::new(self.client.listen(inbox).await?);
        {
            let mut slot = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(Arc::clone(&registered));
        }
        Some(Subscription::new(move || registered.unsubscribe()))
    }

    pub async fn shutdown(&self) {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(inbox) = inbox {
            inbox.unsubscribe();
        }
        self.lifecycle.destroy();
        self.sessions.shutdown().await;
        info!("messaging context shut down");
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> &Arc<AppLifecycleBroadcaster> {
        &self.lifecycle
    }

    pub fn sessions(&self) -> &Arc<SessionLifecycleManager> {
        &self.sessions
    }

    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    pub fn client(&self) -> &Arc<MessageSyncClient> {
        &self.client
    }

    pub fn device_tokens(&self) -> &DeviceTokenSync {
        &self.device_tokens
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;
