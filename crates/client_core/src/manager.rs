use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    config::MessageEndpoints, identity::IdentityProvider, lifecycle::SessionHooks,
    session::ConnectionSession,
};

/// Owns the process's single `ConnectionSession`.
///
/// The session is created lazily and reopened whenever it is requested while
/// closed. Pausing closes the transport but keeps the session and its queue.
pub struct SessionLifecycleManager {
    endpoints: MessageEndpoints,
    identity: Arc<dyn IdentityProvider>,
    connect_timeout: Duration,
    session: Mutex<Option<Arc<ConnectionSession>>>,
}

impl SessionLifecycleManager {
    pub fn new(
        endpoints: MessageEndpoints,
        identity: Arc<dyn IdentityProvider>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            identity,
            connect_timeout,
            session: Mutex::new(None),
        })
    }

    /// Returns the session, opening it first when it is not open.
    ///
    /// A failed open is logged and the closed session is still returned, so
    /// sends made now are queued for the next resume.
    pub async fn get_or_create(&self) -> Arc<ConnectionSession> {
        let mut slot = self.session.lock().await;
        let session = slot
            .get_or_insert_with(|| {
                debug!("creating message session");
                ConnectionSession::new(
                    self.endpoints.clone(),
                    Arc::clone(&self.identity),
                    self.connect_timeout,
                )
            })
            .clone();

        if !session.is_open() {
            if let Err(err) = session.open().await {
                warn!(error = %err, "failed to open message session");
            }
        }
        session
    }

    pub async fn resume(&self) -> Arc<ConnectionSession> {
        self.get_or_create().await
    }

    pub async fn pause(&self) {
        if let Some(session) = self.session.lock().await.as_ref() {
            session.close();
        }
    }

    pub async fn current(&self) -> Option<Arc<ConnectionSession>> {
        self.session.lock().await.clone()
    }

    /// Closes and forgets the session. A later `get_or_create` starts a fresh one.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close();
        }
    }
}

#[async_trait]
impl SessionHooks for SessionLifecycleManager {
    async fn resume(&self) {
        let _ = SessionLifecycleManager::resume(self).await;
    }

    async fn pause(&self) {
        SessionLifecycleManager::pause(self).await;
    }
}
