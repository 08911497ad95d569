use std::{sync::Arc, time::Duration};

use reqwest::Client;
use shared::protocol::DeviceTokenUpdate;
use storage::OfflineStore;
use tracing::{info, warn};

use crate::{config::MessageEndpoints, error::RequestError, identity::IdentityProvider};

/// Keeps the server's copy of this device's push token current.
pub struct DeviceTokenSync {
    http: Client,
    endpoints: MessageEndpoints,
    store: OfflineStore,
    identity: Arc<dyn IdentityProvider>,
}

impl DeviceTokenSync {
    pub fn new(
        endpoints: MessageEndpoints,
        store: OfflineStore,
        identity: Arc<dyn IdentityProvider>,
        request_timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|error| {
                warn!(%error, "falling back to default http client");
                Client::new()
            });
        Self {
            http,
            endpoints,
            store,
            identity,
        }
    }

    /// `Some(remote)` when it differs from the locally stored token.
    pub async fn token_changed(&self, remote: &str) -> Option<String> {
        match self.store.load_device_token().await {
            Some(local) if local == remote => None,
            _ => Some(remote.to_string()),
        }
    }

    /// Stores `token` locally and reports it to the account server.
    pub async fn update_token(&self, token: &str) -> bool {
        self.store.save_device_token(token).await;
        match self.push(token).await {
            Ok(()) => {
                info!("device token updated");
                true
            }
            Err(error) => {
                warn!(%error, "failed to report device token");
                false
            }
        }
    }

    /// Reports `remote` only when it changed since the last report.
    pub async fn refresh(&self, remote: &str) -> bool {
        match self.token_changed(remote).await {
            Some(token) => self.update_token(&token).await,
            None => false,
        }
    }

    async fn push(&self, token: &str) -> Result<(), RequestError> {
        let user_id = self
            .identity
            .current_user_id()
            .ok_or(RequestError::MissingIdentity)?;
        self.http
            .put(self.endpoints.user_url(&user_id))
            .json(&DeviceTokenUpdate {
                device_token: token.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
