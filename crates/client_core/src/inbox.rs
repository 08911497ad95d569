use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::warn;

use crate::message_client::{InboundMessage, MessageListener, MessageSyncClient};

/// Persists every inbound message into its conversation before handing the
/// stored form (attachment paths filled in) to `downstream`.
pub struct RecordingListener {
    client: Weak<MessageSyncClient>,
    downstream: Arc<dyn MessageListener>,
}

impl RecordingListener {
    pub fn new(client: &Arc<MessageSyncClient>, downstream: Arc<dyn MessageListener>) -> Arc<Self> {
        Arc::new(Self {
            client: Arc::downgrade(client),
            downstream,
        })
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn on_message(&self, inbound: InboundMessage) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let Some(me) = client.current_user_id() else {
            warn!(message_id = %inbound.message.id, "no signed-in user; message not recorded");
            self.downstream.on_message(inbound).await;
            return;
        };

        let InboundMessage {
            mut message,
            attachment,
        } = inbound;
        let conversation_id = MessageSyncClient::conversation_id_for(&message, &me).to_string();
        client
            .record_message(&conversation_id, &mut message, attachment.as_ref())
            .await;

        self.downstream
            .on_message(InboundMessage {
                message,
                attachment,
            })
            .await;
    }
}
