//! Delivery of finalized agent replies over the bridge's system session.

use anyhow::{anyhow, Result};

use waggle_bridge::{BridgeClient, BridgeError};
use waggle_store::Store;

pub struct ReplyDelivery {
    bridge: BridgeClient,
    store: Store,
    /// System session the reply is sent from.
    session_id: String,
}

impl ReplyDelivery {
    pub fn new(bridge: BridgeClient, store: Store, session_id: String) -> Self {
        Self {
            bridge,
            store,
            session_id,
        }
    }

    /// Send one reply to the user's WhatsApp number.
    ///
    /// Transport and bridge-side failures are returned as errors so the
    /// caller can retry the turn. Session-level errors (missing, not
    /// connected) are not retriable; they are logged and swallowed so
    /// operators can act on them.
    pub async fn deliver(&self, user_id: i64, content: &str) -> Result<()> {
        let user = self
            .store
            .user_by_id(user_id)
            .await?
            .ok_or_else(|| anyhow!("user {user_id} not found"))?;

        match self
            .bridge
            .send_message(&self.session_id, &user.phone_number, content, None)
            .await
        {
            Ok(sent) => {
                tracing::info!(
                    "delivered reply {} to {} ({})",
                    sent.message_id,
                    user.phone_number,
                    sent.status
                );
                Ok(())
            }
            Err(BridgeError::Session(reason)) => {
                tracing::error!(
                    "cannot deliver reply to {}: {reason}",
                    user.phone_number
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
