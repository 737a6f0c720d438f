//! Orchestration of one agent turn: persist the inbound text, run the
//! user's configured model with the archive tools, persist the reply.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use waggle_crypto::TokenCipher;
use waggle_schema::{AgentReply, LlmConfig, MessageCreate, MessageDirection};
use waggle_store::Store;

use crate::agent::{Agent, ConversationMessage};
use crate::tools::ToolSet;

/// Body of the reply stored and sent when a turn fails before the adapter
/// produces text.
pub const TURN_APOLOGY: &str =
    "I apologize, but I encountered an error processing your request.";

/// How many stored messages feed the conversation context.
const CONTEXT_MESSAGES: usize = 20;

/// Seam between the turn orchestration and its drivers (worker pool,
/// webhook handler, tests).
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one turn. `Err` signals an infrastructure failure the caller may
    /// retry; configuration problems come back as unsuccessful replies.
    async fn run_turn(&self, user_id: i64, content: &str) -> Result<AgentReply>;
}

pub struct AgentService {
    store: Store,
    cipher: TokenCipher,
}

impl AgentService {
    pub fn new(store: Store, cipher: TokenCipher) -> Self {
        Self { store, cipher }
    }

    async fn build_context(&self, user_id: i64) -> Result<Vec<ConversationMessage>> {
        let user = self
            .store
            .user_by_id(user_id)
            .await?
            .ok_or_else(|| anyhow!("user {user_id} not found"))?;

        let recent = self
            .store
            .get_recent_messages(user_id, CONTEXT_MESSAGES)
            .await?;

        // Newest-first from the store; the model wants oldest-first, with
        // system-direction messages dropped.
        let mut context = Vec::with_capacity(recent.len());
        for message in recent.into_iter().rev() {
            let role = match message.direction(&user.phone_number) {
                MessageDirection::Incoming => "user",
                MessageDirection::Outgoing => "assistant",
                MessageDirection::System => continue,
            };
            context.push(ConversationMessage {
                role: role.to_string(),
                content: message.content.unwrap_or_default(),
            });
        }
        Ok(context)
    }

    fn failure_reply(error_message: impl Into<String>) -> AgentReply {
        AgentReply {
            content: TURN_APOLOGY.to_string(),
            success: false,
            error_message: Some(error_message.into()),
            metadata: None,
        }
    }

    fn agent_for(&self, config: &LlmConfig, api_key: String) -> (Agent, String) {
        let model = config
            .model()
            .map(str::to_string)
            .unwrap_or_else(|| config.provider.default_model().to_string());
        let temperature = config.temperature().unwrap_or(0.7);
        let mut agent = match config.base_url() {
            Some(base_url) => Agent::new(
                "Waggle Assistant",
                None,
                model.clone(),
                temperature,
                Some(api_key),
                Some(base_url.to_string()),
            ),
            None => Agent::for_provider(
                config.provider,
                Some(api_key),
                Some(model.clone()),
                temperature,
            ),
        };
        if let Some(instructions) = config.custom_instructions() {
            agent.update_instructions(instructions);
        }
        (agent, model)
    }
}

#[async_trait]
impl AgentRunner for AgentService {
    async fn run_turn(&self, user_id: i64, content: &str) -> Result<AgentReply> {
        self.store
            .store_message(user_id, MessageCreate::text(MessageDirection::Incoming, content))
            .await?;

        let Some(config) = self.store.active_llm_config(user_id).await? else {
            tracing::warn!("user {user_id} has no active LLM configuration");
            return Ok(Self::failure_reply("LLM configuration not found"));
        };

        let context = self.build_context(user_id).await?;

        let api_key = match self.cipher.decrypt(&config.api_key_encrypted) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!("failed to decrypt API key for user {user_id}: {e}");
                return Ok(Self::failure_reply("LLM configuration corrupt"));
            }
        };

        let (agent, model) = self.agent_for(&config, api_key);
        let tools = ToolSet::new(self.store.clone(), user_id);
        let response = agent.process_message(content, &tools, &context).await;

        self.store
            .store_message(
                user_id,
                MessageCreate::text(MessageDirection::Outgoing, response.clone()),
            )
            .await?;

        Ok(AgentReply {
            content: response,
            success: true,
            error_message: None,
            metadata: Some(json!({
                "provider": config.provider.as_str(),
                "model": model,
            })),
        })
    }
}
