//! Provider-neutral agent: instructions + tools + run loop.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};

use waggle_schema::LlmProvider;

use crate::chat::{ChatClient, ChatMessage, ChatRequest};
use crate::tools::ToolSet;

pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful WhatsApp assistant with access to the user's message history.\n\n\
You can:\n\
- Search through past messages\n\
- Retrieve recent conversations\n\
- Summarize chat history\n\
- Extract tasks from conversations\n\
- Provide conversation statistics\n\n\
Be conversational and helpful. When users ask about their message history, use the available tools to provide accurate information.";

/// Returned whenever a run fails; the user always gets a reply.
pub const RUN_APOLOGY: &str =
    "I apologize, but I encountered an error processing your message. Please try again.";

/// Upper bound on tool rounds within one run.
const MAX_TOOL_ROUNDS: usize = 8;

/// One history entry handed to the agent, oldest first.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

pub struct Agent {
    pub name: String,
    instructions: String,
    model: String,
    temperature: f64,
    client: ChatClient,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        instructions: Option<String>,
        model: impl Into<String>,
        temperature: f64,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
            model: model.into(),
            temperature,
            client: ChatClient::new(api_key, base_url),
        }
    }

    /// Build an agent for a provider, using its default model and base URL
    /// unless overridden.
    pub fn for_provider(
        provider: LlmProvider,
        api_key: Option<String>,
        model: Option<String>,
        temperature: f64,
    ) -> Self {
        Self::new(
            "Waggle Assistant",
            None,
            model.unwrap_or_else(|| provider.default_model().to_string()),
            temperature,
            api_key,
            provider.default_base_url().map(str::to_string),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn update_instructions(&mut self, instructions: impl Into<String>) {
        self.instructions = instructions.into();
    }

    pub fn update_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// Run one turn. Prior history is prepended oldest-first; the current
    /// message goes last. Any failure collapses into the fixed apology so
    /// the caller always has text to send.
    pub async fn process_message(
        &self,
        message: &str,
        tools: &ToolSet,
        history: &[ConversationMessage],
    ) -> String {
        match self.run(message, tools, history).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("agent run failed: {e}");
                RUN_APOLOGY.to_string()
            }
        }
    }

    async fn run(
        &self,
        message: &str,
        tools: &ToolSet,
        history: &[ConversationMessage],
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&self.instructions));
        for entry in history {
            messages.push(match entry.role.as_str() {
                "assistant" => ChatMessage::assistant(&entry.content),
                _ => ChatMessage::user(&entry.content),
            });
        }
        messages.push(ChatMessage::user(message));

        let tool_specs = ToolSet::definitions();

        for _ in 0..MAX_TOOL_ROUNDS {
            let request = ChatRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                temperature: Some(self.temperature),
                tools: Some(tool_specs.clone()),
            };
            let completion = self.client.complete(&request).await?;
            let choice = completion
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("provider returned no choices"))?;

            let reply = choice.message;
            let calls = reply.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                return Ok(reply.content.unwrap_or_default());
            }

            messages.push(reply);
            for call in calls {
                let args: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                let result = tools.invoke(&call.function.name, &args).await;
                messages.push(ChatMessage::tool(call.id, result.to_string()));
            }
        }

        bail!("tool loop exceeded {MAX_TOOL_ROUNDS} rounds")
    }
}
