mod agent;
mod chat;
mod service;
mod tools;

pub use agent::{Agent, ConversationMessage, DEFAULT_INSTRUCTIONS, RUN_APOLOGY};
pub use chat::{ChatClient, ChatMessage, ChatRequest, ToolSpec};
pub use service::{AgentRunner, AgentService, TURN_APOLOGY};
pub use tools::ToolSet;
