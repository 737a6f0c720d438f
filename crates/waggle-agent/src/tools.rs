//! The five tools the model can invoke over a user's message archive.
//!
//! Dispatch is static: tool names, argument schemas and return shapes are
//! fixed here. Results are JSON values handed back to the model verbatim.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use waggle_schema::{Message, MessageDirection, User};
use waggle_store::Store;

use crate::chat::ToolSpec;

const ACTION_KEYWORDS: [&str; 9] = [
    "todo",
    "task",
    "remind",
    "need to",
    "should",
    "must",
    "have to",
    "don't forget",
    "remember to",
];

/// Tool execution context: the archive handle and the user whose messages
/// the tools may read.
#[derive(Clone)]
pub struct ToolSet {
    store: Store,
    user_id: i64,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    10
}

#[derive(Deserialize)]
struct RecentArgs {
    #[serde(default = "default_recent_count")]
    count: usize,
}

fn default_recent_count() -> usize {
    20
}

#[derive(Deserialize)]
struct SummarizeArgs {
    #[serde(default = "default_summarize_count")]
    last_n_messages: usize,
}

fn default_summarize_count() -> usize {
    50
}

#[derive(Deserialize)]
struct ExtractTasksArgs {
    #[serde(default = "default_tasks_count")]
    last_n_messages: usize,
}

fn default_tasks_count() -> usize {
    100
}

impl ToolSet {
    pub fn new(store: Store, user_id: i64) -> Self {
        Self { store, user_id }
    }

    /// OpenAI-style function specs for all five tools.
    pub fn definitions() -> Vec<ToolSpec> {
        vec![
            ToolSpec::function(
                "search_messages",
                "Search through the user's conversation history",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Search query for finding relevant messages"
                        },
                        "limit": {
                            "type": "integer",
                            "description": "Maximum number of results to return",
                            "default": 10
                        }
                    },
                    "required": ["query"]
                }),
            ),
            ToolSpec::function(
                "get_recent_messages",
                "Get the most recent messages from the conversation",
                json!({
                    "type": "object",
                    "properties": {
                        "count": {
                            "type": "integer",
                            "description": "Number of recent messages to retrieve",
                            "default": 20
                        }
                    },
                    "required": []
                }),
            ),
            ToolSpec::function(
                "summarize_chat",
                "Generate a summary of the recent conversation",
                json!({
                    "type": "object",
                    "properties": {
                        "last_n_messages": {
                            "type": "integer",
                            "description": "Number of recent messages to summarize",
                            "default": 50
                        }
                    },
                    "required": []
                }),
            ),
            ToolSpec::function(
                "extract_tasks",
                "Extract actionable tasks mentioned in the conversation",
                json!({
                    "type": "object",
                    "properties": {
                        "last_n_messages": {
                            "type": "integer",
                            "description": "Number of recent messages to analyze",
                            "default": 100
                        }
                    },
                    "required": []
                }),
            ),
            ToolSpec::function(
                "get_conversation_stats",
                "Get statistics about the entire conversation history",
                json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                }),
            ),
        ]
    }

    /// Execute a tool by name. Failures surface as an error value in the
    /// result, never as a propagated error; a missing user yields
    /// empty/zero results.
    pub async fn invoke(&self, name: &str, args: &Value) -> Value {
        let result = match name {
            "search_messages" => self.search_messages(args).await,
            "get_recent_messages" => self.get_recent_messages(args).await,
            "summarize_chat" => self.summarize_chat(args).await,
            "extract_tasks" => self.extract_tasks(args).await,
            "get_conversation_stats" => self.get_conversation_stats().await,
            other => return json!({"error": format!("unknown tool: {other}")}),
        };

        result.unwrap_or_else(|e| {
            tracing::error!("tool {name} failed: {e}");
            json!({"error": e.to_string()})
        })
    }

    async fn user(&self) -> anyhow::Result<Option<User>> {
        self.store.user_by_id(self.user_id).await
    }

    async fn search_messages(&self, args: &Value) -> anyhow::Result<Value> {
        let args: SearchArgs = parse_args(args)?;
        let Some(user) = self.user().await? else {
            return Ok(json!([]));
        };
        let messages = self
            .store
            .search_messages(self.user_id, &args.query, args.limit)
            .await?;
        Ok(Value::Array(
            messages
                .iter()
                .map(|m| message_result(m, &user.phone_number))
                .collect(),
        ))
    }

    async fn get_recent_messages(&self, args: &Value) -> anyhow::Result<Value> {
        let args: RecentArgs = parse_args(args)?;
        let messages = self.recent_chronological(args.count).await?;
        let Some(user) = self.user().await? else {
            return Ok(json!([]));
        };
        Ok(Value::Array(
            messages
                .iter()
                .map(|m| message_result(m, &user.phone_number))
                .collect(),
        ))
    }

    async fn summarize_chat(&self, args: &Value) -> anyhow::Result<Value> {
        let args: SummarizeArgs = parse_args(args)?;
        let messages = self.recent_chronological(args.last_n_messages).await?;

        if messages.is_empty() {
            return Ok(json!({
                "summary": "No messages found to summarize.",
                "message_count": 0,
                "date_range": {},
                "key_topics": []
            }));
        }

        let first = messages.first().map(|m| m.timestamp);
        let last = messages.last().map(|m| m.timestamp);
        Ok(json!({
            "summary": format!(
                "Conversation between user and assistant covering {} messages.",
                messages.len()
            ),
            "message_count": messages.len(),
            "date_range": {
                "start": first.map(encode_ts),
                "end": last.map(encode_ts),
            },
            "key_topics": key_topics(&messages),
        }))
    }

    async fn extract_tasks(&self, args: &Value) -> anyhow::Result<Value> {
        let args: ExtractTasksArgs = parse_args(args)?;
        let messages = self.recent_chronological(args.last_n_messages).await?;

        let tasks: Vec<Value> = messages
            .iter()
            .filter_map(|m| {
                let content = m.content.as_deref()?;
                let lowered = content.to_lowercase();
                if !ACTION_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
                    return None;
                }
                let task: String = content.chars().take(100).collect();
                Some(json!({
                    "task": task,
                    "mentioned_at": encode_ts(m.timestamp),
                    "priority": "medium",
                    "completed": false,
                }))
            })
            .collect();

        Ok(Value::Array(tasks))
    }

    async fn get_conversation_stats(&self) -> anyhow::Result<Value> {
        let stats = self.store.get_conversation_stats(self.user_id).await?;
        let date_range = match (stats.first_message_date, stats.last_message_date) {
            (Some(first), Some(last)) => json!({
                "start": encode_ts(first),
                "end": encode_ts(last),
            }),
            _ => json!({}),
        };
        Ok(json!({
            "total_messages": stats.total_messages,
            "user_messages": stats.messages_sent,
            "assistant_messages": stats.total_messages - stats.messages_sent,
            "date_range": date_range,
            "average_messages_per_day": stats.average_messages_per_day,
        }))
    }

    /// Recent messages reordered oldest-first.
    async fn recent_chronological(&self, count: usize) -> anyhow::Result<Vec<Message>> {
        let mut messages = self.store.get_recent_messages(self.user_id, count).await?;
        messages.reverse();
        Ok(messages)
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> anyhow::Result<T> {
    serde_json::from_value(args.clone()).map_err(|e| anyhow::anyhow!("invalid tool arguments: {e}"))
}

fn message_result(message: &Message, user_phone: &str) -> Value {
    let sender = match message.direction(user_phone) {
        MessageDirection::Incoming => "user",
        _ => "assistant",
    };
    json!({
        "message_id": message.id,
        "content": message.content.clone().unwrap_or_default(),
        "sender": sender,
        "timestamp": encode_ts(message.timestamp),
    })
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Crude topic extraction: the most frequent words of five or more letters.
fn key_topics(messages: &[Message]) -> Vec<String> {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for message in messages {
        let Some(content) = &message.content else { continue };
        for word in content.split_whitespace() {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if word.len() >= 5 {
                *counts.entry(word).or_default() += 1;
            }
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let topics: Vec<String> = ranked.into_iter().take(3).map(|(word, _)| word).collect();
    if topics.is_empty() {
        vec!["general conversation".to_string()]
    } else {
        topics
    }
}
