//! The turn machine: send → stream → tool_use → tool_result → repeat.
//!
//! `ChatClient` is deliberately a single-method abstraction (§9 "Polymorphism")
//! so a new LLM vendor is one adapter, not a trait hierarchy.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::NamespacedTool;
use crate::error::{SpikeError, SpikeResult};
use crate::fleet::Fleet;
use crate::upstream::call_result_text;

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// One incremental event drained from a chat stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ContentBlock(ContentBlock),
}

/// Vendor-facing tool shape: the schema's top-level `type` is forced to
/// `object` regardless of what the upstream actually advertised, since a
/// handful of MCP servers omit it.
#[derive(Debug, Clone, Serialize)]
pub struct VendorTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

pub fn to_vendor_tools(tools: &[NamespacedTool]) -> Vec<VendorTool> {
    tools
        .iter()
        .map(|nt| {
            let mut schema = nt.descriptor.input_schema.clone();
            if let Value::Object(map) = &mut schema {
                map.entry("type")
                    .or_insert_with(|| Value::String("object".to_string()));
            } else {
                schema = serde_json::json!({"type": "object"});
            }
            VendorTool {
                name: nt.namespaced_name.clone(),
                description: nt.descriptor.description.clone(),
                input_schema: schema,
            }
        })
        .collect()
}

/// A single-method abstraction over an LLM vendor's streaming chat API.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn create_stream(
        &self,
        messages: &[Message],
        tools: &[VendorTool],
    ) -> SpikeResult<BoxStream<'static, SpikeResult<StreamEvent>>>;
}

/// Callbacks the host (CLI, TUI, whatever embeds the loop) hangs side
/// effects off. All are optional; a headless caller can leave every field
/// `None` and just inspect the returned message list.
#[derive(Default)]
pub struct AgentObserver {
    pub on_text_delta: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_tool_call: Option<Box<dyn Fn(&str, &str, &Value) + Send + Sync>>,
    pub on_tool_call_start: Option<Box<dyn Fn(&str, &str, &str, &Value) + Send + Sync>>,
    pub on_tool_call_end: Option<Box<dyn Fn(&str, &str, bool) + Send + Sync>>,
    pub on_turn_start: Option<Box<dyn Fn(u32) + Send + Sync>>,
    pub on_turn_end: Option<Box<dyn Fn(u32) + Send + Sync>>,
}

impl AgentObserver {
    fn text_delta(&self, text: &str) {
        if let Some(f) = &self.on_text_delta {
            f(text);
        }
    }

    fn tool_call(&self, id: &str, name: &str, input: &Value) {
        if let Some(f) = &self.on_tool_call {
            f(id, name, input);
        }
    }

    fn tool_call_start(&self, id: &str, name: &str, server: &str, input: &Value) {
        if let Some(f) = &self.on_tool_call_start {
            f(id, name, server, input);
        }
    }

    fn tool_call_end(&self, id: &str, result_text: &str, is_error: bool) {
        if let Some(f) = &self.on_tool_call_end {
            f(id, result_text, is_error);
        }
    }

    fn turn_start(&self, turn: u32) {
        if let Some(f) = &self.on_turn_start {
            f(turn);
        }
    }

    fn turn_end(&self, turn: u32) {
        if let Some(f) = &self.on_turn_end {
            f(turn);
        }
    }
}

pub const DEFAULT_MAX_TURNS: u32 = 20;

pub struct AgentLoop {
    client: Arc<dyn ChatClient>,
    fleet: Arc<Fleet>,
    max_turns: u32,
}

impl AgentLoop {
    pub fn new(client: Arc<dyn ChatClient>, fleet: Arc<Fleet>) -> Self {
        Self {
            client,
            fleet,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Runs the full turn machine for one user message, mutating `messages`
    /// in place and driving `observer` as events happen.
    pub async fn run(
        &self,
        messages: &mut Vec<Message>,
        user_text: &str,
        observer: &AgentObserver,
    ) -> SpikeResult<()> {
        messages.push(Message::user_text(user_text));

        for turn in 0..self.max_turns {
            observer.turn_start(turn);

            let catalog = self.fleet.get_all_tools().await;
            let vendor_tools = to_vendor_tools(&catalog);

            let mut stream = self.client.create_stream(messages, &vendor_tools).await?;

            let mut blocks: Vec<ContentBlock> = Vec::new();
            while let Some(event) = stream.next().await {
                match event? {
                    StreamEvent::TextDelta(delta) => observer.text_delta(&delta),
                    StreamEvent::ContentBlock(block) => blocks.push(block),
                }
            }
            messages.push(Message::assistant_blocks(blocks.clone()));

            let tool_uses: Vec<(String, String, Value)> = blocks
                .into_iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
                    _ => None,
                })
                .collect();

            if tool_uses.is_empty() {
                observer.turn_end(turn);
                return Ok(());
            }

            let mut results = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in tool_uses {
                observer.tool_call(&id, &name, &input);
                let server = name.split("__").next().unwrap_or(&name).to_string();
                observer.tool_call_start(&id, &name, &server, &input);

                let arguments = match &input {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };

                let (text, is_error) = match self.fleet.call_tool(&name, arguments).await {
                    Ok(result) => (call_result_text(&result), result.is_error.unwrap_or(false)),
                    Err(err) => (format!("Tool error: {err}"), true),
                };

                observer.tool_call_end(&id, &text, is_error);
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: text,
                    is_error,
                });
            }

            messages.push(Message::user_blocks(results));
            observer.turn_end(turn);
        }

        observer.text_delta("\n[Reached maximum turns]\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct ScriptedClient {
        turns: std::sync::Mutex<Vec<Vec<StreamEvent>>>,
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn create_stream(
            &self,
            _messages: &[Message],
            _tools: &[VendorTool],
        ) -> SpikeResult<BoxStream<'static, SpikeResult<StreamEvent>>> {
            let mut turns = self.turns.lock().unwrap();
            let events = if turns.is_empty() {
                Vec::new()
            } else {
                turns.remove(0)
            };
            Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
        }
    }

    #[tokio::test]
    async fn text_only_reply_ends_the_loop_after_one_turn() {
        let client = Arc::new(ScriptedClient {
            turns: std::sync::Mutex::new(vec![vec![StreamEvent::ContentBlock(
                ContentBlock::Text {
                    text: "hello".to_string(),
                },
            )]]),
        });
        let fleet = Arc::new(Fleet::default());
        let agent = AgentLoop::new(client, fleet);
        let mut messages = Vec::new();
        let observer = AgentObserver::default();

        agent
            .run(&mut messages, "hi", &observer)
            .await
            .expect("loop should succeed");

        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, Role::User));
        assert!(matches!(messages[1].role, Role::Assistant));
    }

    #[tokio::test]
    async fn tool_use_against_an_unknown_server_produces_a_tool_error_result() {
        let client = Arc::new(ScriptedClient {
            turns: std::sync::Mutex::new(vec![
                vec![StreamEvent::ContentBlock(ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "ghost__do_thing".to_string(),
                    input: serde_json::json!({}),
                })],
                vec![StreamEvent::ContentBlock(ContentBlock::Text {
                    text: "done".to_string(),
                })],
            ]),
        });
        let fleet = Arc::new(Fleet::default());
        let agent = AgentLoop::new(client, fleet);
        let mut messages = Vec::new();
        let observer = AgentObserver::default();

        agent
            .run(&mut messages, "run the thing", &observer)
            .await
            .unwrap();

        let MessageContent::Blocks(blocks) = &messages[2].content else {
            panic!("expected a tool_result message");
        };
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                assert!(*is_error);
                assert!(content.starts_with("Tool error:"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reaching_the_turn_cap_emits_the_cap_notice() {
        let endless = vec![StreamEvent::ContentBlock(ContentBlock::ToolUse {
            id: "t".to_string(),
            name: "ghost__do_thing".to_string(),
            input: serde_json::json!({}),
        })];
        let client = Arc::new(ScriptedClient {
            turns: std::sync::Mutex::new(vec![endless.clone(), endless.clone(), endless]),
        });
        let fleet = Arc::new(Fleet::default());
        let agent = AgentLoop::new(client, fleet).with_max_turns(3);
        let mut messages = Vec::new();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let seen_clone = seen.clone();
        let observer = AgentObserver {
            on_text_delta: Some(Box::new(move |delta| {
                seen_clone.lock().unwrap().push_str(delta);
            })),
            ..Default::default()
        };

        agent.run(&mut messages, "go forever", &observer).await.unwrap();
        assert!(seen.lock().unwrap().contains("[Reached maximum turns]"));
    }
}
