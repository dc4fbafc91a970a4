//! 对话状态：消息、工具调用请求与会话级 ConversationState
//!
//! Message 携带内部元数据（时间戳、关键标记、临时标记），发送给模型前经 to_chat 剥离为 ChatMessage。
//! ConversationState 是单个会话的全部可变状态，由 ContextWindowManager 独占持有，多会话即多实例。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 消息角色（与 Chat Completions API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

fn default_call_type() -> String {
    "function".to_string()
}

/// 工具调用中的 function 部分；arguments 可能是 JSON 字符串、已结构化的对象或 null
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// 助手消息中的单个工具调用请求（id 必须原样回传给模型）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub kind: String,
    #[serde(default)]
    pub function: FunctionCall,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            kind: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: Some(arguments),
            },
        }
    }
}

/// 单条消息（含内部元数据）
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 关键消息：压缩时尽量保留
    pub is_key: bool,
    /// 临时引导消息：下一次决策后由 Engine 移除
    pub transient: bool,
}

impl Message {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            created_at: Utc::now(),
            is_key: false,
            transient: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()))
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    /// 携带工具调用的助手消息；content 通常为空
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = Some(calls);
        msg
    }

    /// 工具结果消息，回答 call_id 对应的调用
    pub fn tool(call_id: impl Into<String>, payload: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, Some(payload.into()));
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// 文本内容，无内容时为空串
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// 剥离内部元数据，得到发送给模型的消息
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

/// 发送给模型的消息视图（无时间戳、关键标记等元数据）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// 单个会话的对话状态：有序消息、关键索引、至多一条摘要与一条工具上下文
#[derive(Clone, Debug)]
pub struct ConversationState {
    id: Uuid,
    pub(crate) messages: Vec<Message>,
    pub(crate) key_indices: BTreeSet<usize>,
    pub(crate) summary: Option<Message>,
    pub(crate) tool_context: Option<Message>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            key_indices: BTreeSet::new(),
            summary: None,
            tool_context: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn key_indices(&self) -> &BTreeSet<usize> {
        &self.key_indices
    }

    pub fn summary(&self) -> Option<&Message> {
        self.summary.as_ref()
    }

    pub fn tool_context(&self) -> Option<&Message> {
        self.tool_context.as_ref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 关键索引集合与消息 is_key 标记是否一致
    pub fn keys_consistent(&self) -> bool {
        self.key_indices
            .iter()
            .all(|&i| self.messages.get(i).map(|m| m.is_key).unwrap_or(false))
            && self
                .messages
                .iter()
                .enumerate()
                .filter(|(_, m)| m.is_key)
                .all(|(i, _)| self.key_indices.contains(&i))
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}
