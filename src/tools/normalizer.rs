//! 工具调用归一化
//!
//! 主路径读取结构化 tool_calls；仅当该字段缺失且开启降级时，从 reasoning_content 中提取一个
//! `<tool_call>{...}</tool_call>` 形式的内嵌调用。参数统一为 JSON 对象：
//! null / 缺失 / 空串为空对象，无法解析或不是对象的文本保留在 `raw_arguments` 下。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::llm::ResponseMessage;
use crate::memory::ToolCallRequest;
use crate::tools::{ToolCatalog, ToolIdentifier};

const FALLBACK_CLOSE_TAG: &str = "</tool_call>";

/// 归一化后的调用
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    /// 限定名 `<backend>.<tool>`
    pub name: String,
    /// 路由目标；按工具目录确定，未确定时执行器报告后端不可用
    pub target: Option<ToolIdentifier>,
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            target: None,
            arguments,
        }
    }

    pub fn with_target(mut self, target: Option<ToolIdentifier>) -> Self {
        self.target = target;
        self
    }

    /// 按本回合的工具目录确定目标
    pub fn routed(self, catalog: &ToolCatalog) -> Self {
        let target = catalog.route(&self.name);
        self.with_target(target)
    }

    /// 回传给模型的调用请求；arguments 序列化为 JSON 字符串
    pub fn to_request(&self) -> ToolCallRequest {
        let args = Value::Object(self.arguments.clone()).to_string();
        ToolCallRequest::new(&self.id, &self.name, Value::String(args))
    }
}

/// 参数归一化
pub fn normalize_arguments(raw: Option<&Value>) -> Map<String, Value> {
    match raw {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) => {
            if s.trim().is_empty() {
                return Map::new();
            }
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => map,
                _ => raw_arguments(s.clone()),
            }
        }
        Some(other) => raw_arguments(other.to_string()),
    }
}

fn raw_arguments(raw: String) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("raw_arguments".to_string(), Value::String(raw));
    map
}

fn tool_call_block() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").ok())
        .as_ref()
}

/// 从文本中第一个 `{` 起解析出一个完整 JSON 值，忽略其后内容
fn first_json_object(text: &str) -> Option<Map<String, Value>> {
    let mut offset = 0;
    while let Some(pos) = text[offset..].find('{') {
        let start = offset + pos;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            return Some(map);
        }
        offset = start + 1;
    }
    None
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallNormalizer {
    reasoning_fallback: bool,
}

impl ToolCallNormalizer {
    pub fn new(reasoning_fallback: bool) -> Self {
        Self { reasoning_fallback }
    }

    pub fn normalize(&self, message: &ResponseMessage) -> Vec<ToolInvocation> {
        match message.tool_calls.as_deref() {
            Some(calls) if !calls.is_empty() => Self::from_structured(calls),
            _ if self.reasoning_fallback => message
                .reasoning_content
                .as_deref()
                .and_then(Self::from_reasoning)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    fn from_structured(calls: &[ToolCallRequest]) -> Vec<ToolInvocation> {
        calls
            .iter()
            .filter_map(|call| {
                if call.id.is_empty() || call.function.name.is_empty() {
                    tracing::warn!(id = %call.id, name = %call.function.name, "dropping tool call without id or name");
                    return None;
                }
                Some(ToolInvocation::new(
                    call.id.clone(),
                    call.function.name.clone(),
                    normalize_arguments(call.function.arguments.as_ref()),
                ))
            })
            .collect()
    }

    /// 降级路径：只提取第一个带 name 与 id 的内嵌调用
    fn from_reasoning(reasoning: &str) -> Option<ToolInvocation> {
        if !reasoning.contains(FALLBACK_CLOSE_TAG) {
            return None;
        }
        tracing::warn!("no structured tool_calls, parsing reasoning_content");
        for cap in tool_call_block()?.captures_iter(reasoning) {
            let Some(obj) = cap.get(1).and_then(|m| first_json_object(m.as_str())) else {
                continue;
            };
            let name = obj.get("name").and_then(Value::as_str).unwrap_or_default();
            let id = obj.get("id").and_then(Value::as_str).unwrap_or_default();
            if name.is_empty() || id.is_empty() {
                continue;
            }
            return Some(ToolInvocation::new(id, name, normalize_arguments(obj.get("arguments"))));
        }
        None
    }
}
