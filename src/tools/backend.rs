//! 工具后端抽象与调用结果
//!
//! 后端（进程内注册表或外部连接）按名称注册到 ToolExecutor；具体的连线协议由 BackendConnector 提供。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::BackendSpec;

/// 后端声明的单个工具（名称不含后端前缀）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema：{"type": "object", "properties": {...}, "required": [...]}
    pub input_schema: Value,
}

/// 后端提供的只读资源
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptArgument {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
}

/// 后端提供的提示模板
#[derive(Debug, Clone, PartialEq)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

/// 提示模板展开后的一条消息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// 工具后端 trait
///
/// 资源与提示是可选能力，默认实现返回「不支持」。
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// 后端名，即限定名中 `.` 之前的部分
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String>;

    /// 调用工具；Ok(None) 表示执行成功但无内容。超时由调用方施加
    async fn invoke(&self, tool: &str, args: Map<String, Value>) -> Result<Option<String>, String>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, String> {
        Err(unsupported(self.name(), "resources"))
    }

    /// 读取资源内容，空字符串表示资源无内容
    async fn read_resource(&self, _resource: &str) -> Result<String, String> {
        Err(unsupported(self.name(), "resources"))
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, String> {
        Err(unsupported(self.name(), "prompts"))
    }

    async fn get_prompt(&self, _prompt: &str, _args: Map<String, Value>) -> Result<Vec<PromptMessage>, String> {
        Err(unsupported(self.name(), "prompts"))
    }
}

fn unsupported(backend: &str, feature: &str) -> String {
    format!("backend '{}' does not support {}", backend, feature)
}

/// 按配置建立后端连接
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, name: &str, spec: &BackendSpec) -> Result<Arc<dyn ToolBackend>, String>;
}

/// 单次工具调用的结果分类
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Option<String>),
    Timeout(Duration),
    ExecutionError(String),
    UnknownBackend(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// 审计日志中的结果标签
    pub fn label(&self) -> &'static str {
        match self {
            ToolOutcome::Success(_) => "ok",
            ToolOutcome::Timeout(_) => "timeout",
            ToolOutcome::ExecutionError(_) => "error",
            ToolOutcome::UnknownBackend(_) => "unknown_backend",
        }
    }

    /// 渲染为非空的工具消息文本
    pub fn into_payload(self, tool: &str) -> String {
        match self {
            ToolOutcome::Success(Some(text)) if !text.trim().is_empty() => text,
            ToolOutcome::Success(_) => "Tool executed successfully but returned no content.".to_string(),
            ToolOutcome::Timeout(d) => format!("Tool {} timed out after {}s", tool, d.as_secs_f64()),
            ToolOutcome::ExecutionError(e) => format!("Tool {} failed: {}", tool, e),
            ToolOutcome::UnknownBackend(backend) => {
                format!("Error: backend '{}' is not connected or unavailable.", backend)
            }
        }
    }
}

/// 一个调用的最终结果，按 call_id 与请求对应
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub payload: String,
    pub ok: bool,
}
