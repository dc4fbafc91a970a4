//! 模型响应结构（与 Chat Completions 非流式响应同形）
//!
//! 流式响应经 StreamAssembler 组装后也转换为同一结构，Engine 只面对一种形状。

use serde::{Deserialize, Serialize};

use crate::memory::ToolCallRequest;

/// finish_reason：模型请求调用工具
pub const FINISH_TOOL_CALLS: &str = "tool_calls";
/// finish_reason：正常结束
pub const FINISH_STOP: &str = "stop";

/// 顶层响应：{choices: [...]}
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseChoice {
    #[serde(default)]
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl ResponseChoice {
    /// 缺省 finish_reason 视为 stop
    pub fn finish_reason(&self) -> &str {
        self.finish_reason.as_deref().unwrap_or(FINISH_STOP)
    }
}

/// 助手消息：文本、推理文本、结构化工具调用
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl ModelResponse {
    /// 便于测试与 Mock：单条文本回复
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ResponseChoice {
                message: ResponseMessage {
                    content: Some(content.into()),
                    ..Default::default()
                },
                finish_reason: Some(FINISH_STOP.to_string()),
            }],
        }
    }

    /// 便于测试与 Mock：一组工具调用
    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            choices: vec![ResponseChoice {
                message: ResponseMessage {
                    tool_calls: Some(calls),
                    ..Default::default()
                },
                finish_reason: Some(FINISH_TOOL_CALLS.to_string()),
            }],
        }
    }
}
