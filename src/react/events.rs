//! 编排过程事件：用于向客户端实时推送推理、回复片段、工具调用与系统通知

use serde::Serialize;
use tokio::sync::mpsc;

/// 事件发送端（无界通道：发送永不阻塞组装与编排）
pub type EventSender = mpsc::UnboundedSender<ReactEvent>;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 决策轮次更新（当前第几轮）
    StepUpdate { step: usize, max_steps: usize },
    /// 推理片段；new_step 标记一个推理阶段的首个片段
    Reasoning { text: String, new_step: bool },
    /// 回复片段
    Content { text: String },
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        call_id: String,
        ok: bool,
        preview: String,
    },
    /// 系统通知（降级、迭代上限等）
    System { text: String },
    /// 最终回复结束
    MessageDone,
    /// 本轮致命错误
    Error { text: String },
}

/// 推送事件；接收端已关闭时只记录日志
pub fn send_event(tx: Option<&EventSender>, ev: ReactEvent) {
    if let Some(t) = tx {
        if let Err(e) = t.send(ev) {
            tracing::debug!(event = ?e.0, "event receiver dropped");
        }
    }
}
