//! LLM 客户端抽象
//!
//! 两类协作者：
//! - LlmClient：纯文本补全（摘要等），complete 返回首条回复内容；
//! - ModelGateway（见 gateway.rs）：携带工具目录的决策调用，返回完整的 choices 结构。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
