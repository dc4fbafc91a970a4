//! Token 预算控制
//!
//! TokenCounter 负责「数多少」，ContextWindowManager 只决定「留什么」。
//! 默认实现 TokenEstimator 采用字符启发式，可替换为真实分词器。

use crate::memory::ChatMessage;

/// 默认上下文窗口（token）
pub const DEFAULT_MAX_TOKENS: usize = 128_000;
/// 为模型回复预留的 token 数
pub const DEFAULT_RESERVE_TOKENS: usize = 500;

/// Token 计数协作者
pub trait TokenCounter: Send + Sync {
    /// 单条消息的 token 数
    fn count_message(&self, message: &ChatMessage) -> usize;

    /// 整个上下文的 token 总数
    fn count_total(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

/// Token 估算器（简单的字符计数近似）
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

impl TokenCounter for TokenEstimator {
    /// 按 `<|im_start|>{role}\n{content}<|im_end|>\n` 的对话模板计数，工具调用按序列化后的 JSON 计入
    fn count_message(&self, message: &ChatMessage) -> usize {
        let mut text = format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role.as_str(),
            message.content.as_deref().unwrap_or("")
        );
        if let Some(ref calls) = message.tool_calls {
            text.push_str(&serde_json::to_string(calls).unwrap_or_default());
        }
        if let Some(ref id) = message.tool_call_id {
            text.push_str(id);
        }
        Self::estimate(&text)
    }
}

/// 上下文预算：总窗口与回复预留
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    max_tokens: usize,
    reserve: usize,
}

impl TokenBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            reserve: DEFAULT_RESERVE_TOKENS,
        }
    }

    pub fn with_reserve(mut self, reserve: usize) -> Self {
        self.reserve = reserve;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    /// 物化视图允许的上限：max - reserve
    pub fn limit(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserve)
    }

    /// 超出上限的 token 数，未超出为 0
    pub fn excess(&self, total: usize) -> usize {
        total.saturating_sub(self.limit())
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}

/// 分阶段压缩策略参数
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionPolicy {
    /// 阶段一按重要性保留的比例
    pub retention_ratio: f64,
    /// 各阶段无条件保留的最近消息数
    pub recent_keep: usize,
    /// 阶段一至少保留的消息数
    pub min_keep: usize,
    /// 阶段二（分段摘要）所需的最少消息数
    pub summarize_threshold: usize,
    /// 阶段二保留的最近消息数上限
    pub summary_recent_max: usize,
    /// 阶段三的绝对上限
    pub hard_cap: usize,
    /// 阶段三收窄时保留的关键消息数
    pub floor_key_messages: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            retention_ratio: 0.8,
            recent_keep: 4,
            min_keep: 4,
            summarize_threshold: 6,
            summary_recent_max: 6,
            hard_cap: 6,
            floor_key_messages: 2,
        }
    }
}
