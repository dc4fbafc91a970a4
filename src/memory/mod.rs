//! 记忆层：对话状态、token 预算与上下文窗口管理（分阶段压缩）

pub mod context;
pub mod conversation;
pub mod importance;
pub mod summarizer;
pub mod token_budget;

pub use context::{CompressionReport, CompressionStage, ContextWindowManager, COMPRESSION_NOTICE};
pub use conversation::{ChatMessage, ConversationState, FunctionCall, Message, Role, ToolCallRequest};
pub use importance::importance_score;
pub use summarizer::{extract_key_information, summary_guidance, LlmSummarizer, Summarizer, DEGRADED_SUMMARY};
pub use token_budget::{
    CompressionPolicy, TokenBudget, TokenCounter, TokenEstimator, DEFAULT_MAX_TOKENS, DEFAULT_RESERVE_TOKENS,
};
