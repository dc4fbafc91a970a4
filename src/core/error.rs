//! 单轮对话的致命错误
//!
//! 可恢复的情况（工具失败、超时、未知后端、摘要失败）都转成工具消息或系统通知，不会出现在这里。

use thiserror::Error;

use crate::llm::GatewayError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Model gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}
