//! Hive - 工具编排对话智能体运行时
//!
//! 模块划分：
//! - **agent**: 无界面运行时与前端命令
//! - **config**: 应用配置加载（TOML + 环境变量）与外部后端描述
//! - **core**: 错误类型与引擎阶段
//! - **llm**: 模型网关（决策调用）、纯文本客户端与 Mock
//! - **memory**: 对话状态、token 预算、分阶段上下文压缩
//! - **react**: 工具编排状态机与过程事件
//! - **stream**: 流式响应组装
//! - **tools**: 工具后端、目录、调用归一化与并发执行

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod stream;
pub mod tools;
