//! 核心类型：错误与引擎阶段

pub mod error;
pub mod state;

pub use error::AgentError;
pub use state::EnginePhase;
