//! 编排层：工具编排引擎与过程事件

pub mod events;
pub mod loop_;

pub use events::{send_event, EventSender, ReactEvent};
pub use loop_::{
    Engine, EngineConfig, TurnResult, DEFAULT_MAX_TOOL_ITERATIONS, DEFAULT_SYSTEM_PROMPT, FALLBACK_REPLY,
    LIMIT_APOLOGY, LIMIT_REACHED_RESULT, TURN_PROMPT_MARKER,
};
