//! 编排引擎的阶段

use std::fmt;

use serde::Serialize;

/// 单轮对话中引擎所处的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnginePhase {
    Deciding,
    ExecutingTools,
    IterationLimit,
    Done,
    Error,
}

impl EnginePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnginePhase::Deciding => "DECIDING",
            EnginePhase::ExecutingTools => "EXECUTING_TOOLS",
            EnginePhase::IterationLimit => "ITERATION_LIMIT",
            EnginePhase::Done => "DONE",
            EnginePhase::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnginePhase::Done | EnginePhase::Error)
    }
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
