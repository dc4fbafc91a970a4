//! 流式分片的线上格式：`data: {choices:[{delta:{content?, reasoning_content?, tool_calls?}}]}`

use serde::Deserialize;

/// 流结束标记
pub const DONE_MARKER: &str = "[DONE]";
/// 数据行前缀
pub const DATA_PREFIX: &str = "data:";

#[derive(Debug, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl StreamChunk {
    /// 只取第一个 choice 的 delta
    pub fn into_delta(self) -> Option<Delta> {
        self.choices.into_iter().next().map(|c| c.delta)
    }
}
