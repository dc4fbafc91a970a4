//! 分段摘要协作者
//!
//! 压缩阶段二把较早的消息段交给 Summarizer；摘要失败时返回固定的降级文本，从不向调用方报错。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// 摘要失败时的降级占位文本
pub const DEGRADED_SUMMARY: &str =
    "A summary could not be generated; the earlier conversation contained tool calls and important results.";

const TOOL_EXCERPT_CHARS: usize = 300;
const CODE_EXCERPT_CHARS: usize = 100;
const RESULT_EXCERPT_CHARS: usize = 200;

/// 摘要协作者：summarize(消息段, 指引, 最新用户问题) -> 摘要文本
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, span: &[Message], guidance: &str, last_question: Option<&str>) -> String;

    /// 累计 token 使用：(prompt, completion, total)；不调用模型的实现为 0
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 基于 LlmClient 的摘要器：guidance 作为 system，后接原始消息段
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, span: &[Message], guidance: &str, last_question: Option<&str>) -> String {
        let mut system = guidance.to_string();
        if let Some(q) = last_question {
            system.push_str(&format!(
                "\n\nThe latest user question is: \"{}\"\nMake sure the summary keeps all background relevant to it.",
                q
            ));
        }
        let mut request = vec![Message::system(system)];
        request.extend(span.iter().cloned());

        let result = self.llm.complete(&request).await;
        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        tracing::info!(
            span = span.len(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            "summarizer token usage"
        );
        match result {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => {
                tracing::warn!("summarizer returned empty text");
                DEGRADED_SUMMARY.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "summarizer failed");
                DEGRADED_SUMMARY.to_string()
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// 从消息段中提取关键信息片段：工具调用、代码块、结果/数据段落
pub fn extract_key_information(messages: &[Message]) -> String {
    let mut key_info = Vec::new();

    for msg in messages {
        let content = msg.text();
        let lower = content.to_lowercase();

        if let Some(start) = lower.find("tool") {
            // to_lowercase 可能改变字节长度，只在边界一致时按位置截取
            let from = if content.is_char_boundary(start) { start } else { 0 };
            key_info.push(format!(
                "Tool call: {}...",
                excerpt(content[from..].trim(), TOOL_EXCERPT_CHARS)
            ));
        }

        if content.contains("```") {
            let mut in_block = false;
            let mut current = Vec::new();
            let mut blocks = Vec::new();
            for line in content.lines() {
                if line.starts_with("```") {
                    if in_block {
                        blocks.push(current.join("\n"));
                        current.clear();
                    }
                    in_block = !in_block;
                } else if in_block {
                    current.push(line);
                }
            }
            for (i, block) in blocks.iter().enumerate() {
                key_info.push(format!("Code snippet {}: {}...", i + 1, excerpt(block, CODE_EXCERPT_CHARS)));
            }
        }

        if msg.role == Role::Assistant {
            let is_result = |p: &str| {
                let l = p.to_lowercase();
                l.contains("result") || l.contains("data") || p.contains("结果") || p.contains("数据")
            };
            if let Some(para) = content.split("\n\n").find(|p| is_result(p)) {
                key_info.push(format!("Result: {}...", excerpt(para, RESULT_EXCERPT_CHARS)));
            }
        }
    }

    if key_info.is_empty() {
        "No obvious key information found; keep the main content and the user's questions.".to_string()
    } else {
        key_info.join("\n\n")
    }
}

/// 生成摘要指引：要求保留意图、工具调用结果、代码与数值数据
pub fn summary_guidance(span: &[Message]) -> String {
    format!(
        "Summarize the following conversation in detail. Requirements:\n\
         1. Keep all important context and the user's intent.\n\
         2. Keep every tool call together with its result.\n\
         3. Keep code snippets and technical details intact.\n\
         4. Keep data analysis results and key numbers.\n\
         5. Be specific rather than generic so the conversation can continue seamlessly.\n\
         6. Include enough detail that specific questions can be answered from the summary.\n\n\
         Pay particular attention to this key information:\n{}",
        extract_key_information(span)
    )
}
