//! Mock 协作者（用于测试，无需 API）
//!
//! - MockLlmClient：固定回复或固定失败，记录最近一次请求，可按次累计 token 使用；
//! - ScriptedGateway：按脚本依次返回决策响应，记录每次请求；
//! - MockSummarizer：固定摘要文本，统计调用次数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{GatewayError, GatewayRequest, LlmClient, ModelGateway, ModelResponse, TokenUsage};
use crate::memory::{ChatMessage, Message, Role, Summarizer};
use crate::react::events::EventSender;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mock 客户端：默认回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient {
    reply: Option<Result<String, String>>,
    last_request: Mutex<Vec<Message>>,
    /// 每次调用计入的 (prompt, completion)
    per_call: Option<(u64, u64)>,
    usage: TokenUsage,
}

impl MockLlmClient {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(Ok(reply.into())),
            ..Default::default()
        }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            reply: Some(Err(error.into())),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.per_call = Some((prompt, completion));
        self
    }

    pub fn last_request(&self) -> Vec<Message> {
        lock(&self.last_request).clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        *lock(&self.last_request) = messages.to_vec();
        if let Some((prompt, completion)) = self.per_call {
            self.usage.add(prompt, completion);
        }
        if let Some(ref reply) = self.reply {
            return reply.clone();
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

/// 网关收到的一次请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Value>,
    pub stream: bool,
    pub new_reasoning_phase: bool,
}

/// 脚本化网关：每次调用弹出一条预设结果；脚本耗尽时返回错误
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<ModelResponse, GatewayError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedGateway {
    pub fn new(script: Vec<Result<ModelResponse, GatewayError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    /// 每次响应前等待，用于测试取消
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, response: Result<ModelResponse, GatewayError>) {
        lock(&self.script).push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn complete(
        &self,
        request: GatewayRequest<'_>,
        _events: Option<&EventSender>,
    ) -> Result<ModelResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(RecordedRequest {
            messages: request.messages.to_vec(),
            tools: request.tools.to_vec(),
            stream: request.stream,
            new_reasoning_phase: request.new_reasoning_phase,
        });
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Malformed("script exhausted".into())))
    }
}

/// 固定文本的摘要器
#[derive(Debug, Default)]
pub struct MockSummarizer {
    text: String,
    calls: AtomicUsize,
    spans: Mutex<Vec<usize>>,
}

impl MockSummarizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的消息段长度
    pub fn span_lengths(&self) -> Vec<usize> {
        lock(&self.spans).clone()
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, span: &[Message], _guidance: &str, _last_question: Option<&str>) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.spans).push(span.len());
        self.text.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_mock_echoes_last_user_message() {
        let llm = MockLlmClient::default();
        let out = llm
            .complete(&[Message::user("first"), Message::assistant("a"), Message::user("second")])
            .await
            .unwrap();
        assert_eq!(out, "Echo from Mock: second");
    }

    #[tokio::test]
    async fn scripted_gateway_pops_in_order_then_errors() {
        let gw = ScriptedGateway::new(vec![Ok(ModelResponse::text("one"))]);
        gw.push(Ok(ModelResponse::text("two")));
        let messages = vec![Message::user("q").to_chat()];
        let req = GatewayRequest {
            messages: &messages,
            tools: &[],
            stream: false,
            new_reasoning_phase: true,
        };
        let a = gw.complete(req, None).await.unwrap();
        let b = gw.complete(req, None).await.unwrap();
        assert_eq!(a.choices[0].message.content.as_deref(), Some("one"));
        assert_eq!(b.choices[0].message.content.as_deref(), Some("two"));
        assert!(gw.complete(req, None).await.is_err());
        assert_eq!(gw.calls(), 3);
        assert_eq!(gw.requests().len(), 3);
    }
}
