//! 模型网关：携带工具目录的决策调用
//!
//! 与 LlmClient 不同，网关返回完整的 choices 结构（含 finish_reason、reasoning_content、tool_calls），
//! 流式模式下原始字节流交给 StreamAssembler 组装，并实时转发推理与回复片段。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::ModelResponse;
use crate::memory::ChatMessage;
use crate::react::events::EventSender;
use crate::stream::assemble_stream;

/// 模型请求默认超时（秒）
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

const COMPLETIONS_PATH: &str = "/chat/completions";

/// 网关错误：对本轮决策是致命的
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("model response has no choices")]
    EmptyResponse,
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

/// 单次决策请求
#[derive(Debug, Clone, Copy)]
pub struct GatewayRequest<'a> {
    pub messages: &'a [ChatMessage],
    /// 函数规格列表（{"type": "function", "function": {...}}），为空时不携带工具
    pub tools: &'a [Value],
    pub stream: bool,
    /// 本次调用开启一个新的推理阶段
    pub new_reasoning_phase: bool,
}

/// 模型网关 trait
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        request: GatewayRequest<'_>,
        events: Option<&EventSender>,
    ) -> Result<ModelResponse, GatewayError>;
}

/// OpenAI 兼容的 HTTP 网关（/chat/completions）
pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    parallel_tool_calls: bool,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = base_url.trim_end_matches('/');
        let endpoint = if base.ends_with(COMPLETIONS_PATH) {
            base.to_string()
        } else {
            format!("{}{}", base, COMPLETIONS_PATH)
        };
        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()).map(String::from),
            parallel_tool_calls: true,
        })
    }

    /// 关闭后改用 tool_choice: auto
    pub fn with_parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = enabled;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, request: &GatewayRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "stream": request.stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.to_vec());
            if self.parallel_tool_calls {
                body["parallel_tool_calls"] = Value::Bool(true);
            } else {
                body["tool_choice"] = Value::String("auto".into());
            }
        }
        body
    }
}

#[async_trait]
impl ModelGateway for HttpGateway {
    async fn complete(
        &self,
        request: GatewayRequest<'_>,
        events: Option<&EventSender>,
    ) -> Result<ModelResponse, GatewayError> {
        let body = self.request_body(&request);
        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            stream = request.stream,
            "model request"
        );

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response = if request.stream {
            let assembled = assemble_stream(
                resp.bytes_stream(),
                request.new_reasoning_phase,
                events.cloned(),
            )
            .await?;
            if assembled.skipped_records > 0 {
                tracing::warn!(skipped = assembled.skipped_records, "stream had malformed records");
            }
            assembled.into_model_response()
        } else {
            let text = resp.text().await?;
            serde_json::from_str::<ModelResponse>(&text)
                .map_err(|e| GatewayError::Malformed(e.to_string()))?
        };

        if response.choices.is_empty() {
            return Err(GatewayError::EmptyResponse);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    fn gateway() -> HttpGateway {
        HttpGateway::new("http://localhost:8000/v1/", "qwen", Some("sk-test"), Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn endpoint_joins_base_url() {
        assert_eq!(gateway().endpoint(), "http://localhost:8000/v1/chat/completions");
        let full = HttpGateway::new(
            "https://example.com/v1/chat/completions",
            "m",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(full.endpoint(), "https://example.com/v1/chat/completions");
    }

    #[test]
    fn body_carries_tools_and_parallel_flag() {
        let gw = gateway();
        let messages = vec![Message::user("hi").to_chat()];
        let tools = vec![json!({"type": "function", "function": {"name": "a.b"}})];
        let req = GatewayRequest {
            messages: &messages,
            tools: &tools,
            stream: true,
            new_reasoning_phase: true,
        };
        let body = gw.request_body(&req);
        assert_eq!(body["model"], "qwen");
        assert_eq!(body["stream"], true);
        assert_eq!(body["parallel_tool_calls"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "a.b");

        let body = gw.with_parallel_tool_calls(false).request_body(&req);
        assert_eq!(body["tool_choice"], "auto");
        assert!(body.get("parallel_tool_calls").is_none());
    }

    #[test]
    fn body_without_tools_has_no_tool_fields() {
        let messages = vec![Message::user("hi").to_chat()];
        let req = GatewayRequest {
            messages: &messages,
            tools: &[],
            stream: false,
            new_reasoning_phase: false,
        };
        let body = gateway().request_body(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }
}
