//! LLM 层：纯文本客户端、决策网关与响应结构

pub mod gateway;
pub mod mock;
pub mod openai;
pub mod traits;
pub mod types;

pub use gateway::{GatewayError, GatewayRequest, HttpGateway, ModelGateway, DEFAULT_REQUEST_TIMEOUT_SECS};
pub use mock::{MockLlmClient, MockSummarizer, RecordedRequest, ScriptedGateway};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;
pub use types::{ModelResponse, ResponseChoice, ResponseMessage, FINISH_STOP, FINISH_TOOL_CALLS};
