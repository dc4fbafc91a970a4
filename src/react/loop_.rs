//! 工具编排主循环
//!
//! 每个用户回合是一个状态机：DECIDING -> EXECUTING_TOOLS -> DECIDING ... -> DONE / ERROR，
//! 工具轮数达到上限时经 ITERATION_LIMIT 做最后一次不带工具的决策。
//!
//! - 一轮内的工具调用并发执行，各自超时，互不影响；
//! - 一轮全部完成后才把助手调用消息与全部结果写入历史（二者都是关键消息，压缩时成对保留），取消时整轮丢弃；
//! - 每回合的 system 提示通过标记定位并替换；每轮结束后追加一条临时引导消息，下一次决策后移除；
//! - 单回合网关调用次数不超过 max_iterations + 1；max_iterations 为 0 时不执行任何工具。

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, EnginePhase};
use crate::llm::{GatewayError, GatewayRequest, ModelGateway, ModelResponse, ResponseMessage, FINISH_TOOL_CALLS};
use crate::memory::{ContextWindowManager, Message, ToolCallRequest};
use crate::react::events::{send_event, EventSender, ReactEvent};
use crate::tools::{ToolCallNormalizer, ToolCatalog, ToolExecutor, ToolInvocation};

/// 单回合最多的工具轮数
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 5;
/// 每回合 system 提示的定位标记
pub const TURN_PROMPT_MARKER: &str = "[turn guidance]";
/// 模型既无文本也无工具调用时的回复
pub const FALLBACK_REPLY: &str = "Sorry, I could not produce an answer to that request.";
/// 达到上限后最后一次决策仍无文本时的回复
pub const LIMIT_APOLOGY: &str =
    "Sorry, the tool call limit was reached before a final answer could be produced.";
/// 达到上限后仍被请求的调用所得到的合成结果
pub const LIMIT_REACHED_RESULT: &str =
    "Tool call limit reached; stop issuing tool calls and answer from the information gathered so far.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "Analyse the user's request fully and decide every tool call and argument needed for this round. \
Issue independent tool calls together in the same round so they run concurrently; when one tool depends on another, call them in the right order. \
Before and after each round, check whether enough information has been gathered and whether any tool returned an error.";

const ROUND_GUIDANCE: &str = "Review the tool results above. If they answer the user's request, reply directly; \
if not, issue the next tool calls, grouping independent ones in a single round.";

const LIMIT_GUIDANCE: &str = "The tool call limit has been reached. Do not call any more tools; \
summarise the results gathered so far and give the final answer.";

const OBSERVATION_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: usize,
    /// 以流式方式请求模型
    pub stream: bool,
    /// 允许从 reasoning_content 中提取内嵌调用
    pub reasoning_fallback: bool,
    /// 把工具目录写入「可用工具」上下文消息
    pub inject_tool_context: bool,
    pub system_prompt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            stream: true,
            reasoning_fallback: false,
            inject_tool_context: false,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// 单回合结果
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub response: String,
    /// 执行过的工具轮数
    pub iterations: usize,
    pub gateway_calls: usize,
    pub limit_reached: bool,
}

enum EngineState {
    Deciding,
    ExecutingTools {
        message: ResponseMessage,
        calls: Vec<ToolInvocation>,
    },
    IterationLimit,
    Done {
        text: String,
        streamed: bool,
    },
    Failed(AgentError),
}

impl EngineState {
    fn phase(&self) -> EnginePhase {
        match self {
            EngineState::Deciding => EnginePhase::Deciding,
            EngineState::ExecutingTools { .. } => EnginePhase::ExecutingTools,
            EngineState::IterationLimit => EnginePhase::IterationLimit,
            EngineState::Done { .. } => EnginePhase::Done,
            EngineState::Failed(_) => EnginePhase::Error,
        }
    }
}

#[derive(Debug, Default)]
struct TurnCounters {
    iterations: usize,
    gateway_calls: usize,
    limit_reached: bool,
}

pub struct Engine {
    gateway: Arc<dyn ModelGateway>,
    executor: Arc<ToolExecutor>,
    normalizer: ToolCallNormalizer,
    config: EngineConfig,
}

impl Engine {
    pub fn new(gateway: Arc<dyn ModelGateway>, executor: Arc<ToolExecutor>, config: EngineConfig) -> Self {
        Self {
            gateway,
            executor,
            normalizer: ToolCallNormalizer::new(config.reasoning_fallback),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// 处理一条用户输入，直到得到最终回复或遇到致命错误
    pub async fn run_turn(
        &self,
        ctx: &mut ContextWindowManager,
        input: &str,
        events: Option<&EventSender>,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        ctx.append(Message::user(input), false);
        ctx.remove_system_containing(TURN_PROMPT_MARKER);
        ctx.append(
            Message::system(format!("{}\n{}", TURN_PROMPT_MARKER, self.config.system_prompt)),
            false,
        );
        self.optimize(ctx, events).await;

        let catalog = self.executor.catalog().await;
        if self.config.inject_tool_context && !catalog.is_empty() {
            ctx.set_tool_context(&catalog.describe());
        }
        let tools = catalog.function_specs();

        let mut turn = TurnCounters::default();
        let mut state = EngineState::Deciding;
        loop {
            tracing::debug!(session = %ctx.state().id(), phase = %state.phase(), iterations = turn.iterations, "engine state");
            state = match state {
                EngineState::Deciding => {
                    send_event(
                        events,
                        ReactEvent::StepUpdate {
                            step: turn.gateway_calls + 1,
                            max_steps: self.config.max_iterations + 1,
                        },
                    );
                    match self.decide(ctx, &tools, events, cancel, &mut turn).await {
                        // 轮数已用尽（仅 max_iterations 为 0 时在此出现）：本次决策即最后一次
                        Ok(response) if turn.iterations >= self.config.max_iterations => {
                            turn.limit_reached = true;
                            self.finish_after_limit(ctx, response, events)
                        }
                        Ok(response) => self.route_decision(ctx, response, &catalog, events),
                        Err(e) => EngineState::Failed(e),
                    }
                }
                EngineState::ExecutingTools { message, calls } => {
                    match self.execute_round(ctx, message, calls, events, cancel, &turn).await {
                        Ok(()) => {
                            turn.iterations += 1;
                            if turn.iterations >= self.config.max_iterations {
                                EngineState::IterationLimit
                            } else {
                                EngineState::Deciding
                            }
                        }
                        Err(e) => EngineState::Failed(e),
                    }
                }
                EngineState::IterationLimit => {
                    turn.limit_reached = true;
                    tracing::warn!(iterations = turn.iterations, "tool iteration limit reached");
                    send_event(
                        events,
                        ReactEvent::System {
                            text: format!(
                                "Tool call limit ({}) reached, requesting a final answer",
                                self.config.max_iterations
                            ),
                        },
                    );
                    ctx.append(Message::system(LIMIT_GUIDANCE).transient(), false);
                    match self.decide(ctx, &[], events, cancel, &mut turn).await {
                        Ok(response) => self.finish_after_limit(ctx, response, events),
                        Err(e) => EngineState::Failed(e),
                    }
                }
                EngineState::Done { text, streamed } => {
                    if !streamed {
                        send_event(events, ReactEvent::Content { text: text.clone() });
                    }
                    send_event(events, ReactEvent::MessageDone);
                    tracing::info!(
                        iterations = turn.iterations,
                        gateway_calls = turn.gateway_calls,
                        limit_reached = turn.limit_reached,
                        "turn finished"
                    );
                    return Ok(TurnResult {
                        response: text,
                        iterations: turn.iterations,
                        gateway_calls: turn.gateway_calls,
                        limit_reached: turn.limit_reached,
                    });
                }
                EngineState::Failed(e) => {
                    tracing::error!(error = %e, "turn failed");
                    send_event(events, ReactEvent::Error { text: e.to_string() });
                    return Err(e);
                }
            };
        }
    }

    /// 一次网关调用；无论成败都移除临时引导消息
    async fn decide(
        &self,
        ctx: &mut ContextWindowManager,
        tools: &[Value],
        events: Option<&EventSender>,
        cancel: &CancellationToken,
        turn: &mut TurnCounters,
    ) -> Result<ModelResponse, AgentError> {
        let view = ctx.current_view();
        let request = GatewayRequest {
            messages: &view,
            tools,
            stream: self.config.stream,
            new_reasoning_phase: true,
        };
        turn.gateway_calls += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = self.gateway.complete(request, events) => r.map_err(AgentError::from),
        };
        ctx.drop_transient();
        let response = result?;
        if response.choices.is_empty() {
            return Err(GatewayError::EmptyResponse.into());
        }
        Ok(response)
    }

    fn route_decision(
        &self,
        ctx: &mut ContextWindowManager,
        response: ModelResponse,
        catalog: &ToolCatalog,
        events: Option<&EventSender>,
    ) -> EngineState {
        let Some(choice) = response.choices.into_iter().next() else {
            return EngineState::Failed(GatewayError::EmptyResponse.into());
        };
        let wants_tools = choice.finish_reason() == FINISH_TOOL_CALLS;
        let message = choice.message;

        if wants_tools {
            let calls: Vec<ToolInvocation> = self
                .normalizer
                .normalize(&message)
                .into_iter()
                .map(|call| call.routed(catalog))
                .collect();
            if !calls.is_empty() {
                return EngineState::ExecutingTools { message, calls };
            }
            tracing::warn!("finish_reason is tool_calls but no usable tool call was found");
        }

        match message.content.filter(|c| !c.trim().is_empty()) {
            Some(text) => {
                ctx.append(Message::assistant(text.clone()), false);
                EngineState::Done {
                    text,
                    streamed: self.config.stream,
                }
            }
            None => {
                send_event(
                    events,
                    ReactEvent::System {
                        text: "The model returned neither text nor tool calls".to_string(),
                    },
                );
                EngineState::Done {
                    text: FALLBACK_REPLY.to_string(),
                    streamed: false,
                }
            }
        }
    }

    /// 上限后的最后一次决策：有文本则作答；仍请求工具时记录合成结果并致歉
    fn finish_after_limit(
        &self,
        ctx: &mut ContextWindowManager,
        response: ModelResponse,
        events: Option<&EventSender>,
    ) -> EngineState {
        let Some(choice) = response.choices.into_iter().next() else {
            return EngineState::Failed(GatewayError::EmptyResponse.into());
        };
        let message = choice.message;
        let pending = self.normalizer.normalize(&message);
        if !pending.is_empty() {
            tracing::warn!(pending = pending.len(), "model still requested tools after the limit");
            let requests = history_requests(&message, &pending);
            ctx.append(Message::assistant_tool_calls(None, requests), true);
            for call in &pending {
                ctx.append(Message::tool(&call.id, LIMIT_REACHED_RESULT), true);
            }
        }

        match message.content.filter(|c| !c.trim().is_empty()) {
            Some(text) => {
                ctx.append(Message::assistant(text.clone()), false);
                EngineState::Done {
                    text,
                    streamed: self.config.stream,
                }
            }
            None => {
                send_event(
                    events,
                    ReactEvent::System {
                        text: "No final answer after the tool call limit".to_string(),
                    },
                );
                EngineState::Done {
                    text: LIMIT_APOLOGY.to_string(),
                    streamed: false,
                }
            }
        }
    }

    /// 并发执行一轮；整轮完成后再写入历史
    async fn execute_round(
        &self,
        ctx: &mut ContextWindowManager,
        message: ResponseMessage,
        calls: Vec<ToolInvocation>,
        events: Option<&EventSender>,
        cancel: &CancellationToken,
        turn: &TurnCounters,
    ) -> Result<(), AgentError> {
        tracing::info!(round = turn.iterations + 1, calls = calls.len(), "executing tool round");
        for call in &calls {
            send_event(
                events,
                ReactEvent::ToolCall {
                    tool: call.name.clone(),
                    args: Value::Object(call.arguments.clone()),
                },
            );
        }

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(calls = calls.len(), "tool round cancelled, discarding");
                return Err(AgentError::Cancelled);
            }
            r = self.executor.execute_round(&calls) => r,
        };

        let requests = history_requests(&message, &calls);
        let content = message.content.filter(|c| !c.trim().is_empty());
        ctx.append(Message::assistant_tool_calls(content, requests), true);
        for result in results {
            send_event(
                events,
                ReactEvent::Observation {
                    tool: result.tool.clone(),
                    call_id: result.call_id.clone(),
                    ok: result.ok,
                    preview: preview(&result.payload),
                },
            );
            ctx.append(Message::tool(result.call_id, result.payload), true);
        }

        ctx.append(Message::system(ROUND_GUIDANCE).transient(), false);
        self.optimize(ctx, events).await;
        Ok(())
    }

    async fn optimize(&self, ctx: &mut ContextWindowManager, events: Option<&EventSender>) {
        let report = ctx.optimize().await;
        if report.compressed() {
            send_event(
                events,
                ReactEvent::System {
                    text: format!(
                        "Context compressed from {} to {} tokens",
                        report.tokens_before, report.tokens_after
                    ),
                },
            );
        }
    }
}

/// 写入历史的助手调用列表：优先使用模型原样给出的请求（保留原始参数文本），降级路径提取的调用则合成
fn history_requests(message: &ResponseMessage, calls: &[ToolInvocation]) -> Vec<ToolCallRequest> {
    let originals = message.tool_calls.as_deref().unwrap_or(&[]);
    calls
        .iter()
        .map(|call| {
            originals
                .iter()
                .find(|c| c.id == call.id)
                .cloned()
                .unwrap_or_else(|| call.to_request())
        })
        .collect()
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
