//! 无界面 Agent 运行时
//!
//! create_runtime 按配置组装网关、工具执行器与上下文窗口；
//! Command 解析前端输入（会话命令、资源与提示命令或普通提问），
//! AgentRuntime::handle 执行命令或跑一个编排回合。
//! `/resource use` 与 `/prompt` 把内容作为关键 system 消息写入会话。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{load_backend_specs, AppConfig};
use crate::core::AgentError;
use crate::llm::{HttpGateway, LlmClient, ModelGateway, OpenAiClient};
use crate::memory::{
    CompressionPolicy, ContextWindowManager, ConversationState, LlmSummarizer, Message, Summarizer, TokenBudget,
    TokenEstimator,
};
use crate::react::{Engine, EngineConfig, EventSender, DEFAULT_SYSTEM_PROMPT};
use crate::tools::{BackendConnector, LocalBackend, ToolBackend, ToolExecutor, ToolIdentifier};

const VIEW_PREVIEW_CHARS: usize = 120;

pub const COMMAND_HELP: &str =
    "/reset /key /view /tools /resources /resource get|use <backend>.<resource> /prompts /prompt <backend>.<prompt> [JSON] /quit";

const RESOURCE_USAGE: &str = "Usage: /resource get|use <backend>.<resource>";
const PROMPT_USAGE: &str = "Usage: /prompt <backend>.<prompt> [JSON arguments]";

/// `/resource` 的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    /// 只显示内容
    Get,
    /// 写入会话上下文
    Use,
}

/// 前端输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 清空当前会话
    Reset,
    /// 把最近一问一答标记为关键消息
    MarkKey,
    /// 查看当前上下文视图
    View,
    /// 列出可用工具
    Tools,
    Resources,
    Resource {
        action: ResourceAction,
        target: String,
    },
    Prompts,
    Prompt {
        target: String,
        /// JSON 对象文本
        arguments: Option<String>,
    },
    /// 参数不合法，附用法
    Usage(&'static str),
    Quit,
    Unknown(String),
    Query(String),
}

impl Command {
    /// 解析一行输入；空行返回 None
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('/') {
            return Some(Command::Query(line.to_string()));
        }
        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or(line);
        Some(match cmd {
            "/reset" => Command::Reset,
            "/key" => Command::MarkKey,
            "/view" => Command::View,
            "/tools" => Command::Tools,
            "/resources" => Command::Resources,
            "/prompts" => Command::Prompts,
            "/resource" => {
                let action = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                    Some("get") => Some(ResourceAction::Get),
                    Some("use") => Some(ResourceAction::Use),
                    _ => None,
                };
                match (action, parts.next()) {
                    (Some(action), Some(target)) => Command::Resource {
                        action,
                        target: target.to_string(),
                    },
                    _ => Command::Usage(RESOURCE_USAGE),
                }
            }
            "/prompt" => match parts.next() {
                Some(target) => {
                    let rest: Vec<&str> = parts.collect();
                    Command::Prompt {
                        target: target.to_string(),
                        arguments: (!rest.is_empty()).then(|| rest.join(" ")),
                    }
                }
                None => Command::Usage(PROMPT_USAGE),
            },
            "/quit" | "/exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        })
    }
}

/// 命令处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// 回合的最终回复
    Reply(String),
    /// 本地命令的提示信息
    Info(String),
    Quit,
}

/// 单会话运行时：编排引擎 + 上下文窗口
pub struct AgentRuntime {
    engine: Engine,
    context: ContextWindowManager,
}

impl AgentRuntime {
    pub fn new(engine: Engine, context: ContextWindowManager) -> Self {
        Self { engine, context }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn context(&self) -> &ContextWindowManager {
        &self.context
    }

    pub async fn handle(
        &mut self,
        command: Command,
        events: Option<&EventSender>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AgentError> {
        match command {
            Command::Query(input) => {
                let result = self.engine.run_turn(&mut self.context, &input, events, cancel).await?;
                let (prompt_tokens, completion_tokens, total_tokens) = self.context.summarizer_usage();
                if total_tokens > 0 {
                    tracing::info!(prompt_tokens, completion_tokens, total_tokens, "cumulative summarizer usage");
                }
                Ok(CommandOutcome::Reply(result.response))
            }
            Command::Reset => {
                self.context.reset();
                Ok(CommandOutcome::Info("Conversation cleared.".to_string()))
            }
            Command::MarkKey => {
                self.context.mark_latest_exchange_key();
                Ok(CommandOutcome::Info(format!(
                    "Key messages: {}",
                    self.context.state().key_indices().len()
                )))
            }
            Command::View => Ok(CommandOutcome::Info(self.render_view())),
            Command::Tools => {
                let catalog = self.engine.executor().catalog().await;
                if catalog.is_empty() {
                    Ok(CommandOutcome::Info("No tools available.".to_string()))
                } else {
                    Ok(CommandOutcome::Info(catalog.describe()))
                }
            }
            Command::Resources => Ok(CommandOutcome::Info(self.list_resources().await)),
            Command::Resource { action, target } => Ok(CommandOutcome::Info(self.resource(action, &target).await)),
            Command::Prompts => Ok(CommandOutcome::Info(self.list_prompts().await)),
            Command::Prompt { target, arguments } => {
                Ok(CommandOutcome::Info(self.prompt(&target, arguments.as_deref()).await))
            }
            Command::Usage(usage) => Ok(CommandOutcome::Info(usage.to_string())),
            Command::Quit => Ok(CommandOutcome::Quit),
            Command::Unknown(cmd) => Ok(CommandOutcome::Info(format!(
                "Unknown command: {} (available: {})",
                cmd, COMMAND_HELP
            ))),
        }
    }

    /// 解析 `<backend>.<name>` 并找到已注册的后端
    fn locate(&self, target: &str) -> Result<(Arc<dyn ToolBackend>, ToolIdentifier), String> {
        let id = ToolIdentifier::parse(target)
            .ok_or_else(|| format!("Use the form <backend>.<name>, got '{}'", target))?;
        let backend = self
            .engine
            .executor()
            .backend(&id.backend)
            .cloned()
            .ok_or_else(|| format!("Backend not found: {}", id.backend))?;
        Ok((backend, id))
    }

    async fn list_resources(&self) -> String {
        let mut lines = vec!["Available resources:".to_string()];
        for (name, backend) in self.engine.executor().backends() {
            match backend.list_resources().await {
                Ok(resources) if resources.is_empty() => lines.push(format!("Backend {} has no resources", name)),
                Ok(resources) => {
                    for r in resources {
                        lines.push(format!("- {}.{}: {}", name, r.name, r.description));
                    }
                }
                Err(e) => lines.push(format!("Failed to list resources of backend {}: {}", name, e)),
            }
        }
        lines.join("\n")
    }

    async fn resource(&mut self, action: ResourceAction, target: &str) -> String {
        let (backend, id) = match self.locate(target) {
            Ok(found) => found,
            Err(e) => return e,
        };
        let content = match backend.read_resource(&id.name).await {
            Ok(text) if text.trim().is_empty() => "(the resource has no content)".to_string(),
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(resource = %target, error = %e, "failed to read resource");
                return format!("Failed to read resource {}: {}", target, e);
            }
        };
        match action {
            ResourceAction::Get => format!("Resource {}:\n{}", target, content),
            ResourceAction::Use => {
                self.context.append(
                    Message::system(format!("Content of resource {}:\n{}", target, content)),
                    true,
                );
                format!("Resource {} added to the conversation context.", target)
            }
        }
    }

    async fn list_prompts(&self) -> String {
        let mut lines = vec!["Available prompts:".to_string()];
        for (name, backend) in self.engine.executor().backends() {
            match backend.list_prompts().await {
                Ok(prompts) if prompts.is_empty() => lines.push(format!("Backend {} has no prompts", name)),
                Ok(prompts) => {
                    for p in prompts {
                        lines.push(format!("- {}.{}: {}", name, p.name, p.description));
                        for arg in &p.arguments {
                            let required = if arg.required { " (required)" } else { "" };
                            lines.push(format!(
                                "    {}{}: {}",
                                arg.name,
                                required,
                                arg.description.as_deref().unwrap_or("no description")
                            ));
                        }
                    }
                }
                Err(e) => lines.push(format!("Failed to list prompts of backend {}: {}", name, e)),
            }
        }
        lines.join("\n")
    }

    async fn prompt(&mut self, target: &str, arguments: Option<&str>) -> String {
        let (backend, id) = match self.locate(target) {
            Ok(found) => found,
            Err(e) => return e,
        };
        let args = match arguments.map(serde_json::from_str::<serde_json::Value>) {
            None => serde_json::Map::new(),
            Some(Ok(serde_json::Value::Object(map))) => map,
            Some(_) => return "Prompt arguments must be a JSON object.".to_string(),
        };
        let args_text = serde_json::Value::Object(args.clone()).to_string();
        let messages = match backend.get_prompt(&id.name, args).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(prompt = %target, error = %e, "failed to get prompt");
                return format!("Failed to run prompt {}: {}", target, e);
            }
        };
        let content = if messages.is_empty() {
            "The prompt returned no messages.".to_string()
        } else {
            serde_json::to_string_pretty(&messages).unwrap_or_default()
        };
        self.context.append(
            Message::system(format!(
                "Result of prompt {} (arguments: {}):\n{}",
                target, args_text, content
            )),
            true,
        );
        format!("Prompt {} executed and added to the conversation context.", target)
    }

    fn render_view(&self) -> String {
        let view = self.context.current_view();
        let (prompt, completion, total) = self.context.summarizer_usage();
        let mut out = format!(
            "{} messages, ~{} tokens (limit {})\nsummarizer usage: prompt {}, completion {}, total {}\n",
            view.len(),
            self.context.estimate_tokens(),
            self.context.budget().limit(),
            prompt,
            completion,
            total
        );
        for (i, msg) in view.iter().enumerate() {
            let text = msg.content.as_deref().unwrap_or("");
            let mut preview: String = text.chars().take(VIEW_PREVIEW_CHARS).collect();
            if text.chars().count() > VIEW_PREVIEW_CHARS {
                preview.push_str("...");
            }
            let calls = msg.tool_calls.as_ref().map_or(0, Vec::len);
            if calls > 0 {
                out.push_str(&format!("{:>3} [{}] ({} tool calls) {}\n", i, msg.role.as_str(), calls, preview));
            } else {
                out.push_str(&format!("{:>3} [{}] {}\n", i, msg.role.as_str(), preview));
            }
        }
        out
    }
}

/// 新建空会话的上下文窗口
pub fn create_context(cfg: &AppConfig, summarizer: Arc<dyn Summarizer>) -> ContextWindowManager {
    let budget = TokenBudget::new(cfg.llm.context_window).with_reserve(cfg.context.reserve_tokens);
    let policy = CompressionPolicy {
        retention_ratio: cfg.context.retention_ratio,
        ..CompressionPolicy::default()
    };
    ContextWindowManager::new(ConversationState::new(), Arc::new(TokenEstimator), summarizer, budget)
        .with_policy(policy)
}

pub fn engine_config(cfg: &AppConfig) -> EngineConfig {
    EngineConfig {
        max_iterations: cfg.agent.max_tool_iterations,
        stream: cfg.llm.stream,
        reasoning_fallback: cfg.agent.reasoning_fallback,
        inject_tool_context: cfg.agent.inject_tool_context,
        system_prompt: cfg
            .agent
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    }
}

/// 组装工具执行器：内置本地后端 + 配置文件中描述的外部后端
///
/// 外部后端连接失败只记录日志，不影响其余后端。
pub async fn create_executor(cfg: &AppConfig, connector: Option<&dyn BackendConnector>) -> ToolExecutor {
    let mut executor = ToolExecutor::new(Duration::from_secs(cfg.agent.tool_timeout_secs));
    executor.register(Arc::new(LocalBackend::builtin()));

    let specs = load_backend_specs(&cfg.backends);
    match connector {
        Some(connector) => {
            for (name, spec) in &specs {
                match connector.connect(name, spec).await {
                    Ok(backend) => {
                        tracing::info!(backend = %name, "backend connected");
                        executor.register(backend);
                    }
                    Err(e) => tracing::warn!(backend = %name, error = %e, "backend connection failed"),
                }
            }
        }
        None if !specs.is_empty() => {
            tracing::warn!(count = specs.len(), "backend specs configured but no connector available");
        }
        None => {}
    }
    executor
}

/// 按配置创建运行时：HTTP 网关、工具执行器、带 LLM 摘要器的上下文窗口
pub async fn create_runtime(
    cfg: &AppConfig,
    connector: Option<&dyn BackendConnector>,
) -> Result<AgentRuntime, AgentError> {
    let api_key = cfg.llm.api_key.as_deref();
    let gateway: Arc<dyn ModelGateway> = Arc::new(
        HttpGateway::new(
            &cfg.llm.base_url,
            &cfg.llm.model,
            api_key,
            Duration::from_secs(cfg.llm.request_timeout_secs),
        )?
        .with_parallel_tool_calls(cfg.llm.parallel_tool_calls),
    );

    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(Some(cfg.llm.api_base()), &cfg.llm.model, api_key));
    let summarizer: Arc<dyn Summarizer> = Arc::new(LlmSummarizer::new(llm));

    let executor = Arc::new(create_executor(cfg, connector).await);
    tracing::info!(
        model = %cfg.llm.model,
        backends = ?executor.backend_names(),
        max_iterations = cfg.agent.max_tool_iterations,
        "agent runtime ready"
    );

    let engine = Engine::new(gateway, executor, engine_config(cfg));
    Ok(AgentRuntime::new(engine, create_context(cfg, summarizer)))
}
