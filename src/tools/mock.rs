//! Mock 工具后端（用于测试）：按工具名预设行为，可按参数区分，记录每次调用；也可预置资源与提示模板

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::tools::{PromptDescriptor, PromptMessage, ResourceDescriptor, ToolBackend, ToolDescriptor};

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Reply(String),
    /// 成功但无内容
    Empty,
    Fail(String),
    /// 延迟后回复
    Delay(Duration, String),
    /// 永不返回
    Hang,
}

type Handler = Arc<dyn Fn(&Map<String, Value>) -> MockBehavior + Send + Sync>;

pub struct MockBackend {
    name: String,
    tools: BTreeMap<String, Handler>,
    /// 资源名 -> (描述, 内容)
    resources: BTreeMap<String, (String, String)>,
    prompts: Vec<(PromptDescriptor, Vec<PromptMessage>)>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: BTreeMap::new(),
            resources: BTreeMap::new(),
            prompts: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool(self, tool: &str, behavior: MockBehavior) -> Self {
        self.with_handler(tool, move |_| behavior.clone())
    }

    /// 行为由参数决定
    pub fn with_handler<F>(mut self, tool: &str, handler: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> MockBehavior + Send + Sync + 'static,
    {
        self.tools.insert(tool.to_string(), Arc::new(handler));
        self
    }

    pub fn with_resource(mut self, name: &str, description: &str, content: &str) -> Self {
        self.resources
            .insert(name.to_string(), (description.to_string(), content.to_string()));
        self
    }

    /// 消息内容中的 `{arg}` 在展开时替换为同名参数
    pub fn with_prompt(mut self, descriptor: PromptDescriptor, messages: Vec<PromptMessage>) -> Self {
        self.prompts.push((descriptor, messages));
        self
    }

    /// 已收到的调用（工具名, 参数）
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ToolBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
        Ok(self
            .tools
            .keys()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                description: format!("mock tool {name}"),
                input_schema: json!({"type": "object", "properties": {}}),
            })
            .collect())
    }

    async fn invoke(&self, tool: &str, args: Map<String, Value>) -> Result<Option<String>, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((tool.to_string(), args.clone()));
        }
        let handler = self
            .tools
            .get(tool)
            .cloned()
            .ok_or_else(|| format!("Unknown tool: {tool}"))?;
        match handler(&args) {
            MockBehavior::Reply(text) => Ok(Some(text)),
            MockBehavior::Empty => Ok(None),
            MockBehavior::Fail(e) => Err(e),
            MockBehavior::Delay(d, text) => {
                tokio::time::sleep(d).await;
                Ok(Some(text))
            }
            MockBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, String> {
        Ok(self
            .resources
            .iter()
            .map(|(name, (description, _))| ResourceDescriptor {
                name: name.clone(),
                description: description.clone(),
            })
            .collect())
    }

    async fn read_resource(&self, resource: &str) -> Result<String, String> {
        self.resources
            .get(resource)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| format!("Unknown resource: {resource}"))
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, String> {
        Ok(self.prompts.iter().map(|(d, _)| d.clone()).collect())
    }

    async fn get_prompt(&self, prompt: &str, args: Map<String, Value>) -> Result<Vec<PromptMessage>, String> {
        let (descriptor, messages) = self
            .prompts
            .iter()
            .find(|(d, _)| d.name == prompt)
            .ok_or_else(|| format!("Unknown prompt: {prompt}"))?;
        if let Some(missing) = descriptor
            .arguments
            .iter()
            .find(|a| a.required && !args.contains_key(&a.name))
        {
            return Err(format!("Missing required argument: {}", missing.name));
        }
        Ok(messages
            .iter()
            .map(|m| {
                let content = args.iter().fold(m.content.clone(), |text, (k, v)| {
                    let value = v.as_str().map(String::from).unwrap_or_else(|| v.to_string());
                    text.replace(&format!("{{{k}}}"), &value)
                });
                PromptMessage {
                    role: m.role.clone(),
                    content,
                }
            })
            .collect())
    }
}
