//! 进程内工具注册表
//!
//! 所有本地工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册，
//! 再包装为 LocalBackend 挂到 ToolExecutor 上，与外部后端走同一条调用路径。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::tools::{ToolBackend, ToolDescriptor};

/// 本地后端的默认名称
pub const LOCAL_BACKEND: &str = "local";

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.tools.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            })
            .collect()
    }
}

/// 以注册表为内容的进程内后端
pub struct LocalBackend {
    name: String,
    registry: ToolRegistry,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, registry: ToolRegistry) -> Self {
        Self {
            name: name.into(),
            registry,
        }
    }

    /// 内置工具集：echo、clock
    pub fn builtin() -> Self {
        let mut registry = ToolRegistry::new();
        registry.register(crate::tools::EchoTool);
        registry.register(crate::tools::ClockTool);
        Self::new(LOCAL_BACKEND, registry)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl ToolBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
        Ok(self.registry.descriptors())
    }

    async fn invoke(&self, tool: &str, args: Map<String, Value>) -> Result<Option<String>, String> {
        self.registry.execute(tool, Value::Object(args)).await.map(Some)
    }
}
