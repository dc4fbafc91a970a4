//! 工具目录：所有后端声明的工具，按限定名索引，并转换为模型使用的函数规格

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::tools::{ToolDescriptor, ToolIdentifier};

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: ToolIdentifier,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, backend: &str, descriptor: ToolDescriptor) {
        let id = ToolIdentifier::new(backend, descriptor.name);
        self.entries.insert(
            id.qualified(),
            CatalogEntry {
                id,
                description: descriptor.description,
                input_schema: descriptor.input_schema,
            },
        );
    }

    pub fn resolve(&self, qualified: &str) -> Option<&CatalogEntry> {
        self.entries.get(qualified)
    }

    /// 调用的路由目标：目录内的工具取建目录时构造的标识；
    /// 目录外的限定名交给前缀对应的后端，由它报告未知工具；无前缀时为 None
    pub fn route(&self, qualified: &str) -> Option<ToolIdentifier> {
        if let Some(entry) = self.resolve(qualified) {
            return Some(entry.id.clone());
        }
        tracing::warn!(tool = %qualified, "tool is not in the catalog");
        ToolIdentifier::parse(qualified)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn function_specs(&self) -> Vec<Value> {
        self.entries.values().map(to_function_spec).collect()
    }

    /// 「可用工具」上下文消息的文本
    pub fn describe(&self) -> String {
        let mut out = String::from("Available tools:\n");
        for entry in self.entries.values() {
            out.push_str(&format!("- {}: {}\n", entry.id, entry.description));
        }
        out
    }
}

/// 输入 schema 转函数规格；类型为列表的属性取第一个类型，并在描述中注明支持的类型
pub fn to_function_spec(entry: &CatalogEntry) -> Value {
    let mut properties = Map::new();
    if let Some(props) = entry.input_schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            let mut description = prop
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let ty = match prop.get("type") {
                Some(Value::Array(types)) => {
                    let names: Vec<&str> = types.iter().filter_map(Value::as_str).collect();
                    description.push_str(&format!(" (supported types: {})", names.join(", ")));
                    names.first().copied().unwrap_or("string").to_string()
                }
                Some(Value::String(t)) => t.clone(),
                _ => "string".to_string(),
            };
            properties.insert(name.clone(), json!({"type": ty, "description": description}));
        }
    }
    let required = entry
        .input_schema
        .get("required")
        .cloned()
        .unwrap_or_else(|| json!([]));

    json!({
        "type": "function",
        "function": {
            "name": entry.id.qualified(),
            "description": entry.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        }
    })
}
