//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_TOOL_ITERATIONS=3`），
//! 最后是兼容旧部署的 `MODEL`、`MODEL_BASE_URL`、`MODEL_API_KEY`、`MODEL_API_OPTION_CONTEXTWINDOWS`。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub context: ContextSection,
    pub backends: BackendsSection,
}

/// [llm] 段：模型端点与请求方式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    /// 可以是 `.../v1`，也可以是完整的 `.../chat/completions`
    pub base_url: String,
    pub api_key: Option<String>,
    /// 上下文窗口（tokens）
    pub context_window: usize,
    pub stream: bool,
    pub request_timeout_secs: u64,
    /// false 时请求携带 tool_choice: auto
    pub parallel_tool_calls: bool,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "Qwen/Qwen3-32B".to_string(),
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            api_key: None,
            context_window: 128_000,
            stream: true,
            request_timeout_secs: crate::llm::DEFAULT_REQUEST_TIMEOUT_SECS,
            parallel_tool_calls: true,
        }
    }
}

impl LlmSection {
    /// 去掉 /chat/completions 后缀的 API 根地址（供 async-openai 使用）
    pub fn api_base(&self) -> &str {
        let base = self.base_url.trim_end_matches('/');
        base.strip_suffix("/chat/completions").unwrap_or(base)
    }
}

/// [agent] 段：编排引擎行为
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_tool_iterations: usize,
    pub tool_timeout_secs: u64,
    /// 允许从 reasoning_content 的 <tool_call> 标签中提取调用
    pub reasoning_fallback: bool,
    /// 每轮把工具目录写入上下文的工具说明槽
    pub inject_tool_context: bool,
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_tool_iterations: crate::react::DEFAULT_MAX_TOOL_ITERATIONS,
            tool_timeout_secs: crate::tools::DEFAULT_TOOL_TIMEOUT_SECS,
            reasoning_fallback: true,
            inject_tool_context: false,
            system_prompt: None,
        }
    }
}

/// [context] 段：上下文窗口压缩
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub reserve_tokens: usize,
    pub retention_ratio: f64,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            reserve_tokens: 500,
            retention_ratio: 0.8,
        }
    }
}

/// [backends] 段：外部工具后端的 JSON 描述文件
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackendsSection {
    /// 子进程后端：{"servers": {"name": {"command": ..., "args": [...], "env": {...}}}}
    pub stdio_config: Option<PathBuf>,
    /// URL 后端：{"servers": {"name": {"url": ..., "headers": {...}}}}
    pub url_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StdioBackendSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UrlBackendSpec {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// 一个外部后端的连接方式
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSpec {
    Stdio(StdioBackendSpec),
    Url(UrlBackendSpec),
}

const ENV_PREFIX: &str = "HIVE";

/// 兼容的旧环境变量 -> 配置键
const LEGACY_ENV: [(&str, &str); 4] = [
    ("MODEL", "llm.model"),
    ("MODEL_BASE_URL", "llm.base_url"),
    ("MODEL_API_KEY", "llm.api_key"),
    ("MODEL_API_OPTION_CONTEXTWINDOWS", "llm.context_window"),
];

/// 从 config 目录加载配置，环境变量 HIVE__* 与旧变量名可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 HIVE__*（双下划线表示嵌套键）
/// 4. 旧变量名（MODEL 等）以 override 方式最后生效
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    for (key, value) in legacy_overrides(|name| std::env::var(name).ok()) {
        builder = builder.set_override(key, value)?;
    }

    let c = builder.build()?;
    c.try_deserialize()
}

/// 收集旧环境变量的覆盖项；空值忽略，上下文窗口必须是正整数
pub fn legacy_overrides<F>(lookup: F) -> Vec<(&'static str, config::Value)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = Vec::new();
    for (env_name, key) in LEGACY_ENV {
        let Some(raw) = lookup(env_name).map(|v| v.trim().to_string()) else {
            continue;
        };
        if raw.is_empty() {
            continue;
        }
        if key == "llm.context_window" {
            match raw.parse::<u64>() {
                Ok(n) if n > 0 => out.push((key, config::Value::from(n))),
                _ => tracing::warn!(var = env_name, value = %raw, "ignoring invalid context window"),
            }
        } else {
            out.push((key, config::Value::from(raw)));
        }
    }
    out
}

/// 读取两个后端描述文件，合并为 名称 -> 连接方式
///
/// 子进程后端先登记；URL 描述中与之重名的条目跳过。
pub fn load_backend_specs(section: &BackendsSection) -> BTreeMap<String, BackendSpec> {
    let mut specs = BTreeMap::new();

    if let Some(ref path) = section.stdio_config {
        for (name, entry) in read_servers(path) {
            match serde_json::from_value::<StdioBackendSpec>(entry) {
                Ok(spec) => {
                    specs.insert(name, BackendSpec::Stdio(spec));
                }
                Err(e) => tracing::warn!(backend = %name, error = %e, "invalid stdio backend spec"),
            }
        }
    }

    if let Some(ref path) = section.url_config {
        for (name, entry) in read_servers(path) {
            if specs.contains_key(&name) {
                continue;
            }
            let has_url = entry
                .get("url")
                .and_then(Value::as_str)
                .is_some_and(|u| !u.trim().is_empty());
            if !has_url {
                tracing::warn!(backend = %name, "url backend spec has no url, skipped");
                continue;
            }
            match serde_json::from_value::<UrlBackendSpec>(entry) {
                Ok(spec) => {
                    specs.insert(name, BackendSpec::Url(spec));
                }
                Err(e) => tracing::warn!(backend = %name, error = %e, "invalid url backend spec"),
            }
        }
    }

    specs
}

/// 读取 {"servers": {...}}；文件缺失或格式错误时退化为空
fn read_servers(path: &Path) -> Vec<(String, Value)> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "backend config unreadable");
            return Vec::new();
        }
    };
    let root: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "backend config is not valid JSON");
            return Vec::new();
        }
    };
    match root.get("servers").and_then(Value::as_object) {
        Some(servers) => servers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => {
            tracing::warn!(path = %path.display(), "backend config has no servers object");
            Vec::new()
        }
    }
}
