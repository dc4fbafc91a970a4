//! 工具执行器
//!
//! 按后端名持有 ToolBackend，对每次调用施加超时，把结果分类为 ToolOutcome；每次调用输出结构化审计日志（JSON）。
//! execute_round 并发执行一轮中的全部调用，单个调用的失败或超时不影响同轮其他调用。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{ToolBackend, ToolCatalog, ToolInvocation, ToolOutcome, ToolResult};

/// 单个工具调用的默认超时（秒）
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;

pub struct ToolExecutor {
    backends: BTreeMap<String, Arc<dyn ToolBackend>>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            backends: BTreeMap::new(),
            timeout,
        }
    }

    /// 注册后端；同名后端会被替换
    pub fn register(&mut self, backend: Arc<dyn ToolBackend>) {
        let name = backend.name().to_string();
        if self.backends.insert(name.clone(), backend).is_some() {
            tracing::warn!(backend = %name, "replacing registered backend");
        }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn backend(&self, name: &str) -> Option<&Arc<dyn ToolBackend>> {
        self.backends.get(name)
    }

    /// 按名称排序的全部后端
    pub fn backends(&self) -> impl Iterator<Item = (&str, &Arc<dyn ToolBackend>)> {
        self.backends.iter().map(|(name, backend)| (name.as_str(), backend))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 汇总所有后端的工具；单个后端列举失败时跳过
    pub async fn catalog(&self) -> ToolCatalog {
        let mut catalog = ToolCatalog::new();
        for (name, backend) in &self.backends {
            match backend.list_tools().await {
                Ok(tools) => {
                    for tool in tools {
                        catalog.insert(name, tool);
                    }
                }
                Err(e) => tracing::warn!(backend = %name, error = %e, "failed to list tools"),
            }
        }
        catalog
    }

    /// 执行单个调用，按 target 分发；无目标或后端未注册时不调用，直接返回 UnknownBackend
    pub async fn invoke(&self, call: &ToolInvocation) -> ToolOutcome {
        let start = Instant::now();
        let args_preview = args_preview(&Value::Object(call.arguments.clone()));

        let outcome = match call.target.as_ref() {
            None => ToolOutcome::UnknownBackend(call.name.clone()),
            Some(target) => match self.backends.get(&target.backend) {
                None => ToolOutcome::UnknownBackend(target.backend.clone()),
                Some(backend) => {
                    match timeout(self.timeout, backend.invoke(&target.name, call.arguments.clone())).await {
                        Ok(Ok(payload)) => ToolOutcome::Success(payload),
                        Ok(Err(e)) => ToolOutcome::ExecutionError(e),
                        Err(_) => ToolOutcome::Timeout(self.timeout),
                    }
                }
            },
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": outcome.is_success(),
            "outcome": outcome.label(),
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        outcome
    }

    /// 并发执行一轮调用；结果与输入一一对应、顺序一致
    pub async fn execute_round(&self, calls: &[ToolInvocation]) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| async move {
            let outcome = self.invoke(call).await;
            let ok = outcome.is_success();
            ToolResult {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                payload: outcome.into_payload(&call.name),
                ok,
            }
        }))
        .await
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{LocalBackend, MockBackend, MockBehavior, ToolIdentifier};
    use serde_json::{json, Map};

    fn call(id: &str, name: &str, args: Value) -> ToolInvocation {
        let arguments = match args {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        ToolInvocation::new(id, name, arguments).with_target(ToolIdentifier::parse(name))
    }

    fn executor() -> ToolExecutor {
        let mut exec = ToolExecutor::new(Duration::from_millis(200));
        exec.register(Arc::new(LocalBackend::builtin()));
        exec.register(Arc::new(
            MockBackend::new("svc")
                .with_tool("ok", MockBehavior::Reply("fine".into()))
                .with_tool("empty", MockBehavior::Empty)
                .with_tool("fail", MockBehavior::Fail("bad input".into()))
                .with_tool("slow", MockBehavior::Hang),
        ));
        exec
    }

    #[tokio::test]
    async fn outcomes_are_classified() {
        let exec = executor();
        assert_eq!(
            exec.invoke(&call("1", "svc.ok", json!({}))).await,
            ToolOutcome::Success(Some("fine".into()))
        );
        assert_eq!(
            exec.invoke(&call("2", "svc.empty", json!({}))).await,
            ToolOutcome::Success(None)
        );
        assert_eq!(
            exec.invoke(&call("3", "svc.fail", json!({}))).await,
            ToolOutcome::ExecutionError("bad input".into())
        );
        assert_eq!(
            exec.invoke(&call("4", "svc.slow", json!({}))).await,
            ToolOutcome::Timeout(Duration::from_millis(200))
        );
        assert_eq!(
            exec.invoke(&call("5", "nowhere.tool", json!({}))).await,
            ToolOutcome::UnknownBackend("nowhere".into())
        );
    }

    #[tokio::test]
    async fn round_returns_one_result_per_call_in_order() {
        let exec = executor();
        let calls = vec![
            call("a", "svc.slow", json!({})),
            call("b", "local.echo", json!({"text": "hi"})),
            call("c", "svc.fail", json!({})),
            call("d", "ghost.x", json!({})),
            call("e", "svc.ok", json!({})),
        ];
        let start = Instant::now();
        let results = exec.execute_round(&calls).await;
        // 并发执行：总耗时约等于最长的超时，而不是累加
        assert!(start.elapsed() < Duration::from_millis(600));
        let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
        assert!(!results[0].ok);
        assert_eq!(results[1].payload, "hi");
        assert!(results.iter().all(|r| !r.payload.is_empty()));
    }

    #[tokio::test]
    async fn unknown_backend_is_not_invoked() {
        let backend = Arc::new(MockBackend::new("svc").with_tool("ok", MockBehavior::Reply("x".into())));
        let mut exec = ToolExecutor::new(Duration::from_secs(1));
        exec.register(backend.clone());
        exec.invoke(&call("1", "other.ok", json!({}))).await;
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn names_outside_catalog() {
        let exec = executor();
        let catalog = exec.catalog().await;
        let missing = ToolInvocation::new("1", "svc.missing", Map::new()).routed(&catalog);
        assert_eq!(
            exec.invoke(&missing).await,
            ToolOutcome::ExecutionError("Unknown tool: missing".into())
        );
        let bare = ToolInvocation::new("2", "echo", Map::new()).routed(&catalog);
        assert_eq!(exec.invoke(&bare).await, ToolOutcome::UnknownBackend("echo".into()));
    }

    #[tokio::test]
    async fn catalog_spans_backends() {
        let catalog = executor().catalog().await;
        assert!(catalog.resolve("local.echo").is_some());
        assert!(catalog.resolve("svc.slow").is_some());
        assert_eq!(catalog.len(), 6);
    }
}
