//! 编排引擎集成测试：Mock 网关 + Mock 工具后端跑完整回合

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::stream;
    use hive::core::AgentError;
    use hive::llm::{GatewayError, MockSummarizer, ModelResponse, ScriptedGateway};
    use hive::memory::{
        ChatMessage, ContextWindowManager, ConversationState, Role, TokenBudget, TokenEstimator, ToolCallRequest,
    };
    use hive::react::{Engine, EngineConfig, ReactEvent, LIMIT_APOLOGY, LIMIT_REACHED_RESULT};
    use hive::stream::assemble_stream;
    use hive::tools::{MockBackend, MockBehavior, ToolExecutor};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn context() -> ContextWindowManager {
        ContextWindowManager::new(
            ConversationState::new(),
            Arc::new(TokenEstimator),
            Arc::new(MockSummarizer::new("summary")),
            TokenBudget::default(),
        )
    }

    fn weather_backend() -> Arc<MockBackend> {
        Arc::new(MockBackend::new("weather").with_handler("get_weather", |args| {
            match args.get("city").and_then(|v| v.as_str()) {
                Some("Beijing") => MockBehavior::Reply("Beijing: sunny, 21C".into()),
                Some("Shanghai") => MockBehavior::Hang,
                _ => MockBehavior::Fail("city not found".into()),
            }
        }))
    }

    fn executor_with(backend: Arc<MockBackend>, timeout: Duration) -> Arc<ToolExecutor> {
        let mut exec = ToolExecutor::new(timeout);
        exec.register(backend);
        Arc::new(exec)
    }

    fn config(max_iterations: usize) -> EngineConfig {
        EngineConfig {
            max_iterations,
            stream: false,
            ..Default::default()
        }
    }

    fn weather_call(id: &str, city: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "weather.get_weather", json!(format!(r#"{{"city": "{}"}}"#, city)))
    }

    fn tool_messages(messages: &[ChatMessage]) -> Vec<(String, String)> {
        messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| {
                (
                    m.tool_call_id.clone().unwrap_or_default(),
                    m.content.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ReactEvent>) -> Vec<ReactEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_two_city_weather_with_one_timeout() {
        let backend = weather_backend();
        let gw = Arc::new(ScriptedGateway::new(vec![
            Ok(ModelResponse::tool_calls(vec![
                weather_call("c1", "Beijing"),
                weather_call("c2", "Shanghai"),
            ])),
            Ok(ModelResponse::text(
                "Beijing is sunny at 21C; Shanghai's weather is unavailable right now.",
            )),
        ]));
        let engine = Engine::new(
            gw.clone(),
            executor_with(backend.clone(), Duration::from_millis(100)),
            config(5),
        );
        let mut ctx = context();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = engine
            .run_turn(&mut ctx, "Weather in Beijing and Shanghai?", Some(&tx), &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.response.contains("Beijing is sunny"));
        assert_eq!(out.iterations, 1);
        assert_eq!(gw.calls(), 2);
        assert_eq!(backend.calls().len(), 2);

        // 第二次决策看到两个结果，顺序与调用一致
        let second = &gw.requests()[1];
        let results = tool_messages(&second.messages);
        assert_eq!(
            results,
            vec![
                ("c1".to_string(), "Beijing: sunny, 21C".to_string()),
                (
                    "c2".to_string(),
                    "Tool weather.get_weather timed out after 0.1s".to_string()
                ),
            ]
        );
        // 助手调用消息在结果之前
        let assistant_idx = second
            .messages
            .iter()
            .position(|m| m.role == Role::Assistant && m.tool_calls.is_some())
            .unwrap();
        let first_tool_idx = second.messages.iter().position(|m| m.role == Role::Tool).unwrap();
        assert!(assistant_idx < first_tool_idx);

        let state = ctx.state();
        assert!(state.keys_consistent());
        let tool_keys = state
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool && m.is_key)
            .count();
        assert_eq!(tool_keys, 2);

        let events = drain(&mut rx);
        let observations: Vec<(String, bool)> = events
            .iter()
            .filter_map(|e| match e {
                ReactEvent::Observation { call_id, ok, .. } => Some((call_id.clone(), *ok)),
                _ => None,
            })
            .collect();
        assert_eq!(observations, vec![("c1".into(), true), ("c2".into(), false)]);
        assert_eq!(events.last(), Some(&ReactEvent::MessageDone));
    }

    #[tokio::test]
    async fn test_results_follow_call_order_not_completion_order() {
        let backend = Arc::new(
            MockBackend::new("svc")
                .with_tool("slow", MockBehavior::Delay(Duration::from_millis(80), "slow done".into()))
                .with_tool("fast", MockBehavior::Delay(Duration::from_millis(5), "fast done".into()))
                .with_tool("broken", MockBehavior::Fail("disk full".into()))
                .with_tool("quiet", MockBehavior::Empty),
        );
        let gw = Arc::new(ScriptedGateway::new(vec![
            Ok(ModelResponse::tool_calls(vec![
                ToolCallRequest::new("a", "svc.slow", json!("{}")),
                ToolCallRequest::new("b", "svc.fast", json!("{}")),
                ToolCallRequest::new("c", "svc.broken", json!("{}")),
                ToolCallRequest::new("d", "svc.quiet", serde_json::Value::Null),
            ])),
            Ok(ModelResponse::text("done")),
        ]));
        let engine = Engine::new(gw.clone(), executor_with(backend, Duration::from_secs(2)), config(5));
        let mut ctx = context();
        engine
            .run_turn(&mut ctx, "run all", None, &CancellationToken::new())
            .await
            .unwrap();

        let results = tool_messages(&gw.requests()[1].messages);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(results[0].1, "slow done");
        assert_eq!(results[2].1, "Tool svc.broken failed: disk full");
        assert_eq!(results[3].1, "Tool executed successfully but returned no content.");
    }

    #[tokio::test]
    async fn test_unknown_backend_is_reported_without_invocation() {
        let backend = weather_backend();
        let gw = Arc::new(ScriptedGateway::new(vec![
            Ok(ModelResponse::tool_calls(vec![
                ToolCallRequest::new("x1", "maps.route", json!("{}")),
                ToolCallRequest::new("x2", "lonely", json!("{}")),
            ])),
            Ok(ModelResponse::text("no maps available")),
        ]));
        let engine = Engine::new(
            gw.clone(),
            executor_with(backend.clone(), Duration::from_secs(1)),
            config(5),
        );
        let mut ctx = context();
        engine
            .run_turn(&mut ctx, "route me", None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(backend.calls().is_empty());
        let results = tool_messages(&gw.requests()[1].messages);
        assert_eq!(results[0].1, "Error: backend 'maps' is not connected or unavailable.");
        assert_eq!(results[1].1, "Error: backend 'lonely' is not connected or unavailable.");
    }

    #[tokio::test]
    async fn test_iteration_limit_bounds_gateway_calls() {
        let backend = weather_backend();
        let max = 2;
        let gw = Arc::new(ScriptedGateway::new(vec![
            Ok(ModelResponse::tool_calls(vec![weather_call("r1", "Beijing")])),
            Ok(ModelResponse::tool_calls(vec![weather_call("r2", "Beijing")])),
            // 上限后的最后一次决策仍然要工具
            Ok(ModelResponse::tool_calls(vec![weather_call("r3", "Beijing")])),
            Ok(ModelResponse::text("never reached")),
        ]));
        let engine = Engine::new(
            gw.clone(),
            executor_with(backend.clone(), Duration::from_secs(1)),
            config(max),
        );
        let mut ctx = context();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = engine
            .run_turn(&mut ctx, "loop forever", Some(&tx), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(gw.calls(), max + 1);
        assert_eq!(out.gateway_calls, max + 1);
        assert_eq!(out.iterations, max);
        assert!(out.limit_reached);
        assert_eq!(out.response, LIMIT_APOLOGY);
        // r3 没有真正执行
        assert_eq!(backend.calls().len(), max);

        let requests = gw.requests();
        assert!(requests[max].tools.is_empty());
        assert!(!requests[0].tools.is_empty());

        let history: Vec<(String, String)> = ctx
            .state()
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| (m.tool_call_id.clone().unwrap_or_default(), m.text().to_string()))
            .collect();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2], ("r3".to_string(), LIMIT_REACHED_RESULT.to_string()));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, ReactEvent::System { text } if text.contains("limit"))));
        assert!(!events.iter().any(|e| matches!(e, ReactEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_iteration_limit_final_answer() {
        let gw = Arc::new(ScriptedGateway::new(vec![
            Ok(ModelResponse::tool_calls(vec![weather_call("r1", "Beijing")])),
            Ok(ModelResponse::text("Beijing is sunny.")),
        ]));
        let engine = Engine::new(
            gw.clone(),
            executor_with(weather_backend(), Duration::from_secs(1)),
            config(1),
        );
        let mut ctx = context();
        let out = engine
            .run_turn(&mut ctx, "weather?", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.response, "Beijing is sunny.");
        assert!(out.limit_reached);
        assert_eq!(gw.calls(), 2);
        // 临时引导消息不会留在历史里
        assert!(ctx.state().messages().iter().all(|m| !m.transient));
    }

    #[tokio::test]
    async fn test_gateway_error_ends_turn_with_single_error_event() {
        let gw = Arc::new(ScriptedGateway::new(vec![
            Ok(ModelResponse::tool_calls(vec![weather_call("c1", "Beijing")])),
            Err(GatewayError::Status {
                status: 503,
                body: "overloaded".into(),
            }),
        ]));
        let engine = Engine::new(
            gw.clone(),
            executor_with(weather_backend(), Duration::from_secs(1)),
            config(5),
        );
        let mut ctx = context();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = engine
            .run_turn(&mut ctx, "weather?", Some(&tx), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Gateway(GatewayError::Status { status: 503, .. })));

        let events = drain(&mut rx);
        let errors = events.iter().filter(|e| matches!(e, ReactEvent::Error { .. })).count();
        assert_eq!(errors, 1);
        assert!(!events.contains(&ReactEvent::MessageDone));

        // 已完成的一轮保留在历史中
        assert_eq!(ctx.state().messages().iter().filter(|m| m.role == Role::Tool).count(), 1);
        assert!(ctx.state().keys_consistent());
    }

    #[tokio::test]
    async fn test_streamed_tool_call_reaches_backend() {
        let records = [
            r#"data: {"choices":[{"delta":{"reasoning_content":"Need the weather."}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"s1","type":"function","function":{"name":"weather.get_weather","arguments":"{\"ci"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ty\": \"Beijing\"}"}}]}}]}"#,
            "data: [DONE]",
        ];
        let body = records.join("\n\n") + "\n\n";
        // 故意在记录中间切块
        let chunks: Vec<Result<Bytes, std::convert::Infallible>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembled = assemble_stream(stream::iter(chunks), true, Some(tx)).await.unwrap();
        assert!(assembled.saw_done);
        let reasoning = drain(&mut rx);
        assert_eq!(
            reasoning.first(),
            Some(&ReactEvent::Reasoning {
                text: "Need the weather.".into(),
                new_step: true
            })
        );

        let backend = weather_backend();
        let gw = Arc::new(ScriptedGateway::new(vec![
            Ok(assembled.into_model_response()),
            Ok(ModelResponse::text("sunny")),
        ]));
        let engine = Engine::new(gw.clone(), executor_with(backend.clone(), Duration::from_secs(1)), config(5));
        let mut ctx = context();
        let out = engine
            .run_turn(&mut ctx, "weather in Beijing", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.response, "sunny");

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.get("city"), Some(&json!("Beijing")));

        // 历史中的调用保留原始参数文本
        let second = &gw.requests()[1];
        let assistant = second
            .messages
            .iter()
            .find(|m| m.tool_calls.is_some())
            .and_then(|m| m.tool_calls.clone())
            .unwrap();
        assert_eq!(
            assistant[0].function.arguments,
            Some(json!("{\"city\": \"Beijing\"}"))
        );
    }
}
