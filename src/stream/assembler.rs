//! 流式响应组装器
//!
//! 输入是任意切分的字节块（一条记录可能跨多个块，一个块也可能含多条记录），按行解析：
//! - 空行、非 `data:` 行忽略；`data: [DONE]` 结束组装；
//! - 其余为 JSON delta：content 按到达顺序拼接；tool_calls 按 index 归并，name / arguments 追加，
//!   id / type 只取第一次出现的值；reasoning_content 单独累积，阶段内首个非空片段标记 new_step。
//!
//! 解析失败的记录只记日志并跳过。可选的事件发送端用于实时转发 content / reasoning 片段，
//! 转发失败不影响累积结果。

use std::collections::BTreeMap;

use futures_util::{pin_mut, Stream, StreamExt};
use serde_json::Value;

use crate::llm::{ModelResponse, ResponseChoice, ResponseMessage, FINISH_STOP, FINISH_TOOL_CALLS};
use crate::memory::{FunctionCall, ToolCallRequest};
use crate::react::events::{send_event, EventSender, ReactEvent};
use crate::stream::delta::{Delta, StreamChunk, DATA_PREFIX, DONE_MARKER};

/// 单个推理片段
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningFragment {
    pub text: String,
    /// 是否为当前推理阶段的首个片段
    pub new_step: bool,
}

/// 组装完成的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledToolCall {
    pub index: u64,
    pub id: String,
    pub kind: String,
    pub name: String,
    /// 各分片 arguments 的原样拼接
    pub arguments_raw: String,
    /// 解析后的参数；解析失败时为原始字符串
    pub arguments: Value,
}

/// 组装结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledResponse {
    pub content: String,
    pub reasoning: String,
    pub reasoning_fragments: Vec<ReasoningFragment>,
    pub tool_calls: Vec<AssembledToolCall>,
    /// 是否收到结束标记
    pub saw_done: bool,
    /// 被跳过的畸形记录数
    pub skipped_records: usize,
}

impl AssembledResponse {
    /// 转为与非流式响应同形的结构；有工具调用时 finish_reason 为 tool_calls，否则为 stop。
    /// 工具调用的 arguments 保留原始字符串，以便原样回传给模型。
    pub fn into_model_response(self) -> ModelResponse {
        let finish = if self.tool_calls.is_empty() {
            FINISH_STOP
        } else {
            FINISH_TOOL_CALLS
        };
        let tool_calls = if self.tool_calls.is_empty() {
            None
        } else {
            Some(
                self.tool_calls
                    .into_iter()
                    .map(|c| ToolCallRequest {
                        id: c.id,
                        kind: c.kind,
                        function: FunctionCall {
                            name: c.name,
                            arguments: Some(Value::String(c.arguments_raw)),
                        },
                    })
                    .collect(),
            )
        };
        ModelResponse {
            choices: vec![ResponseChoice {
                message: ResponseMessage {
                    content: (!self.content.is_empty()).then_some(self.content),
                    reasoning_content: (!self.reasoning.is_empty()).then_some(self.reasoning),
                    tool_calls,
                },
                finish_reason: Some(finish.to_string()),
            }],
        }
    }
}

#[derive(Debug, Default)]
struct ToolCallFragment {
    id: Option<String>,
    kind: Option<String>,
    name: String,
    arguments: String,
}

/// 增量组装器：feed 字节块，finish 得到结果
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buffer: Vec<u8>,
    /// buffer 中已确认不含换行的前缀长度
    scanned: usize,
    content: String,
    reasoning: String,
    reasoning_fragments: Vec<ReasoningFragment>,
    tool_calls: BTreeMap<u64, ToolCallFragment>,
    in_phase: bool,
    phase_step_marked: bool,
    finished: bool,
    skipped: usize,
    sink: Option<EventSender>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 实时转发 content / reasoning 片段
    pub fn with_sink(mut self, sink: EventSender) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 由调用方声明新推理阶段的开始
    pub fn begin_phase(&mut self) {
        self.in_phase = true;
        self.phase_step_marked = false;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 输入一个字节块；只处理已完整的行，残余部分留在缓冲区
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.finished {
            return;
        }
        self.buffer.extend_from_slice(chunk);
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            let line = self.buffer[start..end].to_vec();
            start = end + 1;
            self.scanned = start;
            self.process_line(&line);
            if self.finished {
                self.buffer.clear();
                self.scanned = 0;
                return;
            }
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
    }

    /// 结束组装：处理末尾无换行的残余行，解析各工具调用参数
    pub fn finish(mut self) -> AssembledResponse {
        if !self.finished && !self.buffer.is_empty() {
            self.scanned = 0;
            let rest = std::mem::take(&mut self.buffer);
            self.process_line(&rest);
        }

        let mut tool_calls = Vec::with_capacity(self.tool_calls.len());
        for (index, frag) in std::mem::take(&mut self.tool_calls) {
            if frag.id.is_none() && frag.name.is_empty() {
                tracing::warn!(index, "discarding incomplete tool call fragment");
                continue;
            }
            if frag.id.is_none() || frag.name.is_empty() {
                tracing::warn!(index, id = ?frag.id, name = %frag.name, "tool call fragment is missing an id or a name");
            }
            let arguments = match serde_json::from_str::<Value>(&frag.arguments) {
                Ok(v) => v,
                Err(e) => {
                    if !frag.arguments.trim().is_empty() {
                        tracing::warn!(index, error = %e, "tool call arguments are not valid JSON, keeping raw text");
                    }
                    Value::String(frag.arguments.clone())
                }
            };
            tool_calls.push(AssembledToolCall {
                index,
                id: frag.id.unwrap_or_default(),
                kind: frag.kind.unwrap_or_else(|| "function".to_string()),
                name: frag.name,
                arguments_raw: frag.arguments,
                arguments,
            });
        }

        AssembledResponse {
            content: self.content,
            reasoning: self.reasoning,
            reasoning_fragments: self.reasoning_fragments,
            tool_calls,
            saw_done: self.finished,
            skipped_records: self.skipped,
        }
    }

    fn process_line(&mut self, raw: &[u8]) {
        let line = match std::str::from_utf8(raw) {
            Ok(l) => l.trim(),
            Err(e) => {
                tracing::warn!(error = %e, "stream line is not valid UTF-8");
                self.skipped += 1;
                return;
            }
        };
        if line.is_empty() {
            return;
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();
        if payload == DONE_MARKER {
            self.finished = true;
            return;
        }
        match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => {
                if let Some(delta) = chunk.into_delta() {
                    self.apply(delta);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, data = %payload, "invalid JSON in stream line");
                self.skipped += 1;
            }
        }
    }

    fn apply(&mut self, delta: Delta) {
        if let Some(reasoning) = delta.reasoning_content {
            self.reasoning.push_str(&reasoning);
            if !reasoning.trim().is_empty() {
                let new_step = self.in_phase && !self.phase_step_marked;
                if new_step {
                    self.phase_step_marked = true;
                }
                send_event(
                    self.sink.as_ref(),
                    ReactEvent::Reasoning {
                        text: reasoning.clone(),
                        new_step,
                    },
                );
                self.reasoning_fragments.push(ReasoningFragment {
                    text: reasoning,
                    new_step,
                });
            }
        }

        if let Some(content) = delta.content {
            if !content.is_empty() {
                send_event(self.sink.as_ref(), ReactEvent::Content { text: content.clone() });
            }
            self.content.push_str(&content);
        }

        for tc in delta.tool_calls.unwrap_or_default() {
            let Some(index) = tc.index else {
                tracing::warn!("tool call delta missing index");
                continue;
            };
            let frag = self.tool_calls.entry(index).or_default();
            if frag.id.is_none() {
                frag.id = tc.id.filter(|id| !id.is_empty());
            }
            if frag.kind.is_none() {
                frag.kind = tc.kind.filter(|k| !k.is_empty());
            }
            if let Some(func) = tc.function {
                if let Some(name) = func.name {
                    frag.name.push_str(&name);
                }
                if let Some(args) = func.arguments {
                    frag.arguments.push_str(&args);
                }
            }
        }
    }
}

/// 消费整个字节流并组装；传输错误原样返回，畸形记录不会中断组装
pub async fn assemble_stream<S, B, E>(
    stream: S,
    new_phase: bool,
    sink: Option<EventSender>,
) -> Result<AssembledResponse, E>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let mut assembler = StreamAssembler::new();
    if let Some(tx) = sink {
        assembler = assembler.with_sink(tx);
    }
    if new_phase {
        assembler.begin_phase();
    }

    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        assembler.feed(chunk?.as_ref());
        if assembler.is_finished() {
            break;
        }
    }
    Ok(assembler.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio::sync::mpsc;

    fn record(delta: serde_json::Value) -> String {
        format!("data: {}\n\n", serde_json::json!({"choices": [{"delta": delta}]}))
    }

    fn sample_stream() -> String {
        let mut s = String::new();
        s.push_str(": keep-alive\n");
        s.push_str(&record(serde_json::json!({"reasoning_content": "先查天气"})));
        s.push_str(&record(serde_json::json!({"content": "你好, "})));
        s.push_str(&record(serde_json::json!({"tool_calls": [
            {"index": 0, "id": "call_a", "type": "function", "function": {"name": "weather.", "arguments": "{\"ci"}},
            {"index": 1, "id": "call_b", "function": {"name": "weather.get_weather", "arguments": ""}}
        ]})));
        s.push_str(&record(serde_json::json!({"tool_calls": [
            {"index": 0, "function": {"name": "get_weather", "arguments": "ty\": \"Beijing\"}"}},
            {"index": 1, "function": {"arguments": "{\"city\": \"Shanghai\"}"}}
        ]})));
        s.push_str(&record(serde_json::json!({"content": "world"})));
        s.push_str("data: [DONE]\n");
        s
    }

    fn assemble_chunks(chunks: &[&[u8]]) -> AssembledResponse {
        let mut asm = StreamAssembler::new();
        asm.begin_phase();
        for c in chunks {
            asm.feed(c);
        }
        asm.finish()
    }

    #[test]
    fn assembles_content_and_tool_calls() {
        let data = sample_stream();
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.content, "你好, world");
        assert!(out.saw_done);
        assert_eq!(out.tool_calls.len(), 2);
        assert_eq!(out.tool_calls[0].id, "call_a");
        assert_eq!(out.tool_calls[0].name, "weather.get_weather");
        assert_eq!(out.tool_calls[0].arguments, serde_json::json!({"city": "Beijing"}));
        assert_eq!(out.tool_calls[1].kind, "function");
        assert_eq!(out.tool_calls[1].arguments, serde_json::json!({"city": "Shanghai"}));
    }

    #[test]
    fn chunk_boundaries_do_not_change_result() {
        let data = sample_stream();
        let bytes = data.as_bytes();
        let whole = assemble_chunks(&[bytes]);
        for size in 1..bytes.len() {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            let split = assemble_chunks(&chunks);
            assert_eq!(split, whole, "chunk size {size}");
        }
    }

    #[test]
    fn arguments_are_concatenated_in_arrival_order() {
        let pieces = ["{\"a\"", ": [1, ", "2, 3]", ", \"b\": \"x\"", "}"];
        let mut data = record(serde_json::json!({"tool_calls": [
            {"index": 0, "id": "c1", "function": {"name": "svc.tool"}}
        ]}));
        for p in pieces {
            data.push_str(&record(serde_json::json!({"tool_calls": [
                {"index": 0, "function": {"arguments": p}}
            ]})));
        }
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.tool_calls[0].arguments_raw, pieces.concat());
        assert_eq!(
            out.tool_calls[0].arguments,
            serde_json::json!({"a": [1, 2, 3], "b": "x"})
        );
    }

    #[test]
    fn id_and_type_are_set_once() {
        let mut data = record(serde_json::json!({"tool_calls": [
            {"index": 0, "id": "first", "type": "function", "function": {"name": "a.b"}}
        ]}));
        data.push_str(&record(serde_json::json!({"tool_calls": [
            {"index": 0, "id": "second", "type": "other"}
        ]})));
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.tool_calls[0].id, "first");
        assert_eq!(out.tool_calls[0].kind, "function");
    }

    #[test]
    fn long_record_fed_in_small_chunks() {
        let text = "x".repeat(64 * 1024);
        let mut data = record(serde_json::json!({"content": text}));
        data.push_str(&record(serde_json::json!({"content": "!"})));
        let mut asm = StreamAssembler::new();
        for b in data.as_bytes().chunks(3) {
            asm.feed(b);
            // 未完成的行只保留在缓冲区里，已扫描部分不会被重复查找
            assert_eq!(asm.scanned, asm.buffer.len());
        }
        let out = asm.finish();
        assert_eq!(out.content.len(), 64 * 1024 + 1);
        assert!(out.content.ends_with("x!"));
    }

    #[test]
    fn malformed_records_are_skipped() {
        let mut data = record(serde_json::json!({"content": "a"}));
        data.push_str("data: {not json\n");
        data.push_str("data: {\"choices\": [{\"delta\": {\"content\": 5}}]}\n");
        data.push_str(&record(serde_json::json!({"content": "b"})));
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.content, "ab");
        assert_eq!(out.skipped_records, 2);
    }

    #[test]
    fn records_after_done_are_ignored() {
        let mut data = record(serde_json::json!({"content": "a"}));
        data.push_str("data: [DONE]\n");
        data.push_str(&record(serde_json::json!({"content": "b"})));
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.content, "a");
    }

    #[test]
    fn trailing_line_without_newline_is_processed() {
        let data = format!("data: {}", serde_json::json!({"choices": [{"delta": {"content": "tail"}}]}));
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.content, "tail");
        assert!(!out.saw_done);
    }

    #[test]
    fn unparsable_arguments_keep_raw_text() {
        let data = record(serde_json::json!({"tool_calls": [
            {"index": 0, "id": "c1", "function": {"name": "a.b", "arguments": "{city: Beijing"}}
        ]}));
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.tool_calls[0].arguments, Value::String("{city: Beijing".into()));
    }

    #[test]
    fn fragments_without_id_and_name_are_discarded() {
        let mut data = record(serde_json::json!({"tool_calls": [
            {"index": 0, "function": {"arguments": "{}"}},
            {"index": 1, "function": {"name": "a.b", "arguments": "{}"}}
        ]}));
        data.push_str(&record(serde_json::json!({"tool_calls": [
            {"function": {"name": "no.index"}}
        ]})));
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].index, 1);
        assert_eq!(out.tool_calls[0].id, "");
    }

    #[test]
    fn first_reasoning_fragment_of_phase_is_marked() {
        let mut data = record(serde_json::json!({"reasoning_content": "  "}));
        data.push_str(&record(serde_json::json!({"reasoning_content": "step one"})));
        data.push_str(&record(serde_json::json!({"reasoning_content": " continues"})));
        let out = assemble_chunks(&[data.as_bytes()]);
        assert_eq!(out.reasoning, "  step one continues");
        assert_eq!(
            out.reasoning_fragments,
            vec![
                ReasoningFragment { text: "step one".into(), new_step: true },
                ReasoningFragment { text: " continues".into(), new_step: false },
            ]
        );

        // 未声明阶段时不标记
        let mut asm = StreamAssembler::new();
        asm.feed(data.as_bytes());
        assert!(asm.finish().reasoning_fragments.iter().all(|f| !f.new_step));
    }

    #[test]
    fn forwarding_is_lossless_even_when_receiver_is_gone() {
        let data = sample_stream();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut asm = StreamAssembler::new().with_sink(tx);
        asm.begin_phase();
        asm.feed(data.as_bytes());
        let out = asm.finish();
        assert_eq!(out.content, "你好, world");

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(
            events,
            vec![
                ReactEvent::Reasoning { text: "先查天气".into(), new_step: true },
                ReactEvent::Content { text: "你好, ".into() },
                ReactEvent::Content { text: "world".into() },
            ]
        );

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut asm = StreamAssembler::new().with_sink(tx);
        asm.feed(data.as_bytes());
        assert_eq!(asm.finish().content, "你好, world");
    }

    #[test]
    fn model_response_shape() {
        let data = sample_stream();
        let resp = assemble_chunks(&[data.as_bytes()]).into_model_response();
        let choice = &resp.choices[0];
        assert_eq!(choice.finish_reason(), FINISH_TOOL_CALLS);
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(
            calls[0].function.arguments,
            Some(Value::String("{\"city\": \"Beijing\"}".into()))
        );

        let text_only = assemble_chunks(&[record(serde_json::json!({"content": "hi"})).as_bytes()])
            .into_model_response();
        assert_eq!(text_only.choices[0].finish_reason(), FINISH_STOP);
        assert!(text_only.choices[0].message.tool_calls.is_none());
    }

    #[tokio::test]
    async fn assemble_stream_consumes_chunks() {
        let data = sample_stream();
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            data.as_bytes().chunks(7).map(|c| Ok(c.to_vec())).collect();
        let out = assemble_stream(stream::iter(chunks), true, None).await.unwrap();
        assert_eq!(out.content, "你好, world");
        assert_eq!(out.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn assemble_stream_propagates_transport_errors() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(record(serde_json::json!({"content": "a"})).into_bytes()),
            Err("connection reset".to_string()),
        ];
        let err = assemble_stream(stream::iter(chunks), false, None).await.unwrap_err();
        assert_eq!(err, "connection reset");
    }
}
