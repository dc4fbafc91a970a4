//! 上下文窗口管理
//!
//! 持有单个会话的 ConversationState，决定超出预算时保留哪些消息；token 计数委托给 TokenCounter，
//! 摘要委托给 Summarizer。optimize 分三阶段，每阶段后重新计数，回到预算内即停止：
//!
//! 1. 重要性过滤：按 importance_score 保留前 max(min_keep, n × ratio) 条，并上最近 recent_keep 条与全部关键消息；
//! 2. 分段摘要：保留最近 min(6, max(n/3, 4)) 条，较早的非关键消息折叠为一条摘要；
//! 3. 强保留：system ∪ 最近 4 条 ∪ 关键消息，超过上限时收窄到 system + 最近一问一答 + 至多 2 条关键消息，
//!    并以压缩提示替换摘要。
//!
//! 前两个阶段不会丢弃关键消息；关键索引在每次重排后按 is_key 重新推导。
//! 每个阶段里助手调用消息与其结果消息同进同出：前两个阶段与阶段三的常规路径把不完整的组补全，
//! 阶段三收窄时整组丢弃；找不到请求的结果消息总会被丢弃。

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::memory::importance::importance_score;
use crate::memory::summarizer::{summary_guidance, Summarizer};
use crate::memory::{
    ChatMessage, CompressionPolicy, ConversationState, Message, Role, TokenBudget, TokenCounter,
};

/// 阶段三替换摘要的提示文本
pub const COMPRESSION_NOTICE: &str = "Note: the conversation exceeded the context limit, so only the most critical context was kept. Ask the user to restate anything earlier that is needed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStage {
    ImportanceFilter,
    SegmentSummary,
    HardPreservation,
}

/// 一次 optimize 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionReport {
    /// 实际进入的阶段（依次）
    pub stages_run: Vec<CompressionStage>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl CompressionReport {
    pub fn compressed(&self) -> bool {
        !self.stages_run.is_empty()
    }
}

pub struct ContextWindowManager {
    state: ConversationState,
    counter: Arc<dyn TokenCounter>,
    summarizer: Arc<dyn Summarizer>,
    budget: TokenBudget,
    policy: CompressionPolicy,
}

impl ContextWindowManager {
    pub fn new(
        state: ConversationState,
        counter: Arc<dyn TokenCounter>,
        summarizer: Arc<dyn Summarizer>,
        budget: TokenBudget,
    ) -> Self {
        Self {
            state,
            counter,
            summarizer,
            budget,
            policy: CompressionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CompressionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    /// 摘要器累计的 token 使用：(prompt, completion, total)
    pub fn summarizer_usage(&self) -> (u64, u64, u64) {
        self.summarizer.token_usage()
    }

    /// 追加消息，返回其索引
    pub fn append(&mut self, mut message: Message, is_key: bool) -> usize {
        let index = self.state.messages.len();
        message.is_key = message.is_key || is_key;
        if message.is_key {
            self.state.key_indices.insert(index);
        }
        self.state.messages.push(message);
        index
    }

    /// 物化视图：摘要、工具上下文、实时消息（剥离元数据）
    pub fn current_view(&self) -> Vec<ChatMessage> {
        self.state
            .summary
            .iter()
            .chain(self.state.tool_context.iter())
            .chain(self.state.messages.iter())
            .map(Message::to_chat)
            .collect()
    }

    pub fn estimate_tokens(&self) -> usize {
        self.counter.count_total(&self.current_view())
    }

    /// 标记关键消息；索引越界时返回 false
    pub fn mark_key(&mut self, index: usize) -> bool {
        match self.state.messages.get_mut(index) {
            Some(msg) => {
                msg.is_key = true;
                self.state.key_indices.insert(index);
                true
            }
            None => false,
        }
    }

    /// 向前找到最近的 user 消息并标记，紧随其后的 assistant 回复一并标记
    pub fn mark_latest_exchange_key(&mut self) {
        let Some(user_idx) = self
            .state
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
        else {
            return;
        };
        self.mark_key(user_idx);
        if self
            .state
            .messages
            .get(user_idx + 1)
            .is_some_and(|m| m.role == Role::Assistant)
        {
            self.mark_key(user_idx + 1);
        }
    }

    pub fn latest_user_question(&self) -> Option<String> {
        self.state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text().to_string())
    }

    /// 安装「可用工具」上下文消息（至多一条）
    pub fn set_tool_context(&mut self, tools_info: &str) {
        self.state.tool_context = Some(Message::system(format!(
            "The following tools are available to you:\n\n{}\n\nChoose the tools that fit the user's request.",
            tools_info
        )));
    }

    pub fn clear_tool_context(&mut self) {
        self.state.tool_context = None;
    }

    /// 删除内容包含 marker 的 system 消息
    pub fn remove_system_containing(&mut self, marker: &str) -> usize {
        let before = self.state.messages.len();
        let keep: BTreeSet<usize> = self
            .state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !(m.role == Role::System && m.text().contains(marker)))
            .map(|(i, _)| i)
            .collect();
        self.retain_indices(&keep);
        before - self.state.messages.len()
    }

    /// 删除临时引导消息
    pub fn drop_transient(&mut self) -> usize {
        let before = self.state.messages.len();
        let keep: BTreeSet<usize> = self
            .state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.transient)
            .map(|(i, _)| i)
            .collect();
        self.retain_indices(&keep);
        before - self.state.messages.len()
    }

    /// 清空消息、关键索引、摘要与工具上下文；会话 id 不变
    pub fn reset(&mut self) {
        self.state.messages.clear();
        self.state.key_indices.clear();
        self.state.summary = None;
        self.state.tool_context = None;
    }

    /// 压缩入口；预算内为空操作
    pub async fn optimize(&mut self) -> CompressionReport {
        let tokens_before = self.estimate_tokens();
        let mut report = CompressionReport {
            stages_run: Vec::new(),
            tokens_before,
            tokens_after: tokens_before,
        };
        if self.budget.excess(tokens_before) == 0 {
            return report;
        }

        let stages = [
            CompressionStage::ImportanceFilter,
            CompressionStage::SegmentSummary,
            CompressionStage::HardPreservation,
        ];
        let mut tokens = tokens_before;
        for stage in stages {
            if self.budget.excess(tokens) == 0 {
                break;
            }
            let changed = match stage {
                CompressionStage::ImportanceFilter => self.filter_by_importance(),
                CompressionStage::SegmentSummary => self.summarize_segments().await,
                CompressionStage::HardPreservation => self.preserve_critical_context(),
            };
            report.stages_run.push(stage);
            let after = self.estimate_tokens();
            tracing::info!(
                session = %self.state.id(),
                stage = ?stage,
                changed,
                tokens_before = tokens,
                tokens_after = after,
                limit = self.budget.limit(),
                "context compression stage"
            );
            tokens = after;
        }

        if self.budget.excess(tokens) > 0 {
            tracing::warn!(
                session = %self.state.id(),
                tokens,
                limit = self.budget.limit(),
                "context still over budget after all compression stages"
            );
        }
        report.tokens_after = tokens;
        report
    }

    /// 按索引集合重建消息序列，关键索引按 is_key 重新推导
    fn retain_indices(&mut self, keep: &BTreeSet<usize>) {
        let old = std::mem::take(&mut self.state.messages);
        let mut keys = BTreeSet::new();
        for (i, msg) in old.into_iter().enumerate() {
            if keep.contains(&i) {
                if msg.is_key {
                    keys.insert(self.state.messages.len());
                }
                self.state.messages.push(msg);
            }
        }
        self.state.key_indices = keys;
    }

    fn recent_indices(&self, count: usize) -> impl Iterator<Item = usize> {
        let n = self.state.messages.len();
        n.saturating_sub(count)..n
    }

    fn key_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_key)
            .map(|(i, _)| i)
    }

    /// 工具调用分组：助手调用消息的索引，以及紧随其后、id 属于该请求的结果消息索引
    fn tool_groups(&self) -> Vec<(usize, Vec<usize>)> {
        let msgs = &self.state.messages;
        msgs.iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let ids: Vec<&str> = m.tool_calls.as_ref()?.iter().map(|c| c.id.as_str()).collect();
                let results = msgs
                    .iter()
                    .enumerate()
                    .skip(i + 1)
                    .take_while(|(_, r)| r.role == Role::Tool)
                    .filter(|(_, r)| r.tool_call_id.as_deref().is_some_and(|id| ids.contains(&id)))
                    .map(|(j, _)| j)
                    .collect();
                Some((i, results))
            })
            .collect()
    }

    /// 让保留集合不拆开工具调用组：expand 时部分保留的组整组补全，否则整组丢弃
    fn close_tool_pairs(&self, keep: &mut BTreeSet<usize>, expand: bool) {
        let mut paired = BTreeSet::new();
        for (request, results) in self.tool_groups() {
            paired.extend(results.iter().copied());
            // 没有任何结果的调用消息无法单独发送
            if results.is_empty() {
                keep.remove(&request);
                continue;
            }
            let any = keep.contains(&request) || results.iter().any(|j| keep.contains(j));
            let all = keep.contains(&request) && results.iter().all(|j| keep.contains(j));
            if expand && any {
                keep.insert(request);
                keep.extend(results);
            } else if !all {
                keep.remove(&request);
                for j in &results {
                    keep.remove(j);
                }
            }
        }
        keep.retain(|&i| {
            paired.contains(&i)
                || self.state.messages.get(i).is_some_and(|m| m.role != Role::Tool)
        });
    }

    fn filter_by_importance(&mut self) -> bool {
        let n = self.state.messages.len();
        if n <= self.policy.min_keep {
            return false;
        }
        let keep_count = ((n as f64 * self.policy.retention_ratio) as usize).max(self.policy.min_keep);

        let mut scored: Vec<(usize, f64)> = self
            .state
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| (i, importance_score(m, i, n)))
            .collect();
        // 分数相同时新消息优先
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));

        let mut keep: BTreeSet<usize> = scored.iter().take(keep_count).map(|(i, _)| *i).collect();
        keep.extend(self.recent_indices(self.policy.recent_keep));
        keep.extend(self.key_positions());
        self.close_tool_pairs(&mut keep, true);

        if keep.len() == n {
            return false;
        }
        self.retain_indices(&keep);
        true
    }

    async fn summarize_segments(&mut self) -> bool {
        let n = self.state.messages.len();
        if n < self.policy.summarize_threshold {
            return false;
        }
        let recent = (n / 3)
            .max(self.policy.recent_keep)
            .min(self.policy.summary_recent_max);
        let split = n.saturating_sub(recent);
        if split == 0 {
            return false;
        }

        let mut keep: BTreeSet<usize> = self.key_positions().filter(|&i| i < split).collect();
        keep.extend(split..n);
        self.close_tool_pairs(&mut keep, true);

        let mut span: Vec<Message> = Vec::new();
        if let Some(ref previous) = self.state.summary {
            span.push(previous.clone());
        }
        span.extend(
            self.state.messages[..split]
                .iter()
                .enumerate()
                .filter(|(i, _)| !keep.contains(i))
                .map(|(_, m)| m.clone()),
        );
        if span.len() == usize::from(self.state.summary.is_some()) {
            return false;
        }

        let question = self.latest_user_question();
        let guidance = summary_guidance(&span);
        let summary = self
            .summarizer
            .summarize(&span, &guidance, question.as_deref())
            .await;

        self.state.summary = Some(Message::system(format!(
            "Detailed summary of the earlier conversation:\n\n{}\n\nContinue the conversation based on this summary and refer to its key details when needed.",
            summary
        )));
        self.retain_indices(&keep);
        true
    }

    fn preserve_critical_context(&mut self) -> bool {
        let n = self.state.messages.len();
        let system: BTreeSet<usize> = self
            .state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::System)
            .map(|(i, _)| i)
            .collect();

        let mut keep: BTreeSet<usize> = system.clone();
        keep.extend(self.recent_indices(self.policy.recent_keep));
        keep.extend(self.key_positions());
        self.close_tool_pairs(&mut keep, true);

        if keep.len() > self.policy.hard_cap {
            if let Some(user_idx) = self.state.messages.iter().rposition(|m| m.role == Role::User) {
                let mut narrowed = system;
                narrowed.insert(user_idx);
                if self
                    .state
                    .messages
                    .get(user_idx + 1)
                    .is_some_and(|m| m.role == Role::Assistant)
                {
                    narrowed.insert(user_idx + 1);
                }
                narrowed.extend(self.key_positions().take(self.policy.floor_key_messages));
                self.close_tool_pairs(&mut narrowed, false);
                keep = narrowed;
            }
        }

        self.retain_indices(&keep);
        self.state.summary = Some(Message::system(COMPRESSION_NOTICE));
        tracing::warn!(session = %self.state.id(), kept = keep.len(), of = n, "context aggressively compressed");
        true
    }
}
