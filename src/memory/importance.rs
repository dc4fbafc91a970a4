//! 消息重要性评分（压缩阶段一使用）

use crate::memory::{Message, Role};

const KEY_BONUS: f64 = 100.0;
const RECENCY_WEIGHT: f64 = 10.0;
const LENGTH_CREDIT_CHARS: usize = 500;
const LENGTH_WEIGHT: f64 = 5.0;
const DATA_MARKER_BONUS: f64 = 8.0;
const CODE_BLOCK_BONUS: f64 = 5.0;

/// 工具结果 / 数据类内容的标记词
const DATA_MARKERS: &[&str] = &["tool", "result", "data", "结果", "数据"];

fn role_bonus(role: Role) -> f64 {
    match role {
        Role::System => 15.0,
        Role::User => 10.0,
        Role::Assistant => 5.0,
        Role::Tool => 0.0,
    }
}

/// 计算消息重要性：关键标记、角色、位置（越新越高）、长度、是否含数据标记与代码块
pub fn importance_score(message: &Message, index: usize, total: usize) -> f64 {
    let mut score = 0.0;

    if message.is_key {
        score += KEY_BONUS;
    }
    score += role_bonus(message.role);

    if total > 0 {
        score += index as f64 / total as f64 * RECENCY_WEIGHT;
    }

    let content = message.text();
    if !content.is_empty() {
        let credited = content.chars().count().min(LENGTH_CREDIT_CHARS);
        score += credited as f64 / LENGTH_CREDIT_CHARS as f64 * LENGTH_WEIGHT;

        let lower = content.to_lowercase();
        if DATA_MARKERS.iter().any(|m| lower.contains(m)) {
            score += DATA_MARKER_BONUS;
        }
        if content.contains("```") {
            score += CODE_BLOCK_BONUS;
        }
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_monotone_in_recency() {
        let msg = Message::user("what is the weather");
        let total = 20;
        let mut prev = f64::MIN;
        for i in 0..total {
            let s = importance_score(&msg, i, total);
            assert!(s >= prev);
            prev = s;
        }
    }

    #[test]
    fn key_dominates_non_key() {
        let plain = Message::assistant("plain reply");
        let mut key = plain.clone();
        key.is_key = true;
        // 关键消息位于最旧位置，普通消息位于最新位置
        let key_score = importance_score(&key, 0, 10);
        let plain_score = importance_score(&plain, 9, 10);
        assert!(key_score > plain_score);
    }

    #[test]
    fn role_and_content_bonuses() {
        let system = importance_score(&Message::system("x"), 0, 1);
        let user = importance_score(&Message::user("x"), 0, 1);
        let assistant = importance_score(&Message::assistant("x"), 0, 1);
        assert!(system > user && user > assistant);

        let code = importance_score(&Message::assistant("```rust\nfn main() {}\n```"), 0, 1);
        let data = importance_score(&Message::assistant("the Result is 42"), 0, 1);
        assert!(code > assistant);
        assert!(data - assistant >= DATA_MARKER_BONUS);
    }

    #[test]
    fn length_credit_is_capped() {
        let long = importance_score(&Message::user("a".repeat(500)), 0, 1);
        let longer = importance_score(&Message::user("a".repeat(5000)), 0, 1);
        assert!((long - longer).abs() < f64::EPSILON);
    }
}
