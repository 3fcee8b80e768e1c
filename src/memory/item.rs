//! 记忆项与排序
//!
//! 短期记忆按时间倒序保存、隐式权重 1.0；长期记忆按权重降序保存。
//! 所有按权重的排序都走 sort_by_weight_desc（稳定排序，同权重保持原相对顺序）。

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Result;

/// 会话 ID（对应外部 Chat 表主键）
pub type ConversationId = u64;

/// 短期记忆的默认权重，也是检索排序时短期记忆的隐式权重
pub const SHORT_TERM_WEIGHT: f64 = 1.0;

/// 记忆类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// 短期记忆（当前对话上下文）
    ShortTerm,
    /// 长期记忆（关键信息）
    LongTerm,
}

/// 记忆项
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub conversation_id: ConversationId,
    pub kind: MemoryKind,
    pub content: String,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 上一次分配的纳秒时间戳，保证同一纳秒内生成的 ID 也不重复
static LAST_ID_NANOS: AtomicI64 = AtomicI64::new(0);

fn next_id_nanos(now: DateTime<Utc>) -> i64 {
    let candidate = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut prev = LAST_ID_NANOS.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(prev.saturating_add(1));
        match LAST_ID_NANOS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

impl MemoryItem {
    /// ID 形如 `{conversation_id}_{unix_nanos}`，进程内单调递增
    pub fn new(
        conversation_id: ConversationId,
        kind: MemoryKind,
        content: impl Into<String>,
        weight: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}_{}", conversation_id, next_id_nanos(now)),
            conversation_id,
            kind,
            content: content.into(),
            weight,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn short_term(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(conversation_id, MemoryKind::ShortTerm, content, SHORT_TERM_WEIGHT)
    }

    pub fn long_term(conversation_id: ConversationId, content: impl Into<String>, weight: f64) -> Self {
        Self::new(conversation_id, MemoryKind::LongTerm, content, weight)
    }

    /// 参与排序的权重：短期记忆固定为 1.0
    pub fn ordering_weight(&self) -> f64 {
        match self.kind {
            MemoryKind::ShortTerm => SHORT_TERM_WEIGHT,
            MemoryKind::LongTerm => self.weight,
        }
    }
}

/// 按权重降序稳定排序
pub fn sort_by_weight_desc(items: &mut [MemoryItem]) {
    items.sort_by(|a, b| b.ordering_weight().total_cmp(&a.ordering_weight()));
}

/// 序列化记忆数据（JSON），用于导出与调试
pub fn serialize_memory(items: &[MemoryItem]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

/// 反序列化记忆数据
pub fn deserialize_memory(data: &str) -> Result<Vec<MemoryItem>> {
    Ok(serde_json::from_str(data)?)
}
