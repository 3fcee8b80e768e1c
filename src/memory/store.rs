//! 会话记忆存储：每个会话一份短期（最近 N 条）+ 长期（按权重保留前 M 条、内容去重）
//!
//! 并发纪律：外层 RwLock 只保护「会话 -> 槽位」映射，每个会话的槽位各自一把 Mutex，
//! 同一会话上的所有读写（含剪枝与排序）都在该锁内完成；不同会话互不阻塞。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::config::MemorySection;
use crate::core::{ChatError, Result};
use crate::memory::item::{sort_by_weight_desc, ConversationId, MemoryItem};

/// 记忆管理接口
///
/// limit 为 0 时使用各自的默认条数。
#[async_trait]
pub trait MemoryManager: Send + Sync {
    /// 插入到短期记忆头部
    async fn add_short_term(&self, conversation_id: ConversationId, content: &str) -> Result<()>;

    /// 最近的短期记忆，最新在前
    async fn get_short_term(&self, conversation_id: ConversationId, limit: usize) -> Result<Vec<String>>;

    /// 清空短期记忆（幂等，不影响长期记忆）
    async fn clear_short_term(&self, conversation_id: ConversationId) -> Result<()>;

    /// 写入长期记忆；同会话已有相同内容时静默忽略
    async fn add_long_term(&self, conversation_id: ConversationId, content: &str, weight: f64) -> Result<()>;

    /// 长期记忆，按权重降序
    async fn get_long_term(&self, conversation_id: ConversationId, limit: usize) -> Result<Vec<String>>;

    /// 按 ID 更新权重（跨会话查找），找不到返回 NotFound
    async fn update_weight(&self, memory_id: &str, weight: f64) -> Result<()>;

    /// 子串匹配（区分大小写）短期+长期记忆，按权重降序
    async fn search(&self, conversation_id: ConversationId, query: &str, limit: usize) -> Result<Vec<String>>;

    /// 会话全部记忆项：短期（最新在前）后接长期（权重降序）
    async fn snapshot(&self, conversation_id: ConversationId) -> Result<Vec<MemoryItem>>;
}

/// 每个会话短期记忆条数上限
pub const MAX_SHORT_TERM: usize = 10;
/// 每个会话长期记忆条数上限
pub const MAX_LONG_TERM: usize = 50;

/// 容量与默认查询条数；容量只能调小，超过上限的取值在创建存储时被截断
#[derive(Debug, Clone)]
pub struct MemoryLimits {
    pub short_term_capacity: usize,
    pub long_term_capacity: usize,
    pub default_short_term_limit: usize,
    pub default_long_term_limit: usize,
    pub default_search_limit: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self::from(&MemorySection::default())
    }
}

impl From<&MemorySection> for MemoryLimits {
    fn from(section: &MemorySection) -> Self {
        Self {
            short_term_capacity: section.short_term_capacity,
            long_term_capacity: section.long_term_capacity,
            default_short_term_limit: section.default_short_term_limit,
            default_long_term_limit: section.default_long_term_limit,
            default_search_limit: section.default_search_limit,
        }
        .clamped()
    }
}

impl MemoryLimits {
    fn clamped(mut self) -> Self {
        if self.short_term_capacity > MAX_SHORT_TERM || self.long_term_capacity > MAX_LONG_TERM {
            tracing::warn!(
                "Memory capacity {}/{} exceeds {}/{}, clamping",
                self.short_term_capacity,
                self.long_term_capacity,
                MAX_SHORT_TERM,
                MAX_LONG_TERM
            );
        }
        self.short_term_capacity = self.short_term_capacity.min(MAX_SHORT_TERM);
        self.long_term_capacity = self.long_term_capacity.min(MAX_LONG_TERM);
        self
    }
}

/// 单个会话的记忆槽位
#[derive(Debug, Default)]
struct ConversationSlots {
    /// 最新在前
    short_term: VecDeque<MemoryItem>,
    /// 权重降序
    long_term: Vec<MemoryItem>,
}

impl ConversationSlots {
    fn prune_short_term(&mut self, capacity: usize) -> usize {
        let before = self.short_term.len();
        self.short_term.truncate(capacity);
        before - self.short_term.len()
    }

    fn sort_and_limit_long_term(&mut self, capacity: usize) -> usize {
        sort_by_weight_desc(&mut self.long_term);
        let before = self.long_term.len();
        self.long_term.truncate(capacity);
        before - self.long_term.len()
    }

    fn find_mut(&mut self, memory_id: &str) -> Option<&mut MemoryItem> {
        self.short_term
            .iter_mut()
            .chain(self.long_term.iter_mut())
            .find(|m| m.id == memory_id)
    }
}

/// 进程内记忆存储（不落盘）
pub struct InMemoryManager {
    conversations: RwLock<HashMap<ConversationId, Arc<Mutex<ConversationSlots>>>>,
    limits: MemoryLimits,
}

impl InMemoryManager {
    pub fn new(limits: MemoryLimits) -> Self {
        let limits = limits.clamped();
        Self {
            conversations: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub fn from_config(section: &MemorySection) -> Self {
        Self::new(MemoryLimits::from(section))
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }

    /// 已知会话的槽位；未知会话返回 None，不创建
    async fn slots(&self, conversation_id: ConversationId) -> Option<Arc<Mutex<ConversationSlots>>> {
        self.conversations.read().await.get(&conversation_id).cloned()
    }

    async fn slots_or_create(&self, conversation_id: ConversationId) -> Arc<Mutex<ConversationSlots>> {
        if let Some(slots) = self.slots(conversation_id).await {
            return slots;
        }
        let mut conversations = self.conversations.write().await;
        Arc::clone(conversations.entry(conversation_id).or_default())
    }

    fn or_default(limit: usize, default: usize) -> usize {
        if limit == 0 {
            default
        } else {
            limit
        }
    }
}

impl Default for InMemoryManager {
    fn default() -> Self {
        Self::new(MemoryLimits::default())
    }
}

fn validate_conversation(conversation_id: ConversationId) -> Result<()> {
    if conversation_id == 0 {
        return Err(ChatError::InvalidInput("conversation id must be non-zero".into()));
    }
    Ok(())
}

fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() {
        return Err(ChatError::InvalidInput(format!("weight must be finite, got {}", weight)));
    }
    Ok(())
}

#[async_trait]
impl MemoryManager for InMemoryManager {
    async fn add_short_term(&self, conversation_id: ConversationId, content: &str) -> Result<()> {
        validate_conversation(conversation_id)?;
        let slots = self.slots_or_create(conversation_id).await;
        let mut slots = slots.lock().await;
        slots
            .short_term
            .push_front(MemoryItem::short_term(conversation_id, content));
        let evicted = slots.prune_short_term(self.limits.short_term_capacity);
        if evicted > 0 {
            tracing::debug!("Conversation {}: evicted {} short-term memories", conversation_id, evicted);
        }
        Ok(())
    }

    async fn get_short_term(&self, conversation_id: ConversationId, limit: usize) -> Result<Vec<String>> {
        let limit = Self::or_default(limit, self.limits.default_short_term_limit);
        let Some(slots) = self.slots(conversation_id).await else {
            return Ok(Vec::new());
        };
        let slots = slots.lock().await;
        Ok(slots
            .short_term
            .iter()
            .take(limit)
            .map(|m| m.content.clone())
            .collect())
    }

    async fn clear_short_term(&self, conversation_id: ConversationId) -> Result<()> {
        if let Some(slots) = self.slots(conversation_id).await {
            slots.lock().await.short_term.clear();
        }
        Ok(())
    }

    async fn add_long_term(&self, conversation_id: ConversationId, content: &str, weight: f64) -> Result<()> {
        validate_conversation(conversation_id)?;
        validate_weight(weight)?;
        let slots = self.slots_or_create(conversation_id).await;
        let mut slots = slots.lock().await;
        if slots.long_term.iter().any(|m| m.content == content) {
            tracing::debug!("Conversation {}: duplicate long-term memory ignored", conversation_id);
            return Ok(());
        }
        slots
            .long_term
            .push(MemoryItem::long_term(conversation_id, content, weight));
        let evicted = slots.sort_and_limit_long_term(self.limits.long_term_capacity);
        if evicted > 0 {
            tracing::debug!("Conversation {}: evicted {} long-term memories", conversation_id, evicted);
        }
        Ok(())
    }

    async fn get_long_term(&self, conversation_id: ConversationId, limit: usize) -> Result<Vec<String>> {
        let limit = Self::or_default(limit, self.limits.default_long_term_limit);
        let Some(slots) = self.slots(conversation_id).await else {
            return Ok(Vec::new());
        };
        let slots = slots.lock().await;
        Ok(slots
            .long_term
            .iter()
            .take(limit)
            .map(|m| m.content.clone())
            .collect())
    }

    async fn update_weight(&self, memory_id: &str, weight: f64) -> Result<()> {
        validate_weight(weight)?;
        // 先拷出槽位列表再逐个加锁，避免持有映射读锁时等待会话锁
        let all: Vec<Arc<Mutex<ConversationSlots>>> =
            self.conversations.read().await.values().cloned().collect();
        for slots in all {
            let mut slots = slots.lock().await;
            if let Some(item) = slots.find_mut(memory_id) {
                item.weight = weight;
                item.updated_at = Utc::now();
                slots.sort_and_limit_long_term(self.limits.long_term_capacity);
                return Ok(());
            }
        }
        Err(ChatError::NotFound(format!("memory not found: {}", memory_id)))
    }

    async fn search(&self, conversation_id: ConversationId, query: &str, limit: usize) -> Result<Vec<String>> {
        let limit = Self::or_default(limit, self.limits.default_search_limit);
        let Some(slots) = self.slots(conversation_id).await else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<MemoryItem> = {
            let slots = slots.lock().await;
            slots
                .short_term
                .iter()
                .chain(slots.long_term.iter())
                .filter(|m| m.content.contains(query))
                .cloned()
                .collect()
        };
        sort_by_weight_desc(&mut matching);
        Ok(matching.into_iter().take(limit).map(|m| m.content).collect())
    }

    async fn snapshot(&self, conversation_id: ConversationId) -> Result<Vec<MemoryItem>> {
        let Some(slots) = self.slots(conversation_id).await else {
            return Ok(Vec::new());
        };
        let slots = slots.lock().await;
        Ok(slots
            .short_term
            .iter()
            .chain(slots.long_term.iter())
            .cloned()
            .collect())
    }
}
