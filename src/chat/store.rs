//! 持久化接口：会话、明星与消息记录
//!
//! 真实实现在外部（数据库仓储）；InMemoryChatStore 供本地运行与测试，
//! 可通过 set_available(false) 模拟存储不可达。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::chat::models::{
    Conversation, MessageId, Persona, PersonaId, SenderKind, StoredMessage, UserId,
};
use crate::core::{ChatError, Result};
use crate::memory::ConversationId;

/// 聊天记录存储接口
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_conversation(&self, conversation_id: ConversationId) -> Result<Conversation>;

    async fn get_persona(&self, persona_id: PersonaId) -> Result<Persona>;

    /// 保存一条消息，返回消息 ID
    async fn save_message(
        &self,
        conversation_id: ConversationId,
        sender: SenderKind,
        content: &str,
    ) -> Result<MessageId>;

    /// 更新会话的最后活跃时间、最后一条消息与消息计数
    async fn update_conversation_summary(&self, conversation_id: ConversationId, last_text: &str) -> Result<()>;

    /// 最近 n 条消息，按时间正序
    async fn get_recent_messages(&self, conversation_id: ConversationId, n: usize) -> Result<Vec<StoredMessage>>;
}

#[derive(Default)]
struct Tables {
    conversations: HashMap<ConversationId, Conversation>,
    personas: HashMap<PersonaId, Persona>,
    messages: Vec<StoredMessage>,
}

/// 进程内聊天记录存储
pub struct InMemoryChatStore {
    tables: RwLock<Tables>,
    next_conversation_id: AtomicU64,
    next_message_id: AtomicU64,
    available: AtomicBool,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_conversation_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    pub async fn insert_persona(&self, persona: Persona) {
        self.tables.write().await.personas.insert(persona.id, persona);
    }

    /// 创建用户与明星之间的会话，返回会话 ID
    pub async fn create_conversation(&self, user_id: UserId, persona_id: PersonaId) -> ConversationId {
        let id = self.next_conversation_id.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.write().await;
        let title = match tables.personas.get(&persona_id) {
            Some(p) => format!("与{}的聊天", p.name),
            None => "新的聊天".to_string(),
        };
        let now = Utc::now();
        tables.conversations.insert(
            id,
            Conversation {
                id,
                user_id,
                persona_id,
                title,
                message_count: 0,
                last_message: String::new(),
                last_active: now,
                created_at: now,
            },
        );
        id
    }

    /// 会话的全部消息（时间正序）
    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<StoredMessage> {
        self.tables
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// 模拟存储可达/不可达
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatError::Unavailable("chat store unreachable".into()))
        }
    }
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_conversation(&self, conversation_id: ConversationId) -> Result<Conversation> {
        self.check_available()?;
        self.tables
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))
    }

    async fn get_persona(&self, persona_id: PersonaId) -> Result<Persona> {
        self.check_available()?;
        self.tables
            .read()
            .await
            .personas
            .get(&persona_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("persona {}", persona_id)))
    }

    async fn save_message(
        &self,
        conversation_id: ConversationId,
        sender: SenderKind,
        content: &str,
    ) -> Result<MessageId> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&conversation_id) {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        tables.messages.push(StoredMessage {
            id,
            conversation_id,
            sender,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn update_conversation_summary(&self, conversation_id: ConversationId, last_text: &str) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let conversation = tables
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        conversation.last_message = last_text.to_string();
        conversation.last_active = Utc::now();
        conversation.message_count += 1;
        Ok(())
    }

    async fn get_recent_messages(&self, conversation_id: ConversationId, n: usize) -> Result<Vec<StoredMessage>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let all: Vec<&StoredMessage> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .collect();
        let start = all.len().saturating_sub(n);
        Ok(all[start..].iter().map(|m| (*m).clone()).collect())
    }
}
