//! 会话、明星与消息记录（外部存储实体在本核心中的最小投影）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::ConversationId;

pub type UserId = u64;
pub type PersonaId = u64;
pub type MessageId = u64;

/// 消息发送方
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SenderKind {
    User(UserId),
    /// 明星（AI 回复）
    Persona(PersonaId),
    System,
}

/// 明星资料
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: PersonaId,
    pub name: String,
    pub english_name: String,
    pub introduction: String,
    /// 语言风格要求
    pub style_features: String,
    pub is_active: bool,
}

impl Persona {
    pub fn new(id: PersonaId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            english_name: String::new(),
            introduction: String::new(),
            style_features: String::new(),
            is_active: true,
        }
    }

    pub fn with_introduction(mut self, introduction: impl Into<String>) -> Self {
        self.introduction = introduction.into();
        self
    }

    pub fn with_style(mut self, style_features: impl Into<String>) -> Self {
        self.style_features = style_features.into();
        self
    }

    /// 明星资料查询失败时使用的默认明星
    pub fn fallback() -> Self {
        Self::new(1, "默认明星").with_introduction("这是一个默认明星")
    }
}

/// 聊天会话
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub persona_id: PersonaId,
    pub title: String,
    pub message_count: u64,
    pub last_message: String,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// 已保存的消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: SenderKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// 发送消息请求
#[derive(Clone, Debug, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    /// 覆盖默认模型
    #[serde(default)]
    pub model: Option<String>,
}

impl SendMessageRequest {
    pub fn new(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            model: None,
        }
    }
}
