//! 记忆层：对话消息、会话记忆项与按会话隔离的记忆存储

pub mod conversation;
pub mod item;
pub mod store;

pub use conversation::{Message, Role};
pub use item::{
    deserialize_memory, serialize_memory, sort_by_weight_desc, ConversationId, MemoryItem,
    MemoryKind, SHORT_TERM_WEIGHT,
};
pub use store::{InMemoryManager, MemoryLimits, MemoryManager, MAX_LONG_TERM, MAX_SHORT_TERM};
