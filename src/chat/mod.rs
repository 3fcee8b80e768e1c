//! 聊天层：明星会话模型、存储接口、提示词构建、流式协调与聊天服务

pub mod models;
pub mod prompt;
pub mod service;
pub mod store;
pub mod stream;

pub use models::{
    Conversation, MessageId, Persona, PersonaId, SendMessageRequest, SenderKind, StoredMessage,
    UserId,
};
pub use prompt::PromptBuilder;
pub use service::ChatService;
pub use store::{ChatStore, InMemoryChatStore};
pub use stream::{
    ChatStream, ConversationLocks, SessionState, StreamCoordinator, StreamOptions, StreamSummary,
};
