//! StarChat - 明星陪伴聊天核心
//!
//! 模块划分：
//! - **chat**: 会话模型、存储接口、提示词构建、流式回复协调与聊天服务
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 统一错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 按会话隔离的短期 / 长期记忆
//! - **observability**: 日志初始化

pub mod chat;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;

pub use chat::{ChatService, ChatStream, SessionState, StreamCoordinator};
pub use memory::{InMemoryManager, MemoryManager};
