//! 错误类型
//!
//! NotFound / InvalidInput 同步返回给调用方；Unavailable 来自生成端时被吸收为兜底回复，
//! 来自持久化端时经错误通道上报；Cancelled 只通过通道关闭体现，不作为数据出现。

use thiserror::Error;

use crate::llm::LlmError;

/// 聊天核心的错误分类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// 生成后端或持久化后端不可达
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl ChatError {
    /// 错误通道上只出现 Unavailable，其余视为调用方问题
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ChatError::Unavailable(_))
    }
}

impl From<LlmError> for ChatError {
    fn from(e: LlmError) -> Self {
        ChatError::Unavailable(e.to_string())
    }
}

impl From<config::ConfigError> for ChatError {
    fn from(e: config::ConfigError) -> Self {
        ChatError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::InvalidInput(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_maps_to_unavailable() {
        let err: ChatError = LlmError::Request("connection refused".into()).into();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_display() {
        assert_eq!(ChatError::NotFound("7_1".into()).to_string(), "Not found: 7_1");
        assert_eq!(ChatError::Cancelled.to_string(), "Cancelled");
    }
}
