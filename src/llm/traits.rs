//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式 Token）。
//! 重试与超时由具体后端自行处理，上层只消费这两个能力。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::memory::Message;

/// 生成端错误（传输层失败）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM stream interrupted: {0}")]
    Stream(String),

    #[error("No response content received")]
    EmptyResponse,
}

/// 流式生成的 Token 流；按后端产生的顺序逐段给出
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
///
/// `model` 为 None 时使用客户端自身配置的模型。
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message], model: Option<&str>) -> Result<String, LlmError>;

    /// 流式完成，返回 Token 流
    async fn complete_stream(
        &self,
        messages: &[Message],
        model: Option<&str>,
    ) -> Result<TokenStream, LlmError>;

    /// 默认模型名（日志用）
    fn model_name(&self) -> &str;
}
