//! Mock LLM 客户端（用于本地运行与测试，无需 API）
//!
//! 取最后一条 User 消息生成一句固定口吻的回复，流式时按字符切段输出，模拟打字效果。

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, TokenStream};
use crate::memory::{Message, Role};

/// 流式回复时每段字符数
const CHUNK_CHARS: usize = 6;

/// Mock 客户端：复述用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn reply_for(messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.lines().last())
            .unwrap_or("(no input)");
        format!("收到啦～你刚才说「{}」，我们接着聊吧！", last_user)
    }
}

/// 按字符数切段（不会切断多字节字符）
pub(crate) fn split_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], _model: Option<&str>) -> Result<String, LlmError> {
        Ok(Self::reply_for(messages))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        _model: Option<&str>,
    ) -> Result<TokenStream, LlmError> {
        let chunks = split_chunks(&Self::reply_for(messages), CHUNK_CHARS);
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
