//! 聊天服务：一次用户发言的完整处理
//!
//! 校验会话归属 -> 保存用户消息 -> 取最近消息与长期记忆 -> 构建提示词 -> 记录短期记忆 ->
//! 流式（交给 StreamCoordinator）或非流式生成 -> 提交明星回复。

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::chat::models::{Conversation, Persona, SendMessageRequest, SenderKind, StoredMessage, UserId};
use crate::chat::prompt::PromptBuilder;
use crate::chat::store::ChatStore;
use crate::chat::stream::{commit_reply, ChatStream, StreamCoordinator, StreamOptions};
use crate::config::AppConfig;
use crate::core::{ChatError, Result};
use crate::llm::LlmClient;
use crate::memory::{MemoryManager, Message};

/// 一次发言准备好的上下文
struct PreparedTurn {
    conversation: Conversation,
    messages: Vec<Message>,
}

/// 聊天服务
pub struct ChatService {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ChatStore>,
    memory: Arc<dyn MemoryManager>,
    prompt: PromptBuilder,
    coordinator: StreamCoordinator,
    prompt_memory_limit: usize,
}

impl ChatService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn ChatStore>,
        memory: Arc<dyn MemoryManager>,
        cfg: &AppConfig,
    ) -> Self {
        let coordinator = StreamCoordinator::new(
            Arc::clone(&llm),
            Arc::clone(&store),
            Arc::clone(&memory),
            StreamOptions::from(cfg),
        );
        Self {
            llm,
            store,
            memory,
            prompt: PromptBuilder::new(cfg.chat.history_limit),
            coordinator,
            prompt_memory_limit: cfg.chat.prompt_memory_limit,
        }
    }

    pub fn coordinator(&self) -> &StreamCoordinator {
        &self.coordinator
    }

    /// 流式发送：返回数据/错误两条序列；准备阶段的错误同步返回
    pub async fn send_message_stream(
        &self,
        cancel: CancellationToken,
        user_id: UserId,
        request: SendMessageRequest,
    ) -> Result<ChatStream> {
        let turn = self.prepare(user_id, &request).await?;
        self.coordinator.begin(
            cancel,
            turn.conversation.id,
            turn.conversation.persona_id,
            turn.messages,
            request.model,
        )
    }

    /// 非流式发送：生成失败同样使用兜底回复；返回保存后的明星回复
    pub async fn send_message(&self, user_id: UserId, request: SendMessageRequest) -> Result<StoredMessage> {
        let turn = self.prepare(user_id, &request).await?;
        let options = self.coordinator.options();

        let reply = match self.llm.complete(&turn.messages, request.model.as_deref()).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    "Conversation {}: generation failed ({}), using fallback reply",
                    turn.conversation.id,
                    e
                );
                options.fallback_reply.clone()
            }
        };

        let id = commit_reply(
            self.store.as_ref(),
            self.memory.as_ref(),
            self.coordinator.locks(),
            turn.conversation.id,
            turn.conversation.persona_id,
            &reply,
            options.long_term_weight,
        )
        .await?;

        Ok(StoredMessage {
            id,
            conversation_id: turn.conversation.id,
            sender: SenderKind::Persona(turn.conversation.persona_id),
            content: reply,
            created_at: Utc::now(),
        })
    }

    async fn prepare(&self, user_id: UserId, request: &SendMessageRequest) -> Result<PreparedTurn> {
        if user_id == 0 || request.conversation_id == 0 {
            return Err(ChatError::InvalidInput("user and conversation ids must be non-zero".into()));
        }
        let content = request.content.trim();
        if content.is_empty() {
            return Err(ChatError::InvalidInput("message content is empty".into()));
        }

        let conversation = self.store.get_conversation(request.conversation_id).await?;
        if conversation.user_id != user_id {
            return Err(ChatError::InvalidInput(format!(
                "conversation {} does not belong to user {}",
                conversation.id, user_id
            )));
        }

        let persona = match self.store.get_persona(conversation.persona_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    "Persona {} lookup failed ({}), using default persona",
                    conversation.persona_id,
                    e
                );
                Persona::fallback()
            }
        };

        // 历史取在保存本条之前，当前输入单独拼在末尾
        let recent = self
            .store
            .get_recent_messages(conversation.id, self.prompt.history_limit())
            .await?;

        {
            let _guard = self.coordinator.locks().acquire(conversation.id).await;
            self.store
                .save_message(conversation.id, SenderKind::User(user_id), content)
                .await?;
            self.store
                .update_conversation_summary(conversation.id, content)
                .await?;
        }

        let memories = self
            .memory
            .get_long_term(conversation.id, self.prompt_memory_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Conversation {}: memory lookup failed: {}", conversation.id, e);
                Vec::new()
            });

        let messages = self.prompt.build_messages(&persona, &recent, content, &memories);

        if let Err(e) = self.memory.add_short_term(conversation.id, content).await {
            tracing::warn!("Conversation {}: failed to record user input: {}", conversation.id, e);
        }

        Ok(PreparedTurn { conversation, messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::store::InMemoryChatStore;
    use crate::chat::stream::SessionState;
    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryManager;

    async fn service() -> (ChatService, Arc<InMemoryChatStore>, Arc<InMemoryManager>, u64) {
        let store = Arc::new(InMemoryChatStore::new());
        store
            .insert_persona(Persona::new(9, "林俊杰").with_style("温柔"))
            .await;
        let conv = store.create_conversation(100, 9).await;
        let memory = Arc::new(InMemoryManager::default());
        let svc = ChatService::new(
            Arc::new(MockLlmClient),
            store.clone(),
            memory.clone(),
            &AppConfig::default(),
        );
        (svc, store, memory, conv)
    }

    #[tokio::test]
    async fn test_send_message_stream_persists_both_sides() {
        let (svc, store, memory, conv) = service().await;
        let stream = svc
            .send_message_stream(CancellationToken::new(), 100, SendMessageRequest::new(conv, "你好"))
            .await
            .unwrap();
        let summary = stream.drain().await;
        assert_eq!(summary.state, SessionState::Completed);
        assert!(summary.text.contains("你好"));

        let saved = store.messages(conv).await;
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].sender, SenderKind::User(100));
        assert_eq!(saved[1].sender, SenderKind::Persona(9));
        assert_eq!(saved[1].content, summary.text);

        assert_eq!(store.get_conversation(conv).await.unwrap().message_count, 2);
        assert_eq!(
            memory.get_short_term(conv, 10).await.unwrap(),
            vec![summary.text.clone(), "你好".to_string()]
        );
    }

    #[tokio::test]
    async fn test_send_message_non_streaming() {
        let (svc, store, memory, conv) = service().await;
        let reply = svc
            .send_message(100, SendMessageRequest::new(conv, "在吗"))
            .await
            .unwrap();
        assert_eq!(reply.sender, SenderKind::Persona(9));
        assert!(reply.content.contains("在吗"));
        assert_eq!(store.messages(conv).await.len(), 2);
        assert_eq!(memory.get_long_term(conv, 0).await.unwrap(), vec![reply.content]);
    }

    #[tokio::test]
    async fn test_prepare_validation() {
        let (svc, _store, _memory, conv) = service().await;
        let err = svc
            .send_message(0, SendMessageRequest::new(conv, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(_)));

        let err = svc
            .send_message(100, SendMessageRequest::new(conv, "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(_)));

        let err = svc
            .send_message(101, SendMessageRequest::new(conv, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(_)));

        let err = svc
            .send_message_stream(CancellationToken::new(), 100, SendMessageRequest::new(777, "hi"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_persona_falls_back_to_default() {
        let store = Arc::new(InMemoryChatStore::new());
        let conv = store.create_conversation(1, 404).await;
        let svc = ChatService::new(
            Arc::new(MockLlmClient),
            store.clone(),
            Arc::new(InMemoryManager::default()),
            &AppConfig::default(),
        );
        let reply = svc.send_message(1, SendMessageRequest::new(conv, "hello")).await.unwrap();
        // 回复仍记在会话的 persona 名下
        assert_eq!(reply.sender, SenderKind::Persona(404));
    }
}
