//! 流式回复与会话记忆集成测试（只经公开 API）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use starchat::chat::{
    ChatService, ChatStore, InMemoryChatStore, Persona, SendMessageRequest, SenderKind,
    SessionState, StreamCoordinator, StreamOptions,
};
use starchat::config::AppConfig;
use starchat::core::ChatError;
use starchat::llm::{LlmClient, LlmError, MockLlmClient, TokenStream};
use starchat::memory::{InMemoryManager, MemoryManager, Message};
use tokio_util::sync::CancellationToken;

/// 固定片段或直接失败的 LLM；hang 为 true 时给出片段后挂起
struct FixedLlm {
    chunks: Vec<&'static str>,
    fail: bool,
    hang: bool,
}

impl FixedLlm {
    fn chunks(chunks: Vec<&'static str>) -> Self {
        Self { chunks, fail: false, hang: false }
    }

    fn failing() -> Self {
        Self { chunks: Vec::new(), fail: true, hang: false }
    }

    fn hanging(chunks: Vec<&'static str>) -> Self {
        Self { chunks, fail: false, hang: true }
    }
}

#[async_trait]
impl LlmClient for FixedLlm {
    async fn complete(&self, _messages: &[Message], _model: Option<&str>) -> Result<String, LlmError> {
        if self.fail {
            return Err(LlmError::Request("upstream down".into()));
        }
        Ok(self.chunks.concat())
    }

    async fn complete_stream(&self, _messages: &[Message], _model: Option<&str>) -> Result<TokenStream, LlmError> {
        if self.fail {
            return Err(LlmError::Request("upstream down".into()));
        }
        let items: Vec<Result<String, LlmError>> = self.chunks.iter().map(|c| Ok(c.to_string())).collect();
        if self.hang {
            Ok(Box::pin(stream::iter(items).chain(stream::pending())))
        } else {
            Ok(Box::pin(stream::iter(items)))
        }
    }

    fn model_name(&self) -> &str {
        "fixed"
    }
}

const FALLBACK: &str = "稍等一下，我马上回来～";

async fn coordinator(llm: FixedLlm) -> (StreamCoordinator, Arc<InMemoryChatStore>, Arc<InMemoryManager>, u64) {
    let store = Arc::new(InMemoryChatStore::new());
    store.insert_persona(Persona::new(7, "邓紫棋")).await;
    let conv = store.create_conversation(42, 7).await;
    let memory = Arc::new(InMemoryManager::default());
    let options = StreamOptions {
        fallback_reply: FALLBACK.to_string(),
        ..StreamOptions::default()
    };
    let coord = StreamCoordinator::new(Arc::new(llm), store.clone(), memory.clone(), options);
    (coord, store, memory, conv)
}

#[tokio::test]
async fn test_stream_hi_there() {
    let (coord, store, memory, conv) = coordinator(FixedLlm::chunks(vec!["Hi", " there", "!"])).await;
    let summary = coord
        .begin(CancellationToken::new(), conv, 7, vec![Message::user("hello")], None)
        .unwrap()
        .drain()
        .await;

    assert_eq!(summary.chunks, vec!["Hi", " there", "!"]);
    assert!(summary.errors.is_empty());
    assert_eq!(summary.state, SessionState::Completed);

    let saved = store.messages(conv).await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].content, "Hi there!");
    assert_eq!(saved[0].sender, SenderKind::Persona(7));

    let conversation = store.get_conversation(conv).await.unwrap();
    assert_eq!(conversation.last_message, "Hi there!");
    assert_eq!(conversation.message_count, 1);

    assert_eq!(memory.get_short_term(conv, 0).await.unwrap(), vec!["Hi there!"]);
    assert_eq!(memory.get_long_term(conv, 0).await.unwrap(), vec!["Hi there!"]);
}

#[tokio::test]
async fn test_generation_failure_yields_single_fallback() {
    let (coord, store, memory, conv) = coordinator(FixedLlm::failing()).await;
    let summary = coord
        .begin(CancellationToken::new(), conv, 7, vec![Message::user("hello")], None)
        .unwrap()
        .drain()
        .await;

    assert_eq!(summary.chunks, vec![FALLBACK]);
    assert!(summary.errors.is_empty());
    assert_eq!(store.messages(conv).await[0].content, FALLBACK);
    assert_eq!(memory.get_long_term(conv, 0).await.unwrap(), vec![FALLBACK]);
}

#[tokio::test]
async fn test_cancel_persists_nothing() {
    let (coord, store, memory, conv) = coordinator(FixedLlm::hanging(vec!["一", "二"])).await;
    let cancel = CancellationToken::new();
    let mut chat_stream = coord
        .begin(cancel.clone(), conv, 7, vec![Message::user("hello")], None)
        .unwrap();

    assert_eq!(chat_stream.data.recv().await.as_deref(), Some("一"));
    cancel.cancel();

    let state = tokio::time::timeout(Duration::from_secs(1), async move {
        while chat_stream.data.recv().await.is_some() {}
        assert!(chat_stream.errors.recv().await.is_none());
        chat_stream.finished().await
    })
    .await
    .unwrap();
    assert_eq!(state, SessionState::Cancelled);

    assert!(store.messages(conv).await.is_empty());
    assert_eq!(store.get_conversation(conv).await.unwrap().message_count, 0);
    assert!(memory.get_short_term(conv, 0).await.unwrap().is_empty());
    assert!(memory.get_long_term(conv, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_persistence_failure_surfaces_once() {
    let (coord, store, _memory, conv) = coordinator(FixedLlm::chunks(vec!["ok"])).await;
    store.set_available(false);
    let summary = coord
        .begin(CancellationToken::new(), conv, 7, vec![Message::user("hello")], None)
        .unwrap()
        .drain()
        .await;

    assert_eq!(summary.chunks, vec!["ok"]);
    assert_eq!(summary.state, SessionState::Failed);
    assert_eq!(summary.errors.len(), 1);
    assert!(matches!(summary.errors[0], ChatError::Unavailable(_)));
}

#[tokio::test]
async fn test_concurrent_sessions_on_one_conversation() {
    let (coord, store, memory, conv) = coordinator(FixedLlm::chunks(vec!["a", "b"])).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coord = coord.clone();
        handles.push(tokio::spawn(async move {
            coord
                .begin(CancellationToken::new(), conv, 7, vec![Message::user("hello")], None)
                .unwrap()
                .drain()
                .await
        }));
    }
    for handle in handles {
        let summary = handle.await.unwrap();
        assert_eq!(summary.text, "ab");
        assert_eq!(summary.state, SessionState::Completed);
    }

    assert_eq!(store.messages(conv).await.len(), 8);
    assert_eq!(store.get_conversation(conv).await.unwrap().message_count, 8);
    assert_eq!(memory.get_short_term(conv, 0).await.unwrap().len(), 8);
    // 相同内容在长期记忆中只保留一份
    assert_eq!(memory.get_long_term(conv, 0).await.unwrap(), vec!["ab"]);
}

#[tokio::test]
async fn test_memory_caps_and_ordering() {
    let memory = InMemoryManager::default();

    for i in 0..15 {
        memory.add_short_term(9, &format!("s{}", i)).await.unwrap();
    }
    let short = memory.get_short_term(9, 100).await.unwrap();
    assert_eq!(short.len(), 10);
    assert_eq!(short[0], "s14");
    assert_eq!(short[9], "s5");

    for i in 0..60 {
        memory
            .add_long_term(9, &format!("l{}", i), i as f64)
            .await
            .unwrap();
    }
    let long = memory.get_long_term(9, 100).await.unwrap();
    assert_eq!(long.len(), 50);
    assert_eq!(long[0], "l59");
    assert_eq!(long[49], "l10");

    // 其他会话不受影响
    assert!(memory.get_long_term(10, 0).await.unwrap().is_empty());

    memory.clear_short_term(9).await.unwrap();
    assert!(memory.get_short_term(9, 0).await.unwrap().is_empty());
    assert_eq!(memory.get_long_term(9, 100).await.unwrap().len(), 50);
}

#[tokio::test]
async fn test_update_weight_reorders_and_search() {
    let memory = InMemoryManager::default();
    memory.add_long_term(3, "喜欢猫", 1.0).await.unwrap();
    memory.add_long_term(3, "喜欢狗", 2.0).await.unwrap();
    memory.add_short_term(3, "今天喜欢下雨").await.unwrap();

    let cat_id = memory
        .snapshot(3)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.content == "喜欢猫")
        .map(|m| m.id)
        .unwrap();
    memory.update_weight(&cat_id, 5.0).await.unwrap();
    assert_eq!(memory.get_long_term(3, 0).await.unwrap(), vec!["喜欢猫", "喜欢狗"]);

    let hits = memory.search(3, "喜欢", 10).await.unwrap();
    assert_eq!(hits, vec!["喜欢猫", "喜欢狗", "今天喜欢下雨"]);
    assert!(memory.search(3, "Cat", 10).await.unwrap().is_empty());

    assert!(matches!(
        memory.update_weight("no-such-id", 1.0).await,
        Err(ChatError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_service_round_trip_with_mock() {
    let store = Arc::new(InMemoryChatStore::new());
    store.insert_persona(Persona::new(2, "周深")).await;
    let conv = store.create_conversation(5, 2).await;
    let memory = Arc::new(InMemoryManager::default());
    let service = ChatService::new(Arc::new(MockLlmClient), store.clone(), memory.clone(), &AppConfig::default());

    for text in ["第一句", "第二句"] {
        let summary = service
            .send_message_stream(CancellationToken::new(), 5, SendMessageRequest::new(conv, text))
            .await
            .unwrap()
            .drain()
            .await;
        assert_eq!(summary.state, SessionState::Completed);
        assert!(summary.text.contains(text));
    }

    let saved = store.get_recent_messages(conv, 10).await.unwrap();
    let senders: Vec<SenderKind> = saved.iter().map(|m| m.sender).collect();
    assert_eq!(
        senders,
        vec![
            SenderKind::User(5),
            SenderKind::Persona(2),
            SenderKind::User(5),
            SenderKind::Persona(2)
        ]
    );
    assert_eq!(memory.get_short_term(conv, 0).await.unwrap().len(), 4);
    assert_eq!(memory.get_long_term(conv, 0).await.unwrap().len(), 2);
}
