//! 流式回复协调器
//!
//! 每次流式调用对应一个 StreamSession：单个生产者任务拉取 LLM Token 流，
//! 按原顺序转发到数据通道并累积全文；生成结束后在会话锁内执行一次持久化
//! （保存消息 -> 更新会话摘要 -> 写短期记忆 -> 写长期记忆）。
//!
//! 状态机：Running -> Completed | Failed | Cancelled。
//! - 生成端失败（建立流失败、流中断、Token 超时、空回复）被吸收：发送兜底回复并照常持久化。
//! - 持久化失败：错误写入错误通道，终止剩余步骤，状态 Failed。
//! - 调用方取消或断开（数据通道被丢弃）：停止拉取 Token，跳过持久化，状态 Cancelled。
//!
//! 无论哪条路径，StreamSession::finish 都会发布终态并关闭两个通道。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::chat::models::{MessageId, PersonaId, SenderKind};
use crate::chat::store::ChatStore;
use crate::config::AppConfig;
use crate::core::{ChatError, Result};
use crate::llm::{LlmClient, LlmError, TokenStream};
use crate::memory::{ConversationId, MemoryManager, Message};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Completed,
    /// 持久化失败
    Failed,
    /// 调用方取消或断开
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

/// 协调器参数
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// 数据通道缓冲（段数）
    pub chunk_buffer: usize,
    pub fallback_reply: String,
    /// 回复写入长期记忆时的权重
    pub long_term_weight: f64,
    /// 两段 Token 之间允许的最长间隔
    pub token_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for StreamOptions {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            chunk_buffer: cfg.chat.chunk_buffer.max(1),
            fallback_reply: cfg.chat.fallback_reply.clone(),
            long_term_weight: cfg.chat.long_term_weight,
            token_timeout: Duration::from_secs(cfg.llm.timeouts.stream),
        }
    }
}

/// 按会话 ID 分配的互斥锁：同一会话的提交（消息 + 摘要 + 记忆）串行执行
///
/// 映射里只保留正在使用的锁：强引用计数为 1（只剩映射自身持有）的条目在下次 acquire 时清除。
#[derive(Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // 持有或等待锁的一方都握有一份克隆，计数 > 1 的条目不会被移除
            locks.retain(|id, lock| *id == conversation_id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(conversation_id).or_default())
        };
        lock.lock_owned().await
    }
}

/// 调用方持有的两条只读序列；会话进入终态后两者都会关闭
pub struct ChatStream {
    /// 回复片段，顺序与生成端一致
    pub data: mpsc::Receiver<String>,
    /// 持久化错误（至多一条）
    pub errors: mpsc::Receiver<ChatError>,
    state: watch::Receiver<SessionState>,
}

/// drain 的结果
#[derive(Debug)]
pub struct StreamSummary {
    pub text: String,
    pub chunks: Vec<String>,
    pub errors: Vec<ChatError>,
    pub state: SessionState,
}

impl ChatStream {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 等待会话进入终态
    pub async fn finished(&mut self) -> SessionState {
        loop {
            let state = *self.state.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }

    /// 读完两条序列并返回汇总（非流式调用方与测试使用）
    pub async fn drain(mut self) -> StreamSummary {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.data.recv().await {
            chunks.push(chunk);
        }
        let mut errors = Vec::new();
        while let Some(err) = self.errors.recv().await {
            errors.push(err);
        }
        let state = self.finished().await;
        StreamSummary {
            text: chunks.concat(),
            chunks,
            errors,
            state,
        }
    }
}

/// 单次流式调用的协调记录，由生产者任务独占
struct StreamSession {
    id: String,
    conversation_id: ConversationId,
    persona_id: PersonaId,
    /// 已成功送达调用方的全文
    accumulated: String,
    chunk_count: usize,
    used_fallback: bool,
    started_at: Instant,
    data_tx: mpsc::Sender<String>,
    err_tx: mpsc::Sender<ChatError>,
    state_tx: watch::Sender<SessionState>,
}

/// 生成阶段的结果
enum Generation {
    Finished,
    Cancelled,
}

impl StreamSession {
    /// 发送一段到数据通道；调用方取消或断开时返回 false
    async fn emit(&mut self, chunk: String, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.data_tx.send(chunk.clone()) => match sent {
                Ok(()) => {
                    self.accumulated.push_str(&chunk);
                    self.chunk_count += 1;
                    true
                }
                Err(_) => {
                    tracing::debug!("Session {}: consumer disconnected", self.id);
                    false
                }
            },
        }
    }

    /// 生成端失败时发送兜底回复
    async fn emit_fallback(&mut self, reason: &LlmError, fallback: &str, cancel: &CancellationToken) -> bool {
        tracing::warn!(
            "Session {}: generation failed ({}), sending fallback reply",
            self.id,
            reason
        );
        self.used_fallback = true;
        self.emit(fallback.to_string(), cancel).await
    }

    /// 发布终态并关闭两个通道
    fn finish(self, state: SessionState) -> SessionState {
        let elapsed = self.started_at.elapsed();
        match state {
            SessionState::Cancelled => tracing::debug!(
                "Session {} cancelled after {} chunks ({:?})",
                self.id,
                self.chunk_count,
                elapsed
            ),
            _ => tracing::info!(
                "Session {} (conversation {}, persona {}) {:?}: {} chunks, {} chars, fallback={}, {:?}",
                self.id,
                self.conversation_id,
                self.persona_id,
                state,
                self.chunk_count,
                self.accumulated.chars().count(),
                self.used_fallback,
                elapsed
            ),
        }
        let _ = self.state_tx.send(state);
        // data_tx / err_tx 随 self 一起释放，接收端随即看到关闭
        state
    }
}

/// 流式回复协调器；可在多个会话间共享（Clone 只复制句柄）
#[derive(Clone)]
pub struct StreamCoordinator {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ChatStore>,
    memory: Arc<dyn MemoryManager>,
    locks: ConversationLocks,
    options: StreamOptions,
}

impl StreamCoordinator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn ChatStore>,
        memory: Arc<dyn MemoryManager>,
        options: StreamOptions,
    ) -> Self {
        Self {
            llm,
            store,
            memory,
            locks: ConversationLocks::new(),
            options,
        }
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// 与协调器共享的会话锁（非流式路径提交时也需串行）
    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    /// 开始一次流式回复，立即返回两条序列；生成与持久化在独立任务中进行
    ///
    /// 会话或明星 ID 为 0 时同步返回 InvalidInput，不会调用生成端。
    pub fn begin(
        &self,
        cancel: CancellationToken,
        conversation_id: ConversationId,
        persona_id: PersonaId,
        messages: Vec<Message>,
        model: Option<String>,
    ) -> Result<ChatStream> {
        if conversation_id == 0 || persona_id == 0 {
            return Err(ChatError::InvalidInput(format!(
                "conversation id and persona id must be non-zero (got {}, {})",
                conversation_id, persona_id
            )));
        }

        let (data_tx, data_rx) = mpsc::channel(self.options.chunk_buffer);
        // 至多一条错误，缓冲 1 保证生产者写入永不阻塞
        let (err_tx, err_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(SessionState::Running);

        let session = StreamSession {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            persona_id,
            accumulated: String::new(),
            chunk_count: 0,
            used_fallback: false,
            started_at: Instant::now(),
            data_tx,
            err_tx,
            state_tx,
        };
        tracing::debug!(
            "Session {} started (conversation {}, {} prompt messages)",
            session.id,
            conversation_id,
            messages.len()
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.run(session, messages, model, cancel).await;
        });

        Ok(ChatStream {
            data: data_rx,
            errors: err_rx,
            state: state_rx,
        })
    }

    async fn run(
        &self,
        mut session: StreamSession,
        messages: Vec<Message>,
        model: Option<String>,
        cancel: CancellationToken,
    ) -> SessionState {
        let state = match self.generate(&mut session, &messages, model.as_deref(), &cancel).await {
            Generation::Cancelled => SessionState::Cancelled,
            Generation::Finished => match self.persist(&session).await {
                Ok(_) => SessionState::Completed,
                Err(e) => {
                    tracing::error!("Session {}: failed to persist reply: {}", session.id, e);
                    // 缓冲为 1 且只写一次，try_send 不会因满而失败；接收端已丢弃时忽略
                    let _ = session.err_tx.try_send(e);
                    SessionState::Failed
                }
            },
        };
        session.finish(state)
    }

    /// 拉取 Token 流并转发；生成端的任何失败都转成兜底回复
    async fn generate(
        &self,
        session: &mut StreamSession,
        messages: &[Message],
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Generation {
        let fallback = self.options.fallback_reply.clone();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Generation::Cancelled,
            _ = session.data_tx.closed() => return Generation::Cancelled,
            opened = self.llm.complete_stream(messages, model) => opened,
        };
        let mut stream: TokenStream = match opened {
            Ok(s) => s,
            Err(e) => {
                return if session.emit_fallback(&e, &fallback, cancel).await {
                    Generation::Finished
                } else {
                    Generation::Cancelled
                };
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Generation::Cancelled,
                _ = session.data_tx.closed() => {
                    tracing::debug!("Session {}: consumer disconnected", session.id);
                    return Generation::Cancelled;
                }
                next = tokio::time::timeout(self.options.token_timeout, stream.next()) => next,
            };
            let failure = match next {
                Ok(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if !session.emit(chunk, cancel).await {
                        return Generation::Cancelled;
                    }
                    continue;
                }
                Ok(None) if session.chunk_count > 0 => return Generation::Finished,
                Ok(None) => LlmError::EmptyResponse,
                Ok(Some(Err(e))) => e,
                Err(_) => LlmError::Stream("timed out waiting for next token".into()),
            };
            return if session.emit_fallback(&failure, &fallback, cancel).await {
                Generation::Finished
            } else {
                Generation::Cancelled
            };
        }
    }

    /// 提交：保存消息 -> 更新会话摘要 -> 短期记忆 -> 长期记忆；任一步失败即中止
    async fn persist(&self, session: &StreamSession) -> Result<MessageId> {
        commit_reply(
            self.store.as_ref(),
            self.memory.as_ref(),
            &self.locks,
            session.conversation_id,
            session.persona_id,
            &session.accumulated,
            self.options.long_term_weight,
        )
        .await
    }
}

/// 在会话锁内提交一条明星回复
pub(crate) async fn commit_reply(
    store: &dyn ChatStore,
    memory: &dyn MemoryManager,
    locks: &ConversationLocks,
    conversation_id: ConversationId,
    persona_id: PersonaId,
    text: &str,
    long_term_weight: f64,
) -> Result<MessageId> {
    let _guard = locks.acquire(conversation_id).await;
    let message_id = store
        .save_message(conversation_id, SenderKind::Persona(persona_id), text)
        .await?;
    store.update_conversation_summary(conversation_id, text).await?;
    memory.add_short_term(conversation_id, text).await?;
    memory
        .add_long_term(conversation_id, text, long_term_weight)
        .await?;
    Ok(message_id)
}
