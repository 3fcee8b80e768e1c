//! StarChat - 明星陪伴聊天（命令行）
//!
//! 入口：加载配置、初始化日志，创建聊天服务后进入 stdin 对话循环。
//! 每行输入作为一次发言，回复逐段打印；生成过程中按 Ctrl+C 取消本轮，空闲时按 Ctrl+C 退出。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use starchat::chat::{ChatService, InMemoryChatStore, Persona, SendMessageRequest, SessionState};
use starchat::config::load_config;
use starchat::llm::create_llm_from_config;
use starchat::memory::InMemoryManager;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const LOCAL_USER_ID: u64 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 第一个参数可指定额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    starchat::observability::init();

    let llm = create_llm_from_config(&cfg);
    let store = Arc::new(InMemoryChatStore::new());
    let persona = Persona::new(1, "小星")
        .with_introduction("元气满满的新人歌手，喜欢和粉丝聊音乐和日常")
        .with_style("语气轻快，偶尔用～和！");
    let persona_name = persona.name.clone();
    store.insert_persona(persona.clone()).await;
    let conversation_id = store.create_conversation(LOCAL_USER_ID, persona.id).await;

    let memory = Arc::new(InMemoryManager::from_config(&cfg.memory));
    let service = ChatService::new(llm, store, memory, &cfg);

    tracing::info!("Chat started (conversation {})", conversation_id);
    println!("和{}聊天吧（Ctrl+C 退出）", persona_name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        let mut stream = match service
            .send_message_stream(
                cancel.clone(),
                LOCAL_USER_ID,
                SendMessageRequest::new(conversation_id, line),
            )
            .await
        {
            Ok(s) => s,
            Err(e) => {
                eprintln!("发送失败：{}", e);
                continue;
            }
        };

        print!("{}：", persona_name);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    break;
                }
                chunk = stream.data.recv() => match chunk {
                    Some(chunk) => {
                        print!("{}", chunk);
                        std::io::stdout().flush()?;
                    }
                    None => break,
                },
            }
        }
        println!();

        while let Some(err) = stream.errors.recv().await {
            eprintln!("保存失败：{}", err);
        }
        if stream.finished().await == SessionState::Cancelled {
            println!("（已取消）");
        }
    }

    tracing::info!("Bye");
    Ok(())
}
