//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STARCHAT__*` 覆盖（双下划线表示嵌套，如 `STARCHAT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::Result;

/// 默认兜底回复：生成端不可用时仍让明星「开口」
pub const DEFAULT_FALLBACK_REPLY: &str =
    "你好！很高兴能和你聊天。虽然我的AI功能暂时无法使用，但我依然可以陪伴你。有什么想聊的吗？";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub chat: ChatSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、模型与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读环境变量 LLM_API_KEY / OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    /// 流式生成时两段 Token 之间允许的最长间隔（秒）
    #[serde(default = "default_stream_timeout")]
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            stream: default_stream_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_stream_timeout() -> u64 {
    120
}

/// [memory] 段：短期/长期记忆容量与默认查询条数
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_short_term_capacity")]
    pub short_term_capacity: usize,
    #[serde(default = "default_long_term_capacity")]
    pub long_term_capacity: usize,
    #[serde(default = "default_short_term_limit")]
    pub default_short_term_limit: usize,
    #[serde(default = "default_long_term_limit")]
    pub default_long_term_limit: usize,
    #[serde(default = "default_search_limit")]
    pub default_search_limit: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_capacity: default_short_term_capacity(),
            long_term_capacity: default_long_term_capacity(),
            default_short_term_limit: default_short_term_limit(),
            default_long_term_limit: default_long_term_limit(),
            default_search_limit: default_search_limit(),
        }
    }
}

fn default_short_term_capacity() -> usize {
    10
}

fn default_long_term_capacity() -> usize {
    50
}

fn default_short_term_limit() -> usize {
    10
}

fn default_long_term_limit() -> usize {
    20
}

fn default_search_limit() -> usize {
    5
}

/// [chat] 段：上下文条数、流缓冲、兜底回复
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSection {
    /// 拼入提示词的最近消息条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// 拼入提示词的长期记忆条数
    #[serde(default = "default_prompt_memory_limit")]
    pub prompt_memory_limit: usize,
    /// 回复写入长期记忆时的权重
    #[serde(default = "default_long_term_weight")]
    pub long_term_weight: f64,
    /// 数据通道缓冲（段数）
    #[serde(default = "default_chunk_buffer")]
    pub chunk_buffer: usize,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            prompt_memory_limit: default_prompt_memory_limit(),
            long_term_weight: default_long_term_weight(),
            chunk_buffer: default_chunk_buffer(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

fn default_history_limit() -> usize {
    10
}

fn default_prompt_memory_limit() -> usize {
    10
}

fn default_long_term_weight() -> f64 {
    1.0
}

fn default_chunk_buffer() -> usize {
    64
}

fn default_fallback_reply() -> String {
    DEFAULT_FALLBACK_REPLY.to_string()
}

/// 从 config 目录加载配置，环境变量 STARCHAT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 STARCHAT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STARCHAT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig> {
    load_config(None)
}
