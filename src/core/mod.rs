//! 核心：统一错误类型

pub mod error;

pub use error::{ChatError, Result};
