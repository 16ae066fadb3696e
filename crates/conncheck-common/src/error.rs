//! 错误处理模块
//!
//! 该模块提供 Conncheck 项目的统一错误处理机制。状态写入的冲突错误
//! 被单独区分出来，供乐观并发重试逻辑识别。

use std::io;
use thiserror::Error;

/// Conncheck 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),

    /// 资源版本冲突（乐观并发写入失败）
    #[error("资源版本冲突: {0}")]
    Conflict(String),

    /// 资源不存在
    #[error("资源不存在: {0}")]
    NotFound(String),

    /// API 调用错误
    #[error("API 错误: {0}")]
    Api(String),

    /// 客户端证书错误
    #[error("证书错误: {0}")]
    Certificate(String),

    /// 序列化/反序列化错误
    #[error("序列化/反序列化错误: {0}")]
    Serialization(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

impl Error {
    /// 是否为可重试的版本冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// 是否值得重试（冲突或暂时性的网络/API 错误）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Network(_) | Error::Api(_))
    }
}

/// Conncheck 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

/// 从字符串创建错误
pub trait IntoError<T> {
    /// 将当前类型转换为错误
    fn into_error(self, kind: fn(String) -> Error) -> Result<T>;
}

impl<T> IntoError<T> for String {
    fn into_error(self, kind: fn(String) -> Error) -> Result<T> {
        Err(kind(self))
    }
}

impl<T> IntoError<T> for &str {
    fn into_error(self, kind: fn(String) -> Error) -> Result<T> {
        Err(kind(self.to_string()))
    }
}
