use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// qfarm 错误类型定义
#[derive(Debug, Error)]
pub enum QfarmError {
    #[error("等待结果超时")]
    Timeout,

    #[error("远端执行失败: {0}")]
    RemoteFailure(RemoteError),

    #[error("结果包缺少 result/exception 字段")]
    MalformedResult,

    #[error("子进程管道错误: {0}")]
    StreamFailure(String),

    #[error("嵌套提交深度 {depth} 超过上限 {limit}")]
    RecursionLimit { depth: u32, limit: u32 },

    #[error("未注册的函数: {name}")]
    FuncNotFound { name: String },

    #[error("future 已被取消")]
    Cancelled,

    #[error("Broker错误: {0}")]
    Broker(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl QfarmError {
    /// 变体名称, 作为携带到远端的错误种类
    pub fn kind(&self) -> &'static str {
        match self {
            QfarmError::Timeout => "Timeout",
            QfarmError::RemoteFailure(_) => "RemoteFailure",
            QfarmError::MalformedResult => "MalformedResult",
            QfarmError::StreamFailure(_) => "StreamFailure",
            QfarmError::RecursionLimit { .. } => "RecursionLimit",
            QfarmError::FuncNotFound { .. } => "FuncNotFound",
            QfarmError::Cancelled => "Cancelled",
            QfarmError::Broker(_) => "Broker",
            QfarmError::Serialization(_) => "Serialization",
            QfarmError::Configuration(_) => "Configuration",
            QfarmError::Internal(_) => "Internal",
        }
    }
}

impl From<serde_json::Error> for QfarmError {
    fn from(err: serde_json::Error) -> Self {
        QfarmError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for QfarmError {
    fn from(err: config::ConfigError) -> Self {
        QfarmError::Configuration(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, QfarmError>;

/// 跨进程边界携带的错误值。
///
/// 子进程中的任何失败都被捕获为这样一条数据随结果包传回,
/// 在提交侧重建后通过 [`QfarmError::RemoteFailure`] 重新抛出;
/// 不会也不需要还原原始的具体错误类型。
/// 序列化时带 `__type__` 标记, 信封编解码据此识别非原语叶子。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type__", rename = "RemoteError")]
pub struct RemoteError {
    /// 错误种类, 例如 "Internal"、"FuncNotFound"
    pub kind: String,
    /// 人类可读的错误消息
    pub message: String,
    /// 可选的结构化细节
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<QfarmError> for RemoteError {
    fn from(err: QfarmError) -> Self {
        match err {
            // 已经是远端错误的直接透传, 不再嵌套一层
            QfarmError::RemoteFailure(inner) => inner,
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }
}
