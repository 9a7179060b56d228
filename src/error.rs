//! Error types / 错误类型

use thiserror::Error;

/// Result alias used across the engine / 引擎统一的 Result 类型
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error / 引擎错误
///
/// Not-found is never an error here: lookups return `Option` or an empty
/// collection and retrieval returns a typed [`crate::service::Retrieval`].
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed / 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O failed / 文件读写错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A record referenced by id does not exist / 记录不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint hit (image path, or image hash within a group) / 唯一约束冲突
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
