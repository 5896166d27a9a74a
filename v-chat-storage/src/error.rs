use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("mongodb 错误 / mongodb failure: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("redis 错误 / redis failure: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("序列化错误 / serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("未找到记录 / missing record: {0}")]
    Missing(String),
    #[error("存储不可用 / store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// 是否值得重试（网络/IO 类错误）/ Whether a retry may succeed (network or IO failures)
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Mongo(e) => {
                matches!(
                    e.kind.as_ref(),
                    ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. }
                ) || e.contains_label(RETRYABLE_WRITE_ERROR)
            }
            StorageError::Unavailable(_) => true,
            StorageError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            StorageError::Serialization(_) | StorageError::Missing(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_transient() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(!StorageError::Missing("chat".into()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(StorageError::Mongo(mongodb::error::Error::from(io)).is_transient());
        let parse = StorageError::from(serde_json::from_str::<u32>("x").unwrap_err());
        assert!(!parse.is_transient());
    }
}
