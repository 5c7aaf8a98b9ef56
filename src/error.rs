use std::path::PathBuf;

/// 重定向器错误类型
///
/// 探测失败与"全部后端不可用"属于常规结果，不在此列：
/// 前者是 [`crate::health::ProbeOutcome::Unhealthy`]，后者是
/// [`crate::controller::VirtualHostStatus::Failed`] 状态。
#[derive(Debug, thiserror::Error)]
pub enum RedirectorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Hosts file I/O error on {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt managed block for '{id}' in {path}: {reason}")]
    CorruptHostsFile {
        path: PathBuf,
        id: String,
        reason: String,
    },

    #[error("Failed to resolve '{host}': {reason}")]
    Resolution { host: String, reason: String },
}

impl RedirectorError {
    pub fn config(message: impl Into<String>) -> Self {
        RedirectorError::Configuration(message.into())
    }

    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RedirectorError::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// 是否为配置错误（仅影响对应的虚拟主机）
    pub fn is_configuration(&self) -> bool {
        matches!(self, RedirectorError::Configuration(_))
    }

    /// 写入类错误：下个周期重试，内存状态保持不变
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RedirectorError::StoreIo { .. } | RedirectorError::CorruptHostsFile { .. }
        )
    }
}

/// 重定向器结果
pub type RedirectorResult<T> = Result<T, RedirectorError>;
