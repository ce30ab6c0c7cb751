use std::path::PathBuf;
use std::time::Duration;

/// 统一的错误类型
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// 目标仓库检查或创建失败
    #[error("Provisioning error for {repository}: {source}")]
    Provisioning {
        repository: String,
        #[source]
        source: Box<MirrorError>,
    },

    /// 镜像克隆失败
    #[error("Clone error for {repository}: {source}")]
    Clone {
        repository: String,
        #[source]
        source: Box<MirrorError>,
    },

    /// 从源端拉取失败
    #[error("Fetch error for {repository}: {source}")]
    Fetch {
        repository: String,
        #[source]
        source: Box<MirrorError>,
    },

    /// 清理 packed-refs / refs/pull 失败
    #[error("Ref sanitization error at {}: {source}", path.display())]
    RefSanitization {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 推送到目标端失败
    #[error("Push error for {repository}: {source}")]
    Push {
        repository: String,
        #[source]
        source: Box<MirrorError>,
    },

    /// 单仓库同步超时
    #[error("Sync of {repository} timed out after {}s", elapsed.as_secs())]
    Timeout {
        repository: String,
        elapsed: Duration,
    },

    /// 远端拒绝了某个引用的更新
    #[error("Remote rejected {reference}: {message}")]
    PushRejected { reference: String, message: String },

    /// 操作被取消
    #[error("Operation cancelled")]
    Cancelled,

    /// Git 操作错误
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// HTTP 请求错误
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 托管平台 API 返回非成功状态
    #[error("API error: {status} from {url}: {body}")]
    Api {
        status: u16,
        url: String,
        body: String,
    },

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL 解析错误
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),

    /// Anyhow 错误兼容
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MirrorError {
    pub fn provisioning(repository: &str, source: MirrorError) -> Self {
        MirrorError::Provisioning {
            repository: repository.to_string(),
            source: Box::new(source),
        }
    }

    pub fn clone_failed(repository: &str, source: MirrorError) -> Self {
        MirrorError::Clone {
            repository: repository.to_string(),
            source: Box::new(source),
        }
    }

    pub fn fetch(repository: &str, source: MirrorError) -> Self {
        MirrorError::Fetch {
            repository: repository.to_string(),
            source: Box::new(source),
        }
    }

    pub fn push(repository: &str, source: MirrorError) -> Self {
        MirrorError::Push {
            repository: repository.to_string(),
            source: Box::new(source),
        }
    }

    /// 展开整个错误链，用于日志中的 trace 字段
    pub fn chain(&self) -> String {
        let mut parts = vec![self.to_string()];
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            parts.push(err.to_string());
            current = err.source();
        }
        parts.join(" <- ")
    }
}

/// 从字符串创建配置错误
impl From<String> for MirrorError {
    fn from(s: String) -> Self {
        MirrorError::Config(s)
    }
}

/// 从 &str 创建配置错误
impl From<&str> for MirrorError {
    fn from(s: &str) -> Self {
        MirrorError::Config(s.to_string())
    }
}
