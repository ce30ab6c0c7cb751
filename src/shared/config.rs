use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;
use crate::domain::value_objects::NameFilter;
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

/// 应用配置
///
/// 源端和目标端各自是一个独立、不可变的 [`EndpointConfig`]，
/// 启动时构建一次后显式传递给需要它们的组件。
#[derive(Debug, Clone)]
pub struct Config {
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    pub mirror: MirrorConfig,
    pub sync: SyncConfig,
}

/// 托管实例端点配置
#[derive(Clone)]
pub struct EndpointConfig {
    /// 实例地址，例如 `https://github.example.com`
    pub instance_url: Url,
    /// REST API 根地址
    pub api_url: Url,
    pub token: String,
    pub organization: String,
}

impl EndpointConfig {
    /// 构建端点配置，未显式指定 API 地址时按实例地址推导
    pub fn new(
        instance_url: &str,
        api_url: Option<&str>,
        token: String,
        organization: String,
    ) -> Result<Self> {
        let instance_url = Url::parse(instance_url)?;
        let api_url = match api_url {
            Some(explicit) => Url::parse(explicit)?,
            None => derive_api_url(&instance_url)?,
        };

        if token.trim().is_empty() {
            return Err(MirrorError::Config(format!(
                "empty access token for {}",
                instance_url
            )));
        }
        if organization.trim().is_empty() {
            return Err(MirrorError::Config(format!(
                "empty organization for {}",
                instance_url
            )));
        }

        Ok(Self {
            instance_url,
            api_url,
            token,
            organization,
        })
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("instance_url", &self.instance_url.as_str())
            .field("api_url", &self.api_url.as_str())
            .field("token", &"<redacted>")
            .field("organization", &self.organization)
            .finish()
    }
}

/// github.com 使用独立的 API 域名，其余实例（GitHub Enterprise 等）使用 `/api/v3`
fn derive_api_url(instance_url: &Url) -> Result<Url> {
    if instance_url.host_str() == Some("github.com") {
        return Ok(Url::parse("https://api.github.com")?);
    }

    let base = instance_url.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{}/api/v3", base))?)
}

/// 本地镜像缓存配置
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub cache_path: PathBuf,
    pub repos: Option<NameFilter>,
}

/// 同步调度配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 单个仓库同步的墙钟超时
    pub repo_timeout_secs: u64,
    /// 两轮批处理之间的固定间隔
    pub cycle_delay_secs: u64,
    /// 同时同步的仓库数量，1 表示顺序执行
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repo_timeout_secs: 15 * 60,
            cycle_delay_secs: 60,
            concurrency: 1,
        }
    }
}

/// 配置文件内容（只包含可调参数，凭证只通过命令行或环境变量传入）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub sync: SyncConfig,
}

impl FileConfig {
    /// 从文件加载配置
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: FileConfig = toml::from_str(content)
            .map_err(|e| MirrorError::Config(e.to_string()))?;
        Ok(config)
    }
}

impl SyncConfig {
    /// 命令行参数覆盖配置文件
    pub fn with_overrides(
        mut self,
        repo_timeout_secs: Option<u64>,
        cycle_delay_secs: Option<u64>,
        concurrency: Option<usize>,
    ) -> Result<Self> {
        if let Some(secs) = repo_timeout_secs {
            self.repo_timeout_secs = secs;
        }
        if let Some(secs) = cycle_delay_secs {
            self.cycle_delay_secs = secs;
        }
        if let Some(n) = concurrency {
            self.concurrency = n;
        }

        if self.repo_timeout_secs == 0 {
            return Err("repo_timeout_secs must be greater than zero".into());
        }
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".into());
        }
        Ok(self)
    }
}
