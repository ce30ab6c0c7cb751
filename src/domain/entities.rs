use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 托管平台上的仓库描述（源端或目标端）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub owner_organization: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// 目标端仓库描述，结构与源端相同
pub type DestinationDescriptor = RepositoryDescriptor;

/// 创建目标仓库时使用的固定参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRepository {
    pub name: String,
    pub description: String,
    pub default_branch: String,
    pub private: bool,
    pub has_issues: bool,
    pub has_wiki: bool,
    pub has_downloads: bool,
}

impl NewRepository {
    /// 以源仓库为模板：关闭 issues / wiki / downloads，描述指回源地址
    pub fn mirror_of(source: &RepositoryDescriptor) -> Self {
        Self {
            name: source.name.clone(),
            description: format!("Mirror of {}", source.clone_url),
            default_branch: source.default_branch.clone(),
            private: source.private,
            has_issues: false,
            has_wiki: false,
            has_downloads: false,
        }
    }
}

/// 本地裸镜像，位于 `cache_root/<name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMirror {
    pub name: String,
    pub path: PathBuf,
}

impl LocalMirror {
    pub fn new(cache_root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: cache_root.join(name),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// 单仓库同步流程中已到达的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SyncStage {
    #[default]
    NotStarted,
    DestinationEnsured,
    MirrorReady,
    Fetched,
    Sanitized,
    Pushed,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::NotStarted => "not_started",
            SyncStage::DestinationEnsured => "destination_ensured",
            SyncStage::MirrorReady => "mirror_ready",
            SyncStage::Fetched => "fetched",
            SyncStage::Sanitized => "sanitized",
            SyncStage::Pushed => "pushed",
        }
    }
}

/// 单仓库单轮同步结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    Failed(String),
    TimedOut,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Success => "success",
            SyncOutcome::Failed(_) => "failed",
            SyncOutcome::TimedOut => "timed_out",
        }
    }
}

/// 单仓库同步报告
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub repository: String,
    pub outcome: SyncOutcome,
    pub stage: SyncStage,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}
