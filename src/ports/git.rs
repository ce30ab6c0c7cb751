use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use crate::domain::value_objects::AuthenticatedUrl;
use crate::shared::result::Result;

/// 本地裸镜像上的 Git 传输操作接口
///
/// 只包含同步引擎需要的四个操作：镜像克隆、设置 push 地址、拉取、镜像推送。
/// `cancel` 被触发后，实现应尽快放弃仍在进行的传输。
#[async_trait]
pub trait MirrorPort: Send + Sync {
    /// 将 `source_url` 镜像克隆到 `path`（裸仓库，`+refs/*:refs/*`）
    async fn clone_mirror(
        &self,
        source_url: &str,
        path: &Path,
        default_branch: &str,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// 设置 origin 的 push 地址（与 fetch 地址相互独立）
    async fn set_push_url(&self, path: &Path, push_url: &AuthenticatedUrl) -> Result<()>;

    /// 从 origin 拉取，包含全部标签并清理源端已删除的引用
    async fn fetch(&self, path: &Path, cancel: CancellationToken) -> Result<FetchSummary>;

    /// 镜像推送到 origin 的 push 地址，默认分支最先推送
    async fn push_mirror(
        &self,
        path: &Path,
        default_branch: &str,
        cancel: CancellationToken,
    ) -> Result<PushSummary>;
}

/// Fetch 操作结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub refs_updated: usize,
    pub objects_received: usize,
}

/// Push 操作结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushSummary {
    pub refs_pushed: usize,
    pub refs_deleted: usize,
}
