use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::domain::entities::{LocalMirror, RepositoryDescriptor};
use crate::domain::value_objects::AuthenticatedUrl;
use crate::ports::git::{FetchSummary, MirrorPort, PushSummary};
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

/// 本地镜像缓存管理 - 每个仓库在 `cache_root/<name>` 下有且只有一个裸镜像
///
/// 目录一旦创建就不会被删除或重新克隆，它本身就是“已初始化”的标记。
/// 同一个缓存目录同一时间只能由一个进程使用。
pub struct MirrorCacheManager {
    cache_root: PathBuf,
    git: Arc<dyn MirrorPort>,
}

impl MirrorCacheManager {
    pub fn new(cache_root: PathBuf, git: Arc<dyn MirrorPort>) -> Self {
        Self { cache_root, git }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// 获取或创建镜像，并把 push 地址刷新为当前的带凭证地址
    pub async fn get_or_create_mirror(
        &self,
        repo: &RepositoryDescriptor,
        destination_url: &AuthenticatedUrl,
        cancel: CancellationToken,
    ) -> Result<LocalMirror> {
        validate_name(&repo.name).map_err(|e| MirrorError::clone_failed(&repo.name, e))?;
        let mirror = LocalMirror::new(&self.cache_root, &repo.name);

        if mirror.exists() {
            debug!("Reusing mirror at {}", mirror.path.display());
        } else {
            info!(
                "Cloning mirror of {} into {}",
                repo.clone_url,
                mirror.path.display()
            );
            tokio::fs::create_dir_all(&self.cache_root)
                .await
                .map_err(|e| MirrorError::clone_failed(&repo.name, e.into()))?;
            self.git
                .clone_mirror(&repo.clone_url, &mirror.path, &repo.default_branch, cancel)
                .await
                .map_err(|e| MirrorError::clone_failed(&repo.name, e))?;
        }

        self.git
            .set_push_url(&mirror.path, destination_url)
            .await
            .map_err(|e| MirrorError::clone_failed(&repo.name, e))?;
        debug!("Push URL of {} set to {}", repo.name, destination_url);

        Ok(mirror)
    }

    pub async fn fetch(&self, mirror: &LocalMirror, cancel: CancellationToken) -> Result<FetchSummary> {
        self.git
            .fetch(&mirror.path, cancel)
            .await
            .map_err(|e| MirrorError::fetch(&mirror.name, e))
    }

    pub async fn push(
        &self,
        mirror: &LocalMirror,
        default_branch: &str,
        cancel: CancellationToken,
    ) -> Result<PushSummary> {
        self.git
            .push_mirror(&mirror.path, default_branch, cancel)
            .await
            .map_err(|e| MirrorError::push(&mirror.name, e))
    }
}

/// 仓库名直接用作目录名，不能跳出缓存目录
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(MirrorError::Internal(format!(
            "repository name '{}' cannot be used as a directory name",
            name
        )));
    }
    Ok(())
}
