use std::sync::Arc;
use tracing::{debug, info};
use crate::domain::entities::{DestinationDescriptor, NewRepository, RepositoryDescriptor};
use crate::ports::hosting::HostingPort;
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

/// 目标仓库准备服务 - 保证目标组织下存在同名仓库
pub struct RepositoryProvisioner {
    destination: Arc<dyn HostingPort>,
}

impl RepositoryProvisioner {
    pub fn new(destination: Arc<dyn HostingPort>) -> Self {
        Self { destination }
    }

    /// 存在则直接返回，不存在则按固定参数创建；可每轮重复调用
    pub async fn ensure_destination(
        &self,
        repo: &RepositoryDescriptor,
        org: &str,
    ) -> Result<DestinationDescriptor> {
        let existing = self
            .destination
            .get_repository(org, &repo.name)
            .await
            .map_err(|e| MirrorError::provisioning(&repo.name, e))?;

        if let Some(destination) = existing {
            debug!("Destination {}/{} already exists", org, repo.name);
            return Ok(destination);
        }

        info!("Creating destination repository {}/{}", org, repo.name);
        self.destination
            .create_repository(org, &NewRepository::mirror_of(repo))
            .await
            .map_err(|e| MirrorError::provisioning(&repo.name, e))
    }

    /// 让目标仓库的默认分支与源仓库一致
    ///
    /// GitHub 创建仓库时忽略 `default_branch`，分支推送上去之后才能修改。
    pub async fn align_default_branch(
        &self,
        destination: &DestinationDescriptor,
        repo: &RepositoryDescriptor,
        org: &str,
    ) -> Result<()> {
        if destination.default_branch == repo.default_branch {
            return Ok(());
        }

        info!(
            "Switching default branch of {}/{} from {} to {}",
            org, destination.name, destination.default_branch, repo.default_branch
        );
        self.destination
            .update_default_branch(org, &destination.name, &repo.default_branch)
            .await
            .map_err(|e| MirrorError::provisioning(&repo.name, e))?;
        Ok(())
    }
}
