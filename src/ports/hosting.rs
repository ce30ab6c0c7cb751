use async_trait::async_trait;
use crate::domain::entities::{NewRepository, RepositoryDescriptor};
use crate::shared::result::Result;

/// 托管平台 API 接口
///
/// 源端和目标端各有一个实例，彼此独立。
#[async_trait]
pub trait HostingPort: Send + Sync {
    /// 列出组织下的全部仓库（已处理分页）
    async fn list_org_repositories(&self, org: &str) -> Result<Vec<RepositoryDescriptor>>;

    /// 查询 `org/name`，不存在时返回 `None`
    async fn get_repository(&self, org: &str, name: &str) -> Result<Option<RepositoryDescriptor>>;

    /// 在组织下创建仓库
    async fn create_repository(&self, org: &str, repo: &NewRepository) -> Result<RepositoryDescriptor>;

    /// 修改 `org/name` 的默认分支（分支必须已存在）
    async fn update_default_branch(
        &self,
        org: &str,
        name: &str,
        branch: &str,
    ) -> Result<RepositoryDescriptor>;
}
