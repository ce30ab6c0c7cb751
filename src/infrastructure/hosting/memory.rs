//! 内存中的托管平台实现，用于测试
//!
//! 设置了 `remote_root` 时，创建仓库会同时在磁盘上初始化一个裸仓库，
//! 其路径即为返回的 `clone_url`，可以直接作为 libgit2 的推送目标。

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use crate::domain::entities::{NewRepository, RepositoryDescriptor};
use crate::ports::hosting::HostingPort;
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

#[derive(Default)]
pub struct InMemoryHosting {
    repos: RwLock<BTreeMap<(String, String), RepositoryDescriptor>>,
    created: RwLock<Vec<NewRepository>>,
    branch_updates: RwLock<Vec<(String, String)>>,
    remote_root: Option<PathBuf>,
    unavailable: bool,
    list_calls: AtomicUsize,
}

impl InMemoryHosting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_root(root: PathBuf) -> Self {
        Self {
            remote_root: Some(root),
            ..Self::default()
        }
    }

    /// 所有 API 调用都返回 503
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    fn check_available(&self, path: &str) -> Result<()> {
        if self.unavailable {
            return Err(MirrorError::Api {
                status: 503,
                url: format!("memory://{}", path),
                body: "service unavailable".to_string(),
            });
        }
        Ok(())
    }

    pub fn insert(&self, repo: RepositoryDescriptor) {
        let key = (repo.owner_organization.clone(), repo.name.clone());
        self.repos.write().unwrap().insert(key, repo);
    }

    /// 通过 `create_repository` 创建过的仓库
    pub fn created(&self) -> Vec<NewRepository> {
        self.created.read().unwrap().clone()
    }

    /// `update_default_branch` 的调用记录：(仓库名, 新默认分支)
    pub fn branch_updates(&self) -> Vec<(String, String)> {
        self.branch_updates.read().unwrap().clone()
    }

    pub fn names_in(&self, org: &str) -> Vec<String> {
        self.repos
            .read()
            .unwrap()
            .keys()
            .filter(|(owner, _)| owner == org)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn descriptor(&self, org: &str, name: &str) -> Option<RepositoryDescriptor> {
        self.repos
            .read()
            .unwrap()
            .get(&(org.to_string(), name.to_string()))
            .cloned()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostingPort for InMemoryHosting {
    async fn list_org_repositories(&self, org: &str) -> Result<Vec<RepositoryDescriptor>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available(&format!("orgs/{}/repos", org))?;
        Ok(self
            .repos
            .read()
            .unwrap()
            .iter()
            .filter(|((owner, _), _)| owner == org)
            .map(|(_, repo)| repo.clone())
            .collect())
    }

    async fn get_repository(&self, org: &str, name: &str) -> Result<Option<RepositoryDescriptor>> {
        self.check_available(&format!("repos/{}/{}", org, name))?;
        Ok(self.descriptor(org, name))
    }

    async fn create_repository(&self, org: &str, repo: &NewRepository) -> Result<RepositoryDescriptor> {
        self.check_available(&format!("orgs/{}/repos", org))?;
        if self.descriptor(org, &repo.name).is_some() {
            return Err(MirrorError::Api {
                status: 422,
                url: format!("memory://orgs/{}/repos", org),
                body: "name already exists on this account".to_string(),
            });
        }

        let clone_url = match &self.remote_root {
            Some(root) => {
                let path = root.join(org).join(format!("{}.git", repo.name));
                std::fs::create_dir_all(&path)?;
                git2::Repository::init_bare(&path)?;
                path.display().to_string()
            }
            None => format!("https://dest.example.com/{}/{}.git", org, repo.name),
        };

        let descriptor = RepositoryDescriptor {
            name: repo.name.clone(),
            clone_url,
            default_branch: repo.default_branch.clone(),
            owner_organization: org.to_string(),
            private: repo.private,
            description: Some(repo.description.clone()),
        };

        self.insert(descriptor.clone());
        self.created.write().unwrap().push(repo.clone());
        Ok(descriptor)
    }

    async fn update_default_branch(
        &self,
        org: &str,
        name: &str,
        branch: &str,
    ) -> Result<RepositoryDescriptor> {
        let path = format!("repos/{}/{}", org, name);
        self.check_available(&path)?;

        let mut repos = self.repos.write().unwrap();
        let Some(repo) = repos.get_mut(&(org.to_string(), name.to_string())) else {
            return Err(MirrorError::Api {
                status: 404,
                url: format!("memory://{}", path),
                body: "Not Found".to_string(),
            });
        };
        repo.default_branch = branch.to_string();
        self.branch_updates
            .write()
            .unwrap()
            .push((name.to_string(), branch.to_string()));
        Ok(repo.clone())
    }
}
