//! 按脚本行为返回结果的 [`MirrorPort`]，用于测试调度逻辑
//!
//! 仓库以镜像目录名区分；克隆只创建空目录，不做任何网络操作。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::domain::value_objects::AuthenticatedUrl;
use crate::ports::git::{FetchSummary, MirrorPort, PushSummary};
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

#[derive(Default)]
pub struct ScriptedMirror {
    failing_pushes: HashSet<String>,
    hanging_fetches: HashSet<String>,
    calls: Mutex<Vec<String>>,
    push_urls: Mutex<BTreeMap<String, String>>,
}

fn repo_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

impl ScriptedMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_push_for(mut self, name: &str) -> Self {
        self.failing_pushes.insert(name.to_string());
        self
    }

    pub fn hang_fetch_for(mut self, name: &str) -> Self {
        self.hanging_fetches.insert(name.to_string());
        self
    }

    /// 形如 `clone:api`、`push:web` 的调用记录
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}:", op);
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(String::from))
            .collect()
    }

    pub fn push_url(&self, name: &str) -> Option<String> {
        self.push_urls.lock().unwrap().get(name).cloned()
    }

    fn record(&self, op: &str, path: &Path) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", op, repo_name(path)));
    }
}

#[async_trait]
impl MirrorPort for ScriptedMirror {
    async fn clone_mirror(
        &self,
        _source_url: &str,
        path: &Path,
        _default_branch: &str,
        _cancel: CancellationToken,
    ) -> Result<()> {
        self.record("clone", path);
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    async fn set_push_url(&self, path: &Path, push_url: &AuthenticatedUrl) -> Result<()> {
        self.record("set_push_url", path);
        self.push_urls
            .lock()
            .unwrap()
            .insert(repo_name(path), push_url.expose().to_string());
        Ok(())
    }

    async fn fetch(&self, path: &Path, cancel: CancellationToken) -> Result<FetchSummary> {
        self.record("fetch", path);
        if self.hanging_fetches.contains(&repo_name(path)) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            }
        }
        Ok(FetchSummary::default())
    }

    async fn push_mirror(
        &self,
        path: &Path,
        default_branch: &str,
        _cancel: CancellationToken,
    ) -> Result<PushSummary> {
        self.record("push", path);
        if self.failing_pushes.contains(&repo_name(path)) {
            return Err(MirrorError::PushRejected {
                reference: format!("refs/heads/{}", default_branch),
                message: "pre-receive hook declined".to_string(),
            });
        }
        Ok(PushSummary {
            refs_pushed: 1,
            refs_deleted: 0,
        })
    }
}
