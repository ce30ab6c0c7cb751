use async_trait::async_trait;
use git2::{
    AutotagOption, Cred, CredentialType, FetchOptions, FetchPrune, PushOptions,
    ReferenceType, RemoteCallbacks, Repository,
};
use std::cell::{Cell, RefCell};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use crate::domain::value_objects::AuthenticatedUrl;
use crate::ports::git::{FetchSummary, MirrorPort, PushSummary};
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

const REMOTE: &str = "origin";
const MIRROR_REFSPEC: &str = "+refs/*:refs/*";
/// 托管平台管理的只读引用，推送时既不写入也不删除
const PULL_REF_PREFIX: &str = "refs/pull/";
/// 推送前临时存放目标端引用的命名空间，不会被推送
const DEST_NAMESPACE: &str = "refs/orgmirror-dest/";

/// 镜像客户端实现（基于 git2-rs）
pub struct Git2MirrorClient {
    /// 源端令牌，用于 clone / fetch；push 使用 push 地址中嵌入的凭证
    source_token: Option<String>,
}

impl Git2MirrorClient {
    pub fn new(source_token: Option<String>) -> Self {
        Self { source_token }
    }

    /// 在线程池中执行阻塞的 Git 操作
    async fn run_blocking<F, T>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| MirrorError::Internal(format!("Task join error: {}", e)))?
    }
}

/// Git 凭证回调（令牌作为 basic-auth 用户名）
///
/// libgit2 在凭证被拒绝后会反复调用回调，第二次调用直接失败以免死循环。
fn credentials(
    token: Option<String>,
) -> impl FnMut(&str, Option<&str>, CredentialType) -> std::result::Result<Cred, git2::Error> {
    let mut attempts = 0u32;
    move |_url, username_from_url, allowed| {
        attempts += 1;
        if attempts > 1 {
            return Err(git2::Error::from_str("authentication rejected by remote"));
        }
        if allowed.is_user_pass_plaintext() {
            if let Some(user) = username_from_url {
                return Cred::userpass_plaintext(user, "");
            }
            if let Some(token) = token.as_deref() {
                return Cred::userpass_plaintext(token, "");
            }
        }
        Cred::default()
    }
}

fn cancelled_or(cancel: &CancellationToken, err: git2::Error) -> MirrorError {
    if cancel.is_cancelled() {
        MirrorError::Cancelled
    } else {
        MirrorError::Git(err)
    }
}

/// 从 origin 拉取全部引用和标签，并清理源端已删除的引用
fn fetch_origin(
    repo: &Repository,
    token: Option<String>,
    cancel: &CancellationToken,
) -> Result<FetchSummary> {
    if cancel.is_cancelled() {
        return Err(MirrorError::Cancelled);
    }

    let mut remote = repo.find_remote(REMOTE)?;
    let refs_updated = Cell::new(0usize);

    let result = {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(credentials(token));

        // 进度回调，同时作为取消检查点
        callbacks.transfer_progress(|stats| {
            if cancel.is_cancelled() {
                return false;
            }
            if stats.received_objects() == stats.total_objects() {
                debug!(
                    "Resolving deltas {}/{}",
                    stats.indexed_deltas(),
                    stats.total_deltas()
                );
            } else if stats.total_objects() > 0 {
                debug!(
                    "Received {}/{} objects",
                    stats.received_objects(),
                    stats.total_objects()
                );
            }
            true
        });
        callbacks.update_tips(|refname, _old, _new| {
            debug!("Updated {}", refname);
            refs_updated.set(refs_updated.get() + 1);
            true
        });

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks);
        fetch_options.prune(FetchPrune::On);
        fetch_options.download_tags(AutotagOption::All);

        remote.fetch(&[] as &[&str], Some(&mut fetch_options), Some("orgmirror: fetch"))
    };
    result.map_err(|e| cancelled_or(cancel, e))?;

    Ok(FetchSummary {
        refs_updated: refs_updated.get(),
        objects_received: remote.stats().received_objects(),
    })
}

/// 镜像克隆：初始化裸仓库、配置 mirror 远端、首次拉取、HEAD 指向默认分支
fn clone_into(
    source_url: &str,
    path: &Path,
    default_branch: &str,
    token: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    std::fs::create_dir_all(path)?;
    let repo = Repository::init_bare(path)?;
    repo.remote_with_fetch(REMOTE, source_url, MIRROR_REFSPEC)?;
    repo.config()?
        .set_bool(&format!("remote.{}.mirror", REMOTE), true)?;

    fetch_origin(&repo, token, cancel)?;

    let head = format!("refs/heads/{}", default_branch);
    if repo.find_reference(&head).is_ok() {
        repo.set_head(&head)?;
    }
    Ok(())
}

/// 本地需要推送的引用：跳过符号引用，默认分支排在最前
fn local_refs(repo: &Repository, default_branch: &str) -> Result<Vec<String>> {
    let primary = format!("refs/heads/{}", default_branch);
    let mut names = Vec::new();

    for reference in repo.references()? {
        let reference = reference?;
        if reference.kind() == Some(ReferenceType::Symbolic) {
            continue;
        }
        match reference.name() {
            Some(name) if name.starts_with(DEST_NAMESPACE) => {}
            Some(name) if name.starts_with("refs/") => names.push(name.to_string()),
            Some(_) => {}
            None => warn!("Skipping reference with non UTF-8 name"),
        }
    }

    names.sort();
    if let Some(pos) = names.iter().position(|n| *n == primary) {
        let head = names.remove(pos);
        names.insert(0, head);
    }
    Ok(names)
}

/// 生成镜像推送的 refspec：本地引用全部强制推送，远端多余的引用删除
fn mirror_refspecs(local: &[String], remote: &[String]) -> Vec<String> {
    let mut specs: Vec<String> = local
        .iter()
        .map(|name| format!("+{}:{}", name, name))
        .collect();

    specs.extend(
        remote
            .iter()
            .filter(|name| name.starts_with("refs/"))
            .filter(|name| !name.ends_with("^{}"))
            .filter(|name| !name.starts_with(PULL_REF_PREFIX))
            .filter(|name| !local.contains(name))
            .map(|name| format!(":{}", name)),
    );
    specs
}

/// 读取目标端现有的引用名
///
/// 把 push 地址上的全部引用拉取到私有命名空间，记下名字后立即删除这些本地引用。
/// 目标仓库可能是刚创建的空仓库，不能直接列举远端。
fn destination_refs(
    repo: &Repository,
    push_url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    if cancel.is_cancelled() {
        return Err(MirrorError::Cancelled);
    }

    let mut remote = repo.remote_anonymous(push_url)?;
    let result = {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(credentials(None));
        callbacks.transfer_progress(|_| !cancel.is_cancelled());

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks);
        fetch_options.download_tags(AutotagOption::None);

        let refspec = format!("+refs/*:{}*", DEST_NAMESPACE);
        remote.fetch(&[refspec.as_str()], Some(&mut fetch_options), None)
    };
    result.map_err(|e| cancelled_or(cancel, e))?;

    let fetched: Vec<String> = repo
        .references_glob(&format!("{}*", DEST_NAMESPACE))?
        .names()
        .filter_map(|name| name.ok().map(String::from))
        .collect();

    let mut names = Vec::with_capacity(fetched.len());
    for full in &fetched {
        repo.find_reference(full)?.delete()?;
        if let Some(name) = full.strip_prefix(DEST_NAMESPACE) {
            names.push(format!("refs/{}", name));
        }
    }
    names.sort();
    Ok(names)
}

fn push_all(path: &Path, default_branch: &str, cancel: &CancellationToken) -> Result<PushSummary> {
    let repo = Repository::open_bare(path)?;
    let local = local_refs(&repo, default_branch)?;
    let mut remote = repo.find_remote(REMOTE)?;

    let push_url = match remote.pushurl().or_else(|| remote.url()) {
        Some(url) => url.to_string(),
        None => {
            return Err(MirrorError::Internal(format!(
                "remote {} of {} has no usable push URL",
                REMOTE,
                path.display()
            )))
        }
    };
    let remote_refs = destination_refs(&repo, &push_url, cancel)?;

    let refspecs = mirror_refspecs(&local, &remote_refs);
    let refs_deleted = refspecs.iter().filter(|s| s.starts_with(':')).count();
    if refspecs.is_empty() {
        debug!("Nothing to push");
        return Ok(PushSummary::default());
    }
    if cancel.is_cancelled() {
        return Err(MirrorError::Cancelled);
    }

    let rejected: RefCell<Vec<(String, String)>> = RefCell::new(Vec::new());
    {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(credentials(None));
        callbacks.push_transfer_progress(|current, total, bytes| {
            debug!("Pushed {}/{} objects ({} bytes)", current, total, bytes);
        });
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                rejected
                    .borrow_mut()
                    .push((refname.to_string(), message.to_string()));
            }
            Ok(())
        });

        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(callbacks);
        remote.push(&refspecs, Some(&mut push_options))?;
    }

    if let Some((reference, message)) = rejected.into_inner().into_iter().next() {
        return Err(MirrorError::PushRejected { reference, message });
    }

    Ok(PushSummary {
        refs_pushed: local.len(),
        refs_deleted,
    })
}

#[async_trait]
impl MirrorPort for Git2MirrorClient {
    #[instrument(skip(self, cancel), fields(path = %path.display()))]
    async fn clone_mirror(
        &self,
        source_url: &str,
        path: &Path,
        default_branch: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let source_url = source_url.to_string();
        let path = path.to_path_buf();
        let default_branch = default_branch.to_string();
        let token = self.source_token.clone();

        Self::run_blocking(move || {
            let result = clone_into(&source_url, &path, &default_branch, token, &cancel);
            // 未完成的克隆不能留下来被当作已初始化的镜像
            if result.is_err() && path.exists() {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!("Failed to remove incomplete mirror {}: {}", path.display(), e);
                }
            }
            result
        })
        .await
    }

    async fn set_push_url(&self, path: &Path, push_url: &AuthenticatedUrl) -> Result<()> {
        let path = path.to_path_buf();
        let push_url = push_url.expose().to_string();

        Self::run_blocking(move || {
            let repo = Repository::open_bare(&path)?;
            repo.remote_set_pushurl(REMOTE, Some(&push_url))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(path = %path.display()))]
    async fn fetch(&self, path: &Path, cancel: CancellationToken) -> Result<FetchSummary> {
        let path = path.to_path_buf();
        let token = self.source_token.clone();

        Self::run_blocking(move || {
            let repo = Repository::open_bare(&path)?;
            fetch_origin(&repo, token, &cancel)
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(path = %path.display()))]
    async fn push_mirror(
        &self,
        path: &Path,
        default_branch: &str,
        cancel: CancellationToken,
    ) -> Result<PushSummary> {
        let path = path.to_path_buf();
        let default_branch = default_branch.to_string();

        Self::run_blocking(move || push_all(&path, &default_branch, &cancel)).await
    }
}
