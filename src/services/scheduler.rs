use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use crate::domain::entities::{RepositoryDescriptor, SyncOutcome, SyncReport, SyncStage};
use crate::domain::value_objects::{AuthenticatedUrl, NameFilter};
use crate::ports::git::MirrorPort;
use crate::ports::hosting::HostingPort;
use crate::services::mirror_cache::MirrorCacheManager;
use crate::services::provisioner::RepositoryProvisioner;
use crate::services::sanitizer::RefSanitizer;
use crate::shared::config::Config;
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

/// 一轮批处理所需的参数（启动时确定，之后不再变化）
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub source_org: String,
    pub destination_org: String,
    pub destination_token: String,
    pub name_filter: Option<NameFilter>,
    pub cache_root: PathBuf,
    pub repo_timeout: Duration,
    pub concurrency: usize,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_org: config.source.organization.clone(),
            destination_org: config.destination.organization.clone(),
            destination_token: config.destination.token.clone(),
            name_filter: config.mirror.repos.clone(),
            cache_root: config.mirror.cache_path.clone(),
            repo_timeout: Duration::from_secs(config.sync.repo_timeout_secs),
            concurrency: config.sync.concurrency.max(1),
        }
    }
}

/// 同步调度器 - 枚举源端仓库，逐个执行带超时、相互隔离的镜像同步，并无限循环
pub struct SyncOrchestrator {
    settings: BatchSettings,
    source: Arc<dyn HostingPort>,
    provisioner: RepositoryProvisioner,
    mirrors: MirrorCacheManager,
}

/// 单仓库同步过程中到达的阶段，超时后用于报告停在哪一步
#[derive(Default)]
struct StageTracker(Mutex<SyncStage>);

impl StageTracker {
    fn advance(&self, stage: SyncStage) {
        if let Ok(mut current) = self.0.lock() {
            *current = stage;
        }
    }

    fn get(&self) -> SyncStage {
        self.0.lock().map(|s| *s).unwrap_or_default()
    }
}

impl SyncOrchestrator {
    pub fn new(
        settings: BatchSettings,
        source: Arc<dyn HostingPort>,
        destination: Arc<dyn HostingPort>,
        git: Arc<dyn MirrorPort>,
    ) -> Self {
        let mirrors = MirrorCacheManager::new(settings.cache_root.clone(), git);
        Self {
            settings,
            source,
            provisioner: RepositoryProvisioner::new(destination),
            mirrors,
        }
    }

    /// 启动调度循环（长期运行），只有 `shutdown` 被触发才会返回
    pub async fn run_forever(self: Arc<Self>, cycle_delay: Duration, shutdown: CancellationToken) {
        info!(
            "Mirror scheduler started: {} -> {}, cache {}, delay {}s",
            self.settings.source_org,
            self.settings.destination_org,
            self.mirrors.cache_root().display(),
            cycle_delay.as_secs()
        );
        if let Some(filter) = &self.settings.name_filter {
            info!("Restricted to {} repository name(s)", filter.len());
        }

        while !shutdown.is_cancelled() {
            let batch_id = Uuid::new_v4();
            let this = Arc::clone(&self);
            let token = shutdown.clone();
            let mut batch = tokio::spawn(
                async move { this.run_batch(&token).await }
                    .instrument(info_span!("batch", %batch_id)),
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, abandoning current batch");
                    batch.abort();
                    break;
                }
                joined = &mut batch => match joined {
                    Ok(Ok(stats)) => {
                        info!(
                            %batch_id,
                            discovered = stats.discovered,
                            skipped = stats.skipped,
                            succeeded = stats.succeeded,
                            failed = stats.failed,
                            timed_out = stats.timed_out,
                            "Mirror batch completed"
                        );
                    }
                    Ok(Err(e)) => {
                        error!(%batch_id, error = %e, trace = %e.chain(), "Mirror batch failed");
                    }
                    Err(e) => {
                        error!(%batch_id, "Mirror batch task panicked: {}", e);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(cycle_delay) => {}
            }
        }

        info!("Mirror scheduler stopped");
    }

    /// 执行一轮批处理
    ///
    /// 单个仓库的失败或超时只记入统计，不会让整轮失败；
    /// 只有枚举源端仓库失败时才返回错误。
    pub async fn run_batch(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        let repos = self
            .source
            .list_org_repositories(&self.settings.source_org)
            .await?;
        stats.discovered = repos.len();

        let selected: Vec<RepositoryDescriptor> = repos
            .into_iter()
            .filter(|repo| match &self.settings.name_filter {
                Some(filter) => filter.allows(&repo.name),
                None => true,
            })
            .collect();
        stats.skipped = stats.discovered - selected.len();

        info!(
            "Discovered {} repositories in {}, {} selected",
            stats.discovered,
            self.settings.source_org,
            selected.len()
        );

        let total = selected.len();
        let reports: Vec<SyncReport> = stream::iter(selected.into_iter().enumerate())
            .map(|(idx, repo)| {
                let this = Arc::clone(self);
                let cancel = shutdown.child_token();
                async move {
                    let name = repo.name.clone();
                    info!("[{}/{}] Syncing {}", idx + 1, total, name);

                    // 在独立任务中运行，panic 也只影响这一个仓库
                    let started = Instant::now();
                    match tokio::spawn(async move { this.sync_with_deadline(repo, cancel).await }).await {
                        Ok(report) => report,
                        Err(e) => {
                            error!(repository = %name, "Sync task panicked: {}", e);
                            SyncReport {
                                repository: name,
                                outcome: SyncOutcome::Failed(format!("sync task panicked: {}", e)),
                                stage: SyncStage::NotStarted,
                                elapsed: started.elapsed(),
                                finished_at: Utc::now(),
                            }
                        }
                    }
                }
            })
            .buffered(self.settings.concurrency)
            .collect()
            .await;

        for report in reports {
            let elapsed_ms = report.elapsed.as_millis() as u64;
            info!(
                repository = %report.repository,
                outcome = report.outcome.as_str(),
                stage = report.stage.as_str(),
                elapsed_ms,
                finished_at = %report.finished_at.to_rfc3339(),
                "Repository report"
            );
            stats.record(report);
        }
        Ok(stats)
    }

    /// 在截止时间内同步单个仓库，所有错误都在这里被截获
    async fn sync_with_deadline(&self, repo: RepositoryDescriptor, cancel: CancellationToken) -> SyncReport {
        let started = Instant::now();
        let stage = StageTracker::default();
        let span = info_span!("sync", repository = %repo.name);

        let result = time::timeout(
            self.settings.repo_timeout,
            self.sync_repository(&repo, &stage, cancel.clone()),
        )
        .instrument(span)
        .await;

        let outcome = match result {
            Ok(Ok(())) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(repository = %repo.name, elapsed_ms, "Mirror synced");
                SyncOutcome::Success
            }
            Ok(Err(e)) => {
                error!(
                    repository = %repo.name,
                    stage = stage.get().as_str(),
                    error = %e,
                    trace = %e.chain(),
                    "Repository sync failed"
                );
                SyncOutcome::Failed(e.to_string())
            }
            Err(_) => {
                // 不再等待；仍在进行的传输会在下一个进度回调时放弃
                cancel.cancel();
                let e = MirrorError::Timeout {
                    repository: repo.name.clone(),
                    elapsed: started.elapsed(),
                };
                warn!(
                    repository = %repo.name,
                    stage = stage.get().as_str(),
                    error = %e,
                    "Repository sync abandoned"
                );
                SyncOutcome::TimedOut
            }
        };

        SyncReport {
            repository: repo.name,
            outcome,
            stage: stage.get(),
            elapsed: started.elapsed(),
            finished_at: Utc::now(),
        }
    }

    /// 同步单个仓库：准备目标仓库 → 准备镜像 → 拉取 → 清理引用 → 推送
    async fn sync_repository(
        &self,
        repo: &RepositoryDescriptor,
        stage: &StageTracker,
        cancel: CancellationToken,
    ) -> Result<()> {
        let destination = self
            .provisioner
            .ensure_destination(repo, &self.settings.destination_org)
            .await?;
        stage.advance(SyncStage::DestinationEnsured);

        let push_url = AuthenticatedUrl::new(&destination.clone_url, &self.settings.destination_token);
        let mirror = self
            .mirrors
            .get_or_create_mirror(repo, &push_url, cancel.clone())
            .await?;
        stage.advance(SyncStage::MirrorReady);

        let fetched = self.mirrors.fetch(&mirror, cancel.clone()).await?;
        stage.advance(SyncStage::Fetched);

        let sanitized = RefSanitizer::sanitize(&mirror).await?;
        stage.advance(SyncStage::Sanitized);

        let pushed = self
            .mirrors
            .push(&mirror, &repo.default_branch, cancel)
            .await?;
        stage.advance(SyncStage::Pushed);

        // 空仓库没有可设为默认的分支
        if pushed.refs_pushed > 0 {
            self.provisioner
                .align_default_branch(&destination, repo, &self.settings.destination_org)
                .await?;
        }

        info!(
            refs_fetched = fetched.refs_updated,
            objects_received = fetched.objects_received,
            pull_refs_dropped = sanitized.packed_lines_removed,
            refs_pushed = pushed.refs_pushed,
            refs_deleted = pushed.refs_deleted,
            "Pushed mirror of {} to {}/{}",
            repo.name,
            self.settings.destination_org,
            destination.name
        );
        Ok(())
    }
}

/// 一轮批处理的统计，按结果分类计数
#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    pub discovered: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub reports: Vec<SyncReport>,
}

impl BatchStats {
    fn record(&mut self, report: SyncReport) {
        match report.outcome {
            SyncOutcome::Success => self.succeeded += 1,
            SyncOutcome::Failed(_) => self.failed += 1,
            SyncOutcome::TimedOut => self.timed_out += 1,
        }
        self.reports.push(report);
    }

    pub fn outcome_of(&self, name: &str) -> Option<&SyncOutcome> {
        self.reports
            .iter()
            .find(|r| r.repository == name)
            .map(|r| &r.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::git::client::tests::commit_on;
    use crate::infrastructure::git::scripted::ScriptedMirror;
    use crate::infrastructure::git::Git2MirrorClient;
    use crate::infrastructure::hosting::memory::InMemoryHosting;
    use git2::Repository;
    use std::path::Path;
    use tempfile::TempDir;

    const SRC_ORG: &str = "src-org";
    const DST_ORG: &str = "dst-org";

    fn settings(cache_root: &Path, filter: Option<&str>, timeout: Duration) -> BatchSettings {
        BatchSettings {
            source_org: SRC_ORG.to_string(),
            destination_org: DST_ORG.to_string(),
            destination_token: "dest-token".to_string(),
            name_filter: filter.map(|f| f.parse().unwrap()),
            cache_root: cache_root.to_path_buf(),
            repo_timeout: timeout,
            concurrency: 1,
        }
    }

    fn descriptor(name: &str, clone_url: String, default_branch: &str) -> RepositoryDescriptor {
        RepositoryDescriptor {
            name: name.to_string(),
            clone_url,
            default_branch: default_branch.to_string(),
            owner_organization: SRC_ORG.to_string(),
            private: false,
            description: None,
        }
    }

    fn source_with(names: &[&str]) -> Arc<InMemoryHosting> {
        let source = InMemoryHosting::new();
        for name in names {
            source.insert(descriptor(
                name,
                format!("https://src.example.com/{}/{}.git", SRC_ORG, name),
                "main",
            ));
        }
        Arc::new(source)
    }

    fn orchestrator(
        settings: BatchSettings,
        source: Arc<InMemoryHosting>,
        destination: Arc<InMemoryHosting>,
        git: Arc<dyn MirrorPort>,
    ) -> Arc<SyncOrchestrator> {
        Arc::new(SyncOrchestrator::new(settings, source, destination, git))
    }

    #[tokio::test]
    async fn without_filter_every_repository_is_synced_in_order() {
        let dir = TempDir::new().unwrap();
        let git = Arc::new(ScriptedMirror::new());
        let destination = Arc::new(InMemoryHosting::new());
        let orch = orchestrator(
            settings(dir.path(), None, Duration::from_secs(60)),
            source_with(&["a", "b", "c"]),
            destination.clone(),
            git.clone(),
        );

        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.discovered, 3);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(git.calls_for("push"), vec!["a", "b", "c"]);
        assert_eq!(destination.names_in(DST_ORG), vec!["a", "b", "c"]);
        assert!(stats.reports.iter().all(|r| r.stage == SyncStage::Pushed));
    }

    #[tokio::test]
    async fn filter_limits_batch_to_listed_names() {
        let dir = TempDir::new().unwrap();
        let git = Arc::new(ScriptedMirror::new());
        let destination = Arc::new(InMemoryHosting::new());
        let orch = orchestrator(
            settings(dir.path(), Some("c, a, missing"), Duration::from_secs(60)),
            source_with(&["a", "b", "c"]),
            destination.clone(),
            git.clone(),
        );

        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(git.calls_for("clone"), vec!["a", "c"]);
        assert_eq!(git.calls_for("push"), vec!["a", "c"]);
        assert_eq!(destination.names_in(DST_ORG), vec!["a", "c"]);
        assert!(stats.outcome_of("b").is_none());
    }

    #[tokio::test]
    async fn push_failure_does_not_stop_the_next_repository() {
        let dir = TempDir::new().unwrap();
        let git = Arc::new(ScriptedMirror::new().fail_push_for("a"));
        let orch = orchestrator(
            settings(dir.path(), None, Duration::from_secs(60)),
            source_with(&["a", "b"]),
            Arc::new(InMemoryHosting::new()),
            git.clone(),
        );

        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert!(matches!(stats.outcome_of("a"), Some(SyncOutcome::Failed(reason)) if reason.contains("Push error")));
        assert_eq!(stats.outcome_of("b"), Some(&SyncOutcome::Success));
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(git.calls_for("push"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn slow_repository_times_out_without_blocking_the_next() {
        let dir = TempDir::new().unwrap();
        let git = Arc::new(ScriptedMirror::new().hang_fetch_for("a"));
        let orch = orchestrator(
            settings(dir.path(), None, Duration::from_millis(200)),
            source_with(&["a", "b"]),
            Arc::new(InMemoryHosting::new()),
            git.clone(),
        );

        let started = Instant::now();
        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(stats.outcome_of("a"), Some(&SyncOutcome::TimedOut));
        assert_eq!(stats.outcome_of("b"), Some(&SyncOutcome::Success));
        assert_eq!(stats.timed_out, 1);

        let a = stats.reports.iter().find(|r| r.repository == "a").unwrap();
        let b = stats.reports.iter().find(|r| r.repository == "b").unwrap();
        assert_eq!(a.stage, SyncStage::MirrorReady);
        assert!(a.elapsed >= Duration::from_millis(200));
        assert!(a.finished_at <= b.finished_at);
        assert_eq!(git.calls_for("push"), vec!["b"]);
    }

    #[tokio::test]
    async fn destination_default_branch_follows_source_after_push() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(InMemoryHosting::new());
        let mut existing = descriptor("a", "https://dest.example.com/dst-org/a.git".to_string(), "master");
        existing.owner_organization = DST_ORG.to_string();
        destination.insert(existing);

        let orch = orchestrator(
            settings(dir.path(), None, Duration::from_secs(60)),
            source_with(&["a", "b"]),
            destination.clone(),
            Arc::new(ScriptedMirror::new()),
        );

        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.succeeded, 2);
        assert_eq!(destination.branch_updates(), vec![("a".to_string(), "main".to_string())]);
        assert_eq!(destination.descriptor(DST_ORG, "a").unwrap().default_branch, "main");
    }

    #[tokio::test]
    async fn provisioning_failure_is_contained_per_repository() {
        let dir = TempDir::new().unwrap();
        let git = Arc::new(ScriptedMirror::new());
        let orch = orchestrator(
            settings(dir.path(), None, Duration::from_secs(60)),
            source_with(&["a", "b"]),
            Arc::new(InMemoryHosting::unavailable()),
            git.clone(),
        );

        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.failed, 2);
        assert!(stats.reports.iter().all(|r| r.stage == SyncStage::NotStarted));
        assert!(git.calls().is_empty());
    }

    #[tokio::test]
    async fn listing_failure_fails_the_batch() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            settings(dir.path(), None, Duration::from_secs(60)),
            Arc::new(InMemoryHosting::unavailable()),
            Arc::new(InMemoryHosting::new()),
            Arc::new(ScriptedMirror::new()),
        );

        let err = orch.run_batch(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MirrorError::Api { status: 503, .. }));
    }

    #[tokio::test]
    async fn outer_loop_survives_failing_batches_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(InMemoryHosting::unavailable());
        let orch = orchestrator(
            settings(dir.path(), None, Duration::from_secs(60)),
            source.clone(),
            Arc::new(InMemoryHosting::new()),
            Arc::new(ScriptedMirror::new()),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(orch.run_forever(Duration::from_millis(10), shutdown.clone()));

        time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stops after shutdown")
            .unwrap();

        assert!(source.list_calls() >= 2);
    }

    /// 源端两个仓库 X、Y（真实的裸仓库），目标端为空
    struct EndToEnd {
        dir: TempDir,
        source: Arc<InMemoryHosting>,
        destination: Arc<InMemoryHosting>,
        upstream_x: Repository,
    }

    fn end_to_end() -> EndToEnd {
        let dir = TempDir::new().unwrap();
        let source = InMemoryHosting::new();

        let x_path = dir.path().join("src").join("X.git");
        let upstream_x = Repository::init_bare(&x_path).unwrap();
        let main = commit_on(&upstream_x, "refs/heads/main", "x: initial");
        upstream_x
            .reference("refs/pull/1/head", main, false, "review")
            .unwrap();
        source.insert(descriptor("X", x_path.display().to_string(), "main"));

        let y_path = dir.path().join("src").join("Y.git");
        let upstream_y = Repository::init_bare(&y_path).unwrap();
        commit_on(&upstream_y, "refs/heads/develop", "y: initial");
        source.insert(descriptor("Y", y_path.display().to_string(), "develop"));

        let destination = InMemoryHosting::with_remote_root(dir.path().join("dst"));

        EndToEnd {
            source: Arc::new(source),
            destination: Arc::new(destination),
            upstream_x,
            dir,
        }
    }

    #[tokio::test]
    async fn first_batch_creates_and_mirrors_every_repository() {
        let e2e = end_to_end();
        let cache = e2e.dir.path().join("cache");
        let orch = orchestrator(
            settings(&cache, None, Duration::from_secs(120)),
            e2e.source.clone(),
            e2e.destination.clone(),
            Arc::new(Git2MirrorClient::new(None)),
        );

        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.succeeded, 2, "{:?}", stats.reports);
        assert_eq!(e2e.destination.names_in(DST_ORG), vec!["X", "Y"]);
        assert_eq!(
            e2e.destination.descriptor(DST_ORG, "X").unwrap().default_branch,
            "main"
        );
        assert_eq!(
            e2e.destination.descriptor(DST_ORG, "Y").unwrap().default_branch,
            "develop"
        );

        for name in ["X", "Y"] {
            let dest_url = e2e.destination.descriptor(DST_ORG, name).unwrap().clone_url;
            let mirror = Repository::open_bare(cache.join(name)).unwrap();
            let remote = mirror.find_remote("origin").unwrap();
            let expected = AuthenticatedUrl::new(&dest_url, "dest-token");
            assert_eq!(remote.pushurl(), Some(expected.expose()));
        }

        let dest_x = Repository::open_bare(
            e2e.destination.descriptor(DST_ORG, "X").unwrap().clone_url,
        )
        .unwrap();
        assert_eq!(
            dest_x.find_reference("refs/heads/main").unwrap().target(),
            e2e.upstream_x.find_reference("refs/heads/main").unwrap().target()
        );
        assert!(dest_x.find_reference("refs/pull/1/head").is_err());
    }

    #[tokio::test]
    async fn second_batch_reuses_mirrors_and_creates_nothing() {
        let e2e = end_to_end();
        let cache = e2e.dir.path().join("cache");
        let orch = orchestrator(
            settings(&cache, None, Duration::from_secs(120)),
            e2e.source.clone(),
            e2e.destination.clone(),
            Arc::new(Git2MirrorClient::new(None)),
        );

        orch.run_batch(&CancellationToken::new()).await.unwrap();
        let marker = cache.join("X").join("orgmirror-marker");
        std::fs::write(&marker, b"kept").unwrap();

        let stats = orch.run_batch(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.succeeded, 2, "{:?}", stats.reports);
        assert_eq!(e2e.destination.created().len(), 2);
        assert!(marker.exists());

        let mut entries: Vec<String> = std::fs::read_dir(&cache)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["X", "Y"]);
    }
}
