use async_trait::async_trait;
use reqwest::header::LINK;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;
use crate::domain::entities::{NewRepository, RepositoryDescriptor};
use crate::ports::hosting::HostingPort;
use crate::shared::config::EndpointConfig;
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

const ACCEPT: &str = "application/vnd.github.v3+json";
const PER_PAGE: usize = 100;

/// 托管平台 REST 客户端（GitHub / GitHub Enterprise / Gitea 兼容）
///
/// 每个实例绑定一个不可变的 [`EndpointConfig`]。
pub struct RestHostingClient {
    http: Client,
    endpoint: EndpointConfig,
}

/// API 返回的仓库结构（只取需要的字段）
#[derive(Debug, Deserialize)]
struct ApiRepository {
    name: String,
    clone_url: String,
    #[serde(default)]
    default_branch: Option<String>,
    owner: ApiOwner,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    login: String,
}

impl From<ApiRepository> for RepositoryDescriptor {
    fn from(repo: ApiRepository) -> Self {
        let default_branch = repo
            .default_branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "main".to_string());

        RepositoryDescriptor {
            name: repo.name,
            clone_url: repo.clone_url,
            default_branch,
            owner_organization: repo.owner.login,
            private: repo.private,
            description: repo.description,
        }
    }
}

impl RestHostingClient {
    pub fn new(http: Client, endpoint: EndpointConfig) -> Self {
        Self { http, endpoint }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.api_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("token {}", self.endpoint.token))
            .header("Accept", ACCEPT)
    }

    /// 非 2xx 响应转换为 [`MirrorError::Api`]
    async fn check(url: &str, resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(MirrorError::Api {
            status,
            url: url.to_string(),
            body,
        })
    }

    /// 第 `page` 页的地址；GitHub 认 `per_page`，Gitea 认 `limit`
    fn page_url(base: &str, page: usize) -> Result<Url> {
        Ok(Url::parse_with_params(
            base,
            &[
                ("per_page", PER_PAGE.to_string()),
                ("limit", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ],
        )?)
    }

    /// `Link` 头里的下一页地址必须和 API 根地址同源，令牌不能发往别处
    fn follow(&self, link: &str) -> Result<Url> {
        let next = Url::parse(link)?;
        if next.origin() != self.endpoint.api_url.origin() {
            return Err(MirrorError::Internal(format!(
                "pagination link {} leaves {}",
                next, self.endpoint.api_url
            )));
        }
        Ok(next)
    }
}

/// 从 `Link` 响应头得到的分页信息
#[derive(Debug, PartialEq, Eq)]
enum NextPage {
    /// `rel="next"` 指向的地址
    Link(String),
    /// 有 `Link` 头但没有 `rel="next"`
    Last,
    /// 没有 `Link` 头，只能逐页请求直到空页
    Unknown,
}

fn next_page(link: Option<&str>) -> NextPage {
    let Some(link) = link else {
        return NextPage::Unknown;
    };

    for entry in link.split(',') {
        let mut parts = entry.split(';').map(str::trim);
        let target = parts
            .next()
            .and_then(|t| t.strip_prefix('<'))
            .and_then(|t| t.strip_suffix('>'));
        if let Some(target) = target {
            if parts.any(|p| p == "rel=\"next\"" || p == "rel=next") {
                return NextPage::Link(target.to_string());
            }
        }
    }
    NextPage::Last
}

#[derive(Serialize)]
struct DefaultBranchPatch<'a> {
    default_branch: &'a str,
}

#[async_trait]
impl HostingPort for RestHostingClient {
    #[instrument(skip(self), fields(instance = %self.endpoint.instance_url))]
    async fn list_org_repositories(&self, org: &str) -> Result<Vec<RepositoryDescriptor>> {
        let base = self.url(&format!("orgs/{}/repos", org));
        let mut repos = Vec::new();
        let mut page = 1usize;
        let mut url = Self::page_url(&base, page)?;

        loop {
            let resp = self.authorized(self.http.get(url.clone())).send().await?;
            let next = next_page(resp.headers().get(LINK).and_then(|v| v.to_str().ok()));
            let batch: Vec<ApiRepository> = Self::check(url.as_str(), resp).await?.json().await?;
            let received = batch.len();

            debug!(page, received, "Fetched repository page");
            if received == 0 {
                break;
            }
            repos.extend(batch.into_iter().map(RepositoryDescriptor::from));

            page += 1;
            url = match next {
                NextPage::Link(link) => self.follow(&link)?,
                NextPage::Last => break,
                NextPage::Unknown => Self::page_url(&base, page)?,
            };
        }

        Ok(repos)
    }

    #[instrument(skip(self), fields(instance = %self.endpoint.instance_url))]
    async fn get_repository(&self, org: &str, name: &str) -> Result<Option<RepositoryDescriptor>> {
        let url = self.url(&format!("repos/{}/{}", org, name));
        let resp = self.authorized(self.http.get(&url)).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let repo: ApiRepository = Self::check(&url, resp).await?.json().await?;
        Ok(Some(repo.into()))
    }

    #[instrument(skip(self, repo), fields(instance = %self.endpoint.instance_url, name = %repo.name))]
    async fn create_repository(&self, org: &str, repo: &NewRepository) -> Result<RepositoryDescriptor> {
        let url = self.url(&format!("orgs/{}/repos", org));
        let resp = self
            .authorized(self.http.post(&url))
            .json(repo)
            .send()
            .await?;

        let created: ApiRepository = Self::check(&url, resp).await?.json().await?;
        Ok(created.into())
    }

    #[instrument(skip(self), fields(instance = %self.endpoint.instance_url))]
    async fn update_default_branch(
        &self,
        org: &str,
        name: &str,
        branch: &str,
    ) -> Result<RepositoryDescriptor> {
        let url = self.url(&format!("repos/{}/{}", org, name));
        let resp = self
            .authorized(self.http.patch(&url))
            .json(&DefaultBranchPatch {
                default_branch: branch,
            })
            .send()
            .await?;

        let updated: ApiRepository = Self::check(&url, resp).await?.json().await?;
        Ok(updated.into())
    }
}
