use std::time::Duration;

use anyhow::Context;
use preview_instance::{PrDetails, PrNumber};

/// What the host needs to know about a PR when only its number is at hand
/// (e.g. a command comment on a PR the host has not seen yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestMeta {
    pub branch: String,
    pub source_repo: String,
    pub author: String,
}

impl PullRequestMeta {
    pub fn into_details(self, owner: &str, repo: &str, number: PrNumber) -> PrDetails {
        PrDetails {
            number,
            source_repo: self.source_repo,
            branch: self.branch,
            target_owner: owner.to_string(),
            target_repo: repo.to_string(),
            author: self.author,
        }
    }
}

#[async_trait::async_trait]
pub trait GithubApi: Send + Sync {
    async fn post_comment(
        &self,
        owner: &str,
        repo: &str,
        number: PrNumber,
        body: &str,
    ) -> anyhow::Result<()>;

    async fn pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: PrNumber,
    ) -> anyhow::Result<PullRequestMeta>;
}

pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("preview-host/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5 * 60))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            api_base: "https://api.github.com".to_string(),
            token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        })
    }

    /// The underlying HTTP client, shared with the archive fetcher.
    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{path}", self.api_base))
            .header("accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[derive(Debug, serde::Serialize)]
struct NewComment<'a> {
    body: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct GitHubPull {
    head: GitHubHead,
    user: GitHubUser,
}

#[derive(Debug, serde::Deserialize)]
struct GitHubHead {
    #[serde(rename = "ref")]
    git_ref: String,
    // Null when the fork the PR came from has been deleted.
    repo: Option<GitHubRepo>,
}

#[derive(Debug, serde::Deserialize)]
struct GitHubRepo {
    full_name: String,
}

#[derive(Debug, serde::Deserialize)]
struct GitHubUser {
    login: String,
}

fn pull_meta(pull: GitHubPull) -> anyhow::Result<PullRequestMeta> {
    let repo = pull
        .head
        .repo
        .ok_or_else(|| anyhow::anyhow!("head repository no longer exists"))?;
    Ok(PullRequestMeta {
        branch: pull.head.git_ref,
        source_repo: repo.full_name,
        author: pull.user.login,
    })
}

#[async_trait::async_trait]
impl GithubApi for GithubClient {
    async fn post_comment(
        &self,
        owner: &str,
        repo: &str,
        number: PrNumber,
        body: &str,
    ) -> anyhow::Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/repos/{owner}/{repo}/issues/{number}/comments"),
        )
        .json(&NewComment { body })
        .send()
        .await
        .context("post issue comment")?
        .error_for_status()
        .context("issue comment returned non-2xx")?;
        Ok(())
    }

    async fn pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: PrNumber,
    ) -> anyhow::Result<PullRequestMeta> {
        let pull = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/pulls/{number}"),
            )
            .send()
            .await
            .context("request pull request")?
            .error_for_status()
            .context("pull request returned non-2xx")?
            .json::<GitHubPull>()
            .await
            .context("parse pull request json")?;
        pull_meta(pull)
    }
}
