use std::time::Duration;

use async_trait::async_trait;
use dispatch::{
    parse_retry_after, Backoff, BranchName, PullRequestHead, PullRequestId, RepositoryName,
    RetryPolicy, Revision, VcsClient, VcsError,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Public GitHub API root.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const MEDIA_TYPE: &str = "application/vnd.github+json";
const ERROR_BODY_LIMIT: usize = 512;
const LABELS_PER_PAGE: usize = 100;

/// Connection settings for [`GithubClient`].
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// API root, without a trailing slash (e.g. `https://ghe.example.com/api/v3`).
    pub api_base: String,
    /// Token sent as `Authorization: Bearer`.
    pub token: String,
    pub request_timeout: Duration,
    pub backoff: Backoff,
}

impl GithubConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            request_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

/// Failure building a [`GithubClient`].
#[derive(Debug, Error)]
pub enum GithubClientError {
    #[error("GitHub token contains characters not allowed in a header")]
    InvalidToken,

    #[error("failed to build GitHub HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// [`VcsClient`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    backoff: Backoff,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    head: HeadResponse,
}

#[derive(Debug, Deserialize)]
struct HeadResponse {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

impl GithubClient {
    pub fn new(config: GithubConfig) -> Result<Self, GithubClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("relay-dispatch"));
        headers.insert(ACCEPT, HeaderValue::from_static(MEDIA_TYPE));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token.trim()))
            .map_err(|_| GithubClientError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Contents API URL for `path`, each segment percent-encoded.
    fn contents_url(&self, repository: &RepositoryName, path: &str) -> Result<Url, VcsError> {
        let invalid = |message: String| VcsError::Transport {
            operation: "file_exists_at_revision",
            message,
        };
        let mut url = Url::parse(&self.url(&format!("/repos/{repository}/contents")))
            .map_err(|e| invalid(format!("invalid contents URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| invalid(format!("API base {} cannot hold a path", self.api_base)))?
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        Ok(url)
    }

    /// Sends a request, retrying retryable failures per the back-off schedule.
    ///
    /// Returns the response when it succeeded or its status is in `tolerated`.
    async fn send<F>(
        &self,
        operation: &'static str,
        tolerated: &[StatusCode],
        request: F,
    ) -> Result<Response, VcsError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match request().send().await {
                Ok(response)
                    if response.status().is_success()
                        || tolerated.contains(&response.status()) =>
                {
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after = parse_retry_after(
                        response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok()),
                    );
                    let body = response.text().await.unwrap_or_default();
                    VcsError::Status {
                        operation,
                        status,
                        message: truncate(&body),
                        retry: RetryPolicy::from_status(status, retry_after),
                    }
                }
                Err(e) => VcsError::Transport {
                    operation,
                    message: e.to_string(),
                },
            };

            match self.backoff.delay(attempt, &error.retry_policy()) {
                Some(delay) => {
                    warn!(operation, attempt, ?delay, %error, "GitHub request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<T, VcsError> {
        let url = self.url(path);
        let response = self.send(operation, &[], || self.http.get(&url)).await?;
        response.json::<T>().await.map_err(|e| VcsError::Decode {
            operation,
            message: e.to_string(),
        })
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

#[async_trait]
impl VcsClient for GithubClient {
    async fn file_exists_at_revision(
        &self,
        repository: &RepositoryName,
        revision: &Revision,
        paths: &[String],
    ) -> Result<bool, VcsError> {
        for path in paths {
            let url = self.contents_url(repository, path)?;
            let response = self
                .send("file_exists_at_revision", &[StatusCode::NOT_FOUND], || {
                    self.http.get(url.clone()).query(&[("ref", revision.as_str())])
                })
                .await?;
            if response.status().is_success() {
                debug!(%repository, %revision, path, "file present");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Walks the label pages until one comes back short.
    async fn list_pr_labels(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
    ) -> Result<Vec<String>, VcsError> {
        let mut names = Vec::new();
        for page in 1.. {
            let labels: Vec<LabelResponse> = self
                .get_json(
                    "list_pr_labels",
                    &format!(
                        "/repos/{repository}/issues/{pull_request}/labels?per_page={LABELS_PER_PAGE}&page={page}"
                    ),
                )
                .await?;
            let last = labels.len() < LABELS_PER_PAGE;
            names.extend(labels.into_iter().map(|l| l.name));
            if last {
                break;
            }
        }
        Ok(names)
    }

    async fn get_pr_head(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
    ) -> Result<PullRequestHead, VcsError> {
        const OPERATION: &str = "get_pr_head";
        let pull: PullResponse = self
            .get_json(OPERATION, &format!("/repos/{repository}/pulls/{pull_request}"))
            .await?;
        let missing = |field: &str| VcsError::Decode {
            operation: OPERATION,
            message: format!("pull request head has an empty {field}"),
        };
        Ok(PullRequestHead {
            branch: BranchName::new(pull.head.git_ref).ok_or_else(|| missing("ref"))?,
            revision: Revision::new(pull.head.sha).ok_or_else(|| missing("sha"))?,
        })
    }

    async fn add_pr_label(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
        label: &str,
    ) -> Result<(), VcsError> {
        let url = self.url(&format!("/repos/{repository}/issues/{pull_request}/labels"));
        let body = serde_json::json!({ "labels": [label] });
        self.send("add_pr_label", &[], || self.http.post(&url).json(&body))
            .await?;
        Ok(())
    }
}
