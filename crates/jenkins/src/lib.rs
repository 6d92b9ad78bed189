//! Relay Jenkins infrastructure adapter.
//!
//! Implements the [`dispatch::CiTriggerClient`] port over the Jenkins remote
//! build API. Several Jenkins servers may be configured; each registration's
//! `ci_endpoint` selects one by its base URL.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Job path encoding, credentials and retries live here.
//!
//! ## Requests
//!
//! A job named `team/deploy` on `https://ci.example.com` is started with
//! `POST https://ci.example.com/job/team/job/deploy/buildWithParameters`
//! (form-encoded parameters) or `.../build` when it has no parameters, using
//! HTTP basic auth with the instance's user and API token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dispatch::{
    parse_retry_after, Backoff, CiEndpoint, CiTriggerClient, JobName, RetryPolicy, TriggerError,
    TriggerInvocation,
};
use reqwest::header::RETRY_AFTER;
use thiserror::Error;
use tracing::{debug, warn};

const ERROR_BODY_LIMIT: usize = 512;

/// Credentials for one Jenkins server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JenkinsInstance {
    /// Base URL; matched against registrations' `ci_endpoint`.
    pub url: String,
    pub user: String,
    pub api_token: String,
}

#[derive(Debug, Clone)]
pub struct JenkinsConfig {
    pub instances: Vec<JenkinsInstance>,
    pub request_timeout: Duration,
    pub backoff: Backoff,
}

/// Failure building a [`JenkinsClient`].
#[derive(Debug, Error)]
pub enum JenkinsClientError {
    #[error("Jenkins instance URL must not be empty")]
    EmptyUrl,

    #[error("Jenkins instance {0} is configured more than once")]
    DuplicateInstance(String),

    #[error("failed to build Jenkins HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
struct Credentials {
    base: String,
    user: String,
    api_token: String,
}

/// [`CiTriggerClient`] for one or more Jenkins servers.
#[derive(Debug, Clone)]
pub struct JenkinsClient {
    http: reqwest::Client,
    instances: HashMap<String, Credentials>,
    backoff: Backoff,
}

/// Normalizes an endpoint for lookup: trailing slashes are insignificant.
fn endpoint_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Maps a folder-qualified job name to its URL path: `a/b` → `/job/a/job/b`.
pub fn job_path(job: &JobName) -> String {
    job.as_str()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("/job/{segment}"))
        .collect()
}

impl JenkinsClient {
    pub fn new(config: JenkinsConfig) -> Result<Self, JenkinsClientError> {
        let mut instances = HashMap::new();
        for instance in config.instances {
            let key = endpoint_key(&instance.url);
            if key.is_empty() {
                return Err(JenkinsClientError::EmptyUrl);
            }
            let credentials = Credentials {
                base: key.clone(),
                user: instance.user,
                api_token: instance.api_token,
            };
            if instances.insert(key.clone(), credentials).is_some() {
                return Err(JenkinsClientError::DuplicateInstance(key));
            }
        }

        let http = reqwest::Client::builder()
            .user_agent("relay-dispatch")
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            instances,
            backoff: config.backoff,
        })
    }

    /// Returns `true` if `endpoint` names a configured instance.
    pub fn knows(&self, endpoint: &CiEndpoint) -> bool {
        self.instances.contains_key(&endpoint_key(endpoint.as_str()))
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

#[async_trait]
impl CiTriggerClient for JenkinsClient {
    async fn trigger(&self, invocation: &TriggerInvocation) -> Result<(), TriggerError> {
        let credentials = self
            .instances
            .get(&endpoint_key(invocation.ci_endpoint.as_str()))
            .ok_or_else(|| TriggerError::UnknownEndpoint(invocation.ci_endpoint.clone()))?;

        let action = if invocation.parameters.is_empty() {
            "build"
        } else {
            "buildWithParameters"
        };
        let url = format!(
            "{}{}/{action}",
            credentials.base,
            job_path(&invocation.job_name)
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self
                .http
                .post(&url)
                .basic_auth(&credentials.user, Some(&credentials.api_token));
            if !invocation.parameters.is_empty() {
                request = request.form(&invocation.parameters);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(job = %invocation.job_name, url, "Jenkins accepted build request");
                    return Ok(());
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
                    TriggerError::Rejected {
                        job: invocation.job_name.clone(),
                        status,
                        message: truncate(&body),
                        retry: RetryPolicy::from_status(status, retry_after),
                    }
                }
                Err(e) => TriggerError::Transport {
                    job: invocation.job_name.clone(),
                    message: e.to_string(),
                },
            };

            match self.backoff.delay(attempt, &error.retry_policy()) {
                Some(delay) => {
                    warn!(job = %invocation.job_name, attempt, ?delay, %error, "Jenkins trigger failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            }
        }
    }
}
