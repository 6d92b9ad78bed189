//! In-memory fakes for the port traits (testing only).
//!
//! Provides `FakeRegistrationStore`, `FakeVcsClient` and
//! `RecordingTriggerClient` that satisfy the port contracts without any
//! network access, and record what they were asked so tests can assert on it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::errors::RetryPolicy;
use crate::ports::*;
use crate::{
    EventKind, JobName, PullRequestId, Registration, RegistrationIdentity, RepositoryName,
    Revision, StoreError, TriggerError, TriggerInvocation, VcsError,
};

// ---------------------------------------------------------------------------
// FakeRegistrationStore
// ---------------------------------------------------------------------------

/// In-memory registration store backed by a `Vec<Registration>`.
#[derive(Debug, Default)]
pub struct FakeRegistrationStore {
    registrations: Mutex<Vec<Registration>>,
    queries: AtomicUsize,
    unavailable: AtomicBool,
}

impl FakeRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(registrations: impl IntoIterator<Item = Registration>) -> Self {
        let store = Self::new();
        store
            .registrations
            .lock()
            .unwrap()
            .extend(registrations);
        store
    }

    /// Number of `find` calls made so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn make_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("fake store is offline".to_string()));
        }
        Ok(())
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap().clone()
    }
}

impl RegistrationStore for FakeRegistrationStore {
    fn find<'a>(
        &'a self,
        kind: EventKind,
        repository: &'a RepositoryName,
    ) -> RegistrationStream<'a> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.check_available() {
            return stream::iter([Err(err)]).boxed();
        }
        let matches: Vec<_> = self
            .registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.event_kind == kind && &r.repository == repository)
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(matches).boxed()
    }
}

#[async_trait]
impl RegistrationWriter for FakeRegistrationStore {
    async fn upsert(&self, registration: Registration) -> Result<(), StoreError> {
        self.check_available()?;
        let mut registrations = self.registrations.lock().unwrap();
        let identity = registration.identity();
        registrations.retain(|r| r.identity() != identity);
        registrations.push(registration);
        Ok(())
    }

    async fn remove(&self, identity: &RegistrationIdentity) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut registrations = self.registrations.lock().unwrap();
        let before = registrations.len();
        registrations.retain(|r| &r.identity() != identity);
        Ok(registrations.len() != before)
    }
}

// ---------------------------------------------------------------------------
// FakeVcsClient
// ---------------------------------------------------------------------------

/// A call received by [`FakeVcsClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    FileExists {
        repository: RepositoryName,
        revision: Revision,
        paths: Vec<String>,
    },
    ListLabels(RepositoryName, PullRequestId),
    GetHead(RepositoryName, PullRequestId),
    AddLabel(RepositoryName, PullRequestId, String),
}

type PrKey = (RepositoryName, u64);

/// In-memory VCS host.
///
/// Unknown pull requests have no labels; asking for the head of one fails
/// with a 404.
#[derive(Debug, Default)]
pub struct FakeVcsClient {
    files: Mutex<HashMap<(RepositoryName, Revision), BTreeSet<String>>>,
    labels: Mutex<HashMap<PrKey, Vec<String>>>,
    heads: Mutex<HashMap<PrKey, PullRequestHead>>,
    calls: Mutex<Vec<VcsCall>>,
    failing: AtomicBool,
}

impl FakeVcsClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, repository: &RepositoryName, revision: &Revision, path: &str) {
        self.files
            .lock()
            .unwrap()
            .entry((repository.clone(), revision.clone()))
            .or_default()
            .insert(path.to_string());
    }

    pub fn set_labels(&self, repository: &RepositoryName, pull_request: PullRequestId, labels: &[&str]) {
        self.labels.lock().unwrap().insert(
            (repository.clone(), pull_request.as_u64()),
            labels.iter().map(|l| l.to_string()).collect(),
        );
    }

    pub fn set_head(&self, repository: &RepositoryName, pull_request: PullRequestId, head: PullRequestHead) {
        self.heads
            .lock()
            .unwrap()
            .insert((repository.clone(), pull_request.as_u64()), head);
    }

    /// Labels currently on a pull request, including ones added through the port.
    pub fn labels(&self, repository: &RepositoryName, pull_request: PullRequestId) -> Vec<String> {
        self.labels
            .lock()
            .unwrap()
            .get(&(repository.clone(), pull_request.as_u64()))
            .cloned()
            .unwrap_or_default()
    }

    /// Makes every subsequent call fail with a 503.
    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, call: VcsCall) -> Result<(), VcsError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(VcsError::Status {
                operation,
                status: 503,
                message: "fake VCS host is down".to_string(),
                retry: RetryPolicy::Retryable { after: None },
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VcsClient for FakeVcsClient {
    async fn file_exists_at_revision(
        &self,
        repository: &RepositoryName,
        revision: &Revision,
        paths: &[String],
    ) -> Result<bool, VcsError> {
        self.record(
            "file_exists_at_revision",
            VcsCall::FileExists {
                repository: repository.clone(),
                revision: revision.clone(),
                paths: paths.to_vec(),
            },
        )?;
        let files = self.files.lock().unwrap();
        Ok(files
            .get(&(repository.clone(), revision.clone()))
            .is_some_and(|present| paths.iter().any(|p| present.contains(p))))
    }

    async fn list_pr_labels(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
    ) -> Result<Vec<String>, VcsError> {
        self.record("list_pr_labels", VcsCall::ListLabels(repository.clone(), pull_request))?;
        Ok(self.labels(repository, pull_request))
    }

    async fn get_pr_head(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
    ) -> Result<PullRequestHead, VcsError> {
        self.record("get_pr_head", VcsCall::GetHead(repository.clone(), pull_request))?;
        self.heads
            .lock()
            .unwrap()
            .get(&(repository.clone(), pull_request.as_u64()))
            .cloned()
            .ok_or_else(|| VcsError::Status {
                operation: "get_pr_head",
                status: 404,
                message: format!("pull request {repository}#{pull_request} not found"),
                retry: RetryPolicy::NonRetryable,
            })
    }

    async fn add_pr_label(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
        label: &str,
    ) -> Result<(), VcsError> {
        self.record(
            "add_pr_label",
            VcsCall::AddLabel(repository.clone(), pull_request, label.to_string()),
        )?;
        self.labels
            .lock()
            .unwrap()
            .entry((repository.clone(), pull_request.as_u64()))
            .or_default()
            .push(label.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingTriggerClient
// ---------------------------------------------------------------------------

/// CI client that records every invocation instead of starting jobs.
#[derive(Debug, Default)]
pub struct RecordingTriggerClient {
    invocations: Mutex<Vec<TriggerInvocation>>,
    failing_jobs: Mutex<HashSet<JobName>>,
    latency: Mutex<Option<Duration>>,
    completed: AtomicUsize,
}

impl RecordingTriggerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes triggers of `job` fail with a 500 (still recorded).
    pub fn fail_job(&self, job: &str) {
        if let Some(job) = JobName::new(job) {
            self.failing_jobs.lock().unwrap().insert(job);
        }
    }

    /// Makes every trigger call take `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Invocations recorded when each call started.
    pub fn invocations(&self) -> Vec<TriggerInvocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of trigger calls that ran to the end.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Invocations of `job`, in the order they were made.
    pub fn invocations_of(&self, job: &str) -> Vec<TriggerInvocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.job_name.as_str() == job)
            .collect()
    }
}

#[async_trait]
impl CiTriggerClient for RecordingTriggerClient {
    async fn trigger(&self, invocation: &TriggerInvocation) -> Result<(), TriggerError> {
        self.invocations.lock().unwrap().push(invocation.clone());
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.failing_jobs.lock().unwrap().contains(&invocation.job_name) {
            return Err(TriggerError::Rejected {
                job: invocation.job_name.clone(),
                status: 500,
                message: "fake CI server failure".to_string(),
                retry: RetryPolicy::Retryable { after: None },
            });
        }
        Ok(())
    }
}
