//! Port traits for everything the dispatcher reaches over the network.
//!
//! Infrastructure crates implement these; the dispatch domain never sees a
//! transport. Implementations are shared across all concurrent flows and must
//! tolerate concurrent outstanding calls on `&self`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{
    BranchName, EventKind, PullRequestId, Registration, RegistrationIdentity, RepositoryName,
    Revision, StoreError, TriggerError, TriggerInvocation, VcsError,
};

/// Lazy sequence of candidate registrations.
pub type RegistrationStream<'a> = BoxStream<'a, Result<Registration, StoreError>>;

// ---------------------------------------------------------------------------
// Registration store
// ---------------------------------------------------------------------------

/// Read side of the registration store; the only store access the dispatcher has.
pub trait RegistrationStore: Send + Sync {
    /// Streams every registration for `kind` on `repository`.
    ///
    /// Records are yielded lazily so memory stays bounded when a repository
    /// has many registrations.
    fn find<'a>(&'a self, kind: EventKind, repository: &'a RepositoryName)
        -> RegistrationStream<'a>;
}

/// Write side of the registration store, used by the registration API.
#[async_trait]
pub trait RegistrationWriter: Send + Sync {
    /// Stores `registration`, replacing any record with the same identity.
    async fn upsert(&self, registration: Registration) -> Result<(), StoreError>;

    /// Deletes the record with `identity`. Returns `false` if none existed.
    async fn remove(&self, identity: &RegistrationIdentity) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// VCS host
// ---------------------------------------------------------------------------

/// Head of a pull request as currently reported by the VCS host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestHead {
    pub branch: BranchName,
    pub revision: Revision,
}

/// Queries against the VCS host. Retries are the implementation's concern.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Returns `true` if at least one of `paths` exists in `repository` at `revision`.
    async fn file_exists_at_revision(
        &self,
        repository: &RepositoryName,
        revision: &Revision,
        paths: &[String],
    ) -> Result<bool, VcsError>;

    /// Lists the labels currently on a pull request, in the host's order.
    async fn list_pr_labels(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
    ) -> Result<Vec<String>, VcsError>;

    /// Resolves the current head branch and commit of a pull request.
    async fn get_pr_head(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
    ) -> Result<PullRequestHead, VcsError>;

    /// Adds `label` to a pull request.
    async fn add_pr_label(
        &self,
        repository: &RepositoryName,
        pull_request: PullRequestId,
        label: &str,
    ) -> Result<(), VcsError>;
}

// ---------------------------------------------------------------------------
// CI server
// ---------------------------------------------------------------------------

/// Starts CI jobs. Retries are the implementation's concern.
#[async_trait]
pub trait CiTriggerClient: Send + Sync {
    /// Requests one run of `invocation.job_name` on `invocation.ci_endpoint`
    /// with exactly `invocation.parameters`.
    async fn trigger(&self, invocation: &TriggerInvocation) -> Result<(), TriggerError>;
}
