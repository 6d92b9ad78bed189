//! Event Normalizer: raw webhook payload → [`Event`].
//!
//! # Parsing Strategy
//!
//! 1. The event family comes from the transport header (`X-GitHub-Event`).
//! 2. The payload's `action` (or `ref` for pushes) selects the [`EventKind`].
//! 3. Families and actions Relay does not act on return `Ok(None)`.
//! 4. A payload missing a field its kind requires returns
//!    [`DispatchError::MalformedPayload`].
//!
//! Comments are not turned into events here; they come back as a
//! [`PullRequestComment`] for the comment command parser. Nothing in this
//! module touches the network.

use serde::Deserialize;
use serde_json::Value;

use crate::event::attributes;
use crate::{
    BranchName, DispatchError, Event, EventKind, PullRequestId, RepositoryName, Revision,
};

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const TAG_REF_PREFIX: &str = "refs/tags/";

/// What an inbound payload normalizes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A directly dispatchable event.
    Event(Event),
    /// A pull request comment, to be interpreted by the command parser.
    Comment(PullRequestComment),
}

/// A comment posted on a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestComment {
    pub repository: RepositoryName,
    pub pull_request: PullRequestId,
    pub body: String,
    /// Labels on the pull request when the comment was posted, in host order.
    pub labels: Vec<String>,
    pub author: Option<String>,
}

/// Normalizes a payload delivered with the transport event name `event`.
pub fn normalize(event: &str, payload: &Value) -> Result<Option<Inbound>, DispatchError> {
    match event {
        "push" => normalize_push(payload).map(|e| e.map(Inbound::Event)),
        "pull_request" => normalize_pull_request(payload).map(|e| e.map(Inbound::Event)),
        "release" => normalize_release(payload).map(|e| e.map(Inbound::Event)),
        "issue_comment" => normalize_comment(payload).map(|c| c.map(Inbound::Comment)),
        _ => Ok(None),
    }
}

// ============================================================================
// Raw payload structures
//
// These mirror the host's webhook JSON. Only fields Relay reads are declared;
// unknown fields are ignored.
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

fn action(payload: &Value) -> Option<&str> {
    payload.get("action").and_then(Value::as_str)
}

fn parse<'a, T: Deserialize<'a>>(event: &str, payload: &'a Value) -> Result<T, DispatchError> {
    T::deserialize(payload).map_err(|e| DispatchError::malformed(event, e.to_string()))
}

fn repository(event: &str, raw: &RawRepository) -> Result<RepositoryName, DispatchError> {
    RepositoryName::new(raw.full_name.as_str())
        .ok_or_else(|| DispatchError::malformed(event, "repository.full_name is empty"))
}

fn revision(event: &str, field: &str, raw: &str) -> Result<Revision, DispatchError> {
    Revision::new(raw).ok_or_else(|| DispatchError::malformed(event, format!("{field} is empty")))
}

// ============================================================================
// push
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: RawRepository,
    #[serde(default)]
    commits: Vec<RawCommit>,
    sender: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
}

fn normalize_push(payload: &Value) -> Result<Option<Event>, DispatchError> {
    const EVENT: &str = "push";
    let raw: RawPushPayload = parse(EVENT, payload)?;
    let repo = repository(EVENT, &raw.repository)?;
    let rev = revision(EVENT, "after", &raw.after)?;

    let builder = if let Some(branch) = raw.git_ref.strip_prefix(BRANCH_REF_PREFIX) {
        let changes = raw
            .commits
            .into_iter()
            .flat_map(|c| c.added.into_iter().chain(c.removed).chain(c.modified));
        Event::builder(EventKind::Push, repo, rev)
            .branch(BranchName::new(branch))
            .changed_paths(changes)
    } else if let Some(tag) = raw.git_ref.strip_prefix(TAG_REF_PREFIX) {
        Event::builder(EventKind::Tag, repo, rev).tag(tag)
    } else {
        return Ok(None);
    };

    Ok(Some(with_sender(builder, raw.sender).build()))
}

// ============================================================================
// pull_request
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    pull_request: RawPullRequest,
    repository: RawRepository,
    label: Option<RawLabel>,
    sender: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: u64,
    html_url: Option<String>,
    head: RawHead,
}

#[derive(Debug, Deserialize)]
struct RawHead {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
    // Null once the fork the pull request came from is deleted.
    repo: Option<RawRepository>,
}

fn normalize_pull_request(payload: &Value) -> Result<Option<Event>, DispatchError> {
    const EVENT: &str = "pull_request";
    let kind = match action(payload) {
        Some("opened") => EventKind::PullRequestOpened,
        Some("synchronize") => EventKind::PullRequestSynchronize,
        Some("labeled") => EventKind::Labeled,
        _ => return Ok(None),
    };

    let raw: RawPullRequestPayload = parse(EVENT, payload)?;
    let repo = repository(EVENT, raw.pull_request.head.repo.as_ref().unwrap_or(&raw.repository))?;
    let rev = revision(EVENT, "pull_request.head.sha", &raw.pull_request.head.sha)?;

    let mut builder = Event::builder(kind, repo, rev)
        .branch(BranchName::new(raw.pull_request.head.git_ref))
        .pull_request(PullRequestId::new(raw.pull_request.number));
    if let Some(url) = raw.pull_request.html_url {
        builder = builder.attribute(attributes::PR_URL, url);
    }
    if kind == EventKind::Labeled {
        let label = raw
            .label
            .ok_or_else(|| DispatchError::malformed(EVENT, "labeled action without label"))?;
        builder = builder.attribute(attributes::LABEL, label.name);
    }

    Ok(Some(with_sender(builder, raw.sender).build()))
}

// ============================================================================
// release
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawReleasePayload {
    release: RawRelease,
    repository: RawRepository,
    sender: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawRelease {
    tag_name: String,
    target_commitish: Option<String>,
    #[serde(default)]
    prerelease: bool,
}

fn normalize_release(payload: &Value) -> Result<Option<Event>, DispatchError> {
    const EVENT: &str = "release";
    if action(payload) != Some("created") {
        return Ok(None);
    }

    let raw: RawReleasePayload = parse(EVENT, payload)?;
    let repo = repository(EVENT, &raw.repository)?;
    // Releases have no pushed commit of their own; files are looked up at the tag.
    let rev = revision(EVENT, "release.tag_name", &raw.release.tag_name)?;

    let builder = Event::builder(EventKind::Release, repo, rev)
        .tag(raw.release.tag_name)
        .attribute(attributes::IS_PRERELEASE, raw.release.prerelease)
        .attribute(
            attributes::RELEASE_TARGET,
            raw.release.target_commitish.unwrap_or_default(),
        );

    Ok(Some(with_sender(builder, raw.sender).build()))
}

// ============================================================================
// issue_comment
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawCommentPayload {
    comment: RawComment,
    issue: RawIssue,
    repository: RawRepository,
    sender: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    // Present only when the issue is a pull request.
    pull_request: Option<Value>,
    #[serde(default)]
    labels: Vec<RawLabel>,
}

/// Extracts a newly created pull request comment.
///
/// Edited and deleted comments, and comments on plain issues, return `Ok(None)`.
pub fn normalize_comment(payload: &Value) -> Result<Option<PullRequestComment>, DispatchError> {
    const EVENT: &str = "issue_comment";
    if action(payload) != Some("created") {
        return Ok(None);
    }

    let raw: RawCommentPayload = parse(EVENT, payload)?;
    if raw.issue.pull_request.is_none() {
        return Ok(None);
    }

    Ok(Some(PullRequestComment {
        repository: repository(EVENT, &raw.repository)?,
        pull_request: PullRequestId::new(raw.issue.number),
        body: raw.comment.body.unwrap_or_default(),
        labels: raw.issue.labels.into_iter().map(|l| l.name).collect(),
        author: raw.sender.map(|s| s.login),
    }))
}

fn with_sender(builder: crate::EventBuilder, sender: Option<RawUser>) -> crate::EventBuilder {
    match sender {
        Some(user) => builder.attribute(attributes::WHO, user.login),
        None => builder,
    }
}
