//! The normalized Event Record.
//!
//! One [`Event`] is built per inbound occurrence (or per synthesized replay)
//! through [`EventBuilder`], then frozen: the dispatcher and the restriction
//! evaluator only ever read it. Kind-specific data lives in optional fields and
//! in the attribute map, and every consumer matches exhaustively on
//! [`EventKind`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{BranchName, PullRequestId, RepositoryName, Revision};

/// Attribute keys the normalizer and the synthesized flows populate.
pub mod attributes {
    /// Repository full name; present on every event.
    pub const REPOSITORY: &str = "repository";
    /// Label that triggered a `labeled` event.
    pub const LABEL: &str = "label";
    /// Pull request number.
    pub const PR_NUMBER: &str = "pr_number";
    /// Pull request web URL.
    pub const PR_URL: &str = "pr_url";
    /// Login of the user who caused the event.
    pub const WHO: &str = "who";
    /// Branch or commit a release was cut from.
    pub const RELEASE_TARGET: &str = "release_target";
    /// Whether a release is flagged as a pre-release.
    pub const IS_PRERELEASE: &str = "is_prerelease";
}

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// The closed set of inbound occurrence types Relay reacts to.
///
/// The serialized names are part of the persisted registration layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Commits pushed to a branch.
    Push,
    /// A tag was pushed.
    Tag,
    /// A pull request was opened.
    PullRequestOpened,
    /// New commits were pushed to a pull request's head branch.
    PullRequestSynchronize,
    /// A label was added to a pull request.
    Labeled,
    /// A release was created.
    Release,
    /// A comment was posted on a pull request.
    Comment,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 7] = [
        EventKind::Push,
        EventKind::Tag,
        EventKind::PullRequestOpened,
        EventKind::PullRequestSynchronize,
        EventKind::Labeled,
        EventKind::Release,
        EventKind::Comment,
    ];

    /// Returns the serialized name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::Tag => "tag",
            EventKind::PullRequestOpened => "pull_request_opened",
            EventKind::PullRequestSynchronize => "pull_request_synchronize",
            EventKind::Labeled => "labeled",
            EventKind::Release => "release",
            EventKind::Comment => "comment",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Attribute values
// ---------------------------------------------------------------------------

/// A kind-specific attribute value carried by an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Free text (label names, URLs, numbers rendered as text).
    Text(String),
    /// A boolean flag (e.g. `is_prerelease`).
    Flag(bool),
}

impl AttributeValue {
    /// Returns the text value, or `None` for flags.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Flag(_) => None,
        }
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeValue::Text(s) => f.write_str(s),
            AttributeValue::Flag(b) => write!(f, "{b}"),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Flag(value)
    }
}

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// A normalized inbound occurrence.
///
/// Exactly one of `branch` / `tag` is meaningful depending on the kind:
/// push and pull-request kinds carry a branch, tag and release kinds carry a
/// tag. `revision` is always present but may be the deletion sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    kind: EventKind,
    repository: RepositoryName,
    branch: Option<BranchName>,
    revision: Revision,
    tag: Option<String>,
    pull_request: Option<PullRequestId>,
    changed_paths: BTreeSet<String>,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Event {
    /// Starts building an event of `kind` for `repository` at `revision`.
    pub fn builder(kind: EventKind, repository: RepositoryName, revision: Revision) -> EventBuilder {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            attributes::REPOSITORY.to_string(),
            AttributeValue::Text(repository.as_str().to_string()),
        );
        EventBuilder {
            event: Event {
                kind,
                repository,
                branch: None,
                revision,
                tag: None,
                pull_request: None,
                changed_paths: BTreeSet::new(),
                attributes: attrs,
            },
        }
    }

    /// Starts building a copy of this event re-labelled as `kind`.
    ///
    /// Used to synthesize derived events; every field and attribute is carried
    /// over and may be overridden on the returned builder.
    pub fn rekind(&self, kind: EventKind) -> EventBuilder {
        let mut event = self.clone();
        event.kind = kind;
        EventBuilder { event }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn repository(&self) -> &RepositoryName {
        &self.repository
    }

    pub fn branch(&self) -> Option<&BranchName> {
        self.branch.as_ref()
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn pull_request(&self) -> Option<PullRequestId> {
        self.pull_request
    }

    /// Paths added, removed or modified by a push. Empty for other kinds.
    pub fn changed_paths(&self) -> &BTreeSet<String> {
        &self.changed_paths
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// The label that triggered a `labeled` event, if any.
    pub fn label(&self) -> Option<&str> {
        self.attribute(attributes::LABEL)
            .and_then(AttributeValue::as_text)
    }

    /// Returns `true` when the event reports a deleted ref.
    pub fn is_deletion(&self) -> bool {
        self.revision.is_deletion()
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} on {} (branch: {}, revision: {}",
            self.kind,
            self.repository,
            self.branch.as_ref().map(BranchName::as_str).unwrap_or("-"),
            self.revision,
        )?;
        if let Some(tag) = &self.tag {
            write!(f, ", tag: {tag}")?;
        }
        if let Some(pr) = self.pull_request {
            write!(f, ", pr: #{pr}")?;
        }
        if !self.changed_paths.is_empty() {
            write!(f, ", {} changed paths", self.changed_paths.len())?;
        }
        f.write_str(")")
    }
}

/// First phase of the two-phase [`Event`] construction.
#[derive(Debug, Clone)]
#[must_use]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn branch(mut self, branch: Option<BranchName>) -> Self {
        self.event.branch = branch;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.event.tag = Some(tag.into());
        self
    }

    /// Records the pull request the event belongs to, also exposing its
    /// number as the `pr_number` attribute.
    pub fn pull_request(mut self, number: PullRequestId) -> Self {
        self.event.pull_request = Some(number);
        self.event.attributes.insert(
            attributes::PR_NUMBER.to_string(),
            AttributeValue::Text(number.to_string()),
        );
        self
    }

    /// Adds changed paths; duplicates collapse.
    pub fn changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event
            .changed_paths
            .extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.event.attributes.insert(key.into(), value.into());
        self
    }

    /// Freezes the event.
    pub fn build(self) -> Event {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepositoryName {
        RepositoryName::new("octo/widgets").unwrap()
    }

    fn rev() -> Revision {
        Revision::new("4f1c2a").unwrap()
    }

    #[test]
    fn repository_is_always_an_attribute() {
        let event = Event::builder(EventKind::Tag, repo(), rev()).build();
        assert_eq!(
            event.attribute(attributes::REPOSITORY),
            Some(&AttributeValue::Text("octo/widgets".into()))
        );
    }

    #[test]
    fn changed_paths_are_deduplicated() {
        let event = Event::builder(EventKind::Push, repo(), rev())
            .changed_paths(["a.rs", "b.rs"])
            .changed_paths(["a.rs"])
            .build();
        assert_eq!(event.changed_paths().len(), 2);
    }

    #[test]
    fn rekind_keeps_fields_and_allows_overrides() {
        let sync = Event::builder(EventKind::PullRequestSynchronize, repo(), rev())
            .branch(BranchName::new("feature"))
            .pull_request(PullRequestId::new(12))
            .build();

        let labeled = sync
            .rekind(EventKind::Labeled)
            .attribute(attributes::LABEL, "alpha")
            .build();

        assert_eq!(labeled.kind(), EventKind::Labeled);
        assert_eq!(labeled.branch().map(BranchName::as_str), Some("feature"));
        assert_eq!(labeled.pull_request(), Some(PullRequestId::new(12)));
        assert_eq!(labeled.label(), Some("alpha"));
        assert_eq!(sync.label(), None);
    }

    #[test]
    fn kinds_round_trip_through_their_names() {
        for kind in EventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn flags_render_as_lowercase_booleans() {
        assert_eq!(AttributeValue::Flag(true).to_string(), "true");
        assert_eq!(AttributeValue::from("x").to_string(), "x");
    }
}
