//! Trigger Dispatcher: the orchestrating core.
//!
//! Receives normalized input, queries the registration store, evaluates
//! restrictions per candidate, builds parameters and fires triggers. Also owns
//! the derived flows: synchronize fan-out, comment-driven resyncs and
//! ephemeral comment triggers.
//!
//! # Outcome per inbound occurrence
//!
//! ```text
//! normalize ──None──────────────────────────────► Ignored
//!     │
//!     ▼
//! deleted ref? ──yes────────────────────────────► Suppressed
//!     │
//!     ▼
//! find(kind, repo) ─► should_trigger ─► trigger ─► Dispatched { triggered, failed }
//!                     (per candidate, concurrent)  (or Ignored if none passed)
//! ```
//!
//! Trigger failures are isolated per candidate and counted in
//! [`DispatchOutcome::Dispatched::failed`]. Store and VCS failures fail the
//! whole call, but only once every candidate already in flight has finished;
//! a started trigger is never cancelled.

use std::sync::Arc;

use futures::future;
use futures::stream::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument, warn, Instrument, Span};

use crate::commands::{parse_comment, CommandSettings, CommentCommand};
use crate::event::attributes;
use crate::normalizer::{normalize, normalize_comment, Inbound, PullRequestComment};
use crate::params::build_parameters;
use crate::restrictions::should_trigger;
use crate::{
    CiEndpoint, CiTriggerClient, DispatchError, DispatchId, Event, EventKind, Registration,
    RegistrationStore, TriggerInvocation, VcsClient,
};

/// Default number of candidates evaluated and triggered at once per event.
pub const DEFAULT_MAX_CONCURRENT_TRIGGERS: usize = 8;

// ---------------------------------------------------------------------------
// Settings and outcome
// ---------------------------------------------------------------------------

/// Behaviour switches for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Comment grammar and marker labels.
    pub commands: CommandSettings,
    /// CI server that ephemeral comment triggers run on.
    pub comment_endpoint: CiEndpoint,
    /// Upper bound on candidates in flight for one event.
    pub max_concurrent_triggers: usize,
    /// Add the resync marker to pull requests when they are opened.
    pub label_opened_pull_requests: bool,
}

impl DispatchSettings {
    pub fn new(comment_endpoint: CiEndpoint) -> Self {
        Self {
            commands: CommandSettings::default(),
            comment_endpoint,
            max_concurrent_triggers: DEFAULT_MAX_CONCURRENT_TRIGGERS,
            label_opened_pull_requests: false,
        }
    }
}

/// Terminal state of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// At least one candidate passed its restrictions.
    Dispatched {
        /// Trigger calls that succeeded.
        triggered: usize,
        /// Trigger calls that failed; isolated, never fatal.
        failed: usize,
    },
    /// The event reported a deleted ref; nothing was evaluated.
    Suppressed,
    /// Nothing to do: unknown input, no command, or no matching registration.
    Ignored,
}

impl DispatchOutcome {
    /// Merges the outcomes of two flows derived from the same occurrence.
    pub fn combine(self, other: DispatchOutcome) -> DispatchOutcome {
        use DispatchOutcome::*;
        match (self, other) {
            (
                Dispatched { triggered: t1, failed: f1 },
                Dispatched { triggered: t2, failed: f2 },
            ) => Dispatched {
                triggered: t1 + t2,
                failed: f1 + f2,
            },
            (d @ Dispatched { .. }, _) | (_, d @ Dispatched { .. }) => d,
            (Suppressed, _) | (_, Suppressed) => Suppressed,
            (Ignored, Ignored) => Ignored,
        }
    }

    /// Number of successful trigger calls.
    pub fn triggered(&self) -> usize {
        match self {
            DispatchOutcome::Dispatched { triggered, .. } => *triggered,
            _ => 0,
        }
    }
}

/// Result of one candidate registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Skipped,
    Triggered,
    Failed,
}

#[derive(Debug, Default)]
struct Tally {
    triggered: usize,
    failed: usize,
}

impl Tally {
    fn add(mut self, candidate: Candidate) -> Self {
        match candidate {
            Candidate::Skipped => {}
            Candidate::Triggered => self.triggered += 1,
            Candidate::Failed => self.failed += 1,
        }
        self
    }

    fn outcome(self) -> DispatchOutcome {
        if self.triggered + self.failed == 0 {
            DispatchOutcome::Ignored
        } else {
            DispatchOutcome::Dispatched {
                triggered: self.triggered,
                failed: self.failed,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Completion signal
// ---------------------------------------------------------------------------

/// Handle to a dispatch running in the background.
///
/// Dropping the ticket detaches the dispatch; it still runs to completion.
#[derive(Debug)]
pub struct DispatchTicket {
    id: DispatchId,
    handle: JoinHandle<Result<DispatchOutcome, DispatchError>>,
}

impl DispatchTicket {
    pub fn dispatch_id(&self) -> DispatchId {
        self.id
    }

    /// Waits for the dispatch to finish.
    pub async fn outcome(self) -> Result<DispatchOutcome, DispatchError> {
        self.handle
            .await
            .map_err(|e| DispatchError::TaskFailed(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// The dispatch engine. Cheap to clone; clones share the same ports.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn RegistrationStore>,
    vcs: Arc<dyn VcsClient>,
    ci: Arc<dyn CiTriggerClient>,
    settings: Arc<DispatchSettings>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn dispatch_span(id: DispatchId, event: &str) -> Span {
    info_span!("dispatch", dispatch_id = %id, event)
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        vcs: Arc<dyn VcsClient>,
        ci: Arc<dyn CiTriggerClient>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            vcs,
            ci,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Normalizes and dispatches one webhook delivery, waiting for the result.
    ///
    /// `event` is the transport event name (`X-GitHub-Event`). Comment
    /// deliveries are routed to the comment flow.
    pub async fn handle_event(
        &self,
        event: &str,
        payload: &Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let span = dispatch_span(DispatchId::new_random(), event);
        let inbound = span.in_scope(|| normalize(event, payload))?;
        self.process(inbound).instrument(span).await
    }

    /// Handles one `issue_comment` payload, waiting for the result.
    pub async fn handle_comment(&self, payload: &Value) -> Result<DispatchOutcome, DispatchError> {
        let span = dispatch_span(DispatchId::new_random(), "issue_comment");
        let comment = span.in_scope(|| normalize_comment(payload))?;
        self.process(comment.map(Inbound::Comment))
            .instrument(span)
            .await
    }

    /// Normalizes a webhook delivery now and dispatches it in the background.
    ///
    /// Malformed payloads fail here; everything after normalization is
    /// reported through the returned ticket.
    pub fn submit_event(&self, event: &str, payload: &Value) -> Result<DispatchTicket, DispatchError> {
        let id = DispatchId::new_random();
        let span = dispatch_span(id, event);
        let inbound = span.in_scope(|| normalize(event, payload))?;
        Ok(self.spawn(id, span, inbound))
    }

    /// Comment counterpart of [`Dispatcher::submit_event`].
    pub fn submit_comment(&self, payload: &Value) -> Result<DispatchTicket, DispatchError> {
        let id = DispatchId::new_random();
        let span = dispatch_span(id, "issue_comment");
        let comment = span.in_scope(|| normalize_comment(payload))?;
        Ok(self.spawn(id, span, comment.map(Inbound::Comment)))
    }

    fn spawn(&self, id: DispatchId, span: Span, inbound: Option<Inbound>) -> DispatchTicket {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.process(inbound).await }.instrument(span));
        DispatchTicket { id, handle }
    }

    async fn process(&self, inbound: Option<Inbound>) -> Result<DispatchOutcome, DispatchError> {
        match inbound {
            None => {
                info!("event is not one Relay acts on");
                Ok(DispatchOutcome::Ignored)
            }
            Some(Inbound::Event(event)) => self.process_event(event).await,
            Some(Inbound::Comment(comment)) => self.process_comment(comment).await,
        }
    }

    async fn process_event(&self, event: Event) -> Result<DispatchOutcome, DispatchError> {
        match event.kind() {
            EventKind::PullRequestOpened => {
                self.label_opened(&event).await;
                self.dispatch(&event).await
            }
            EventKind::PullRequestSynchronize => self.synchronize(&event).await,
            _ => self.dispatch(&event).await,
        }
    }

    async fn label_opened(&self, event: &Event) {
        let Some(pull_request) = event.pull_request() else {
            return;
        };
        if !self.settings.label_opened_pull_requests {
            return;
        }
        let label = &self.settings.commands.resync_label;
        if let Err(error) = self
            .vcs
            .add_pr_label(event.repository(), pull_request, label)
            .await
        {
            warn!(%error, pull_request = %pull_request, label, "could not label opened pull request");
        }
    }

    // -----------------------------------------------------------------------
    // Registered dispatch
    // -----------------------------------------------------------------------

    /// Runs every registration for `event` through restrictions and triggers.
    #[instrument(skip_all, fields(event_kind = %event.kind(), repository = %event.repository()))]
    async fn dispatch(&self, event: &Event) -> Result<DispatchOutcome, DispatchError> {
        if event.is_deletion() {
            warn!(branch = ?event.branch(), tag = ?event.tag(), "ref was deleted, dispatch suppressed");
            return Ok(DispatchOutcome::Suppressed);
        }

        // The stream is drained even after an error so triggers already in
        // flight complete and get counted; the first error is returned after.
        let (tally, error) = self
            .store
            .find(event.kind(), event.repository())
            .map(move |candidate| async move {
                let registration = candidate?;
                self.try_candidate(event, &registration).await
            })
            .buffer_unordered(self.settings.max_concurrent_triggers.max(1))
            .fold((Tally::default(), None), |(tally, error), candidate| {
                future::ready(match candidate {
                    Ok(candidate) => (tally.add(candidate), error),
                    Err(e) => (tally, error.or(Some(e))),
                })
            })
            .await;

        if let Some(error) = error {
            warn!(
                %error,
                triggered = tally.triggered,
                failed = tally.failed,
                "dispatch aborted after in-flight candidates finished"
            );
            return Err(error);
        }

        let outcome = tally.outcome();
        if outcome == DispatchOutcome::Ignored {
            info!("no registration matched");
        }
        Ok(outcome)
    }

    async fn try_candidate(
        &self,
        event: &Event,
        registration: &Registration,
    ) -> Result<Candidate, DispatchError> {
        if !should_trigger(event, registration, self.vcs.as_ref()).await? {
            return Ok(Candidate::Skipped);
        }
        let invocation = TriggerInvocation {
            job_name: registration.job_name.clone(),
            ci_endpoint: registration.ci_endpoint.clone(),
            parameters: build_parameters(event, registration),
        };
        Ok(self.invoke(&invocation).await)
    }

    async fn invoke(&self, invocation: &TriggerInvocation) -> Candidate {
        match self.ci.trigger(invocation).await {
            Ok(()) => {
                info!(
                    job = %invocation.job_name,
                    endpoint = %invocation.ci_endpoint,
                    parameters = ?invocation.parameters,
                    "job triggered"
                );
                Candidate::Triggered
            }
            Err(error) => {
                warn!(
                    job = %invocation.job_name,
                    endpoint = %invocation.ci_endpoint,
                    %error,
                    retryable = error.retry_policy().is_retryable(),
                    "job trigger failed"
                );
                Candidate::Failed
            }
        }
    }

    // -----------------------------------------------------------------------
    // Synchronize fan-out
    // -----------------------------------------------------------------------

    async fn synchronize(&self, event: &Event) -> Result<DispatchOutcome, DispatchError> {
        if event.is_deletion() {
            return self.dispatch(event).await;
        }
        let labels = match event.pull_request() {
            Some(pull_request) => {
                self.vcs
                    .list_pr_labels(event.repository(), pull_request)
                    .await?
            }
            None => Vec::new(),
        };

        let (direct, reopened, relabeled) = futures::join!(
            self.dispatch(event),
            self.resync_opened(event, &labels),
            self.resync_labels(event, &labels),
        );
        Ok(direct?.combine(reopened?).combine(relabeled?))
    }

    /// Treats `event` as a freshly opened pull request when it carries the resync marker.
    async fn resync_opened(
        &self,
        event: &Event,
        labels: &[String],
    ) -> Result<DispatchOutcome, DispatchError> {
        if !labels.contains(&self.settings.commands.resync_label) {
            return Ok(DispatchOutcome::Ignored);
        }
        info!("pull request carries the resync marker, replaying as opened");
        self.dispatch(&event.rekind(EventKind::PullRequestOpened).build())
            .await
    }

    async fn resync_labels(
        &self,
        event: &Event,
        labels: &[String],
    ) -> Result<DispatchOutcome, DispatchError> {
        if !labels.contains(&self.settings.commands.resync_labels_label) {
            return Ok(DispatchOutcome::Ignored);
        }
        self.replay_labels(event, labels).await
    }

    /// Dispatches one `labeled` event per label, in listing order, skipping the marker.
    async fn replay_labels(
        &self,
        event: &Event,
        labels: &[String],
    ) -> Result<DispatchOutcome, DispatchError> {
        let marker = &self.settings.commands.resync_labels_label;
        let mut outcome = DispatchOutcome::Ignored;
        for label in labels.iter().filter(|l| *l != marker) {
            info!(label = %label, "replaying label");
            let labeled = event
                .rekind(EventKind::Labeled)
                .attribute(attributes::LABEL, label.as_str())
                .build();
            outcome = outcome.combine(self.dispatch(&labeled).await?);
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Comments
    // -----------------------------------------------------------------------

    async fn process_comment(
        &self,
        comment: PullRequestComment,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(command) = parse_comment(&comment.body, &self.settings.commands) else {
            info!(pull_request = %comment.pull_request, "comment is not a command");
            return Ok(DispatchOutcome::Ignored);
        };

        match command {
            CommentCommand::Run { job, parameters } => {
                let invocation = TriggerInvocation {
                    job_name: job,
                    ci_endpoint: self.settings.comment_endpoint.clone(),
                    parameters,
                };
                Ok(match self.invoke(&invocation).await {
                    Candidate::Triggered => DispatchOutcome::Dispatched { triggered: 1, failed: 0 },
                    _ => DispatchOutcome::Dispatched { triggered: 0, failed: 1 },
                })
            }
            CommentCommand::Resync => {
                let base = self.comment_event(&comment).await?;
                self.dispatch(&base.rekind(EventKind::PullRequestOpened).build())
                    .await
            }
            CommentCommand::ResyncLabels => {
                let base = self.comment_event(&comment).await?;
                self.replay_labels(&base, &comment.labels).await
            }
        }
    }

    /// Builds the event a comment-driven resync starts from, at the pull
    /// request's current head.
    async fn comment_event(&self, comment: &PullRequestComment) -> Result<Event, DispatchError> {
        let head = self
            .vcs
            .get_pr_head(&comment.repository, comment.pull_request)
            .await?;
        let mut builder = Event::builder(EventKind::Comment, comment.repository.clone(), head.revision)
            .branch(Some(head.branch))
            .pull_request(comment.pull_request);
        if let Some(author) = &comment.author {
            builder = builder.attribute(attributes::WHO, author.as_str());
        }
        Ok(builder.build())
    }
}
