//! Core dispatch domain for Relay.
//!
//! This crate turns inbound VCS webhook occurrences into CI job triggers: it
//! normalizes payloads into [`Event`]s, matches them against stored
//! [`Registration`]s, evaluates restrictions, builds trigger parameters, and
//! fans out to the CI server. Infrastructure crates implement the traits in
//! [`ports`]; they never add matching rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RepositoryName`, `JobName`, etc.) |
//! | [`event`] | The normalized [`Event`] record and its builder |
//! | [`registration`] | Stored [`Registration`]s and [`TriggerInvocation`] |
//! | [`normalizer`] | Raw webhook payload → [`Event`] / pull request comment |
//! | [`restrictions`] | Branch, change, file and label restriction evaluation |
//! | [`params`] | Trigger parameter assembly |
//! | [`commands`] | Pull request comment command grammar |
//! | [`dispatcher`] | Orchestration: fan-out, resync flows, comment handling |
//! | [`ports`] | Store, VCS and CI traits |
//! | [`errors`] | Error and retry-policy types |
//! | [`fakes`] | In-memory port implementations for tests |

pub mod commands;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod fakes;
pub mod identifiers;
pub mod normalizer;
pub mod params;
pub mod ports;
pub mod registration;
pub mod restrictions;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use commands::{parse_comment, CommandSettings, CommentCommand};
pub use dispatcher::{
    DispatchOutcome, DispatchSettings, DispatchTicket, Dispatcher, DEFAULT_MAX_CONCURRENT_TRIGGERS,
};
pub use errors::{
    parse_retry_after, Backoff, DispatchError, RetryPolicy, StoreError, TriggerError, VcsError,
};
pub use event::{AttributeValue, Event, EventBuilder, EventKind};
pub use identifiers::{
    BranchName, CiEndpoint, DispatchId, JobName, PullRequestId, RepositoryName, Revision,
    DELETION_SENTINEL,
};
pub use normalizer::{normalize, normalize_comment, Inbound, PullRequestComment};
pub use params::build_parameters;
pub use ports::{
    CiTriggerClient, PullRequestHead, RegistrationStore, RegistrationStream, RegistrationWriter,
    VcsClient,
};
pub use registration::{
    Registration, RegistrationError, RegistrationIdentity, RequestedParam, TriggerInvocation,
    PARAMETER_NAMES,
};
pub use restrictions::{matching_changes, should_trigger};
