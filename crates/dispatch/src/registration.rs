//! Registration Records and the Trigger Invocations built from them.
//!
//! A [`Registration`] is a persisted declaration that a CI job wants to run
//! for a given event kind and repository, narrowed by restriction sets. The
//! field names of its serialized form are the stored document layout and must
//! stay stable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CiEndpoint, EventKind, JobName, RepositoryName};

/// Parameter names a registration may request.
///
/// Anything else is rejected when a registration is submitted, and resolves to
/// an empty string if it is found on an already-stored record.
pub const PARAMETER_NAMES: [&str; 11] = [
    "branch",
    "sha",
    "tag",
    "changes",
    "pr_url",
    "pr_number",
    "who",
    "release_target",
    "is_prerelease",
    "label",
    "repository",
];

// ---------------------------------------------------------------------------
// Requested parameters
// ---------------------------------------------------------------------------

/// One entry of a registration's `requested_params`: `name` or `name:alias`.
///
/// The job receives the value of `name` under the key `alias` (or `name`
/// when no alias is given).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RequestedParam {
    name: String,
    alias: Option<String>,
}

impl RequestedParam {
    /// Parses `name` or `name:alias`. Never fails; see [`Registration::validate`].
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((name, alias)) => Self {
                name: name.to_string(),
                alias: Some(alias.to_string()),
            },
            None => Self {
                name: raw.to_string(),
                alias: None,
            },
        }
    }

    /// The event field this parameter reads.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key the job receives the value under.
    pub fn key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

impl From<String> for RequestedParam {
    fn from(raw: String) -> Self {
        RequestedParam::parse(&raw)
    }
}

impl From<RequestedParam> for String {
    fn from(param: RequestedParam) -> Self {
        param.to_string()
    }
}

impl std::fmt::Display for RequestedParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{}:{}", self.name, alias),
            None => f.write_str(&self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Registration record
// ---------------------------------------------------------------------------

/// A stored job registration.
///
/// An empty restriction set means "unrestricted" for that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub event_kind: EventKind,
    pub repository: RepositoryName,
    pub job_name: JobName,
    pub ci_endpoint: CiEndpoint,
    #[serde(default)]
    pub requested_params: Vec<RequestedParam>,
    #[serde(default)]
    pub branch_restrictions: BTreeSet<String>,
    #[serde(default)]
    pub file_restrictions: BTreeSet<String>,
    #[serde(default)]
    pub change_restrictions: BTreeSet<String>,
    #[serde(default)]
    pub label_restrictions: BTreeSet<String>,
}

/// The fields that identify a registration; at most one stored record exists
/// per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationIdentity {
    pub event_kind: EventKind,
    pub repository: RepositoryName,
    pub job_name: JobName,
    pub ci_endpoint: CiEndpoint,
}

/// Reasons a submitted registration is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// An identity field is empty.
    #[error("registration field '{0}' must not be empty")]
    EmptyField(&'static str),

    /// A requested parameter names a field events never carry.
    #[error("requested parameter '{0}' is not one of the supported names")]
    UnknownParameter(String),

    /// A requested parameter has a `name:` prefix with nothing after it.
    #[error("requested parameter '{0}' has an empty alias")]
    EmptyAlias(String),
}

impl Registration {
    /// Creates an unrestricted registration with no requested parameters.
    pub fn new(
        event_kind: EventKind,
        repository: RepositoryName,
        job_name: JobName,
        ci_endpoint: CiEndpoint,
    ) -> Self {
        Self {
            event_kind,
            repository,
            job_name,
            ci_endpoint,
            requested_params: Vec::new(),
            branch_restrictions: BTreeSet::new(),
            file_restrictions: BTreeSet::new(),
            change_restrictions: BTreeSet::new(),
            label_restrictions: BTreeSet::new(),
        }
    }

    pub fn identity(&self) -> RegistrationIdentity {
        RegistrationIdentity {
            event_kind: self.event_kind,
            repository: self.repository.clone(),
            job_name: self.job_name.clone(),
            ci_endpoint: self.ci_endpoint.clone(),
        }
    }

    /// Checks a registration submitted through the registration API.
    ///
    /// Stored records are never re-validated; the dispatcher tolerates
    /// unknown parameter names on them.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.repository.as_str().is_empty() {
            return Err(RegistrationError::EmptyField("repository"));
        }
        if self.job_name.as_str().is_empty() {
            return Err(RegistrationError::EmptyField("job_name"));
        }
        if self.ci_endpoint.as_str().is_empty() {
            return Err(RegistrationError::EmptyField("ci_endpoint"));
        }
        for param in &self.requested_params {
            if !PARAMETER_NAMES.contains(&param.name()) {
                return Err(RegistrationError::UnknownParameter(param.to_string()));
            }
            if param.key().is_empty() {
                return Err(RegistrationError::EmptyAlias(param.to_string()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trigger invocation
// ---------------------------------------------------------------------------

/// A resolved request to run one CI job. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInvocation {
    pub job_name: JobName,
    pub ci_endpoint: CiEndpoint,
    pub parameters: BTreeMap<String, String>,
}
