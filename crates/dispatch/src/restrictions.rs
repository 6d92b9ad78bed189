//! Restriction Evaluator.
//!
//! Decides whether one registration fires for one event. Dimensions combine
//! by AND; membership inside a dimension is OR; an empty dimension is
//! unrestricted. The only I/O is a single file-presence lookup, made when the
//! registration has file restrictions and every local dimension already
//! passed.

use std::collections::BTreeSet;

use tracing::debug;

use crate::{Event, EventKind, Registration, VcsClient, VcsError};

/// Returns `true` if `registration` should be triggered for `event`.
///
/// A deleted ref never triggers, whatever the restrictions say.
pub async fn should_trigger(
    event: &Event,
    registration: &Registration,
    vcs: &dyn VcsClient,
) -> Result<bool, VcsError> {
    if event.is_deletion() {
        return Ok(false);
    }

    if !registration.branch_restrictions.is_empty() {
        let branch = event.branch().map(|b| b.as_str()).unwrap_or_default();
        if !registration.branch_restrictions.contains(branch) {
            debug!(job = %registration.job_name, branch, "branch restriction not met");
            return Ok(false);
        }
    }

    if !registration.change_restrictions.is_empty()
        && matching_changes(event, registration).is_empty()
    {
        debug!(job = %registration.job_name, "change restriction not met");
        return Ok(false);
    }

    if !registration.label_restrictions.is_empty() && event.kind() == EventKind::Labeled {
        let label = event.label().unwrap_or_default();
        if !registration.label_restrictions.contains(label) {
            debug!(job = %registration.job_name, label, "label restriction not met");
            return Ok(false);
        }
    }

    if !registration.file_restrictions.is_empty() {
        let paths: Vec<String> = registration.file_restrictions.iter().cloned().collect();
        let present = vcs
            .file_exists_at_revision(event.repository(), event.revision(), &paths)
            .await?;
        if !present {
            debug!(job = %registration.job_name, revision = %event.revision(), "file restriction not met");
            return Ok(false);
        }
    }

    Ok(true)
}

/// Changed paths of `event` that satisfy `registration`'s change restrictions.
///
/// A path matches when it contains any restriction as a case-sensitive
/// substring. Without change restrictions every changed path matches.
pub fn matching_changes<'e>(event: &'e Event, registration: &Registration) -> BTreeSet<&'e str> {
    event
        .changed_paths()
        .iter()
        .map(String::as_str)
        .filter(|path| {
            registration.change_restrictions.is_empty()
                || registration
                    .change_restrictions
                    .iter()
                    .any(|restriction| path.contains(restriction.as_str()))
        })
        .collect()
}
