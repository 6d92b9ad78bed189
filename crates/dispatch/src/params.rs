//! Trigger parameter assembly.

use std::collections::BTreeMap;

use crate::restrictions::matching_changes;
use crate::{Event, Registration};

/// Builds the parameter map a registration's job receives for `event`.
///
/// Each requested parameter is resolved by name and stored under its alias
/// (or its name). Names the event cannot supply resolve to the empty string
/// rather than failing the dispatch.
pub fn build_parameters(event: &Event, registration: &Registration) -> BTreeMap<String, String> {
    registration
        .requested_params
        .iter()
        .map(|param| (param.key().to_string(), resolve(param.name(), event, registration)))
        .collect()
}

fn resolve(name: &str, event: &Event, registration: &Registration) -> String {
    match name {
        "branch" => event.branch().map(|b| b.to_string()).unwrap_or_default(),
        "sha" => event.revision().to_string(),
        "tag" => event.tag().unwrap_or_default().to_string(),
        // Already sorted: changed paths are held in a BTreeSet.
        "changes" => matching_changes(event, registration)
            .into_iter()
            .collect::<Vec<_>>()
            .join(","),
        other => event
            .attribute(other)
            .map(|value| value.to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::attributes;
    use crate::{
        BranchName, CiEndpoint, EventKind, JobName, PullRequestId, RepositoryName, RequestedParam,
        Revision,
    };

    fn registration(kind: EventKind, params: &[&str]) -> Registration {
        let mut reg = Registration::new(
            kind,
            RepositoryName::new("octo/widgets").unwrap(),
            JobName::new("build").unwrap(),
            CiEndpoint::new("https://ci.example.com").unwrap(),
        );
        reg.requested_params = params.iter().map(|p| RequestedParam::parse(p)).collect();
        reg
    }

    fn pull_request_event() -> Event {
        Event::builder(
            EventKind::PullRequestOpened,
            RepositoryName::new("octo/widgets").unwrap(),
            Revision::new("f00d").unwrap(),
        )
        .branch(BranchName::new("feature"))
        .pull_request(PullRequestId::new(42))
        .attribute(attributes::PR_URL, "https://github.com/octo/widgets/pull/42")
        .attribute(attributes::WHO, "mona")
        .build()
    }

    #[test]
    fn parameters_resolve_under_their_aliases() {
        let reg = registration(
            EventKind::PullRequestOpened,
            &["branch", "sha:GIT_COMMIT", "pr_number", "pr_url", "who", "repository"],
        );

        let params = build_parameters(&pull_request_event(), &reg);

        assert_eq!(params["branch"], "feature");
        assert_eq!(params["GIT_COMMIT"], "f00d");
        assert_eq!(params["pr_number"], "42");
        assert_eq!(params["pr_url"], "https://github.com/octo/widgets/pull/42");
        assert_eq!(params["who"], "mona");
        assert_eq!(params["repository"], "octo/widgets");
        assert!(!params.contains_key("sha"));
    }

    #[test]
    fn unknown_and_absent_fields_resolve_to_empty() {
        let reg = registration(EventKind::PullRequestOpened, &["tag", "label", "legacy_field:X"]);

        let params = build_parameters(&pull_request_event(), &reg);

        assert_eq!(params["tag"], "");
        assert_eq!(params["label"], "");
        assert_eq!(params["X"], "");
    }

    #[test]
    fn changes_are_sorted_and_narrowed() {
        let event = Event::builder(
            EventKind::Push,
            RepositoryName::new("octo/widgets").unwrap(),
            Revision::new("abc").unwrap(),
        )
        .branch(BranchName::new("main"))
        .changed_paths(["web/app.js", "api/b.py", "api/a.py"])
        .build();

        let mut reg = registration(EventKind::Push, &["changes"]);
        assert_eq!(build_parameters(&event, &reg)["changes"], "api/a.py,api/b.py,web/app.js");

        reg.change_restrictions.insert("api/".into());
        assert_eq!(build_parameters(&event, &reg)["changes"], "api/a.py,api/b.py");
    }

    #[test]
    fn release_flags_render_as_booleans() {
        let event = Event::builder(
            EventKind::Release,
            RepositoryName::new("octo/widgets").unwrap(),
            Revision::new("v1.0.0").unwrap(),
        )
        .tag("v1.0.0")
        .attribute(attributes::IS_PRERELEASE, false)
        .attribute(attributes::RELEASE_TARGET, "main")
        .build();
        let reg = registration(EventKind::Release, &["tag", "is_prerelease", "release_target"]);

        let params = build_parameters(&event, &reg);

        assert_eq!(params["tag"], "v1.0.0");
        assert_eq!(params["is_prerelease"], "false");
        assert_eq!(params["release_target"], "main");
    }

    #[test]
    fn no_requested_parameters_means_empty_map() {
        let reg = registration(EventKind::PullRequestOpened, &[]);
        assert!(build_parameters(&pull_request_event(), &reg).is_empty());
    }
}
