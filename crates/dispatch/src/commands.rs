//! Comment Command Parser.
//!
//! A pure parser turning pull request comment text into a [`CommentCommand`].
//! Three forms are recognized; anything else is a no-op:
//!
//! - `<prefix> run <job> [key=value ...]` runs `job` once with exactly the
//!   given parameters.
//! - A body equal to the resync-labels marker replays every label on the pull
//!   request as its own `labeled` event.
//! - A body equal to the resync marker replays the pull request as freshly
//!   opened.

use std::collections::BTreeMap;

use crate::JobName;

/// The vocabulary the parser recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSettings {
    /// First word of a run command. Matched case-insensitively.
    pub prefix: String,
    /// Body (and label) requesting a pull-request-opened replay.
    pub resync_label: String,
    /// Body (and label) requesting a replay of every label.
    pub resync_labels_label: String,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            prefix: "relay".to_string(),
            resync_label: "resync".to_string(),
            resync_labels_label: "resync-labels".to_string(),
        }
    }
}

/// A recognized comment command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentCommand {
    /// Trigger `job` directly, bypassing registrations.
    Run {
        job: JobName,
        parameters: BTreeMap<String, String>,
    },
    /// Replay each label on the pull request as a `labeled` event.
    ResyncLabels,
    /// Replay the pull request as `pull_request_opened` at its current head.
    Resync,
}

/// Parses a comment body.
///
/// # Parsing Rules
///
/// - Surrounding whitespace is ignored.
/// - Marker bodies must match exactly (case-sensitive); they win over the run
///   form.
/// - In the run form, tokens are whitespace-separated. Each parameter token is
///   split on its first `=`; the value may be empty or contain further `=`.
/// - A parameter token without `=` or with an empty key invalidates the whole
///   command.
/// - When a key repeats, the last value wins.
pub fn parse_comment(body: &str, settings: &CommandSettings) -> Option<CommentCommand> {
    let body = body.trim();
    if body == settings.resync_labels_label {
        return Some(CommentCommand::ResyncLabels);
    }
    if body == settings.resync_label {
        return Some(CommentCommand::Resync);
    }
    parse_run(body, &settings.prefix)
}

fn parse_run(body: &str, prefix: &str) -> Option<CommentCommand> {
    let mut tokens = body.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case(prefix) {
        return None;
    }
    if tokens.next()? != "run" {
        return None;
    }
    let job = JobName::new(tokens.next()?)?;

    let mut parameters = BTreeMap::new();
    for token in tokens {
        let (key, value) = token.split_once('=')?;
        if key.is_empty() {
            return None;
        }
        parameters.insert(key.to_string(), value.to_string());
    }

    Some(CommentCommand::Run { job, parameters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse(body: &str) -> Option<CommentCommand> {
        parse_comment(body, &CommandSettings::default())
    }

    fn run(job: &str, params: &[(&str, &str)]) -> Option<CommentCommand> {
        Some(CommentCommand::Run {
            job: JobName::new(job).unwrap(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    #[test]
    fn run_with_parameters() {
        assert_eq!(
            parse("relay run deploy env=staging region=us"),
            run("deploy", &[("env", "staging"), ("region", "us")])
        );
    }

    #[test]
    fn run_without_parameters() {
        assert_eq!(parse("relay run nightly"), run("nightly", &[]));
    }

    #[test]
    fn prefix_is_case_insensitive_and_whitespace_is_flexible() {
        assert_eq!(
            parse("  RELAY \t run   team/deploy  \n env=prod  "),
            run("team/deploy", &[("env", "prod")])
        );
    }

    #[test]
    fn values_split_on_first_equals() {
        assert_eq!(
            parse("relay run deploy query=a=b empty="),
            run("deploy", &[("query", "a=b"), ("empty", "")])
        );
    }

    #[test]
    fn last_repeated_key_wins() {
        assert_eq!(
            parse("relay run deploy env=a env=b"),
            run("deploy", &[("env", "b")])
        );
    }

    #[test]
    fn bad_parameter_tokens_make_the_comment_a_no_op() {
        assert_eq!(parse("relay run deploy env"), None);
        assert_eq!(parse("relay run deploy =staging"), None);
    }

    #[test]
    fn incomplete_or_foreign_commands_are_ignored() {
        for body in [
            "",
            "relay",
            "relay run",
            "relay build deploy",
            "relay RUN deploy",
            "please relay run deploy",
            "looks good to me",
        ] {
            assert_eq!(parse(body), None, "{body:?}");
        }
    }

    #[test]
    fn markers_must_match_exactly() {
        assert_eq!(parse("resync"), Some(CommentCommand::Resync));
        assert_eq!(parse("resync-labels\n"), Some(CommentCommand::ResyncLabels));
        assert_eq!(parse("Resync"), None);
        assert_eq!(parse("resync please"), None);
        assert_eq!(parse("resync-labels now"), None);
    }

    #[test]
    fn custom_vocabulary() {
        let settings = CommandSettings {
            prefix: "ci".into(),
            resync_label: "triggear-pr-sync".into(),
            resync_labels_label: "triggear-label-sync".into(),
        };
        assert_eq!(
            parse_comment("triggear-label-sync", &settings),
            Some(CommentCommand::ResyncLabels)
        );
        assert_eq!(parse_comment("ci run lint", &settings), run("lint", &[]));
        assert_eq!(parse_comment("relay run lint", &settings), None);
    }

    proptest! {
        #[test]
        fn never_panics(body in "\\PC*") {
            let _ = parse(&body);
        }

        #[test]
        fn well_formed_parameters_are_preserved(
            job in "[a-z][a-z0-9/_-]{0,20}",
            params in proptest::collection::btree_map("[A-Za-z_][A-Za-z0-9_]{0,8}", "[A-Za-z0-9=.,:-]{0,12}", 0..6),
        ) {
            let tokens: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let body = format!("relay run {job} {}", tokens.join(" "));

            let Some(CommentCommand::Run { job: parsed_job, parameters }) = parse(&body) else {
                return Err(TestCaseError::fail("run command not recognized"));
            };
            prop_assert_eq!(parsed_job.as_str(), job.as_str());
            prop_assert_eq!(parameters, params);
        }
    }
}
