//! Relay GitHub infrastructure adapter.
//!
//! Implements the [`dispatch::VcsClient`] port over the GitHub REST API using
//! `reqwest`.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! All GitHub API details (authentication headers, status handling, retries)
//! are handled here; the [`dispatch`] crate never sees them.
//!
//! ## Endpoints
//!
//! | Port method | Request |
//! |-------------|---------|
//! | `file_exists_at_revision` | `GET /repos/{repo}/contents/{path}?ref={revision}` per path |
//! | `list_pr_labels` | `GET /repos/{repo}/issues/{n}/labels` |
//! | `get_pr_head` | `GET /repos/{repo}/pulls/{n}` |
//! | `add_pr_label` | `POST /repos/{repo}/issues/{n}/labels` |

mod client;

pub use client::{GithubClient, GithubClientError, GithubConfig, DEFAULT_API_BASE};
