//! Typed webhook events.
//!
//! Raw GitHub payloads are parsed here, once, into [`PreviewEvent`]; nothing
//! downstream looks at JSON. Event types and actions the host does not act on
//! parse to `Ok(None)`.

use preview_instance::{PrDetails, PrNumber};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid field value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrAction {
    Opened,
    Reopened,
    /// New commits were pushed to the head branch.
    Synchronize,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub action: PrAction,
    pub details: PrDetails,
    /// Who triggered the delivery (not necessarily the PR author).
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentEvent {
    pub number: PrNumber,
    pub owner: String,
    pub repo: String,
    pub body: String,
    pub commenter: String,
    pub pr_author: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewEvent {
    PullRequest(PullRequestEvent),
    Comment(CommentEvent),
}

impl PreviewEvent {
    pub fn pr(&self) -> PrNumber {
        match self {
            PreviewEvent::PullRequest(e) => e.details.number,
            PreviewEvent::Comment(e) => e.number,
        }
    }
}

/// `event_type` is the `X-GitHub-Event` header.
pub fn parse_webhook(event_type: &str, payload: &[u8]) -> Result<Option<PreviewEvent>, ParseError> {
    match event_type {
        "pull_request" => parse_pull_request(payload).map(|e| e.map(PreviewEvent::PullRequest)),
        "issue_comment" => parse_issue_comment(payload).map(|e| e.map(PreviewEvent::Comment)),
        _ => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    owner: RawUser,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    action: String,
    number: u64,
    pull_request: RawPullRequest,
    repository: RawRepository,
    sender: RawUser,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    head: RawHead,
    user: RawUser,
}

#[derive(Debug, Deserialize)]
struct RawHead {
    #[serde(rename = "ref")]
    git_ref: String,
    repo: Option<RawHeadRepo>,
}

#[derive(Debug, Deserialize)]
struct RawHeadRepo {
    full_name: String,
}

fn parse_pull_request(payload: &[u8]) -> Result<Option<PullRequestEvent>, ParseError> {
    let raw: RawPullRequestPayload = serde_json::from_slice(payload)?;
    let action = match raw.action.as_str() {
        "opened" => PrAction::Opened,
        "reopened" => PrAction::Reopened,
        "synchronize" => PrAction::Synchronize,
        "closed" => PrAction::Closed,
        _ => return Ok(None),
    };

    let source_repo = match raw.pull_request.head.repo {
        Some(repo) => repo.full_name,
        // A closed PR whose fork is gone can still be torn down.
        None if action == PrAction::Closed => String::new(),
        None => {
            return Err(ParseError::InvalidField {
                field: "pull_request.head.repo",
                value: "null".to_string(),
            });
        }
    };

    Ok(Some(PullRequestEvent {
        action,
        details: PrDetails {
            number: PrNumber(raw.number),
            source_repo,
            branch: raw.pull_request.head.git_ref,
            target_owner: raw.repository.owner.login,
            target_repo: raw.repository.name,
            author: raw.pull_request.user.login,
        },
        sender: raw.sender.login,
    }))
}

#[derive(Debug, Deserialize)]
struct RawIssueCommentPayload {
    action: String,
    comment: RawComment,
    issue: RawIssue,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    body: Option<String>,
    user: RawUser,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    user: RawUser,
    // Present only when the issue is a pull request.
    pull_request: Option<serde_json::Value>,
}

fn parse_issue_comment(payload: &[u8]) -> Result<Option<CommentEvent>, ParseError> {
    let raw: RawIssueCommentPayload = serde_json::from_slice(payload)?;
    if raw.action != "created" || raw.issue.pull_request.is_none() {
        return Ok(None);
    }
    Ok(Some(CommentEvent {
        number: PrNumber(raw.issue.number),
        owner: raw.repository.owner.login,
        repo: raw.repository.name,
        body: raw.comment.body.unwrap_or_default(),
        commenter: raw.comment.user.login,
        pr_author: raw.issue.user.login,
    }))
}
