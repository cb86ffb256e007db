//! GitHub REST driver and webhook payload types
//! https://developer.github.com/v3/
//! https://developer.github.com/webhooks/

use crate::{
    project::{PullRequestId, Sha},
    Result,
};
use async_trait::async_trait;
use reqwest::{header, Client as ReqwestClient, StatusCode};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.github.com/";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The host operations the interpreter needs.
#[async_trait]
pub trait HostDriver {
    async fn leave_comment(
        &self,
        owner: &str,
        repo: &str,
        number: PullRequestId,
        body: &str,
    ) -> Result<()>;

    /// Whether the user has push access to the repository.
    async fn has_push_access(&self, owner: &str, repo: &str, username: &str) -> Result<bool>;
}

#[derive(Debug)]
pub struct GithubClient {
    base_url: String,
    client: ReqwestClient,
}

impl GithubClient {
    pub fn new(github_api_token: &str) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, github_api_token)
    }

    pub fn with_base_url(base_url: &str, github_api_token: &str) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("token {}", github_api_token))
                .expect("github api token is not a valid header value"),
        );

        let client = ReqwestClient::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .build()
            .expect("unable to construct http client");

        Self {
            base_url: base_url.to_owned(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl HostDriver for GithubClient {
    /// Create a comment
    ///
    /// GitHub API docs: https://developer.github.com/v3/issues/comments/#create-a-comment
    async fn leave_comment(
        &self,
        owner: &str,
        repo: &str,
        number: PullRequestId,
        body: &str,
    ) -> Result<()> {
        #[derive(Debug, serde::Serialize)]
        struct CreateCommentRequest<'a> {
            body: &'a str,
        }

        let url = self.url(&format!(
            "repos/{}/{}/issues/{}/comments",
            owner, repo, number
        ));
        self.client
            .post(&url)
            .json(&CreateCommentRequest { body })
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    /// Check a collaborator's permission level; push access means
    /// `admin` or `write`.
    ///
    /// GitHub API docs: https://developer.github.com/v3/repos/collaborators/#review-a-users-permission-level
    async fn has_push_access(&self, owner: &str, repo: &str, username: &str) -> Result<bool> {
        #[derive(Debug, Deserialize)]
        struct PermissionLevelResponse {
            permission: String,
        }

        let url = self.url(&format!(
            "repos/{}/{}/collaborators/{}/permission",
            owner, repo, username
        ));
        let response = self.client.get(&url).send().await?;

        // Non-collaborators come back as 404
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let response: PermissionLevelResponse = response.error_for_status()?.json().await?;
        Ok(matches!(response.permission.as_str(), "admin" | "write"))
    }
}

//
// Webhook payloads, trimmed down to the fields the adapter consumes
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Reopened,
    Synchronize,
    Closed,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentAction {
    Created,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

#[derive(Clone, Debug, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CommitRef {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: Sha,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PullRequestDetails {
    pub head: CommitRef,
    pub title: String,
    pub user: User,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PullRequestPayload {
    pub action: PullRequestAction,
    pub number: u64,
    pub pull_request: PullRequestDetails,
    pub repository: Repository,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Issue {
    pub number: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Comment {
    pub user: User,
    pub body: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IssueCommentPayload {
    pub action: CommentAction,
    pub issue: Issue,
    pub comment: Comment,
    pub repository: Repository,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StatusPayload {
    pub sha: Sha,
    pub state: CommitState,
    pub repository: Repository,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_pull_request_payload() {
        let payload: PullRequestPayload = serde_json::from_str(
            r#"{
                "action": "opened",
                "number": 7,
                "pull_request": {
                    "head": { "ref": "feat", "sha": "aaa" },
                    "title": "t",
                    "user": { "login": "alice" }
                },
                "repository": { "name": "r", "owner": { "login": "o" } }
            }"#,
        )
        .unwrap();

        assert_eq!(payload.action, PullRequestAction::Opened);
        assert_eq!(payload.number, 7);
        assert_eq!(payload.pull_request.head.git_ref, "feat");
        assert_eq!(payload.pull_request.head.sha, Sha::from("aaa"));
        assert_eq!(payload.repository.owner.login, "o");
    }

    #[test]
    fn unknown_actions_parse_as_other() {
        let payload: PullRequestPayload = serde_json::from_str(
            r#"{
                "action": "locked",
                "number": 7,
                "pull_request": {
                    "head": { "ref": "feat", "sha": "aaa" },
                    "title": "t",
                    "user": { "login": "alice" }
                },
                "repository": { "name": "r", "owner": { "login": "o" } }
            }"#,
        )
        .unwrap();

        assert_eq!(payload.action, PullRequestAction::Other);
    }

    #[test]
    fn parse_status_payload() {
        let payload: StatusPayload = serde_json::from_str(
            r#"{
                "sha": "bbb",
                "state": "success",
                "repository": { "name": "r", "owner": { "login": "o" } }
            }"#,
        )
        .unwrap();

        assert_eq!(payload.state, CommitState::Success);
        assert_eq!(payload.sha, Sha::from("bbb"));
    }
}
