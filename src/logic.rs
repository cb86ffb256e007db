//! The event-driven state machine that sequences pull requests through
//! the merge queue: one deterministic transition per event, then a
//! `proceed` loop that advances the integration candidate until the
//! state reaches a fixed point.

use crate::{
    command::{Command, CommandParser},
    git::PushResult,
    project::{BuildStatus, IntegrationStatus, ProjectState, PullRequest, PullRequestId, Sha},
    Result,
};
use async_trait::async_trait;
use log::{debug, info};

/// Domain events consumed by the handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    PullRequestOpened {
        id: PullRequestId,
        branch: String,
        sha: Sha,
        title: String,
        author: String,
    },
    /// May be a false positive: the host resends the head sha we
    /// already know about.
    PullRequestCommitChanged { id: PullRequestId, sha: Sha },
    PullRequestClosed { id: PullRequestId },
    CommentAdded {
        id: PullRequestId,
        author: String,
        body: String,
    },
    /// Addressed by the integration commit, not by pull request id.
    BuildStatusChanged { sha: Sha, status: BuildStatus },
}

/// The four leaf actions the handler can ask for. The interpreter is
/// the only implementation with real effects; tests substitute a
/// recording double, which keeps the state transitions themselves pure
/// and deterministic.
#[async_trait]
pub trait Actions {
    /// Attempt to integrate the commit into the target branch, writing
    /// the result to the test branch. `None` means a merge conflict.
    async fn try_integrate(
        &mut self,
        message: String,
        candidate_ref: String,
        candidate_sha: Sha,
    ) -> Result<Option<Sha>>;

    /// Fast-forward the target branch to the integrated commit,
    /// updating the pull request branch along the way. `Rejected` means
    /// the target branch advanced since integration.
    async fn try_promote(&mut self, branch: &str, sha: &Sha) -> Result<PushResult>;

    async fn leave_comment(&mut self, id: PullRequestId, body: String) -> Result<()>;

    /// Whether the user has push access, and is therefore entitled to
    /// approve merges.
    async fn is_reviewer(&mut self, username: &str) -> Result<bool>;
}

/// Applies one event to the state. Advancing the queue afterwards is
/// the job of [`proceed_until_fixed_point`].
pub async fn handle_event<A>(
    parser: &CommandParser,
    event: Event,
    state: ProjectState,
    actions: &mut A,
) -> Result<ProjectState>
where
    A: Actions + Send,
{
    match event {
        Event::PullRequestOpened {
            id,
            branch,
            sha,
            title,
            author,
        } => Ok(handle_pull_request_opened(state, id, branch, sha, title, author)),
        Event::PullRequestCommitChanged { id, sha } => {
            Ok(handle_pull_request_commit_changed(state, id, sha))
        }
        Event::PullRequestClosed { id } => Ok(handle_pull_request_closed(state, id)),
        Event::CommentAdded { id, author, body } => {
            handle_comment_added(parser, state, id, &author, &body, actions).await
        }
        Event::BuildStatusChanged { sha, status } => {
            Ok(handle_build_status_changed(state, sha, status))
        }
    }
}

fn handle_pull_request_opened(
    mut state: ProjectState,
    id: PullRequestId,
    branch: String,
    sha: Sha,
    title: String,
    author: String,
) -> ProjectState {
    info!("pull request #{} opened by {}", id, author);
    state.insert_pull_request(id, PullRequest::new(branch, sha, title, author));
    state
}

// A real head change invalidates review and build results, so it is
// treated as close-then-reopen: the pull request keeps its metadata but
// loses approval, integration status and queue position.
fn handle_pull_request_commit_changed(
    mut state: ProjectState,
    id: PullRequestId,
    sha: Sha,
) -> ProjectState {
    match state.pull_request(id) {
        Some(pr) if pr.sha != sha => {}
        // Unknown pull request, or a false positive
        _ => return state,
    }

    info!("pull request #{} commit changed to {}", id, sha);
    let old = state
        .delete_pull_request(id)
        .expect("pull request was just looked up");
    state.insert_pull_request(id, PullRequest::new(old.branch, sha, old.title, old.author));
    state
}

fn handle_pull_request_closed(mut state: ProjectState, id: PullRequestId) -> ProjectState {
    if state.delete_pull_request(id).is_some() {
        info!("pull request #{} closed", id);
    }
    state
}

async fn handle_comment_added<A>(
    parser: &CommandParser,
    mut state: ProjectState,
    id: PullRequestId,
    author: &str,
    body: &str,
    actions: &mut A,
) -> Result<ProjectState>
where
    A: Actions + Send,
{
    if !state.contains(id) {
        debug!("comment on unknown pull request #{}, ignoring", id);
        return Ok(state);
    }

    if parser.parse(body) != Some(Command::Merge) {
        return Ok(state);
    }

    if !actions.is_reviewer(author).await? {
        info!("{} is not allowed to approve pull request #{}", author, id);
        return Ok(state);
    }

    info!("pull request #{} approved by {}", id, author);
    state.approve(id, author);
    let position = state.queue_position(id);
    actions
        .leave_comment(id, approval_comment(author, position))
        .await?;

    Ok(state)
}

fn approval_comment(approver: &str, position: usize) -> String {
    match position {
        0 => format!("approved by @{}, rebasing now.", approver),
        1 => format!(
            "approved by @{}, waiting for rebase at the front of the queue.",
            approver
        ),
        n => format!(
            "approved by @{}, waiting for rebase behind {} pull requests.",
            approver, n
        ),
    }
}

// Build results are only meaningful for the integration commit of the
// current candidate; anything else is a stale delivery and is dropped.
fn handle_build_status_changed(
    mut state: ProjectState,
    sha: Sha,
    status: BuildStatus,
) -> ProjectState {
    if let Some(id) = state.integration_candidate() {
        if let Some(pr) = state.pull_request(id) {
            if pr.integration_status == IntegrationStatus::Integrated(sha.clone()) {
                info!("build of {} for pull request #{} is now {:?}", sha, id, status);
                state.set_build_status(id, status);
                return state;
            }
        }
    }

    debug!("build status of {} is not for the candidate, ignoring", sha);
    state
}

const PROCEED_LIMIT: usize = 100;

/// Runs [`proceed`] steps until the state stops changing. Termination
/// is monotone (every step either resolves the candidate or takes a
/// pull request out of the queue), but the loop is capped in case a
/// future change breaks that.
pub async fn proceed_until_fixed_point<A>(
    mut state: ProjectState,
    actions: &mut A,
) -> Result<ProjectState>
where
    A: Actions + Send,
{
    for _ in 0..PROCEED_LIMIT {
        let next = proceed(state.clone(), actions).await?;
        if next == state {
            return Ok(next);
        }
        state = next;
    }

    panic!(
        "proceed loop did not reach a fixed point within {} steps; state: {:?}",
        PROCEED_LIMIT, state
    );
}

/// One pure step that advances the queue without consuming an external
/// event: resolve the candidate's build outcome if there is one,
/// otherwise start integrating the next approved pull request.
async fn proceed<A>(mut state: ProjectState, actions: &mut A) -> Result<ProjectState>
where
    A: Actions + Send,
{
    let id = match state.integration_candidate() {
        Some(id) => id,
        None => {
            return match state.next_candidate() {
                Some(id) => try_integrate_pull_request(id, state, actions).await,
                None => Ok(state),
            };
        }
    };

    let build_status = match state.pull_request(id) {
        Some(pr) => {
            if !matches!(pr.integration_status, IntegrationStatus::Integrated(_)) {
                panic!(
                    "invariant violated: integration candidate #{} has integration status {:?}",
                    id, pr.integration_status
                );
            }
            pr.build_status
        }
        None => panic!(
            "invariant violated: integration candidate #{} is not a known pull request",
            id
        ),
    };

    match build_status {
        BuildStatus::NotStarted => panic!(
            "invariant violated: integration candidate #{} has build status NotStarted",
            id
        ),
        BuildStatus::Pending => Ok(state),
        BuildStatus::Succeeded => push_candidate(id, state, actions).await,
        BuildStatus::Failed => {
            actions
                .leave_comment(id, "The build failed.".to_owned())
                .await?;
            // The pull request stays in the map with its Failed build
            // status, which keeps it out of the queue until its head
            // changes.
            state.set_integration_candidate(None);
            Ok(state)
        }
    }
}

async fn try_integrate_pull_request<A>(
    id: PullRequestId,
    mut state: ProjectState,
    actions: &mut A,
) -> Result<ProjectState>
where
    A: Actions + Send,
{
    let (message, candidate_ref, candidate_sha) = {
        let pr = state
            .pull_request(id)
            .unwrap_or_else(|| panic!("pull request #{} to integrate is not known", id));
        let approver = pr
            .approved_by
            .as_deref()
            .unwrap_or_else(|| panic!("pull request #{} to integrate is not approved", id));

        (
            format!("Merge #{}\n\nApproved-by: {}", id, approver),
            format!("refs/pull/{}/head", id),
            pr.sha.clone(),
        )
    };

    info!("integrating pull request #{} ({})", id, candidate_sha);

    match actions
        .try_integrate(message, candidate_ref, candidate_sha)
        .await?
    {
        Some(sha) => {
            actions
                .leave_comment(id, format!("Rebased as {}, waiting for CI …", sha))
                .await?;
            state.set_integration_status(id, IntegrationStatus::Integrated(sha));
            state.set_build_status(id, BuildStatus::Pending);
            state.set_integration_candidate(Some(id));
        }
        None => {
            actions
                .leave_comment(id, "Failed to rebase, please rebase manually.".to_owned())
                .await?;
            state.set_integration_status(id, IntegrationStatus::Conflicted);
            state.set_integration_candidate(None);
        }
    }

    Ok(state)
}

async fn push_candidate<A>(
    id: PullRequestId,
    mut state: ProjectState,
    actions: &mut A,
) -> Result<ProjectState>
where
    A: Actions + Send,
{
    let (branch, sha) = {
        let pr = state
            .pull_request(id)
            .unwrap_or_else(|| panic!("candidate #{} to promote is not known", id));
        let sha = match &pr.integration_status {
            IntegrationStatus::Integrated(sha) => sha.clone(),
            other => panic!(
                "invariant violated: promoting candidate #{} with integration status {:?}",
                id, other
            ),
        };
        if pr.build_status != BuildStatus::Succeeded {
            panic!(
                "invariant violated: promoting candidate #{} with build status {:?}",
                id, pr.build_status
            );
        }
        if pr.approved_by.is_none() {
            panic!("invariant violated: promoting unapproved candidate #{}", id);
        }
        (pr.branch.clone(), sha)
    };

    info!("promoting pull request #{} as {}", id, sha);

    match actions.try_promote(&branch, &sha).await? {
        PushResult::Ok => {
            // The pull request stays in the map until the host reports
            // it closed.
            state.set_integration_candidate(None);
            Ok(state)
        }
        // The target branch advanced under us; integrate again on top
        // of the new tip.
        PushResult::Rejected => try_integrate_pull_request(id, state, actions).await,
    }
}
