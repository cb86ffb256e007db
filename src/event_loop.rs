//! The two per-project event loops: the webhook adapter, which turns
//! raw host deliveries into domain events, and the logic worker, which
//! owns the project state.

use crate::{
    command::CommandParser,
    config::Repo,
    github::{self, CommentAction, CommitState, PullRequestAction},
    logic::{handle_event, proceed_until_fixed_point, Actions, Event},
    project::{BuildStatus, ProjectState, PullRequestId},
    Result,
};
use log::{debug, info, warn};
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};

/// Capacity of both the webhook queue and the main event queue. When
/// the webhook queue runs full the HTTP layer answers 503, which is the
/// backpressure contract.
pub const QUEUE_CAPACITY: usize = 128;

/// A raw webhook delivery, parsed no further than the HTTP layer needs.
#[derive(Clone, Debug)]
pub struct WebhookEvent {
    pub event_type: String,
    pub delivery_id: String,
    pub body: Vec<u8>,
}

/// Single consumer of the webhook queue: discards deliveries for other
/// repositories, translates the rest, and blocks on the main queue so
/// backpressure reaches the HTTP layer.
pub async fn run_webhook_event_loop(
    repo: Repo,
    mut webhooks: mpsc::Receiver<WebhookEvent>,
    events: mpsc::Sender<Event>,
) -> Result<()> {
    while let Some(webhook) = webhooks.recv().await {
        debug!(
            "webhook {} ({}) for {}/{}",
            webhook.delivery_id,
            webhook.event_type,
            repo.owner(),
            repo.name()
        );

        if let Some(event) = translate_webhook(&repo, &webhook) {
            if events.send(event).await.is_err() {
                // The logic worker is gone; so are we
                break;
            }
        }
    }

    Ok(())
}

fn parse_payload<T: serde::de::DeserializeOwned>(webhook: &WebhookEvent) -> Option<T> {
    match serde_json::from_slice(&webhook.body) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(
                "could not parse {} payload of delivery {}: {}",
                webhook.event_type, webhook.delivery_id, e
            );
            None
        }
    }
}

fn repository_matches(repo: &Repo, repository: &github::Repository) -> bool {
    repo.owner() == repository.owner.login && repo.name() == repository.name
}

pub fn translate_webhook(repo: &Repo, webhook: &WebhookEvent) -> Option<Event> {
    match webhook.event_type.as_str() {
        "pull_request" => {
            let payload: github::PullRequestPayload = parse_payload(webhook)?;
            if !repository_matches(repo, &payload.repository) {
                return None;
            }

            let id = PullRequestId(payload.number);
            match payload.action {
                PullRequestAction::Opened | PullRequestAction::Reopened => {
                    Some(Event::PullRequestOpened {
                        id,
                        branch: payload.pull_request.head.git_ref,
                        sha: payload.pull_request.head.sha,
                        title: payload.pull_request.title,
                        author: payload.pull_request.user.login,
                    })
                }
                PullRequestAction::Synchronize => Some(Event::PullRequestCommitChanged {
                    id,
                    sha: payload.pull_request.head.sha,
                }),
                PullRequestAction::Closed => Some(Event::PullRequestClosed { id }),
                PullRequestAction::Other => None,
            }
        }
        "issue_comment" => {
            let payload: github::IssueCommentPayload = parse_payload(webhook)?;
            if !repository_matches(repo, &payload.repository) {
                return None;
            }

            match payload.action {
                CommentAction::Created => Some(Event::CommentAdded {
                    id: PullRequestId(payload.issue.number),
                    author: payload.comment.user.login,
                    body: payload.comment.body,
                }),
                CommentAction::Other => None,
            }
        }
        "status" => {
            let payload: github::StatusPayload = parse_payload(webhook)?;
            if !repository_matches(repo, &payload.repository) {
                return None;
            }

            let status = match payload.state {
                CommitState::Pending => BuildStatus::Pending,
                CommitState::Success => BuildStatus::Succeeded,
                CommitState::Failure | CommitState::Error => BuildStatus::Failed,
            };
            Some(Event::BuildStatusChanged {
                sha: payload.sha,
                status,
            })
        }
        other => {
            debug!("nothing to do for '{}' deliveries", other);
            None
        }
    }
}

/// Single consumer of the main event queue. Owns the state variable:
/// every event goes through the handler, then the proceed loop, after
/// which the state is persisted and published. The queue closing is the
/// stop signal; buffered events are drained before exiting.
pub async fn run_logic_event_loop<A>(
    parser: CommandParser,
    state_file: PathBuf,
    mut state: ProjectState,
    mut events: mpsc::Receiver<Event>,
    mut actions: A,
    snapshot: watch::Sender<ProjectState>,
) -> Result<ProjectState>
where
    A: Actions + Send,
{
    while let Some(event) = events.recv().await {
        info!("handling {:?}", event);

        state = handle_event(&parser, event, state, &mut actions).await?;
        state = proceed_until_fixed_point(state, &mut actions).await?;
        state.save(&state_file)?;

        // Observers may be gone; that is not our problem
        let _ = snapshot.send(state.clone());
    }

    info!("event queue closed, exiting");
    Ok(state)
}
