//! Folds action programs into Git and host API calls. This is the only
//! place effects happen; state transitions live in `logic`.

use crate::{
    config::ProjectConfig,
    git::{CloneResult, GitDriver, PushResult},
    github::HostDriver,
    logic::Actions,
    project::{PullRequestId, Sha},
    Result,
};
use async_trait::async_trait;
use log::{info, warn};

const CLONE_ATTEMPTS: usize = 3;

/// Interprets actions for a single project. Single-threaded: the logic
/// worker is the only caller.
pub struct Interpreter<G, H> {
    project: ProjectConfig,
    git: G,
    host: H,
    read_only: bool,
}

impl<G, H> Interpreter<G, H>
where
    G: GitDriver,
{
    pub fn new(project: ProjectConfig, git: G, host: H, read_only: bool) -> Self {
        Self {
            project,
            git,
            host,
            read_only,
        }
    }

    // Idempotent: a handful of clone attempts, no backoff, and silence
    // afterwards; a missing working copy makes the next Git operation
    // come back as conflict or rejected.
    fn ensure_cloned(&self) -> Result<()> {
        if self.git.does_git_directory_exist()? {
            return Ok(());
        }

        for attempt in 1..=CLONE_ATTEMPTS {
            match self.git.clone_repository()? {
                CloneResult::Cloned => return Ok(()),
                CloneResult::CloneFailed => warn!(
                    "failed to clone {} (attempt {}/{})",
                    self.project.repo().to_github_ssh_url(),
                    attempt,
                    CLONE_ATTEMPTS
                ),
            }
        }

        warn!(
            "giving up on cloning {}",
            self.project.repo().to_github_ssh_url()
        );
        Ok(())
    }
}

#[async_trait]
impl<G, H> Actions for Interpreter<G, H>
where
    G: GitDriver + Send,
    H: HostDriver + Send + Sync,
{
    async fn try_integrate(
        &mut self,
        message: String,
        candidate_ref: String,
        candidate_sha: Sha,
    ) -> Result<Option<Sha>> {
        self.ensure_cloned()?;
        self.git.try_integrate(
            &message,
            &candidate_ref,
            &candidate_sha,
            self.project.branch(),
            self.project.test_branch(),
        )
    }

    async fn try_promote(&mut self, branch: &str, sha: &Sha) -> Result<PushResult> {
        self.ensure_cloned()?;

        if self.read_only {
            info!(
                "read-only: not promoting {} to {}",
                sha,
                self.project.branch()
            );
            return Ok(PushResult::Ok);
        }

        // Update the pull request branch first, so the host recognizes
        // the pull request as merged once the target branch advances
        if self.git.force_push(sha, branch)? == PushResult::Rejected {
            warn!("failed to update pull request branch {}", branch);
        }

        self.git.push(sha, self.project.branch())
    }

    async fn leave_comment(&mut self, id: PullRequestId, body: String) -> Result<()> {
        if self.read_only {
            info!("read-only: not commenting on #{}: {}", id, body);
            return Ok(());
        }

        self.host
            .leave_comment(self.project.owner(), self.project.name(), id, &body)
            .await
    }

    async fn is_reviewer(&mut self, username: &str) -> Result<bool> {
        self.host
            .has_push_access(self.project.owner(), self.project.name(), username)
            .await
    }
}
