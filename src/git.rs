//! Git CLI driver

use crate::{config::GitConfig, project::Sha, Result};
use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    process::Command,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneResult {
    Cloned,
    CloneFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushResult {
    Ok,
    Rejected,
}

/// The Git operations the interpreter needs. Subprocess failures inside
/// an operation surface as the domain result (`None`, `CloneFailed`,
/// `Rejected`); failing to run git at all is a driver error.
pub trait GitDriver {
    fn does_git_directory_exist(&self) -> Result<bool>;

    fn clone_repository(&self) -> Result<CloneResult>;

    /// Attempt to build the integration commit: fetch the target branch
    /// and the candidate ref, reset the test branch onto the target,
    /// create the integration commit carrying `message`, and push the
    /// test branch. `None` means a merge conflict.
    fn try_integrate(
        &self,
        message: &str,
        candidate_ref: &str,
        candidate_sha: &Sha,
        target_branch: &str,
        test_branch: &str,
    ) -> Result<Option<Sha>>;

    /// Fast-forward `branch` to `sha`; `Rejected` when the remote
    /// advanced in the meantime.
    fn push(&self, sha: &Sha, branch: &str) -> Result<PushResult>;

    fn force_push(&self, sha: &Sha, branch: &str) -> Result<PushResult>;
}

#[derive(Debug)]
pub struct GitCli {
    directory: PathBuf,
    url: String,
    git_config: GitConfig,
}

impl GitCli {
    pub fn new(directory: PathBuf, url: String, git_config: GitConfig) -> Self {
        Self {
            directory,
            url,
            git_config,
        }
    }

    fn git(&self) -> Git {
        Git::new()
            .current_dir(&self.directory)
            .with_user(&self.git_config.user)
            .with_email(&self.git_config.email)
            .with_ssh(&self.git_config.ssh_key_file)
    }

    fn plain_git(&self) -> Git {
        Git::new().with_ssh(&self.git_config.ssh_key_file)
    }
}

impl GitDriver for GitCli {
    fn does_git_directory_exist(&self) -> Result<bool> {
        self.git().is_git_repo()
    }

    fn clone_repository(&self) -> Result<CloneResult> {
        info!("cloning '{}' to '{}'", self.url, self.directory.display());
        match self.plain_git().clone(&self.directory, &self.url)? {
            Some(_) => Ok(CloneResult::Cloned),
            None => Ok(CloneResult::CloneFailed),
        }
    }

    fn try_integrate(
        &self,
        message: &str,
        candidate_ref: &str,
        candidate_sha: &Sha,
        target_branch: &str,
        test_branch: &str,
    ) -> Result<Option<Sha>> {
        // Bring the target branch and the candidate commit up to date
        if self
            .git()
            .fetch(&[target_branch, candidate_ref])?
            .is_none()
        {
            warn!("failed to fetch {} and {}", target_branch, candidate_ref);
            return Ok(None);
        }

        // Reset the test branch onto the tip of the target branch
        if self
            .git()
            .force_checkout_branch(test_branch, &format!("origin/{}", target_branch))?
            .is_none()
        {
            warn!("failed to check out {}", test_branch);
            return Ok(None);
        }

        // Create the integration commit
        if self.git().merge(message, candidate_sha)?.is_none() {
            info!("merge of {} did not apply cleanly", candidate_sha);
            self.git().merge_abort()?;
            return Ok(None);
        }

        let sha = match self.git().head_sha()? {
            Some(sha) => sha,
            None => return Err("unable to resolve HEAD after merge".into()),
        };

        // The test branch is ours; overwrite whatever CI saw last time
        if self.git().push_branch(test_branch, true)?.is_none() {
            warn!("failed to push {}", test_branch);
            return Ok(None);
        }

        Ok(Some(sha))
    }

    fn push(&self, sha: &Sha, branch: &str) -> Result<PushResult> {
        match self.git().push_sha(sha, branch, false)? {
            Some(_) => Ok(PushResult::Ok),
            None => Ok(PushResult::Rejected),
        }
    }

    fn force_push(&self, sha: &Sha, branch: &str) -> Result<PushResult> {
        match self.git().push_sha(sha, branch, true)? {
            Some(_) => Ok(PushResult::Ok),
            None => Ok(PushResult::Rejected),
        }
    }
}

struct Git {
    inner: Command,
}

impl Git {
    fn new() -> Self {
        let mut inner = Command::new("git");

        // Don't try and open an editor for anything interactive
        inner.env("GIT_EDITOR", "cat");

        Self { inner }
    }

    // Use `-C <path>` instead of `Command::current_dir` so that running
    // in a directory that doesn't exist yields a non-zero exit code
    // instead of a spawn failure
    fn current_dir(mut self, path: &Path) -> Self {
        self.inner.arg("-C").arg(path);
        self
    }

    fn with_ssh(mut self, ssh_key_file: &Path) -> Self {
        self.inner.env(
            "GIT_SSH_COMMAND",
            format!(
                "ssh -i {} -S none -o 'IdentitiesOnly true'",
                ssh_key_file.display()
            ),
        );
        self
    }

    fn with_user(mut self, user: &str) -> Self {
        self.inner.env("GIT_AUTHOR_NAME", user);
        self.inner.env("GIT_COMMITTER_NAME", user);
        self
    }

    fn with_email(mut self, email: &str) -> Self {
        self.inner.env("GIT_AUTHOR_EMAIL", email);
        self.inner.env("GIT_COMMITTER_EMAIL", email);
        self
    }

    /// Runs the command. `None` means git ran and exited non-zero;
    /// `Err` means git could not be run at all.
    fn run(mut self) -> Result<Option<String>> {
        let output = self.inner.output()?;

        if !output.status.success() {
            info!(
                "git command failed:\n{}",
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }

        Ok(Some(String::from_utf8(output.stdout)?))
    }

    fn is_git_repo(mut self) -> Result<bool> {
        self.inner.args(&["rev-parse", "--git-dir"]);
        Ok(self.run()?.is_some())
    }

    fn clone(mut self, path: &Path, url: &str) -> Result<Option<String>> {
        self.inner.arg("clone").arg(url).arg(path);
        self.run()
    }

    fn fetch(mut self, refspec: &[&str]) -> Result<Option<String>> {
        self.inner.arg("fetch").arg("origin").args(refspec);
        self.run()
    }

    fn force_checkout_branch(mut self, branch: &str, start_point: &str) -> Result<Option<String>> {
        self.inner
            .args(&["checkout", "-q", "-B", branch, start_point]);
        self.run()
    }

    fn merge(mut self, message: &str, sha: &Sha) -> Result<Option<String>> {
        self.inner
            .args(&["merge", "--no-ff", "-m", message])
            .arg(sha.as_str());
        self.run()
    }

    fn merge_abort(mut self) -> Result<Option<String>> {
        self.inner.args(&["merge", "--abort"]);
        self.run()
    }

    fn head_sha(mut self) -> Result<Option<Sha>> {
        self.inner.args(&["rev-parse", "HEAD"]);
        Ok(self.run()?.map(|out| Sha::new(out.trim())))
    }

    fn push_branch(mut self, branch: &str, force: bool) -> Result<Option<String>> {
        self.inner.args(&["push", "origin"]);
        if force {
            self.inner.arg("--force");
        }
        self.inner.arg(branch);
        self.run()
    }

    fn push_sha(mut self, sha: &Sha, branch: &str, force: bool) -> Result<Option<String>> {
        self.inner.args(&["push", "origin"]);
        if force {
            self.inner.arg("--force");
        }
        self.inner
            .arg(format!("{}:refs/heads/{}", sha, branch));
        self.run()
    }
}
