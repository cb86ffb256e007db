//! Per-project pull request bookkeeping and its persisted snapshot

use crate::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};

/// Number of a pull request, unique per project and stable across its
/// lifetime.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PullRequestId(pub u64);

impl fmt::Display for PullRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A commit id; equality is bytewise on the 40-char hex form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha(String);

impl Sha {
    pub fn new<S: Into<String>>(sha: S) -> Self {
        Self(sha.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sha {
    fn from(sha: &str) -> Self {
        Sha::new(sha)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    NotStarted,
    Pending,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationStatus {
    NotIntegrated,
    /// Carries the integration commit pushed to the test branch
    Integrated(Sha),
    Conflicted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Source branch on the host
    pub branch: String,
    /// Latest known head commit
    pub sha: Sha,
    pub title: String,
    pub author: String,
    /// Reviewer who issued a valid merge command, if any
    pub approved_by: Option<String>,
    pub integration_status: IntegrationStatus,
    pub build_status: BuildStatus,
}

impl PullRequest {
    pub fn new<B, T, A>(branch: B, sha: Sha, title: T, author: A) -> Self
    where
        B: Into<String>,
        T: Into<String>,
        A: Into<String>,
    {
        Self {
            branch: branch.into(),
            sha,
            title: title.into(),
            author: author.into(),
            approved_by: None,
            integration_status: IntegrationStatus::NotIntegrated,
            build_status: BuildStatus::NotStarted,
        }
    }

    /// An approved pull request that has not been touched by the
    /// integration pipeline yet; these form the merge queue in
    /// insertion order.
    pub fn is_awaiting_integration(&self) -> bool {
        self.approved_by.is_some()
            && self.integration_status == IntegrationStatus::NotIntegrated
            && self.build_status == BuildStatus::NotStarted
    }
}

/// All state tracked for one project. Persisted as an atomic snapshot
/// after every handled event and restored verbatim on startup.
///
/// The map is insertion-ordered; queue position derives from the
/// insertion order of approved pull requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    pull_requests: IndexMap<PullRequestId, PullRequest>,
    integration_candidate: Option<PullRequestId>,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: PullRequestId) -> bool {
        self.pull_requests.contains_key(&id)
    }

    pub fn pull_request(&self, id: PullRequestId) -> Option<&PullRequest> {
        self.pull_requests.get(&id)
    }

    pub fn pull_requests(&self) -> impl Iterator<Item = (PullRequestId, &PullRequest)> {
        self.pull_requests.iter().map(|(id, pr)| (*id, pr))
    }

    /// Inserts a fresh pull request at the back of the insertion order.
    /// Replaces any previous entry for the same id in place.
    pub fn insert_pull_request(&mut self, id: PullRequestId, pull_request: PullRequest) {
        self.pull_requests.insert(id, pull_request);
    }

    /// Removes the pull request, preserving the insertion order of the
    /// survivors. Clears the integration candidate if it pointed here.
    pub fn delete_pull_request(&mut self, id: PullRequestId) -> Option<PullRequest> {
        if self.integration_candidate == Some(id) {
            self.integration_candidate = None;
        }
        self.pull_requests.shift_remove(&id)
    }

    pub fn approve(&mut self, id: PullRequestId, username: &str) {
        if let Some(pr) = self.pull_requests.get_mut(&id) {
            pr.approved_by = Some(username.to_owned());
        }
    }

    pub fn set_integration_status(&mut self, id: PullRequestId, status: IntegrationStatus) {
        if let Some(pr) = self.pull_requests.get_mut(&id) {
            pr.integration_status = status;
        }
    }

    pub fn set_build_status(&mut self, id: PullRequestId, status: BuildStatus) {
        if let Some(pr) = self.pull_requests.get_mut(&id) {
            pr.build_status = status;
        }
    }

    pub fn integration_candidate(&self) -> Option<PullRequestId> {
        self.integration_candidate
    }

    pub fn set_integration_candidate(&mut self, candidate: Option<PullRequestId>) {
        self.integration_candidate = candidate;
    }

    /// Position of an approved pull request in the merge queue: the
    /// number of other approved pull requests that precede it in
    /// insertion order.
    pub fn queue_position(&self, id: PullRequestId) -> usize {
        self.pull_requests
            .iter()
            .take_while(|(other, _)| **other != id)
            .filter(|(_, pr)| pr.approved_by.is_some())
            .count()
    }

    /// First pull request in insertion order that is ready to be
    /// integrated, if any.
    pub fn next_candidate(&self) -> Option<PullRequestId> {
        self.pull_requests
            .iter()
            .find(|(_, pr)| pr.is_awaiting_integration())
            .map(|(id, _)| *id)
    }

    /// Atomically persists the state: write to a temp file, then rename
    /// over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".new");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Restores a previously saved snapshot; an absent file yields the
    /// empty state.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn opened(n: u64) -> (PullRequestId, PullRequest) {
        (
            PullRequestId(n),
            PullRequest::new(format!("feature/{}", n), Sha::from("0ffice"), "t", "alice"),
        )
    }

    fn sample_state() -> ProjectState {
        let mut state = ProjectState::new();
        for n in &[7, 8, 9] {
            let (id, pr) = opened(*n);
            state.insert_pull_request(id, pr);
        }
        state
    }

    #[test]
    fn queue_position_follows_insertion_order_of_approved() {
        let mut state = sample_state();
        state.approve(PullRequestId(7), "bob");
        state.approve(PullRequestId(9), "bob");

        assert_eq!(state.queue_position(PullRequestId(7)), 0);
        // 8 is unapproved and does not count
        assert_eq!(state.queue_position(PullRequestId(9)), 1);
    }

    #[test]
    fn deleting_preserves_order_of_survivors() {
        let mut state = sample_state();
        state.delete_pull_request(PullRequestId(8));

        let order: Vec<_> = state.pull_requests().map(|(id, _)| id.0).collect();
        assert_eq!(order, vec![7, 9]);
    }

    #[test]
    fn deleting_the_candidate_clears_it() {
        let mut state = sample_state();
        state.set_integration_candidate(Some(PullRequestId(7)));
        state.delete_pull_request(PullRequestId(7));
        assert_eq!(state.integration_candidate(), None);

        // deleting a non-candidate leaves the candidate alone
        let mut state = sample_state();
        state.set_integration_candidate(Some(PullRequestId(7)));
        state.delete_pull_request(PullRequestId(8));
        assert_eq!(state.integration_candidate(), Some(PullRequestId(7)));
    }

    #[test]
    fn next_candidate_is_first_eligible_in_insertion_order() {
        let mut state = sample_state();
        assert_eq!(state.next_candidate(), None);

        state.approve(PullRequestId(8), "bob");
        state.approve(PullRequestId(9), "bob");
        assert_eq!(state.next_candidate(), Some(PullRequestId(8)));

        // a conflicted pull request is no longer eligible
        state.set_integration_status(PullRequestId(8), IntegrationStatus::Conflicted);
        assert_eq!(state.next_candidate(), Some(PullRequestId(9)));

        // neither is one that is being built
        state.set_integration_status(
            PullRequestId(9),
            IntegrationStatus::Integrated(Sha::from("cafe")),
        );
        state.set_build_status(PullRequestId(9), BuildStatus::Pending);
        assert_eq!(state.next_candidate(), None);
    }

    #[test]
    fn reinsertion_moves_to_the_back() {
        let mut state = sample_state();
        let pr = state.delete_pull_request(PullRequestId(7)).unwrap();
        state.insert_pull_request(PullRequestId(7), pr);

        let order: Vec<_> = state.pull_requests().map(|(id, _)| id.0).collect();
        assert_eq!(order, vec![8, 9, 7]);
    }

    #[test]
    fn serialization_round_trips() {
        let mut state = sample_state();
        state.approve(PullRequestId(7), "bob");
        state.set_integration_status(
            PullRequestId(7),
            IntegrationStatus::Integrated(Sha::from("b0b")),
        );
        state.set_build_status(PullRequestId(7), BuildStatus::Pending);
        state.set_integration_candidate(Some(PullRequestId(7)));

        let json = serde_json::to_string(&state).unwrap();
        let restored: ProjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);

        // insertion order survives the round trip
        let order: Vec<_> = restored.pull_requests().map(|(id, _)| id.0).collect();
        assert_eq!(order, vec![7, 8, 9]);
    }

    #[test]
    fn save_and_load_round_trips() {
        let path = std::env::temp_dir().join(format!("hoff-state-{}.json", std::process::id()));

        let mut state = sample_state();
        state.approve(PullRequestId(9), "bob");
        state.save(&path).unwrap();

        let restored = ProjectState::load(&path).unwrap();
        assert_eq!(restored, state);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn loading_a_missing_file_yields_the_empty_state() {
        let path = std::env::temp_dir().join("hoff-state-does-not-exist.json");
        let state = ProjectState::load(&path).unwrap();
        assert_eq!(state, ProjectState::new());
    }
}
