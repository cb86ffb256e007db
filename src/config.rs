use crate::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Port the webhook server listens on
    pub port: u16,

    /// Shared secret used to verify webhook signatures; unsigned
    /// deliveries are accepted when absent
    pub secret: Option<String>,

    pub github_api_token: String,

    pub git: GitConfig,
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_ref().map(String::as_bytes)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitConfig {
    pub ssh_key_file: PathBuf,
    pub user: String,
    pub email: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerConfig {
    /// Prefix that makes a comment addressed to us, e.g. `@bot`
    pub comment_prefix: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    /// The repo this project tracks: (Owner, Name)
    #[serde(flatten)]
    repo: Repo,

    /// Target branch that approved pull requests are merged into
    branch: String,

    /// Branch the integration commit is pushed to for CI
    test_branch: String,

    /// Local working copy of the repository
    checkout: PathBuf,

    /// Where the project state snapshot is persisted
    state_file: PathBuf,
}

impl ProjectConfig {
    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn owner(&self) -> &str {
        self.repo.owner()
    }

    pub fn name(&self) -> &str {
        self.repo.name()
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn test_branch(&self) -> &str {
        &self.test_branch
    }

    pub fn checkout(&self) -> &Path {
        &self.checkout
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Repo {
    owner: String,
    name: String,
}

impl Repo {
    pub fn new<O: Into<String>, N: Into<String>>(owner: O, name: N) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_github_ssh_url(&self) -> String {
        format!("git@github.com:{}/{}.git", self.owner, self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_config() {
        let raw = r#"
            port = 1979
            secret = "hunter2"
            github-api-token = "token"

            [git]
            ssh-key-file = "/etc/hoff/id_ed25519"
            user = "Hoff"
            email = "hoff@example.com"

            [trigger]
            comment-prefix = "@bot"

            [[projects]]
            owner = "o"
            name = "r"
            branch = "main"
            test-branch = "testing"
            checkout = "/var/lib/hoff/checkouts/o/r"
            state-file = "/var/lib/hoff/state/o_r.json"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.port, 1979);
        assert_eq!(config.secret(), Some(&b"hunter2"[..]));
        assert_eq!(config.trigger.comment_prefix, "@bot");

        let project = &config.projects[0];
        assert_eq!(project.owner(), "o");
        assert_eq!(project.name(), "r");
        assert_eq!(project.branch(), "main");
        assert_eq!(project.test_branch(), "testing");
        assert_eq!(
            project.repo().to_github_ssh_url(),
            "git@github.com:o/r.git"
        );
    }

    #[test]
    fn secret_is_optional() {
        let raw = r#"
            port = 3000
            github-api-token = "token"

            [git]
            ssh-key-file = "id"
            user = "u"
            email = "e"

            [trigger]
            comment-prefix = "@bot"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.secret().is_none());
        assert!(config.projects.is_empty());
    }
}
