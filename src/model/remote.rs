use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROVIDER_GITHUB: &str = "github";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_PATH: &str = "assets/data/cars.json";
pub const DEFAULT_COMMIT_MESSAGE: &str = "Update car listings";
/// Shown in place of the access token whenever configuration leaves the mirror.
pub const TOKEN_MASK: &str = "***";

/// Where the remote copy of the catalog lives and how to write to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteMirrorConfig {
    pub enabled: bool,
    pub provider: String,
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub path: String,
    pub token: String,
    pub commit_message: String,
    pub author_name: String,
    pub author_email: String,
}

impl Default for RemoteMirrorConfig {
    fn default() -> Self {
        RemoteMirrorConfig {
            enabled: false,
            provider: PROVIDER_GITHUB.to_owned(),
            api_base: DEFAULT_API_BASE.to_owned(),
            owner: String::new(),
            repo: String::new(),
            branch: DEFAULT_BRANCH.to_owned(),
            path: DEFAULT_PATH.to_owned(),
            token: String::new(),
            commit_message: DEFAULT_COMMIT_MESSAGE.to_owned(),
            author_name: String::new(),
            author_email: String::new(),
        }
    }
}

impl RemoteMirrorConfig {
    /// Trims fields and fills blanks with defaults, as applied on save.
    pub fn normalized(mut self) -> Self {
        self.owner = self.owner.trim().to_owned();
        self.repo = self.repo.trim().to_owned();
        self.branch = self.branch_or_default();
        self.path = self.clean_path();
        let message = self.commit_message.trim();
        self.commit_message = if message.is_empty() {
            DEFAULT_COMMIT_MESSAGE.to_owned()
        } else {
            message.to_owned()
        };
        let api_base = self.api_base.trim().trim_end_matches('/');
        self.api_base = if api_base.is_empty() {
            DEFAULT_API_BASE.to_owned()
        } else {
            api_base.to_owned()
        };
        self
    }

    pub fn masked(&self) -> Self {
        let mut clone = self.clone();
        if !clone.token.is_empty() {
            clone.token = TOKEN_MASK.to_owned();
        }
        clone
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
            && self.provider == PROVIDER_GITHUB
            && !self.owner.trim().is_empty()
            && !self.repo.trim().is_empty()
            && !self.path.trim().is_empty()
    }

    pub fn branch_or_default(&self) -> String {
        let branch = self.branch.trim();
        if branch.is_empty() {
            DEFAULT_BRANCH.to_owned()
        } else {
            branch.to_owned()
        }
    }

    pub fn clean_path(&self) -> String {
        let path = self.path.trim();
        let path = if path.is_empty() { DEFAULT_PATH } else { path };
        path.trim_start_matches('/').to_owned()
    }

    /// Committer identity is only sent when complete.
    pub fn committer(&self) -> Option<(&str, &str)> {
        let name = self.author_name.trim();
        let email = self.author_email.trim();
        if name.is_empty() || email.is_empty() {
            None
        } else {
            Some((name, email))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteMirrorState {
    /// Blob SHA of the remote file as last seen.
    pub sha: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
}

// Contents API wire model
#[derive(Debug, Deserialize)]
pub struct ContentResponse {
    pub content: Option<String>,
    pub sha: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PutContentRequest<'a> {
    pub message: &'a str,
    pub content: String,
    pub branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committer: Option<Committer<'a>>,
}

#[derive(Debug, Serialize)]
pub struct Committer<'a> {
    pub name: &'a str,
    pub email: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct PutContentResponse {
    pub content: Option<ContentRef>,
}

#[derive(Debug, Deserialize)]
pub struct ContentRef {
    pub sha: Option<String>,
}
