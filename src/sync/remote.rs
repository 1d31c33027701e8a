//! Remote Git host access.
//!
//! The engine talks to the remote through the [`GitHost`] trait: read the
//! branch tree, read blobs, and write blobs, one tree, one commit and a
//! fast-forward ref update per push. [`GitHubHost`] implements it over the
//! GitHub Git data API, and [`Retrying`] adds timeouts and backoff to any
//! host.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::config::{RemoteSettings, SyncSettings};

/// Snapshot of the remote branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTree {
    /// Branch head. `None` if the branch does not exist yet.
    pub commit: Option<String>,
    /// Root tree of the head commit.
    pub tree: Option<String>,
    /// Path → blob id for every file on the branch.
    pub blobs: BTreeMap<String, String>,
}

/// One path to write (`blob: Some`) or delete (`blob: None`) in a new tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub path: String,
    pub blob: Option<String>,
}

/// Remote failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The branch moved; the update would not be a fast-forward.
    #[error("Branch '{branch}' moved on the remote; update is not a fast-forward")]
    NonFastForward { branch: String },

    #[error("Invalid remote response: {0}")]
    InvalidResponse(String),

    #[error("Remote {op} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: Box<RemoteError>,
    },
}

impl RemoteError {
    /// Network errors, timeouts, 5xx and 429 are worth retrying. Other 4xx
    /// (auth, not found, validation) are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::NonFastForward { .. } | Self::InvalidResponse(_) | Self::RetriesExhausted { .. } => {
                false
            }
        }
    }
}

/// Git data operations the sync engine needs from a remote host.
pub trait GitHost: Send + Sync {
    /// Read the current branch head and its full file listing.
    fn fetch_tree(&self) -> impl Future<Output = Result<RemoteTree, RemoteError>> + Send;

    /// Read one blob's bytes.
    fn fetch_blob(&self, sha: &str) -> impl Future<Output = Result<Vec<u8>, RemoteError>> + Send;

    /// Store bytes as a blob, returning its id.
    fn create_blob(&self, content: &[u8]) -> impl Future<Output = Result<String, RemoteError>> + Send;

    /// Create a tree from `base` with `changes` applied, returning its id.
    fn create_tree(
        &self,
        base: Option<&str>,
        changes: &[TreeChange],
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;

    /// Create a commit object, returning its id.
    fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parents: &[String],
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;

    /// Move the branch from `expected` to `commit`.
    ///
    /// Fails with [`RemoteError::NonFastForward`] if the branch head is no
    /// longer `expected` (`None` = the branch must not exist yet).
    fn update_ref(
        &self,
        expected: Option<&str>,
        commit: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

// ── Retry ─────────────────────────────────────────────────────

/// Timeout and backoff applied to every remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from settings.
    #[must_use]
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.retry_backoff_ms),
            ..Self::default()
        }
    }

    /// Sleep before the next attempt, plus the backoff after that.
    ///
    /// Jitter is bounded to half the current backoff. The next backoff
    /// doubles, capped at `max_backoff`.
    #[must_use]
    pub fn next_backoff(&self, current: Duration, jitter_seed: u64) -> (Duration, Duration) {
        let current_ms = u64::try_from(current.as_millis()).unwrap_or(u64::MAX);
        let max_jitter = current_ms.saturating_div(2).saturating_add(1);
        let sleep = Duration::from_millis(current_ms.saturating_add(jitter_seed % max_jitter));
        let next = current.saturating_mul(2).min(self.max_backoff);
        (sleep, next)
    }

    /// Run `f` with a timeout, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or
    /// [`RemoteError::RetriesExhausted`] wrapping the last transient one.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(self.timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let seed = u64::from(chrono::Utc::now().timestamp_subsec_nanos());
                    let (sleep, next) = self.next_backoff(backoff, seed);
                    tracing::warn!(op, attempt, error = %e, sleep_ms = sleep.as_millis(), "Transient remote failure, retrying");
                    tokio::time::sleep(sleep).await;
                    backoff = next;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(op, attempt, error = %e, "Remote retry limit exceeded");
                    return Err(RemoteError::RetriesExhausted {
                        op: op.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wraps a host so every call gets the policy's timeout and retries.
pub struct Retrying<H> {
    inner: H,
    policy: RetryPolicy,
}

impl<H: GitHost> Retrying<H> {
    pub const fn new(inner: H, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub const fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H: GitHost> GitHost for Retrying<H> {
    async fn fetch_tree(&self) -> Result<RemoteTree, RemoteError> {
        self.policy.run("fetch_tree", || self.inner.fetch_tree()).await
    }

    async fn fetch_blob(&self, sha: &str) -> Result<Vec<u8>, RemoteError> {
        self.policy.run("fetch_blob", || self.inner.fetch_blob(sha)).await
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String, RemoteError> {
        self.policy.run("create_blob", || self.inner.create_blob(content)).await
    }

    async fn create_tree(
        &self,
        base: Option<&str>,
        changes: &[TreeChange],
    ) -> Result<String, RemoteError> {
        self.policy
            .run("create_tree", || self.inner.create_tree(base, changes))
            .await
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parents: &[String],
    ) -> Result<String, RemoteError> {
        self.policy
            .run("create_commit", || self.inner.create_commit(message, tree, parents))
            .await
    }

    async fn update_ref(&self, expected: Option<&str>, commit: &str) -> Result<(), RemoteError> {
        self.policy
            .run("update_ref", || self.inner.update_ref(expected, commit))
            .await
    }
}

// ── GitHub ────────────────────────────────────────────────────

/// GitHub Git data API client.
pub struct GitHubHost {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    branch: String,
    token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    tree: GitObject,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Debug, Serialize)]
struct CreateBlobRequest {
    content: String,
    encoding: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateTreeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_tree: Option<&'a str>,
    tree: Vec<CreateTreeEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct CreateTreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    /// `null` deletes the path from the base tree.
    sha: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CreateCommitRequest<'a> {
    message: &'a str,
    tree: &'a str,
    parents: &'a [String],
}

#[derive(Debug, Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    name: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateRefRequest<'a> {
    sha: &'a str,
    force: bool,
}

impl GitHubHost {
    /// Create a client from remote settings.
    #[must_use]
    pub fn new(remote: &RemoteSettings, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: remote.api_url.trim_end_matches('/').to_string(),
            owner: remote.owner.clone(),
            repo: remote.repo.clone(),
            branch: remote.branch.clone(),
            token: remote.token.clone(),
            timeout,
        }
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/repos/{}/{}/git/{tail}", self.api_url, self.owner, self.repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, concat!("psync/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(self.timeout)
            } else {
                RemoteError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        self.send(req)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn head(&self) -> Result<Option<String>, RemoteError> {
        let url = self.url(&format!("ref/heads/{}", self.branch));
        match self
            .send_json::<RefResponse>(self.request(reqwest::Method::GET, &url))
            .await
        {
            Ok(r) => Ok(Some(r.object.sha)),
            // 404 on an empty repository, 409 on a repository with no commits
            Err(RemoteError::Http { status: 404 | 409, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl GitHost for GitHubHost {
    async fn fetch_tree(&self) -> Result<RemoteTree, RemoteError> {
        let Some(commit) = self.head().await? else {
            return Ok(RemoteTree::default());
        };

        let url = self.url(&format!("commits/{commit}"));
        let commit_obj: CommitResponse = self
            .send_json(self.request(reqwest::Method::GET, &url))
            .await?;
        let tree_sha = commit_obj.tree.sha;

        let url = self.url(&format!("trees/{tree_sha}?recursive=1"));
        let tree: TreeResponse = self
            .send_json(self.request(reqwest::Method::GET, &url))
            .await?;
        if tree.truncated {
            return Err(RemoteError::InvalidResponse(
                "tree listing truncated by the host".to_string(),
            ));
        }

        let blobs = tree
            .tree
            .into_iter()
            .filter(|item| item.kind == "blob")
            .map(|item| (item.path, item.sha))
            .collect();

        Ok(RemoteTree {
            commit: Some(commit),
            tree: Some(tree_sha),
            blobs,
        })
    }

    async fn fetch_blob(&self, sha: &str) -> Result<Vec<u8>, RemoteError> {
        let url = self.url(&format!("blobs/{sha}"));
        let blob: BlobResponse = self
            .send_json(self.request(reqwest::Method::GET, &url))
            .await?;
        if blob.encoding != "base64" {
            return Err(RemoteError::InvalidResponse(format!(
                "unexpected blob encoding '{}'",
                blob.encoding
            )));
        }
        let packed: String = blob.content.split_whitespace().collect();
        BASE64
            .decode(packed)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String, RemoteError> {
        let body = CreateBlobRequest {
            content: BASE64.encode(content),
            encoding: "base64",
        };
        let created: GitObject = self
            .send_json(self.request(reqwest::Method::POST, &self.url("blobs")).json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn create_tree(
        &self,
        base: Option<&str>,
        changes: &[TreeChange],
    ) -> Result<String, RemoteError> {
        let body = CreateTreeRequest {
            base_tree: base,
            tree: changes
                .iter()
                .map(|c| CreateTreeEntry {
                    path: &c.path,
                    mode: "100644",
                    kind: "blob",
                    sha: c.blob.as_deref(),
                })
                .collect(),
        };
        let created: GitObject = self
            .send_json(self.request(reqwest::Method::POST, &self.url("trees")).json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parents: &[String],
    ) -> Result<String, RemoteError> {
        let body = CreateCommitRequest {
            message,
            tree,
            parents,
        };
        let created: GitObject = self
            .send_json(self.request(reqwest::Method::POST, &self.url("commits")).json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn update_ref(&self, expected: Option<&str>, commit: &str) -> Result<(), RemoteError> {
        let non_ff = || RemoteError::NonFastForward {
            branch: self.branch.clone(),
        };

        if self.head().await?.as_deref() != expected {
            return Err(non_ff());
        }

        let result = if expected.is_some() {
            let url = self.url(&format!("refs/heads/{}", self.branch));
            let body = UpdateRefRequest {
                sha: commit,
                force: false,
            };
            self.send(self.request(reqwest::Method::PATCH, &url).json(&body))
                .await
        } else {
            let body = CreateRefRequest {
                name: format!("refs/heads/{}", self.branch),
                sha: commit,
            };
            self.send(self.request(reqwest::Method::POST, &self.url("refs")).json(&body))
                .await
        };

        match result {
            Ok(_) => Ok(()),
            Err(RemoteError::Http { status: 422, .. }) => Err(non_ff()),
            Err(e) => Err(e),
        }
    }
}

// ── Test double ───────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    //! In-memory [`GitHost`] with failure injection.

    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Mutex;

    use super::{GitHost, RemoteError, RemoteTree, TreeChange};
    use crate::sync::blob_hash;

    #[derive(Default)]
    struct State {
        blobs: HashMap<String, Vec<u8>>,
        trees: HashMap<String, BTreeMap<String, String>>,
        commits: HashMap<String, String>,
        head: Option<String>,
        counter: u64,
        failures: VecDeque<(&'static str, RemoteError)>,
        calls: Vec<&'static str>,
    }

    impl State {
        fn check(&mut self, op: &'static str) -> Result<(), RemoteError> {
            self.calls.push(op);
            if let Some(pos) = self.failures.iter().position(|(o, _)| *o == op) {
                if let Some((_, err)) = self.failures.remove(pos) {
                    return Err(err);
                }
            }
            Ok(())
        }

        fn store_tree(&mut self, files: BTreeMap<String, String>) -> String {
            let listing: String = files.iter().map(|(p, s)| format!("{s} {p}\n")).collect();
            let sha = blob_hash(format!("tree\n{listing}").as_bytes());
            self.trees.insert(sha.clone(), files);
            sha
        }

        fn store_commit(&mut self, tree: &str) -> String {
            self.counter += 1;
            let sha = blob_hash(format!("commit {} {tree}", self.counter).as_bytes());
            self.commits.insert(sha.clone(), tree.to_string());
            sha
        }

        fn head_files(&self) -> BTreeMap<String, String> {
            self.head
                .as_ref()
                .and_then(|c| self.commits.get(c))
                .and_then(|t| self.trees.get(t))
                .cloned()
                .unwrap_or_default()
        }
    }

    /// A remote branch held in memory.
    #[derive(Default)]
    pub struct MemoryGitHost {
        state: Mutex<State>,
    }

    impl MemoryGitHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Commit `content` at `path` directly on the branch, as another
        /// client would.
        pub fn put_file(&self, path: &str, content: &[u8]) -> String {
            let mut state = self.state.lock().unwrap();
            let sha = blob_hash(content);
            state.blobs.insert(sha.clone(), content.to_vec());
            let mut files = state.head_files();
            files.insert(path.to_string(), sha.clone());
            let tree = state.store_tree(files);
            let commit = state.store_commit(&tree);
            state.head = Some(commit);
            sha
        }

        /// Remove `path` from the branch in a new commit.
        pub fn remove_file(&self, path: &str) {
            let mut state = self.state.lock().unwrap();
            let mut files = state.head_files();
            files.remove(path);
            let tree = state.store_tree(files);
            let commit = state.store_commit(&tree);
            state.head = Some(commit);
        }

        /// Current branch content at `path`.
        pub fn file(&self, path: &str) -> Option<Vec<u8>> {
            let state = self.state.lock().unwrap();
            let sha = state.head_files().get(path)?.clone();
            state.blobs.get(&sha).cloned()
        }

        pub fn paths(&self) -> Vec<String> {
            self.state.lock().unwrap().head_files().into_keys().collect()
        }

        pub fn head(&self) -> Option<String> {
            self.state.lock().unwrap().head.clone()
        }

        /// Make the next call to `op` fail with `err`.
        pub fn fail_next(&self, op: &'static str, err: RemoteError) {
            self.state.lock().unwrap().failures.push_back((op, err));
        }

        /// Number of calls made to `op`, failed ones included.
        pub fn call_count(&self, op: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|c| **c == op)
                .count()
        }
    }

    impl GitHost for MemoryGitHost {
        async fn fetch_tree(&self) -> Result<RemoteTree, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.check("fetch_tree")?;
            let tree = state.head.as_ref().and_then(|c| state.commits.get(c)).cloned();
            Ok(RemoteTree {
                commit: state.head.clone(),
                tree,
                blobs: state.head_files(),
            })
        }

        async fn fetch_blob(&self, sha: &str) -> Result<Vec<u8>, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.check("fetch_blob")?;
            state.blobs.get(sha).cloned().ok_or_else(|| RemoteError::Http {
                status: 404,
                message: format!("blob {sha} not found"),
            })
        }

        async fn create_blob(&self, content: &[u8]) -> Result<String, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.check("create_blob")?;
            let sha = blob_hash(content);
            state.blobs.insert(sha.clone(), content.to_vec());
            Ok(sha)
        }

        async fn create_tree(
            &self,
            base: Option<&str>,
            changes: &[TreeChange],
        ) -> Result<String, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.check("create_tree")?;
            let mut files = base
                .and_then(|b| state.trees.get(b))
                .cloned()
                .unwrap_or_default();
            for change in changes {
                match &change.blob {
                    Some(sha) => {
                        files.insert(change.path.clone(), sha.clone());
                    }
                    None => {
                        files.remove(&change.path);
                    }
                }
            }
            Ok(state.store_tree(files))
        }

        async fn create_commit(
            &self,
            _message: &str,
            tree: &str,
            _parents: &[String],
        ) -> Result<String, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.check("create_commit")?;
            Ok(state.store_commit(tree))
        }

        async fn update_ref(&self, expected: Option<&str>, commit: &str) -> Result<(), RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.check("update_ref")?;
            if state.head.as_deref() != expected {
                return Err(RemoteError::NonFastForward {
                    branch: "main".to_string(),
                });
            }
            state.head = Some(commit.to_string());
            Ok(())
        }
    }
}
