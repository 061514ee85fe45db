//! Deterministic working trees and speculative merges.
//!
//! The merger keeps a mirror clone per `(connection, project)` under its
//! root and drives everything through the `git` CLI. A process-wide map of
//! per-repo locks serializes mutations; the frozen repo state supplied by
//! the scheduler is reapplied before every operation so identical inputs
//! produce identical trees on every executor.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capstan_rs::types::{MergeItem, RepoState};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum MergerError {
    #[error("unknown connection `{0}`")]
    UnknownConnection(String),
    /// Fetch or missing-object failures; retriable on another executor.
    #[error("could not fetch repository state: {0}")]
    Fetch(String),
    #[error("git {command} failed: {stderr}")]
    GitFailed { command: String, stderr: String },
    #[error("git subprocess environment broken: {0}")]
    Broken(String),
    #[error("git {0} timed out")]
    Timeout(String),
}

/// Result of a successful speculative merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Head commit produced by the final merge.
    pub commit: String,
    /// Paths touched relative to the first item's branch head.
    pub files: Vec<String>,
    /// Repo state updated with the merged branch heads.
    pub repo_state: RepoState,
    /// `(connection, project, branch) -> sha` of the merged heads.
    pub recent: BTreeMap<(String, String, String), String>,
    /// Branch head the first merge was based on, for line mapping.
    pub orig_commit: String,
}

pub struct Merger {
    root: PathBuf,
    /// `connection -> base URL`; a project's upstream is `<base>/<name>`.
    sources: HashMap<String, String>,
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
    /// Set when a git subprocess could not even be spawned; callers see a
    /// transient error until `reset` runs.
    broken: AtomicBool,
}

impl Merger {
    pub fn new(root: impl Into<PathBuf>, sources: HashMap<String, String>) -> Self {
        Self {
            root: root.into(),
            sources,
            locks: Mutex::new(HashMap::new()),
            broken: AtomicBool::new(false),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Clear the broken flag after the caller has surfaced the transient
    /// failure.
    pub fn reset(&self) {
        if self.broken.swap(false, Ordering::SeqCst) {
            info!("merger subprocess environment reset");
        }
    }

    pub fn repo_path(&self, connection: &str, project: &str) -> PathBuf {
        self.root.join(connection).join(project)
    }

    fn repo_lock(&self, connection: &str, project: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry((connection.to_string(), project.to_string()))
            .or_default()
            .clone()
    }

    fn upstream_url(&self, connection: &str, project: &str) -> Result<String, MergerError> {
        let base = self
            .sources
            .get(connection)
            .ok_or_else(|| MergerError::UnknownConnection(connection.to_string()))?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), project))
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, MergerError> {
        debug!(cwd = %cwd.display(), ?args, "running git");
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(cwd)
            // Fixed identity and dates: a speculative merge of the same
            // items on the same repo state must produce the same commit
            // on every executor.
            .env("GIT_AUTHOR_NAME", "capstan-merger")
            .env("GIT_AUTHOR_EMAIL", "merger@capstan.invalid")
            .env("GIT_COMMITTER_NAME", "capstan-merger")
            .env("GIT_COMMITTER_EMAIL", "merger@capstan.invalid")
            .env("GIT_AUTHOR_DATE", "2000-01-01T00:00:00 +0000")
            .env("GIT_COMMITTER_DATE", "2000-01-01T00:00:00 +0000")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|err| {
            self.broken.store(true, Ordering::SeqCst);
            MergerError::Broken(err.to_string())
        })?;
        let output = timeout(GIT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| MergerError::Timeout(args.join(" ")))?
            .map_err(|err| {
                self.broken.store(true, Ordering::SeqCst);
                MergerError::Broken(err.to_string())
            })?;
        if !output.status.success() {
            return Err(MergerError::GitFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Clone or fetch the mirror, then pin any refs named in `repo_state`
    /// so the cache is deterministic. Returns the branches now present.
    pub async fn update_repo(
        &self,
        connection: &str,
        project: &str,
        repo_state: Option<&RepoState>,
    ) -> Result<Vec<String>, MergerError> {
        let lock = self.repo_lock(connection, project);
        let _guard = lock.lock().await;

        let path = self.repo_path(connection, project);
        if !path.join("HEAD").exists() {
            let url = self.upstream_url(connection, project)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| MergerError::Broken(err.to_string()))?;
            }
            info!(connection, project, url, "cloning repository");
            let path_str = path.to_string_lossy().into_owned();
            self.git(Path::new("."), &["clone", "--mirror", &url, &path_str])
                .await
                .map_err(fetch_class)?;
        } else {
            self.git(&path, &["fetch", "--prune", "origin", "+refs/*:refs/*"])
                .await
                .map_err(fetch_class)?;
        }

        if let Some(state) = repo_state {
            if let Some(refs) = state.project(connection, project) {
                for (refname, sha) in refs {
                    self.git(&path, &["update-ref", refname, sha])
                        .await
                        .map_err(fetch_class)?;
                }
            }
        }

        let branches = self
            .git(&path, &["for-each-ref", "refs/heads", "--format=%(refname:short)"])
            .await?
            .lines()
            .map(str::to_string)
            .collect();
        Ok(branches)
    }

    /// Paths changed between `base_sha` and the branch head.
    pub async fn get_files_changes(
        &self,
        connection: &str,
        project: &str,
        branch: &str,
        base_sha: &str,
    ) -> Result<Vec<String>, MergerError> {
        let lock = self.repo_lock(connection, project);
        let _guard = lock.lock().await;
        let path = self.repo_path(connection, project);
        let range = format!("{base_sha}..refs/heads/{branch}");
        Ok(self
            .git(&path, &["diff", "--name-only", &range])
            .await?
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Produce a fresh working tree at `dest`, pinned to `repo_state` and
    /// checked out at `refname`. The tree's origin is then rewritten to
    /// `file:///dev/null` so sandboxed jobs cannot reach the real remote.
    pub async fn checkout_branch(
        &self,
        connection: &str,
        project: &str,
        dest: &Path,
        refname: &str,
        repo_state: &RepoState,
    ) -> Result<String, MergerError> {
        let lock = self.repo_lock(connection, project);
        let _guard = lock.lock().await;

        let cache = self.repo_path(connection, project);
        let cache_str = cache.to_string_lossy().into_owned();
        let dest_str = dest.to_string_lossy().into_owned();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| MergerError::Broken(err.to_string()))?;
        }
        self.git(Path::new("."), &["clone", &cache_str, &dest_str]).await?;

        if let Some(refs) = repo_state.project(connection, project) {
            for (refname, sha) in refs {
                self.git(dest, &["update-ref", refname, sha])
                    .await
                    .map_err(fetch_class)?;
            }
        }

        // checkout is a no-op when the clone's HEAD already names the
        // (re-pinned) branch; the hard reset aligns the worktree either way.
        self.git(dest, &["checkout", "-q", refname]).await.map_err(fetch_class)?;
        self.git(dest, &["reset", "-q", "--hard"]).await?;
        self.git(dest, &["remote", "set-url", "origin", "file:///dev/null"]).await?;

        let sha = self.git(dest, &["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    /// Apply a sequence of dependent changes on top of the supplied base
    /// state. `Ok(None)` is a merge conflict: fatal for the build and not
    /// retried on this executor. Fetch failures surface as
    /// [`MergerError::Fetch`] and are retriable.
    pub async fn merge_changes(
        &self,
        items: &[MergeItem],
        repo_state: &RepoState,
    ) -> Result<Option<MergeOutcome>, MergerError> {
        let mut state = repo_state.clone();
        let mut recent: BTreeMap<(String, String, String), String> = BTreeMap::new();
        let mut files = Vec::new();
        let mut commit = String::new();
        let mut orig_commit = String::new();

        let scratch = tempfile::Builder::new()
            .prefix("merge-")
            .tempdir_in(&self.root)
            .map_err(|err| MergerError::Broken(err.to_string()))?;

        for (index, item) in items.iter().enumerate() {
            let lock = self.repo_lock(&item.connection, &item.project);
            let _guard = lock.lock().await;

            let cache = self.repo_path(&item.connection, &item.project);
            let cache_str = cache.to_string_lossy().into_owned();
            let work = scratch.path().join(format!("{index}"));
            let work_str = work.to_string_lossy().into_owned();
            self.git(Path::new("."), &["clone", &cache_str, &work_str]).await?;

            if let Some(refs) = state.project(&item.connection, &item.project) {
                for (refname, sha) in refs {
                    self.git(&work, &["update-ref", refname, sha])
                        .await
                        .map_err(fetch_class)?;
                }
            }

            self.git(&work, &["checkout", "-q", &item.branch])
                .await
                .map_err(fetch_class)?;
            self.git(&work, &["reset", "-q", "--hard"]).await?;
            let base = self.git(&work, &["rev-parse", "HEAD"]).await?.trim().to_string();
            if orig_commit.is_empty() {
                orig_commit = base.clone();
            }

            let change_rev = match (&item.newrev, &item.refname) {
                (Some(newrev), _) => newrev.clone(),
                (None, Some(refname)) => {
                    self.git(&work, &["fetch", &cache_str, refname])
                        .await
                        .map_err(fetch_class)?;
                    "FETCH_HEAD".to_string()
                }
                (None, None) => {
                    return Err(MergerError::Fetch(format!(
                        "merge item for {}/{} names no revision",
                        item.connection, item.project
                    )))
                }
            };

            match self.git(&work, &["merge", "--no-edit", &change_rev]).await {
                Ok(_) => {}
                Err(MergerError::GitFailed { stderr, .. }) => {
                    // Unmerged index entries mean a genuine conflict; any
                    // other merge failure is a missing-object problem and
                    // retriable elsewhere.
                    let unmerged =
                        self.git(&work, &["ls-files", "-u"]).await.unwrap_or_default();
                    let _ = self.git(&work, &["merge", "--abort"]).await;
                    if unmerged.trim().is_empty() {
                        warn!(code = "merge-fetch", stderr, "speculative merge fetch failure");
                        return Err(MergerError::Fetch(stderr));
                    }
                    warn!(
                        code = "merge-conflict",
                        connection = %item.connection,
                        project = %item.project,
                        branch = %item.branch,
                        stderr,
                        "speculative merge conflict"
                    );
                    return Ok(None);
                }
                Err(err) => {
                    warn!(code = "merge-fetch", %err, "speculative merge fetch failure");
                    return Err(err);
                }
            }

            commit = self.git(&work, &["rev-parse", "HEAD"]).await?.trim().to_string();
            let range = format!("{base}..{commit}");
            files.extend(
                self.git(&work, &["diff", "--name-only", &range])
                    .await?
                    .lines()
                    .map(str::to_string),
            );

            // Publish the merged head back into the mirror so workspace
            // checkouts pinned to the new state can reach it.
            let branch_ref = format!("HEAD:refs/heads/{}", item.branch);
            self.git(&work, &["push", "--force", &cache_str, &branch_ref]).await?;

            let head_ref = format!("refs/heads/{}", item.branch);
            state.set(&item.connection, &item.project, &head_ref, &commit);
            recent.insert(
                (item.connection.clone(), item.project.clone(), item.branch.clone()),
                commit.clone(),
            );
        }

        Ok(Some(MergeOutcome { commit, files, repo_state: state, recent, orig_commit }))
    }
}

/// Classify command failures that indicate missing upstream state as
/// fetch failures (retriable) rather than generic git errors.
fn fetch_class(err: MergerError) -> MergerError {
    match err {
        MergerError::GitFailed { command, stderr } => {
            MergerError::Fetch(format!("git {command}: {stderr}"))
        }
        other => other,
    }
}
