//! Periodic `du` over the per-build work directories; builds whose
//! footprint exceeds the limit are killed through a callback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::process::Command;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type OverLimitFn = Arc<dyn Fn(&Path) + Send + Sync>;

pub struct DiskAccountant {
    jobs_base: PathBuf,
    cache_dir: PathBuf,
    /// MB per build; negative disables the accountant.
    limit: i64,
    over_limit: OverLimitFn,
}

impl DiskAccountant {
    pub fn new(
        jobs_base: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        limit: i64,
        over_limit: OverLimitFn,
    ) -> Self {
        let jobs_base = strip_trailing_slash(jobs_base.into());
        let cache_dir = strip_trailing_slash(cache_dir.into());
        assert_ne!(jobs_base, cache_dir, "cache dir and jobs dir cannot be the same");
        Self { jobs_base, cache_dir, limit, over_limit }
    }

    /// One accounting pass; returns `(dir, MB)` for every build dir seen.
    pub async fn measure(&self) -> Vec<(PathBuf, i64)> {
        // The cache dir goes first so hardlinks into it are not counted
        // against any single job.
        let output = match Command::new("du")
            .arg("-m")
            .arg("--max-depth=1")
            .arg(&self.cache_dir)
            .arg(&self.jobs_base)
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!(%err, "could not run du");
                return Vec::new();
            }
        };

        let mut usage = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Some((size, dirname)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let dirname = Path::new(dirname.trim());
            if dirname == self.jobs_base || dirname == self.cache_dir {
                continue;
            }
            if dirname.parent() == Some(self.cache_dir.as_path()) {
                continue;
            }
            let Ok(size) = size.trim().parse::<i64>() else {
                continue;
            };
            usage.push((dirname.to_path_buf(), size));
        }
        usage
    }

    async fn pass(&self) -> Duration {
        let before = Instant::now();
        for (dirname, size) in self.measure().await {
            if size > self.limit {
                warn!(dir = %dirname.display(), size, limit = self.limit, "build over disk limit");
                (self.over_limit)(&dirname);
            } else {
                debug!(dir = %dirname.display(), size, limit = self.limit, "build disk usage");
            }
        }
        // Sleep half as long as the pass took, or 1s, whichever is longer.
        before.elapsed().div_f64(2.0).max(Duration::from_secs(1))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if self.limit < 0 {
            return;
        }
        loop {
            let delay = self.pass().await;
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}

fn strip_trailing_slash(path: PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_over_limit_build_reported() {
        let base = tempfile::tempdir().unwrap();
        let jobs = base.path().join("builds");
        let cache = base.path().join("cache");
        let build = jobs.join("abcd0123");
        std::fs::create_dir_all(&build).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        // ~3 MB of data in the build dir.
        std::fs::write(build.join("blob"), vec![0u8; 3 * 1024 * 1024]).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let accountant = DiskAccountant::new(
            &jobs,
            &cache,
            1,
            Arc::new(move |dir: &Path| {
                assert!(dir.ends_with("abcd0123"));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        accountant.pass().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_children_not_counted() {
        let base = tempfile::tempdir().unwrap();
        let jobs = base.path().join("builds");
        let cache = base.path().join("cache");
        std::fs::create_dir_all(&jobs).unwrap();
        std::fs::create_dir_all(cache.join("some-repo")).unwrap();
        std::fs::write(cache.join("some-repo/blob"), vec![0u8; 2 * 1024 * 1024]).unwrap();

        let accountant = DiskAccountant::new(&jobs, &cache, 1, Arc::new(|_: &Path| panic!()));
        let usage = accountant.measure().await;
        assert!(usage.is_empty(), "{usage:?}");
    }
}
