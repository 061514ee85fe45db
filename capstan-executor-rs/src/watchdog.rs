//! Per-subprocess timeout enforcement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Watchdog {
    timed_out: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Arm a watchdog; `on_timeout` fires once if `timeout` elapses before
    /// [`Watchdog::stop`] is called.
    pub fn start(timeout: Duration, on_timeout: impl FnOnce() + Send + 'static) -> Self {
        let timed_out = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let flag = timed_out.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    flag.store(true, Ordering::SeqCst);
                    on_timeout();
                }
                _ = token.cancelled() => {}
            }
        });

        Self { timed_out, cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_timeout() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let watchdog = Watchdog::start(Duration::from_secs(5), move || {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(watchdog.timed_out());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let watchdog = Watchdog::start(Duration::from_secs(5), move || {
            flag.store(true, Ordering::SeqCst);
        });
        watchdog.stop();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!watchdog.timed_out());
        assert!(!fired.load(Ordering::SeqCst));
    }
}
