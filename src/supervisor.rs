//! Restart-on-exit for the long-running loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Exponential backoff between restarts. A run that lasted at least
/// `stable_after` resets the delay to `initial`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    stable_after: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            stable_after: Duration::from_secs(60),
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    fn observe_run(&mut self, ran_for: Duration) {
        if ran_for >= self.stable_after {
            self.reset();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Sleep for `duration`, waking early once `shutdown` is set.
pub fn sleep_unless_shutdown(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Run `task` until `shutdown` is set, restarting it with backoff whenever it
/// returns or fails. Returns the number of restarts.
pub fn supervise<T, F>(name: &str, shutdown: &AtomicBool, mut backoff: Backoff, mut task: F) -> u32
where
    F: FnMut() -> Result<T>,
{
    let mut restarts = 0u32;
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        match task() {
            Ok(_) => log::warn!("{} exited", name),
            Err(e) => log::error!("{} failed: {:#}", name, e),
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        backoff.observe_run(started.elapsed());
        let delay = backoff.next_delay();
        restarts += 1;
        log::info!("restarting {} in {:?} (restart #{})", name, delay, restarts);
        sleep_unless_shutdown(shutdown, delay);
    }
    log::info!("{} stopped", name);
    restarts
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        backoff.observe_run(Duration::from_secs(120));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn supervise_restarts_until_shutdown() {
        let shutdown = AtomicBool::new(false);
        let mut runs = 0;
        let restarts = supervise(
            "flaky",
            &shutdown,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            || {
                runs += 1;
                if runs == 4 {
                    shutdown.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(anyhow!("connection refused"))
            },
        );
        assert_eq!(runs, 4);
        assert_eq!(restarts, 3);
    }

    #[test]
    fn sleep_returns_early_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let started = Instant::now();
        sleep_unless_shutdown(&shutdown, Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
