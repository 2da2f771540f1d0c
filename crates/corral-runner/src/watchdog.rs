//! Inactivity watchdog
//!
//! A resettable timer fed by the spawner's activity signal. If no output
//! event arrives within the window, the watchdog fires once with a
//! descriptive inactivity error; the runner reacts by terminating the run
//! with a zero grace period. A `None`/zero window disables the watchdog.

use corral_foundation::Error;
use std::time::Duration;
use tokio::sync::watch;

/// Armed inactivity timer for one run.
pub struct Watchdog {
    window: Option<Duration>,
    activity: watch::Receiver<u64>,
}

impl Watchdog {
    /// Arm with `window`; every change on `activity` resets the timer.
    pub fn arm(window: Option<Duration>, activity: watch::Receiver<u64>) -> Self {
        let window = window.filter(|w| !w.is_zero());
        Self { window, activity }
    }

    /// Resolves with an `InactivityTimeout` when the window elapses with no
    /// activity; pends forever when disabled or once the streams close
    /// (process exit settles the outer race instead).
    pub async fn expired(mut self) -> Error {
        let Some(window) = self.window else {
            return std::future::pending().await;
        };
        loop {
            match tokio::time::timeout(window, self.activity.changed()).await {
                // Output arrived; restart the window.
                Ok(Ok(())) => continue,
                // Streams closed: nothing further can arrive, leave the
                // outcome to the exit future.
                Ok(Err(_)) => return std::future::pending().await,
                Err(_) => {
                    return Error::InactivityTimeout {
                        idle_ms: window.as_millis() as u64,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_after_silence() {
        let (_tx, rx) = watch::channel(0u64);
        let dog = Watchdog::arm(Some(Duration::from_millis(50)), rx);
        let err = tokio::time::timeout(Duration::from_secs(2), dog.expired())
            .await
            .expect("watchdog should fire");
        assert!(matches!(err, Error::InactivityTimeout { idle_ms: 50 }));
    }

    #[tokio::test]
    async fn test_activity_resets_window() {
        let (tx, rx) = watch::channel(0u64);
        let dog = Watchdog::arm(Some(Duration::from_millis(100)), rx);

        let feeder = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(40)).await;
                tx.send_modify(|n| *n += 1);
            }
            // Hold the sender a little longer, then go silent.
            tokio::time::sleep(Duration::from_millis(250)).await;
        });

        let start = std::time::Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(2), dog.expired())
            .await
            .expect("watchdog should eventually fire");
        assert!(matches!(err, Error::InactivityTimeout { .. }));
        // Five resets at 40ms kept it alive past the bare 100ms window.
        assert!(start.elapsed() >= Duration::from_millis(250));
        let _ = feeder.await;
    }

    #[tokio::test]
    async fn test_disabled_never_fires() {
        let (_tx, rx) = watch::channel(0u64);
        let dog = Watchdog::arm(None, rx);
        let fired = tokio::time::timeout(Duration::from_millis(100), dog.expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_zero_window_disables() {
        let (_tx, rx) = watch::channel(0u64);
        let dog = Watchdog::arm(Some(Duration::ZERO), rx);
        let fired = tokio::time::timeout(Duration::from_millis(100), dog.expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_closed_sender_pends() {
        let (tx, rx) = watch::channel(0u64);
        drop(tx);
        let dog = Watchdog::arm(Some(Duration::from_millis(20)), rx);
        // Window elapsed but the stream is closed; the dog stays quiet.
        let fired = tokio::time::timeout(Duration::from_millis(100), dog.expired()).await;
        assert!(fired.is_err());
    }
}
