//! Background reconnect for long-running deployments.
//!
//! Retries [`ConnectionManager::connect`] with exponential backoff until it
//! succeeds, the policy runs out, or the cancellation token fires.

use crate::services::connection::ConnectionManager;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for reconnect behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Extra random delay, as a fraction of the base delay. Only ever added,
    /// so a retry never fires before its base delay.
    pub jitter: f64,
    /// Total connect attempts, the first one included. `None` is unbounded.
    pub max_attempts: Option<u32>,
    /// Give up once this much wall time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    /// Same delay between every attempt, no jitter, no bound.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
            max_elapsed: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Deterministic base delays; jitter is applied separately.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(self.max_elapsed)
            .build()
    }

    fn with_jitter(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = base.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
        base + Duration::from_secs_f64(extra)
    }
}

/// How a reconnect run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected { attempts: u32 },
    /// No URI configured; nothing to connect to.
    Skipped,
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Spawn [`reconnect`] on the runtime.
pub fn spawn_reconnect(
    manager: ConnectionManager,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> JoinHandle<ReconnectOutcome> {
    tokio::spawn(async move { reconnect(&manager, &policy, &cancel).await })
}

/// Connect, retrying failures according to `policy`.
///
/// Cancellation is observed between attempts; an attempt already in flight
/// is allowed to finish so readiness never stays stuck in `Connecting`.
pub async fn reconnect(
    manager: &ConnectionManager,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> ReconnectOutcome {
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            tracing::info!(attempts, "Store reconnect cancelled");
            return ReconnectOutcome::Cancelled { attempts };
        }

        attempts += 1;
        let error = match manager.connect().await {
            Ok(Some(_)) => {
                if attempts > 1 {
                    tracing::info!(attempts, "Store connection succeeded after retry");
                }
                return ReconnectOutcome::Connected { attempts };
            }
            Ok(None) => return ReconnectOutcome::Skipped,
            Err(e) => e,
        };

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            tracing::error!(attempts, error = %error, "Store reconnect gave up after max attempts");
            return ReconnectOutcome::Exhausted { attempts };
        }

        let Some(base) = backoff.next_backoff() else {
            tracing::error!(attempts, error = %error, "Store reconnect gave up after max elapsed time");
            return ReconnectOutcome::Exhausted { attempts };
        };
        let delay = policy.with_jitter(base);

        tracing::warn!(
            attempt = attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Store connection failed, retrying after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(attempts, "Store reconnect cancelled");
                return ReconnectOutcome::Cancelled { attempts };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, None);
    }

    #[test]
    fn test_jitter_only_lengthens_delays() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..Default::default()
        };
        let base = Duration::from_secs(5);
        for _ in 0..200 {
            let delay = policy.with_jitter(base);
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(7500));
        }
    }

    #[test]
    fn test_default_base_delays_grow_to_cap() {
        let mut backoff = RetryPolicy::default().backoff();
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_backoff().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let policy = RetryPolicy {
            jitter: 0.0,
            max_delay: Duration::from_secs(15),
            ..Default::default()
        };
        let mut backoff = policy.backoff();

        let delays: Vec<u64> = (0..4)
            .map(|_| backoff.next_backoff().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 15, 15]);
    }

    #[test]
    fn test_fixed_policy_never_grows() {
        let mut backoff = RetryPolicy::fixed(Duration::from_secs(5)).backoff();
        for _ in 0..20 {
            assert_eq!(backoff.next_backoff().unwrap().as_secs(), 5);
        }
    }
}
