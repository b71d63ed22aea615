//! Optimistic read-modify-write against the cluster.
//!
//! Writes carry the resource version they were read at; the API server rejects
//! stale writes with a conflict, which is retried here with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Errors that can report an optimistic-concurrency conflict.
pub trait ConflictError {
    fn is_conflict(&self) -> bool;
}

/// Backoff for conflict retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub steps: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_factor: f64,
    pub randomize_interval: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_interval_ms: 10,
            max_interval_ms: 1_000,
            backoff_factor: 2.0,
            randomize_interval: true,
        }
    }
}

/// Delay before the next attempt after `failures_so_far` conflicts (0 for the first),
/// or None when the attempt budget is spent.
pub fn next_retry_delay(failures_so_far: u32, policy: &RetryPolicy) -> Option<Duration> {
    if failures_so_far + 1 >= policy.steps {
        return None;
    }
    // delay_n = initial * factor^n
    let mut delay = (policy.initial_interval_ms as f64
        * policy.backoff_factor.powi(failures_so_far as i32))
    .round() as u64;
    if policy.randomize_interval {
        // Deterministic pseudo-random multiplier in [1.0, 1.5)
        let mut seed = (delay ^ ((failures_so_far as u64) << 32)).wrapping_add(0x9e37_79b9);
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let frac = ((seed >> 32) as f64) / (u32::MAX as f64);
        delay = (delay as f64 * (1.0 + frac / 2.0)).round() as u64;
    }
    Some(Duration::from_millis(delay.min(policy.max_interval_ms)))
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the policy gives up.
pub async fn retry_on_conflict<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: ConflictError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failures = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() => backoff(policy, &mut failures, e).await?,
            other => return other,
        }
    }
}

/// Sleep before the next conflict retry, or hand the error back once the budget is spent.
pub async fn backoff<E>(policy: &RetryPolicy, failures: &mut u32, err: E) -> Result<(), E>
where
    E: std::fmt::Display,
{
    match next_retry_delay(*failures, policy) {
        Some(delay) => {
            debug!(attempt = *failures + 1, error = %err, "conflict, retrying");
            tokio::time::sleep(delay).await;
            *failures += 1;
            Ok(())
        }
        None => Err(err),
    }
}

/// Result of [`update_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<T> {
    /// The mutation changed the object and the write was accepted.
    Updated(T),
    /// The mutation produced a structurally identical object; nothing was written.
    Unchanged(T),
}

impl<T> UpdateOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            UpdateOutcome::Updated(t) | UpdateOutcome::Unchanged(t) => t,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Fetch the latest object, apply `mutate` to a copy and write it back only if it changed.
///
/// Conflicts restart from a fresh fetch so `mutate` always sees current state.
pub async fn update_with_retry<T, E, F, FFut, M, W, WFut>(
    policy: &RetryPolicy,
    mut fetch: F,
    mut mutate: M,
    mut write: W,
) -> Result<UpdateOutcome<T>, E>
where
    T: Clone + PartialEq,
    E: ConflictError + std::fmt::Display,
    F: FnMut() -> FFut,
    FFut: Future<Output = Result<T, E>>,
    M: FnMut(&mut T),
    W: FnMut(T) -> WFut,
    WFut: Future<Output = Result<T, E>>,
{
    let mut failures = 0;
    loop {
        let attempt: Result<UpdateOutcome<T>, E> = async {
            let current = fetch().await?;
            let mut desired = current.clone();
            mutate(&mut desired);
            if desired == current {
                return Ok(UpdateOutcome::Unchanged(current));
            }
            write(desired).await.map(UpdateOutcome::Updated)
        }
        .await;
        match attempt {
            Err(e) if e.is_conflict() => backoff(policy, &mut failures, e).await?,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stop() {
        let policy = RetryPolicy {
            steps: 4,
            initial_interval_ms: 10,
            max_interval_ms: 1_000,
            backoff_factor: 2.0,
            randomize_interval: false,
        };
        assert_eq!(next_retry_delay(0, &policy), Some(Duration::from_millis(10)));
        assert_eq!(next_retry_delay(1, &policy), Some(Duration::from_millis(20)));
        assert_eq!(next_retry_delay(2, &policy), Some(Duration::from_millis(40)));
        assert_eq!(next_retry_delay(3, &policy), None);
    }

    #[test]
    fn randomized_delay_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for n in 0..3 {
            let base = 10.0 * 2f64.powi(n as i32);
            let d = next_retry_delay(n, &policy).unwrap().as_millis() as f64;
            assert!(d >= base && d <= base * 1.5 + 1.0, "delay {d} for n={n}");
        }
    }
}
