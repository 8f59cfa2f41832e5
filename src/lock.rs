//! Lease Lock Module
//!
//! Distributed mutual exclusion whose ownership is an expiring deadline
//! stored under `<resource>:lock`.
//!
//! The store is the source of truth. Each [`LeaseLock`] additionally remembers
//! the deadline it last wrote for every resource it holds, which is what makes
//! renew and release possible without a network query. That memory is not
//! shared: one `LeaseLock` belongs to one logical owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::current_timestamp_ms;
use crate::client::KvClient;
use crate::error::{LockError, Result};

// == Lock Options ==
/// Tuning for lease acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Length of a lease
    pub duration: Duration,
    /// Give up waiting after this long, never sooner than `duration`; `None` waits one `duration`
    pub acquire_timeout: Option<Duration>,
    /// Takeover attempts before failing with high concurrency
    pub attempts: u32,
    /// First backoff step, also the increment per retry
    pub backoff_base: Duration,
    /// Upper bound of a single backoff sleep
    pub backoff_cap: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(15),
            acquire_timeout: None,
            attempts: 10,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(250),
        }
    }
}

// == Backoff ==
/// Linearly growing, capped, jittered sleep.
#[derive(Debug)]
struct Backoff {
    step: Duration,
    current: Duration,
    cap: Duration,
}

impl Backoff {
    fn new(step: Duration, cap: Duration) -> Self {
        Self {
            step,
            current: step,
            cap,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.cap);
        self.current = (self.current + self.step).min(self.cap);
        let half_ms = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(fastrand::u64(0..=half_ms))
    }
}

// == Lease Lock ==
/// Acquires, renews and releases named leases.
pub struct LeaseLock {
    client: Arc<dyn KvClient>,
    options: LockOptions,
    /// resource -> deadline (unix ms) this process wrote
    leases: HashMap<String, i64>,
}

impl LeaseLock {
    /// Creates a lock holding no leases.
    pub fn new(client: Arc<dyn KvClient>, options: LockOptions) -> Self {
        Self {
            client,
            options,
            leases: HashMap::new(),
        }
    }

    /// Returns the acquisition tuning.
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Takes the lease on `resource`, waiting while another owner holds it.
    ///
    /// Renews instead when this lock already holds the resource.
    pub fn acquire(&mut self, resource: &str) -> Result<bool> {
        if self.leases.contains_key(resource) {
            return self.renew(resource);
        }

        let lock_key = lock_key(resource);
        let started = Instant::now();
        let mut backoff = Backoff::new(self.options.backoff_base, self.options.backoff_cap);

        for attempt in 1..=self.options.attempts {
            // wait until the lease is free or its stored deadline has passed
            let observed = loop {
                let deadline = self.next_deadline();
                if self.client.set_nx(&lock_key, deadline.to_string().as_bytes())? {
                    return self.claim(resource, &lock_key, deadline);
                }

                let stored = self.client.get(&lock_key)?;
                match stored.as_deref().and_then(parse_deadline) {
                    Some(stored_deadline) if stored_deadline > current_timestamp_ms() => {
                        self.check_timeout(resource, started)?;
                        sleep(backoff.next_delay());
                    }
                    _ => break stored,
                }
            };

            // stale lease: swap in ours, it is ours only if nobody swapped first
            let deadline = self.next_deadline();
            let previous = self
                .client
                .get_set(&lock_key, deadline.to_string().as_bytes())?;
            if previous == observed {
                return self.claim(resource, &lock_key, deadline);
            }

            debug!(resource, attempt, "Lost lease takeover race");
            self.check_timeout(resource, started)?;
            sleep(backoff.next_delay());
        }

        Err(LockError::HighConcurrency {
            resource: resource.to_string(),
            attempts: self.options.attempts,
        }
        .into())
    }

    /// Extends a held lease. Returns false when the resource is not held.
    pub fn renew(&mut self, resource: &str) -> Result<bool> {
        let Some(&current) = self.leases.get(resource) else {
            return Ok(false);
        };

        if current <= current_timestamp_ms() {
            self.leases.remove(resource);
            return Err(LockError::DurabilityTimedOut {
                resource: resource.to_string(),
            }
            .into());
        }

        let lock_key = lock_key(resource);
        let deadline = self.next_deadline();
        let previous = self
            .client
            .get_set(&lock_key, deadline.to_string().as_bytes())?;
        if previous.as_deref().and_then(parse_deadline) != Some(current) {
            self.leases.remove(resource);
            return Err(LockError::InvalidDuration {
                resource: resource.to_string(),
            }
            .into());
        }

        self.client.expire_at(&lock_key, physical_expiry(deadline))?;
        self.leases.insert(resource.to_string(), deadline);
        debug!(resource, deadline, "Lease renewed");
        Ok(true)
    }

    /// Gives up the lease.
    ///
    /// The lock key is deleted only while the local deadline is still ahead;
    /// after it passed the key may already belong to someone else.
    pub fn release(&mut self, resource: &str) -> Result<bool> {
        let Some(deadline) = self.leases.remove(resource) else {
            return Ok(false);
        };

        if deadline <= current_timestamp_ms() {
            debug!(resource, "Lease already expired, leaving lock key alone");
            return Ok(false);
        }

        self.client.del(&[lock_key(resource)])?;
        debug!(resource, "Lease released");
        Ok(true)
    }

    /// Releases every held lease, returning the first failure.
    pub fn release_all(&mut self) -> Result<()> {
        let resources: Vec<String> = self.leases.keys().cloned().collect();
        let mut first_error = None;
        for resource in resources {
            if let Err(err) = self.release(&resource) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Renews every held lease, stopping at the first failure.
    pub fn renew_all(&mut self) -> Result<()> {
        let resources: Vec<String> = self.leases.keys().cloned().collect();
        for resource in resources {
            self.renew(&resource)?;
        }
        Ok(())
    }

    /// Whether this lock believes it holds `resource`.
    pub fn is_held(&self, resource: &str) -> bool {
        self.leases.contains_key(resource)
    }

    /// Time left on a held lease; zero once the deadline passed.
    pub fn remaining(&self, resource: &str) -> Option<Duration> {
        self.leases.get(resource).map(|deadline| {
            let left = deadline - current_timestamp_ms();
            Duration::from_millis(left.max(0) as u64)
        })
    }

    fn next_deadline(&self) -> i64 {
        current_timestamp_ms() + self.options.duration.as_millis() as i64
    }

    fn claim(&mut self, resource: &str, lock_key: &str, deadline: i64) -> Result<bool> {
        self.client.expire_at(lock_key, physical_expiry(deadline))?;
        self.leases.insert(resource.to_string(), deadline);
        debug!(resource, deadline, "Lease acquired");
        Ok(true)
    }

    /// Longest wait for a held lease: the acquire timeout, at least one lease.
    fn wait_limit(&self) -> Duration {
        let duration = self.options.duration;
        self.options
            .acquire_timeout
            .map_or(duration, |timeout| timeout.max(duration))
    }

    fn check_timeout(&self, resource: &str, started: Instant) -> Result<()> {
        let waited = started.elapsed();
        if waited >= self.wait_limit() {
            return Err(LockError::AcquireTimeout {
                resource: resource.to_string(),
                waited,
            }
            .into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("options", &self.options)
            .field("leases", &self.leases)
            .finish()
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_all() {
            warn!(error = %err, "Failed to release leases on shutdown");
        }
    }
}

/// Store key holding the deadline of `resource`.
pub fn lock_key(resource: &str) -> String {
    format!("{}:lock", resource)
}

fn parse_deadline(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

/// Unix seconds one second past `deadline_ms`, for EXPIREAT.
fn physical_expiry(deadline_ms: i64) -> i64 {
    deadline_ms / 1000 + 1
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use crate::client::MemoryClient;
    use crate::error::CacheError;

    fn options(duration_ms: u64, timeout_ms: Option<u64>) -> LockOptions {
        LockOptions {
            duration: Duration::from_millis(duration_ms),
            acquire_timeout: timeout_ms.map(Duration::from_millis),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
            ..LockOptions::default()
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let client = Arc::new(MemoryClient::new());
        let mut lock = LeaseLock::new(client.clone(), options(5_000, None));

        assert!(lock.acquire("res").unwrap());
        assert!(lock.is_held("res"));
        assert!(client.get("res:lock").unwrap().is_some());

        assert!(lock.release("res").unwrap());
        assert!(!lock.is_held("res"));
        assert!(client.get("res:lock").unwrap().is_none());
        assert!(!lock.release("res").unwrap());
    }

    #[test]
    fn test_contended_acquire_times_out() {
        let client = Arc::new(MemoryClient::new());
        let mut holder = LeaseLock::new(client.clone(), options(5_000, None));
        let mut waiter = LeaseLock::new(client, options(100, Some(100)));

        holder.acquire("res").unwrap();
        let err = waiter.acquire("res").unwrap_err();
        assert!(matches!(
            err,
            CacheError::Lock(LockError::AcquireTimeout { .. })
        ));
    }

    #[test]
    fn test_wait_limit_is_at_least_one_lease() {
        let client: Arc<dyn KvClient> = Arc::new(MemoryClient::new());
        let short = LeaseLock::new(client.clone(), options(300, Some(100)));
        let long = LeaseLock::new(client.clone(), options(300, Some(2_000)));
        let unbounded = LeaseLock::new(client, options(300, None));

        assert_eq!(short.wait_limit(), Duration::from_millis(300));
        assert_eq!(long.wait_limit(), Duration::from_millis(2_000));
        assert_eq!(unbounded.wait_limit(), Duration::from_millis(300));
    }

    #[test]
    fn test_waiter_gives_up_while_holder_keeps_renewing() {
        let client = Arc::new(MemoryClient::new());
        let stop = Arc::new(AtomicBool::new(false));

        let mut holder = LeaseLock::new(client.clone(), options(300, None));
        holder.acquire("res").unwrap();
        let holder_stop = stop.clone();
        let renewer = thread::spawn(move || {
            while !holder_stop.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(50));
                holder.renew("res").unwrap();
            }
        });

        let mut waiter = LeaseLock::new(client, options(300, None));
        let started = Instant::now();
        let err = waiter.acquire("res").unwrap_err();
        let waited = started.elapsed();
        stop.store(true, Ordering::SeqCst);
        renewer.join().unwrap();

        assert!(matches!(
            err,
            CacheError::Lock(LockError::AcquireTimeout { .. })
        ));
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_secs(2));
        assert!(!waiter.is_held("res"));
    }

    #[test]
    fn test_acquire_twice_renews() {
        let client = Arc::new(MemoryClient::new());
        let mut lock = LeaseLock::new(client.clone(), options(5_000, None));

        lock.acquire("res").unwrap();
        let first = parse_deadline(&client.get("res:lock").unwrap().unwrap()).unwrap();
        sleep(Duration::from_millis(5));
        assert!(lock.acquire("res").unwrap());
        let second = parse_deadline(&client.get("res:lock").unwrap().unwrap()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let client = Arc::new(MemoryClient::new());
        let mut first = LeaseLock::new(client.clone(), options(100, None));
        let mut second = LeaseLock::new(client.clone(), options(5_000, Some(2_000)));

        first.acquire("res").unwrap();
        assert!(second.acquire("res").unwrap());

        // the first holder cannot prove exclusivity anymore
        let err = first.renew("res").unwrap_err();
        assert!(matches!(
            err,
            CacheError::Lock(LockError::DurabilityTimedOut { .. })
        ));
        assert!(!first.release("res").unwrap());
        assert!(client.get("res:lock").unwrap().is_some());
    }

    #[test]
    fn test_release_after_deadline_keeps_key() {
        let client = Arc::new(MemoryClient::new());
        let mut lock = LeaseLock::new(client.clone(), options(50, None));

        lock.acquire("res").unwrap();
        sleep(Duration::from_millis(80));
        assert!(!lock.release("res").unwrap());
        assert!(!lock.is_held("res"));
    }

    #[test]
    fn test_tampered_deadline_is_invalid_duration() {
        let client = Arc::new(MemoryClient::new());
        let mut lock = LeaseLock::new(client.clone(), options(5_000, None));

        lock.acquire("res").unwrap();
        client.set("res:lock", b"42", None).unwrap();
        let err = lock.renew("res").unwrap_err();
        assert!(matches!(
            err,
            CacheError::Lock(LockError::InvalidDuration { .. })
        ));
        assert!(!lock.is_held("res"));
    }

    #[test]
    fn test_exhausted_attempts_is_high_concurrency() {
        let client = Arc::new(MemoryClient::new());
        let mut lock = LeaseLock::new(
            client,
            LockOptions {
                attempts: 0,
                ..options(5_000, None)
            },
        );
        let err = lock.acquire("res").unwrap_err();
        assert!(matches!(
            err,
            CacheError::Lock(LockError::HighConcurrency { attempts: 0, .. })
        ));
    }

    #[test]
    fn test_garbage_deadline_is_taken_over() {
        let client = Arc::new(MemoryClient::new());
        client.set("res:lock", b"not-a-number", None).unwrap();
        let mut lock = LeaseLock::new(client, options(5_000, Some(500)));
        assert!(lock.acquire("res").unwrap());
    }

    #[test]
    fn test_drop_releases_all() {
        let client = Arc::new(MemoryClient::new());
        {
            let mut lock = LeaseLock::new(client.clone(), options(5_000, None));
            lock.acquire("a").unwrap();
            lock.acquire("b").unwrap();
        }
        assert!(client.is_empty());
    }

    #[test]
    fn test_remaining_counts_down() {
        let client = Arc::new(MemoryClient::new());
        let mut lock = LeaseLock::new(client, options(5_000, None));
        assert!(lock.remaining("res").is_none());
        lock.acquire("res").unwrap();
        let left = lock.remaining("res").unwrap();
        assert!(left <= Duration::from_millis(5_000));
        assert!(left > Duration::from_millis(4_000));
    }

    #[test]
    fn test_backoff_grows_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(30));
        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();
        assert!(delays[0] >= Duration::from_millis(10));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(45)));
        assert!(delays[4] >= Duration::from_millis(30));
    }
}
