//! Token-bucket bin with per-key decay drivers.

use std::fmt;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::key::BucketKey;
use crate::error::{Result, WardenError};
use crate::schedule::{spawn_periodic, Shutdown, MAX_PERIOD};

/// Bounds for the scope and subject halves of a bucket key.
pub trait KeyPart: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> KeyPart for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Consumed capacity for one key.
struct Bucket {
    count: u32,
    /// Start of the decay interval currently in progress
    last_decay: Instant,
    /// Running while `count > 0`.
    driver: Option<JoinHandle<()>>,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            last_decay: now,
            driver: None,
        }
    }

    /// Units that have come back between `last_decay` and `now`.
    fn recovered(&self, now: Instant, interval: Duration) -> u32 {
        let elapsed = now.saturating_duration_since(self.last_decay);
        let units = elapsed.as_nanos() / interval.as_nanos();
        u32::try_from(units).unwrap_or(u32::MAX).min(self.count)
    }

    /// Count as of `now`, without applying it.
    fn count_at(&self, now: Instant, interval: Duration) -> u32 {
        self.count - self.recovered(now, interval)
    }

    /// Apply every whole interval that elapsed up to `now`.
    fn settle(&mut self, now: Instant, interval: Duration) {
        let recovered = self.recovered(now, interval);
        self.count -= recovered;

        if self.count == 0 {
            self.last_decay = now;
        } else {
            // elapsed >= interval * recovered, so this cannot pass `now`
            self.last_decay += interval * recovered;
        }
    }
}

/// A named set of buckets sharing one capacity and decay interval.
///
/// Each key may take up to `capacity` units immediately. Consumed units come
/// back one per `decay_interval`. Decay is applied from elapsed time whenever
/// a bucket is touched, so a unit is available as soon as its interval has
/// passed. A driver per nonzero bucket removes the entry once it has fully
/// decayed, so idle keys cost nothing.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct TokenBin<S: KeyPart, K: KeyPart> {
    /// Name used in logs
    name: String,
    /// Maximum burst per key
    capacity: u32,
    /// Time for one unit to come back
    decay_interval: Duration,
    /// Live buckets indexed by key
    buckets: Arc<DashMap<BucketKey<S, K>, Bucket>>,
    /// Runtime the decay drivers are spawned on
    runtime: Handle,
    /// Stops every decay driver when triggered or dropped
    shutdown: Shutdown,
}

impl<S: KeyPart, K: KeyPart> TokenBin<S, K> {
    /// Create a new bin.
    ///
    /// A zero `capacity` is allowed and denies everything. A zero
    /// `decay_interval`, or one longer than [`MAX_PERIOD`], is rejected.
    /// Must be called from within a Tokio runtime, which is where decay
    /// drivers will run.
    pub fn new(name: impl Into<String>, capacity: u32, decay_interval: Duration) -> Result<Self> {
        let name = name.into();

        if decay_interval.is_zero() {
            return Err(WardenError::InvalidLimit {
                bin: name,
                reason: "decay interval must be greater than zero".to_string(),
            });
        }

        if decay_interval > MAX_PERIOD {
            return Err(WardenError::InvalidLimit {
                bin: name,
                reason: format!("decay interval must be at most {:?}", MAX_PERIOD),
            });
        }

        let runtime = Handle::try_current().map_err(|_| WardenError::NoRuntime)?;

        if capacity == 0 {
            warn!(bin = %name, "Bin has zero capacity and will deny every request");
        }

        debug!(
            bin = %name,
            capacity = capacity,
            decay_interval = ?decay_interval,
            "Creating token bin"
        );

        Ok(Self {
            name,
            capacity,
            decay_interval,
            buckets: Arc::new(DashMap::new()),
            runtime,
            shutdown: Shutdown::new(),
        })
    }

    /// Try to consume one unit for `(scope, subject)`.
    ///
    /// Returns `true` if the action is allowed. A denial leaves the bucket
    /// untouched. Call this exactly once per attempted action.
    pub fn allocate(&self, scope: S, subject: K) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let key = BucketKey::new(scope, subject);
        let now = Instant::now();

        // The entry guard holds the shard lock for the whole check-then-act.
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(now));

        // Checked under the guard so a concurrent shutdown cannot leave a
        // bucket behind after it has cleared the map.
        if self.shutdown.is_triggered() {
            drop(bucket);
            self.buckets.remove_if(&key, |_, bucket| bucket.count == 0);
            return false;
        }

        bucket.settle(now, self.decay_interval);

        if bucket.count >= self.capacity {
            debug!(
                bin = %self.name,
                key = ?key,
                count = bucket.count,
                "Bucket full, denying"
            );
            return false;
        }

        bucket.count += 1;

        let driver_running = bucket
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished());
        if !driver_running {
            trace!(bin = %self.name, key = ?key, "Starting decay driver");
            bucket.driver = Some(self.spawn_decay(key.clone()));
        }

        trace!(
            bin = %self.name,
            key = ?key,
            count = bucket.count,
            "Allocated"
        );
        true
    }

    /// Spawn the driver that settles `key` every interval and drops it at zero.
    fn spawn_decay(&self, key: BucketKey<S, K>) -> JoinHandle<()> {
        let buckets = Arc::clone(&self.buckets);
        let name = self.name.clone();
        let interval = self.decay_interval;

        spawn_periodic(
            &self.runtime,
            interval,
            self.shutdown.subscribe(),
            move || match buckets.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let bucket = entry.get_mut();
                    bucket.settle(Instant::now(), interval);
                    trace!(bin = %name, key = ?key, count = bucket.count, "Bucket decayed");

                    if bucket.count == 0 {
                        entry.remove();
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
                Entry::Vacant(_) => ControlFlow::Break(()),
            },
        )
    }

    /// Current consumed units for `(scope, subject)`; zero if no bucket exists.
    pub fn count(&self, scope: &S, subject: &K) -> u32 {
        let key = BucketKey::new(scope.clone(), subject.clone());
        let now = Instant::now();
        self.buckets
            .get(&key)
            .map_or(0, |bucket| bucket.count_at(now, self.decay_interval))
    }

    /// Number of buckets currently holding consumed units.
    pub fn active_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// The bin's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum burst per key.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Time for one consumed unit to come back.
    pub fn decay_interval(&self) -> Duration {
        self.decay_interval
    }

    /// Stop every decay driver and drop all buckets.
    ///
    /// After shutdown the bin denies every request.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();

        let drivers: Vec<JoinHandle<()>> = self
            .buckets
            .iter_mut()
            .filter_map(|mut bucket| bucket.driver.take())
            .collect();
        self.buckets.clear();

        let stopped = join_all(drivers)
            .await
            .into_iter()
            .filter(|res| res.is_ok())
            .count();

        info!(bin = %self.name, drivers = stopped, "Token bin shut down");
    }
}

impl<S: KeyPart, K: KeyPart> fmt::Debug for TokenBin<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBin")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("decay_interval", &self.decay_interval)
            .field("active_buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Barrier;
    use tokio::time::sleep;

    const INTERVAL: Duration = Duration::from_secs(10);

    /// Sleep just past `n` decay intervals so the drivers have removed empty buckets.
    async fn wait_past_intervals(n: u32) {
        sleep(INTERVAL * n + Duration::from_millis(1)).await;
    }

    #[test]
    fn test_bin_requires_runtime() {
        let result = TokenBin::<u64, u64>::new("no-runtime", 5, INTERVAL);
        assert!(matches!(result, Err(WardenError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_bin_rejects_zero_interval() {
        let result = TokenBin::<u64, u64>::new("broken", 5, Duration::ZERO);
        assert!(matches!(result, Err(WardenError::InvalidLimit { .. })));
    }

    #[tokio::test]
    async fn test_bin_rejects_overlong_interval() {
        let result = TokenBin::<u64, u64>::new("forever", 2, Duration::from_secs(u64::MAX));
        assert!(matches!(result, Err(WardenError::InvalidLimit { .. })));

        let result = TokenBin::<u64, u64>::new("forever", 2, MAX_PERIOD + Duration::from_secs(1));
        assert!(matches!(result, Err(WardenError::InvalidLimit { .. })));

        assert!(TokenBin::<u64, u64>::new("longest", 2, MAX_PERIOD).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_denies_everything() {
        let bin = TokenBin::new("closed", 0, INTERVAL).unwrap();

        assert!(!bin.allocate(1u64, 1u64));
        assert!(!bin.allocate(2u64, 3u64));
        assert_eq!(bin.active_buckets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_bound() {
        let bin = TokenBin::new("users", 3, INTERVAL).unwrap();

        for _ in 0..3 {
            assert!(bin.allocate(1u64, 2u64));
        }

        // Denials never push the count past capacity
        for _ in 0..5 {
            assert!(!bin.allocate(1u64, 2u64));
        }
        assert_eq!(bin.count(&1, &2), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guild_user_scenario() {
        let bin = TokenBin::new("users", 5, INTERVAL).unwrap();

        for i in 1..=5 {
            assert!(bin.allocate("guildX", "userY"), "Request {} should be allowed", i);
        }
        assert!(!bin.allocate("guildX", "userY"));

        sleep(INTERVAL).await;
        assert!(bin.allocate("guildX", "userY"));
        assert!(!bin.allocate("guildX", "userY"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_exactly_at_interval_when_advanced() {
        let bin = TokenBin::new("users", 5, INTERVAL).unwrap();
        for _ in 0..5 {
            assert!(bin.allocate("guildX", "userY"));
        }
        assert!(!bin.allocate("guildX", "userY"));

        tokio::time::advance(INTERVAL).await;
        assert_eq!(bin.count(&"guildX", &"userY"), 4);
        assert!(bin.allocate("guildX", "userY"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_several_intervals_recover_several_units() {
        let bin = TokenBin::new("users", 5, INTERVAL).unwrap();
        for _ in 0..5 {
            bin.allocate(1u64, 1u64);
        }

        tokio::time::advance(INTERVAL * 3 + Duration::from_secs(4)).await;
        assert_eq!(bin.count(&1, &1), 2);

        // The partial interval still counts toward the next unit
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(bin.count(&1, &1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_one_unit_per_interval() {
        let bin = TokenBin::new("users", 5, INTERVAL).unwrap();
        for _ in 0..5 {
            bin.allocate(1u64, 1u64);
        }

        sleep(INTERVAL).await;
        assert_eq!(bin.count(&1, &1), 4);

        sleep(INTERVAL).await;
        assert_eq!(bin.count(&1, &1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_decay_before_interval() {
        let bin = TokenBin::new("users", 2, INTERVAL).unwrap();
        bin.allocate(1u64, 1u64);
        bin.allocate(1u64, 1u64);

        sleep(INTERVAL - Duration::from_millis(1)).await;
        assert!(!bin.allocate(1u64, 1u64));
        assert_eq!(bin.count(&1, &1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let bin = TokenBin::new("channels", 2, INTERVAL).unwrap();

        assert!(bin.allocate(1u64, 100u64));
        assert!(bin.allocate(1u64, 100u64));
        assert!(!bin.allocate(1u64, 100u64));

        // Same subject in another scope, and another subject in the same scope
        assert!(bin.allocate(2u64, 100u64));
        assert!(bin.allocate(1u64, 101u64));
        assert_eq!(bin.active_buckets(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_decayed_bucket_is_removed() {
        let bin = TokenBin::new("users", 3, INTERVAL).unwrap();
        for _ in 0..3 {
            bin.allocate(1u64, 1u64);
        }
        assert_eq!(bin.active_buckets(), 1);

        wait_past_intervals(3).await;
        assert_eq!(bin.count(&1, &1), 0);
        assert_eq!(bin.active_buckets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_restarts_after_idle() {
        let bin = TokenBin::new("users", 1, INTERVAL).unwrap();

        assert!(bin.allocate(1u64, 1u64));
        wait_past_intervals(1).await;
        assert_eq!(bin.active_buckets(), 0);

        assert!(bin.allocate(1u64, 1u64));
        assert!(!bin.allocate(1u64, 1u64));
        sleep(INTERVAL).await;
        assert!(bin.allocate(1u64, 1u64));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exhaustion() {
        const CAPACITY: u32 = 10;
        const EXTRA: usize = 15;
        let callers = CAPACITY as usize + EXTRA;

        let bin = Arc::new(TokenBin::new("concurrent", CAPACITY, Duration::from_secs(3600)).unwrap());
        let barrier = Arc::new(Barrier::new(callers));

        let tasks: Vec<_> = (0..callers)
            .map(|_| {
                let bin = bin.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    bin.allocate(7u64, 9u64)
                })
            })
            .collect();

        let allowed = join_all(tasks)
            .await
            .into_iter()
            .map(|res| res.unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, CAPACITY as usize);
        assert_eq!(bin.count(&7, &9), CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_drivers() {
        let bin = TokenBin::new("users", 5, INTERVAL).unwrap();
        bin.allocate(1u64, 1u64);
        bin.allocate(2u64, 2u64);
        assert_eq!(bin.active_buckets(), 2);

        bin.shutdown().await;

        assert_eq!(bin.active_buckets(), 0);
        assert!(!bin.allocate(1u64, 1u64));
        assert!(!bin.allocate(3u64, 3u64));
        // A denied allocation after shutdown leaves nothing behind
        assert_eq!(bin.active_buckets(), 0);
        assert_eq!(bin.count(&3, &3), 0);
    }

    #[tokio::test]
    async fn test_bin_accessors() {
        let bin = TokenBin::<u64, u64>::new("channels", 10, INTERVAL).unwrap();

        assert_eq!(bin.name(), "channels");
        assert_eq!(bin.capacity(), 10);
        assert_eq!(bin.decay_interval(), INTERVAL);
        assert_eq!(bin.count(&1, &1), 0);
    }
}
