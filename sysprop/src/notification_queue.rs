//! Notification Queue
//!
//! Wait/notify on 32-bit words of the property area, for sync readers and
//! async watchers alike.
//!
//! # 1) Waiting for a word to change
//!
//! The workflow mirrors a futex:
//!
//! 10. Reader: load the word, see a value it cannot use (e.g. a dirty serial)
//! 20. Reader: call `wait` with the key and the observed value
//! 30. Queue-for-reader: under the lock, re-load the word; if it already
//!     differs, return at once
//! 40. Queue-for-reader: otherwise register as a sleeper on the key and block
//!
//! 50. Writer: store the new value of the word
//! 60. Writer: call `wake_all` with the key
//! 70. Queue-for-writer: bump the key's wakeup counter, wake the sleepers
//!
//! Steps 30-40 happen under one lock, and step 70 takes the same lock after
//! step 50 has stored the word. So either the reader sees the new value in
//! step 30, or it is registered before the writer wakes the key. A missed
//! wakeup is impossible; a wait can only end early or by its timeout.
//!
//! Writers must not stall on idle keys. Each key maps to an interest
//! counter that readers raise before step 30 (followed by a SeqCst fence)
//! and writers read after step 50 (after a SeqCst fence). When it is zero,
//! `wake_all` returns without touching the lock: a reader that raised it
//! afterwards is guaranteed to see the new word in step 30.
//!
//! Async clients follow the same pattern by hand:
//!
//! ```ignore
//! let wait = {
//!     let lock = queue.lock_key(key);
//!     if word.load(Ordering::Acquire) != expected {
//!         return;
//!     }
//!     // lock is consumed by wait_async and released before awaiting
//!     queue.wait_async(lock, debug_hint)
//! };
//! wait.await;
//! ```
//!
//! Keep a `KeyLock` for the check-and-register step only. While it is
//! held, writers with listeners on any key block in `wake_all`.
//!
//! # 2) Subscribing to a key
//!
//! Nothing special here. A broadcast receiver gets every value passed to
//! `wake_all` for its key.
//!
//! # 3) Without a queue
//!
//! `SleepWait` implements the same `WaitStrategy` as a bounded
//! sleep-and-recheck. It never gets woken, which is fine: callers always
//! re-check their condition after a wait returns.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound of a single blocking wait inside the read protocol
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Sleep granularity of the fallback strategy
pub const DEFAULT_SLEEP_TICK: Duration = Duration::from_micros(100);

const INTEREST_SLOTS: usize = 64;

// ============================================================================
// Keys and results
// ============================================================================

/// The word being waited on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// The area's global serial, bumped on every successful write
    AreaSerial,
    /// The serial word of the record with this index
    Record(usize),
}

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A `wake_all` on the key happened while waiting
    Woken,
    /// The word no longer held the expected value
    ValueChanged,
    /// The timeout elapsed
    TimedOut,
}

/// Wait-for-change capability used by the read protocol and by watchers
pub trait WaitStrategy: Send + Sync {
    /// Block while `word` holds `expected`, at most for `timeout`.
    ///
    /// Spurious returns are allowed; the caller re-checks the word.
    fn wait(&self, key: WaitKey, word: &AtomicU32, expected: u32, timeout: Duration) -> WaitResult;

    /// Wake everyone waiting on `key`. `value` is the word's new value.
    fn wake_all(&self, key: WaitKey, value: u32);
}

// ============================================================================
// Client Types
// ============================================================================

/// Represents an async client waiting for a key notification
struct WaitingClient {
    /// Thread-safe sender that can be used to notify waiting clients from any thread.
    sender: tokio::sync::oneshot::Sender<u32>,
    debug_hint: String,
}

impl std::fmt::Debug for WaitingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitingClient")
            .field("debug_hint", &self.debug_hint)
            .finish_non_exhaustive()
    }
}

/// Broadcast channel for a key (one channel per key, multiple subscribers)
struct BroadcastChannel {
    sender: tokio::sync::broadcast::Sender<u32>,
    debug_hint: String,
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("debug_hint", &self.debug_hint)
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

// ============================================================================
// Internal State
// ============================================================================

pub(crate) struct InnerState {
    /// Blocked sync waiters per key
    sleepers: HashMap<WaitKey, usize>,
    /// Number of `wake_all` calls per key while it had sleepers
    wakeups: HashMap<WaitKey, u64>,
    waiting_clients: HashMap<WaitKey, Vec<WaitingClient>>,
    broadcast_channels: HashMap<WaitKey, BroadcastChannel>,
}

impl InnerState {
    fn new() -> Self {
        Self {
            sleepers: HashMap::new(),
            wakeups: HashMap::new(),
            waiting_clients: HashMap::new(),
            broadcast_channels: HashMap::new(),
        }
    }

    fn wakeup_count(&self, key: WaitKey) -> u64 {
        self.wakeups.get(&key).copied().unwrap_or(0)
    }

    fn leave(&mut self, key: WaitKey) {
        if let Some(count) = self.sleepers.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.sleepers.remove(&key);
                self.wakeups.remove(&key);
            }
        }
    }
}

// ============================================================================
// Main Queue
// ============================================================================

/// Thread-safe queue for word-change notifications
#[derive(Clone)]
pub struct NotificationQueueArc {
    inner: Arc<Mutex<InnerState>>,
    condvar: Arc<Condvar>,
    interest: Arc<Interest>,
}

impl NotificationQueueArc {
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(InnerState::new())),
            condvar: Arc::new(Condvar::new()),
            interest: Arc::new(Interest::new()),
        }
    }

    /// Get the lock for atomic condition-check + register operations on `key`
    ///
    /// Check the word only after this returns; see the module docs.
    #[must_use]
    pub fn lock_key(&self, key: WaitKey) -> KeyLock<'_> {
        let state = self.inner.lock();
        let interest = self.interest.slot(key);
        interest.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        KeyLock {
            key,
            interest,
            state,
        }
    }

    /// Wait for the key notification
    ///
    /// Precondition: The caller should acquire the lock and check its
    /// condition before calling this method.
    /// Post-condition: The lock is released after the method returns.
    ///
    /// The future resolves to the value passed to `wake_all`, or `None` if
    /// the queue was dropped first.
    pub fn wait_async(
        &self,
        mut lock: KeyLock<'_>,
        debug_hint: &str,
    ) -> impl std::future::Future<Output = Option<u32>> + Send {
        let (tx, rx) = tokio::sync::oneshot::channel();

        let client = WaitingClient {
            sender: tx,
            debug_hint: debug_hint.to_string(),
        };
        // The registered client keeps its own interest until `wake_all`
        // removes it.
        lock.interest.fetch_add(1, Ordering::Relaxed);
        let key = lock.key;
        lock.state.waiting_clients.entry(key).or_default().push(client);

        // Release lock before awaiting
        drop(lock);

        // Cleanup is handled by `wake_all`, which removes all waiting
        // clients from the map before sending notifications.
        async move { rx.await.ok() }
    }

    /// Subscribe to the key notification
    ///
    /// Returns a broadcast Receiver. All subscribers receive all notifications.
    /// Drop the Receiver to unsubscribe (automatic cleanup).
    ///
    /// # Arguments
    /// * `key` - The key to subscribe to
    /// * `channel_capacity` - Capacity of the broadcast channel (only used when creating new channel)
    /// * `debug_hint` - Debug label for this channel (only used when creating new channel)
    #[must_use]
    pub fn subscribe(
        &self,
        key: WaitKey,
        channel_capacity: usize,
        debug_hint: &str,
    ) -> tokio::sync::broadcast::Receiver<u32> {
        let mut state = self.inner.lock();

        let interest = self.interest.slot(key);
        let broadcast = state.broadcast_channels.entry(key).or_insert_with(|| {
            interest.fetch_add(1, Ordering::Relaxed);
            let (tx, _rx) = tokio::sync::broadcast::channel(channel_capacity.max(1));
            BroadcastChannel {
                sender: tx,
                debug_hint: debug_hint.to_string(),
            }
        });

        broadcast.sender.subscribe()
    }

    /// Number of sync waiters currently blocked on `key`
    #[must_use]
    pub fn sleeper_count(&self, key: WaitKey) -> usize {
        self.inner.lock().sleepers.get(&key).copied().unwrap_or(0)
    }
}

// ============================================================================
// Interest counters
// ============================================================================

/// Listener counts per key, readable without the queue lock.
///
/// Keys share slots; a collision only costs a needless lock.
struct Interest {
    slots: [AtomicUsize; INTEREST_SLOTS],
}

impl Interest {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    fn slot(&self, key: WaitKey) -> &AtomicUsize {
        let index = match key {
            WaitKey::AreaSerial => 0,
            WaitKey::Record(n) => 1 + n % (INTEREST_SLOTS - 1),
        };
        &self.slots[index]
    }
}

/// Queue lock taken on behalf of one key.
///
/// While it exists, the key counts as having a listener, so a concurrent
/// `wake_all` on it takes the lock and waits for the check-and-register
/// step to finish.
pub struct KeyLock<'a> {
    key: WaitKey,
    interest: &'a AtomicUsize,
    state: MutexGuard<'a, InnerState>,
}

impl KeyLock<'_> {
    #[must_use]
    pub fn key(&self) -> WaitKey {
        self.key
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.interest.fetch_sub(1, Ordering::Relaxed);
    }
}

impl WaitStrategy for NotificationQueueArc {
    fn wait(&self, key: WaitKey, word: &AtomicU32, expected: u32, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut lock = self.lock_key(key);

        if word.load(Ordering::Acquire) != expected {
            return WaitResult::ValueChanged;
        }

        let seen = lock.state.wakeup_count(key);
        *lock.state.sleepers.entry(key).or_default() += 1;

        let result = loop {
            if lock.state.wakeup_count(key) != seen {
                break WaitResult::Woken;
            }
            if self.condvar.wait_until(&mut lock.state, deadline).timed_out() {
                if lock.state.wakeup_count(key) != seen {
                    break WaitResult::Woken;
                }
                break WaitResult::TimedOut;
            }
        };

        lock.state.leave(key);
        drop(lock);
        log::trace!("queue.wait: key {key:?}, expected={expected:#x}, result={result:?}");
        result
    }

    fn wake_all(&self, key: WaitKey, value: u32) {
        let interest = self.interest.slot(key);
        fence(Ordering::SeqCst);
        if interest.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut state = self.inner.lock();

        let sleepers = state.sleepers.get(&key).copied().unwrap_or(0);
        if sleepers > 0 {
            *state.wakeups.entry(key).or_default() += 1;
            self.condvar.notify_all();
        }

        let waiters = state.waiting_clients.remove(&key).unwrap_or_default();
        interest.fetch_sub(waiters.len(), Ordering::Relaxed);
        let broadcast = state
            .broadcast_channels
            .get(&key)
            .map(|bc| bc.sender.clone());
        drop(state);

        log::debug!(
            "queue.wake_all: key {:?}, value={:#x}, sleepers: {}, waiters: {}, subscribers: {}",
            key,
            value,
            sleepers,
            waiters.len(),
            broadcast.as_ref().map_or(0, tokio::sync::broadcast::Sender::receiver_count)
        );

        for waiter in waiters {
            if waiter.sender.send(value).is_err() {
                log::debug!(
                    "queue.wake_all: oneshot receiver dropped for key {:?} (hint: {})",
                    key,
                    waiter.debug_hint
                );
            }
        }

        let orphaned = broadcast.is_some_and(|sender| sender.send(value).is_err());
        if orphaned {
            // Every receiver is gone; forget the channel unless someone
            // subscribed in the meantime.
            let mut state = self.inner.lock();
            let idle = state
                .broadcast_channels
                .get(&key)
                .is_some_and(|bc| bc.sender.receiver_count() == 0);
            if idle {
                if let Some(bc) = state.broadcast_channels.remove(&key) {
                    interest.fetch_sub(1, Ordering::Relaxed);
                    log::debug!(
                        "queue.wake_all: dropping broadcast channel for key {:?} (hint: {})",
                        key,
                        bc.debug_hint
                    );
                }
            }
        }
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// Sleep-and-recheck strategy for when no queue is shared with the writer
#[derive(Debug, Clone, Copy)]
pub struct SleepWait {
    tick: Duration,
}

impl SleepWait {
    #[must_use]
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        self.tick
    }
}

impl Default for SleepWait {
    fn default() -> Self {
        Self::new(DEFAULT_SLEEP_TICK)
    }
}

impl WaitStrategy for SleepWait {
    fn wait(&self, _key: WaitKey, word: &AtomicU32, expected: u32, timeout: Duration) -> WaitResult {
        if word.load(Ordering::Acquire) != expected {
            return WaitResult::ValueChanged;
        }
        std::thread::sleep(self.tick.min(timeout));
        if word.load(Ordering::Acquire) == expected {
            WaitResult::TimedOut
        } else {
            WaitResult::ValueChanged
        }
    }

    fn wake_all(&self, _key: WaitKey, _value: u32) {}
}
