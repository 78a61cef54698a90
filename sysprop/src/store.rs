//! PropertyStore - the public face of the property system
//!
//! A store owns one `PropArea` and everything needed to use it:
//! - the notification queue readers and watchers block on
//! - the writer lock that serializes `set` calls
//! - the optional persistent backing store
//!
//! Reads (`get`, `list`, `find`) never take a lock. Share a store between
//! threads with `Arc<PropertyStore>`.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::area::{PropArea, PropRef};
use crate::config::{StoreConfig, WaitMode};
use crate::defaults::load_properties_file;
use crate::error::PropertyError;
use crate::notification_queue::{NotificationQueueArc, SleepWait, WaitKey, WaitStrategy};
use crate::persist::{DirStore, PersistentStore, PERSIST_PREFIX};
use crate::prop_info::validate;

/// Prefix of properties that can only be set once
pub const READ_ONLY_PREFIX: &str = "ro.";

/// Handle to one isolated property store
pub struct PropertyStore {
    area: PropArea,
    queue: NotificationQueueArc,
    sleep: Option<SleepWait>,
    write_lock: Mutex<()>,
    persist: Option<Box<dyn PersistentStore>>,
    persist_loaded: AtomicBool,
}

impl PropertyStore {
    /// Create a store as described by `config`.
    ///
    /// Loads the defaults file, then the persist directory. Missing or
    /// unreadable sources are logged; only allocating the area can fail.
    pub fn init(config: &StoreConfig) -> Result<Self, PropertyError> {
        let persist = config
            .persist_dir
            .as_ref()
            .map(|dir| Box::new(DirStore::new(dir)) as Box<dyn PersistentStore>);
        Self::init_with(config, persist)
    }

    /// Like `init`, with an explicit backing store instead of
    /// `config.persist_dir`
    pub fn init_with(
        config: &StoreConfig,
        persist: Option<Box<dyn PersistentStore>>,
    ) -> Result<Self, PropertyError> {
        let area = PropArea::create()?;
        let sleep = match config.wait_mode {
            WaitMode::Queue => None,
            WaitMode::Sleep(tick) => Some(SleepWait::new(tick)),
        };

        let store = Self {
            area,
            queue: NotificationQueueArc::new(),
            sleep,
            write_lock: Mutex::new(()),
            persist,
            persist_loaded: AtomicBool::new(false),
        };

        if let Some(path) = &config.defaults_path {
            store.load_defaults(path);
        }
        store.load_persistent();

        info!(
            "property store ready: {} properties, wait mode {:?}",
            store.len(),
            config.wait_mode
        );
        Ok(store)
    }

    /// Empty in-memory store
    pub fn in_memory() -> Result<Self, PropertyError> {
        Self::init_with(&StoreConfig::default(), None)
    }

    fn load_defaults(&self, path: &Path) {
        let entries = match load_properties_file(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("unable to load defaults: {e}");
                return;
            }
        };
        for (name, value) in entries {
            if let Err(e) = self.set(&name, &value) {
                warn!("skipping default from {}: {e}", path.display());
            }
        }
    }

    fn load_persistent(&self) {
        if let Some(persist) = &self.persist {
            match persist.load_all() {
                Ok(entries) => {
                    debug!("loading {} persistent properties", entries.len());
                    for (name, value) in entries {
                        if let Err(e) = self.set(&name, &value) {
                            warn!("skipping persistent property: {e}");
                        }
                    }
                }
                Err(e) => error!("unable to load persistent properties: {e}"),
            }
        }
        // Mirror writes only from now on, so defaults loaded above never
        // overwrite persisted values on disk.
        self.persist_loaded.store(true, Ordering::Release);
    }

    /// Strategy readers block with while a record is dirty
    fn waiter(&self) -> &dyn WaitStrategy {
        match &self.sleep {
            Some(sleep) => sleep,
            None => &self.queue,
        }
    }

    /// Number of defined properties
    #[must_use]
    pub fn len(&self) -> usize {
        self.area.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Global serial, bumped on every successful mutation
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.area.serial()
    }

    /// Look up a record by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<PropRef<'_>> {
        self.area.find(name)
    }

    /// The `n`-th record in creation order
    #[must_use]
    pub fn find_nth(&self, n: usize) -> Option<PropRef<'_>> {
        self.area.find_nth(n)
    }

    /// Consistent `(name, value)` of a record
    #[must_use]
    pub fn read(&self, prop: &PropRef<'_>) -> (String, String) {
        (prop.name(), prop.value(self.waiter()))
    }

    /// Current value of `name`, or `None` if it was never set
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.find(name).map(|prop| prop.value(self.waiter()))
    }

    /// Define or update a property.
    ///
    /// `ro.` properties accept only their first value. A successful write
    /// to a `persist.` property is mirrored to the backing store once
    /// startup loading is over; a failure there is logged, not returned.
    pub fn set(&self, name: &str, value: &str) -> Result<(), PropertyError> {
        validate(name, value)?;

        let _guard = self.write_lock.lock();

        if let Some(prop) = self.area.find(name) {
            if name.starts_with(READ_ONLY_PREFIX) {
                return Err(PropertyError::Immutable(name.to_string()));
            }
            prop.update(value, &self.queue);
            self.area.bump_serial(&self.queue);
        } else {
            self.area.append_locked(name, value, &self.queue)?;
        }

        if self.persist_loaded.load(Ordering::Acquire) && name.starts_with(PERSIST_PREFIX) {
            if let Some(persist) = &self.persist {
                if let Err(e) = persist.write(name, value) {
                    error!("unable to persist {name}: {e}");
                }
            }
        }

        Ok(())
    }

    /// Visit every property in creation order.
    ///
    /// Each pair is consistent on its own; the walk as a whole is not a
    /// snapshot. Returns the number of properties visited.
    pub fn list(&self, mut visit: impl FnMut(&str, &str)) -> usize {
        let mut visited = 0;
        while let Some(prop) = self.area.find_nth(visited) {
            let (name, value) = self.read(&prop);
            visit(&name, &value);
            visited += 1;
        }
        visited
    }

    /// Block until the global serial differs from `old_serial`.
    ///
    /// Returns the new serial, or `None` if `timeout` elapsed first.
    #[must_use]
    pub fn wait_any(&self, old_serial: u32, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            let serial = self.serial();
            if serial != old_serial {
                return Some(serial);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.waiter()
                .wait(WaitKey::AreaSerial, self.area.serial_word(), old_serial, remaining);
        }
    }

    /// Async version of `wait_any`, without a timeout
    pub async fn wait_any_async(&self, old_serial: u32) -> u32 {
        loop {
            // check (here) - lock - check again - register, see notification_queue
            if self.serial() != old_serial {
                return self.serial();
            }
            let wait = {
                let lock = self.queue.lock_key(WaitKey::AreaSerial);
                let serial = self.serial();
                if serial != old_serial {
                    return serial;
                }
                self.queue.wait_async(lock, "store.wait_any")
            };
            let _ = wait.await;
        }
    }

    /// Receive the global serial after every successful mutation
    #[must_use]
    pub fn subscribe(&self, capacity: usize) -> tokio::sync::broadcast::Receiver<u32> {
        self.queue
            .subscribe(WaitKey::AreaSerial, capacity, "store.subscribe")
    }

    /// Binary image of the area, see `PropArea::to_image`
    #[must_use]
    pub fn to_image(&self) -> Vec<u8> {
        self.area.to_image(self.waiter())
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("area", &self.area)
            .field("wait_mode", &self.sleep.map(|s| s.tick()))
            .field("persist", &self.persist.is_some())
            .field("persist_loaded", &self.persist_loaded.load(Ordering::Relaxed))
            .finish()
    }
}
