//! System-wide property store
//!
//! A bounded set of short named string values: lock-free optimistic reads,
//! write-once `ro.` keys, `persist.` keys that survive a restart.
//!
//! ```
//! use sysprop::PropertyStore;
//!
//! let store = PropertyStore::in_memory().unwrap();
//! store.set("test.key1", "test_value1").unwrap();
//! assert_eq!(store.get("test.key1").as_deref(), Some("test_value1"));
//!
//! store.set("ro.test.key2", "hi").unwrap();
//! assert!(store.set("ro.test.key2", "hi2").is_err());
//! ```

pub mod area;
pub mod config;
pub mod defaults;
pub mod error;
pub mod notification_queue;
pub mod persist;
pub mod prop_info;
pub mod serial;
pub mod store;

// Re-export area types for convenience
pub use area::{PropArea, PropRef, PA_COUNT_MAX, PA_INFO_SIZE, PA_INFO_START, PA_SIZE};

// Re-export record types for convenience
pub use prop_info::{PropInfo, PROP_NAME_MAX, PROP_VALUE_MAX};

// Re-export wait/notify types for convenience
pub use notification_queue::{
    KeyLock, NotificationQueueArc, SleepWait, WaitKey, WaitResult, WaitStrategy,
};

// Re-export persistence types for convenience
pub use persist::{DirStore, MemStore, PersistentStore, PERSIST_PREFIX};

pub use config::{StoreConfig, WaitMode};
pub use error::PropertyError;
pub use store::{PropertyStore, READ_ONLY_PREFIX};
