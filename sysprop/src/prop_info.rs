//! Property record and its serial protocol
//!
//! One writer, many readers, no locks. The record's serial word is the only
//! synchronization point:
//!
//! - Writer: raise the dirty bit, copy the value, publish a new clean serial
//!   (new length, next generation), wake the record's waiters.
//! - Reader: wait until the serial is clean, copy `len + 1` bytes, re-load
//!   the serial and start over if it moved.
//!
//! A reader therefore never returns a mixture of two writes, and a writer
//! never waits for a reader. Two writers on one record are not arbitrated
//! here; `PropertyStore` serializes them.

use std::fmt;
use std::iter;
use std::sync::atomic::{fence, AtomicU32, AtomicU8, Ordering};

use crate::error::PropertyError;
use crate::notification_queue::{WaitKey, WaitStrategy, DEFAULT_WAIT_TIMEOUT};
use crate::serial;

/// Size of the name field, terminator included
pub const PROP_NAME_MAX: usize = 32;

/// Size of the value field, terminator included
pub const PROP_VALUE_MAX: usize = 92;

/// Check a name and value against the record layout
pub fn validate(name: &str, value: &str) -> Result<(), PropertyError> {
    if name.is_empty() || name.len() >= PROP_NAME_MAX || name.contains('\0') {
        return Err(PropertyError::InvalidName(name.to_string()));
    }
    if value.len() >= PROP_VALUE_MAX || value.contains('\0') {
        return Err(PropertyError::InvalidValue {
            name: name.to_string(),
            len: value.len(),
        });
    }
    Ok(())
}

/// Fixed 128-byte record: name, serial word, value.
///
/// Bytes are atomics so that the in-place value rewrite racing with readers
/// is well defined; the serial word decides which copies are kept.
#[repr(C)]
pub struct PropInfo {
    name: [AtomicU8; PROP_NAME_MAX],
    serial: AtomicU32,
    value: [AtomicU8; PROP_VALUE_MAX],
}

impl PropInfo {
    pub(crate) fn zeroed() -> Self {
        Self {
            name: std::array::from_fn(|_| AtomicU8::new(0)),
            serial: AtomicU32::new(0),
            value: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    /// Fill a free record. Callers publish it afterwards through the TOC.
    pub(crate) fn init(&self, name: &[u8], value: &[u8]) {
        store_terminated(&self.name, name);
        self.serial.store(serial::initial(value.len()), Ordering::Relaxed);
        store_terminated(&self.value, value);
    }

    /// Current serial word
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial.load(Ordering::Acquire)
    }

    /// Name bytes, without the terminator. Names never change once set.
    #[must_use]
    pub fn name_bytes(&self) -> Vec<u8> {
        self.name
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .take_while(|&b| b != 0)
            .collect()
    }

    /// Whether the stored name equals `name`
    #[must_use]
    pub fn name_matches(&self, name: &[u8]) -> bool {
        name.len() < PROP_NAME_MAX
            && self
                .name
                .iter()
                .zip(name.iter().chain(iter::once(&0)))
                .all(|(slot, &b)| slot.load(Ordering::Relaxed) == b)
    }

    /// Replace the value in place.
    ///
    /// Precondition: the value passed `validate`, and no other writer is
    /// active on this record.
    ///
    /// Returns the published serial.
    pub(crate) fn update(&self, value: &[u8], key: WaitKey, waiter: &dyn WaitStrategy) -> u32 {
        debug_assert!(value.len() < PROP_VALUE_MAX);

        let dirty = serial::mark_dirty(self.serial.load(Ordering::Relaxed));
        self.serial.store(dirty, Ordering::Relaxed);
        fence(Ordering::Release);

        store_terminated(&self.value, value);

        let published = serial::commit(dirty, value.len());
        self.serial.store(published, Ordering::Release);

        waiter.wake_all(key, published);
        published
    }

    /// Copy the value and its terminator into `out`.
    ///
    /// Returns the value length and the serial the copy is consistent with.
    pub fn read_into(
        &self,
        out: &mut [u8; PROP_VALUE_MAX],
        key: WaitKey,
        waiter: &dyn WaitStrategy,
    ) -> (usize, u32) {
        loop {
            let mut serial = self.serial.load(Ordering::Acquire);
            while serial::is_dirty(serial) {
                waiter.wait(key, &self.serial, serial, DEFAULT_WAIT_TIMEOUT);
                serial = self.serial.load(Ordering::Acquire);
            }

            let len = serial::value_len(serial).min(PROP_VALUE_MAX - 1);
            for (dst, src) in out.iter_mut().zip(self.value.iter()).take(len + 1) {
                *dst = src.load(Ordering::Relaxed);
            }

            fence(Ordering::Acquire);
            if serial == self.serial.load(Ordering::Relaxed) {
                return (len, serial);
            }
        }
    }

    /// Consistent copy of the value, without the terminator
    #[must_use]
    pub fn read(&self, key: WaitKey, waiter: &dyn WaitStrategy) -> Vec<u8> {
        let mut buf = [0u8; PROP_VALUE_MAX];
        let (len, _) = self.read_into(&mut buf, key, waiter);
        buf[..len].to_vec()
    }

    /// Raw field bytes, as laid out in the area image
    pub(crate) fn raw_name(&self) -> [u8; PROP_NAME_MAX] {
        std::array::from_fn(|i| self.name[i].load(Ordering::Relaxed))
    }

    /// Restore a record from image bytes; the area is not shared yet.
    pub(crate) fn restore(&self, name: &[u8; PROP_NAME_MAX], serial: u32, value: &[u8; PROP_VALUE_MAX]) {
        for (slot, &b) in self.name.iter().zip(name) {
            slot.store(b, Ordering::Relaxed);
        }
        self.serial.store(serial, Ordering::Relaxed);
        for (slot, &b) in self.value.iter().zip(value) {
            slot.store(b, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for PropInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PropInfo(name={:?}, serial={:#010x})",
            String::from_utf8_lossy(&self.name_bytes()),
            self.serial()
        )
    }
}

/// Store `bytes` followed by a NUL terminator; slots past it are untouched.
fn store_terminated(slots: &[AtomicU8], bytes: &[u8]) {
    for (slot, &b) in slots.iter().zip(bytes.iter().chain(iter::once(&0))) {
        slot.store(b, Ordering::Relaxed);
    }
}

const _: () = assert!(std::mem::size_of::<PropInfo>() == 128);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification_queue::SleepWait;

    #[test]
    fn test_init_then_read() {
        let info = PropInfo::zeroed();
        info.init(b"test.key1", b"test_value1");

        let waiter = SleepWait::default();
        assert_eq!(info.read(WaitKey::Record(0), &waiter), b"test_value1");
        assert_eq!(info.name_bytes(), b"test.key1");
        assert_eq!(serial::generation(info.serial()), 0);
    }

    #[test]
    fn test_update_shorter_value() {
        let info = PropInfo::zeroed();
        info.init(b"k", b"a long initial value");

        let waiter = SleepWait::default();
        let published = info.update(b"short", WaitKey::Record(0), &waiter);
        assert_eq!(serial::value_len(published), 5);
        assert_eq!(serial::generation(published), 1);
        assert_eq!(info.read(WaitKey::Record(0), &waiter), b"short");
    }

    #[test]
    fn test_update_empty_and_max_value() {
        let info = PropInfo::zeroed();
        info.init(b"k", b"v");
        let waiter = SleepWait::default();

        info.update(b"", WaitKey::Record(0), &waiter);
        assert!(info.read(WaitKey::Record(0), &waiter).is_empty());

        let max = vec![b'x'; PROP_VALUE_MAX - 1];
        info.update(&max, WaitKey::Record(0), &waiter);
        assert_eq!(info.read(WaitKey::Record(0), &waiter), max);
    }

    #[test]
    fn test_read_into_copies_terminator() {
        let info = PropInfo::zeroed();
        info.init(b"k", b"longer");
        let waiter = SleepWait::default();
        info.update(b"ab", WaitKey::Record(0), &waiter);

        let mut out = [0xFFu8; PROP_VALUE_MAX];
        let (len, serial) = info.read_into(&mut out, WaitKey::Record(0), &waiter);
        assert_eq!(len, 2);
        assert_eq!(&out[..3], b"ab\0");
        assert_eq!(serial, info.serial());
    }

    #[test]
    fn test_validate_limits() {
        assert!(validate(&"n".repeat(31), "").is_ok());
        assert!(matches!(
            validate(&"n".repeat(32), ""),
            Err(PropertyError::InvalidName(_))
        ));
        assert!(matches!(validate("", "v"), Err(PropertyError::InvalidName(_))));
        assert!(validate("k", &"v".repeat(91)).is_ok());
        assert!(matches!(
            validate("k", &"v".repeat(92)),
            Err(PropertyError::InvalidValue { len: 92, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_nul() {
        assert!(matches!(validate("a\0b", "v"), Err(PropertyError::InvalidName(_))));
        assert!(matches!(
            validate("k", "v\0"),
            Err(PropertyError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_name_matches_is_exact() {
        let info = PropInfo::zeroed();
        info.init(b"ro.build", b"1");
        assert!(info.name_matches(b"ro.build"));
        assert!(!info.name_matches(b"ro.buil"));
        assert!(!info.name_matches(b"ro.build.x"));
    }
}
