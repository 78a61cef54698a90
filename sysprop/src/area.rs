//! Property area
//!
//! Fixed-capacity storage for all properties:
//!
//! ```text
//! offset  size   field
//! ------  -----  -------------------------------------------
//!      0      4  count      number of defined properties
//!      4      4  serial     global serial, bumped on every write
//!      8     24  reserved
//!     32    988  toc[247]   (name_len << 24) | record byte offset
//!   1024  31616  records    247 x 128-byte PropInfo
//!  32640    128  unused
//! ```
//!
//! Records are addressed by index; the TOC still stores byte offsets so that
//! `to_image` produces the same bytes a C reader of the area expects.
//!
//! Records are only ever appended, and names are unique. `append` takes
//! `&mut self`; a shared area is written only by `PropertyStore`, under its
//! writer lock. `find`, `find_nth` and reads are safe from any number of
//! threads.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::PropertyError;
use crate::notification_queue::{WaitKey, WaitStrategy};
use crate::prop_info::{validate, PropInfo, PROP_NAME_MAX, PROP_VALUE_MAX};
use crate::serial;

/// Maximum number of properties
pub const PA_COUNT_MAX: usize = 247;

/// Byte offset of the first record
pub const PA_INFO_START: usize = 1024;

/// Stride of one record
pub const PA_INFO_SIZE: usize = 128;

/// Total size of the area image
pub const PA_SIZE: usize = 32768;

const COUNT_OFFSET: usize = 0;
const SERIAL_OFFSET: usize = 4;
const TOC_OFFSET: usize = 32;
const INFO_SERIAL_OFFSET: usize = PROP_NAME_MAX;
const INFO_VALUE_OFFSET: usize = PROP_NAME_MAX + 4;

#[repr(C)]
struct AreaHeader {
    count: AtomicU32,
    serial: AtomicU32,
    #[allow(dead_code)]
    reserved: [u32; 6],
    toc: [AtomicU32; PA_COUNT_MAX],
}

const _: () = assert!(std::mem::size_of::<AreaHeader>() <= PA_INFO_START);
const _: () = assert!(PA_INFO_START + PA_COUNT_MAX * PA_INFO_SIZE <= PA_SIZE);

impl AreaHeader {
    fn zeroed() -> Self {
        Self {
            count: AtomicU32::new(0),
            serial: AtomicU32::new(0),
            reserved: [0; 6],
            toc: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

/// A defined property inside an area
#[derive(Clone, Copy)]
pub struct PropRef<'a> {
    info: &'a PropInfo,
    index: usize,
}

impl<'a> PropRef<'a> {
    /// Position in creation order
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Key for waiting on this record's serial word
    #[must_use]
    pub fn key(&self) -> WaitKey {
        WaitKey::Record(self.index)
    }

    #[must_use]
    pub fn info(&self) -> &'a PropInfo {
        self.info
    }

    #[must_use]
    pub fn serial(&self) -> u32 {
        self.info.serial()
    }

    #[must_use]
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.info.name_bytes()).into_owned()
    }

    /// Consistent copy of the current value
    #[must_use]
    pub fn value(&self, waiter: &dyn WaitStrategy) -> String {
        String::from_utf8_lossy(&self.info.read(self.key(), waiter)).into_owned()
    }

    /// Replace the value. Single writer only; the value is validated.
    pub(crate) fn update(&self, value: &str, waiter: &dyn WaitStrategy) -> u32 {
        self.info.update(value.as_bytes(), self.key(), waiter)
    }
}

impl fmt::Debug for PropRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropRef(index={}, info={:?})", self.index, self.info)
    }
}

/// Fixed-capacity property storage
pub struct PropArea {
    header: Box<AreaHeader>,
    records: Box<[PropInfo]>,
}

impl PropArea {
    /// Allocate a zeroed area
    pub fn create() -> Result<Self, PropertyError> {
        let mut records = Vec::new();
        records
            .try_reserve_exact(PA_COUNT_MAX)
            .map_err(|_| PropertyError::InitFailure)?;
        records.extend((0..PA_COUNT_MAX).map(|_| PropInfo::zeroed()));

        Ok(Self {
            header: Box::new(AreaHeader::zeroed()),
            records: records.into_boxed_slice(),
        })
    }

    /// Number of defined properties
    #[must_use]
    pub fn count(&self) -> usize {
        self.header.count.load(Ordering::Acquire) as usize
    }

    /// Global serial
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.header.serial.load(Ordering::Acquire)
    }

    pub(crate) fn serial_word(&self) -> &AtomicU32 {
        &self.header.serial
    }

    /// Look up a property by exact name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<PropRef<'_>> {
        let name = name.as_bytes();
        let count = self.count();

        self.header.toc[..count]
            .iter()
            .map(|toc| toc.load(Ordering::Relaxed))
            .filter(|&toc| serial::toc_name_len(toc) == name.len())
            .filter_map(|toc| self.record(serial::toc_index(toc)?))
            .find(|prop| prop.info.name_matches(name))
    }

    /// The `n`-th property in creation order
    #[must_use]
    pub fn find_nth(&self, n: usize) -> Option<PropRef<'_>> {
        if n >= self.count() {
            return None;
        }
        let toc = self.header.toc.get(n)?.load(Ordering::Relaxed);
        self.record(serial::toc_index(toc)?)
    }

    fn record(&self, index: usize) -> Option<PropRef<'_>> {
        self.records.get(index).map(|info| PropRef { info, index })
    }

    /// Add a new property.
    ///
    /// Fails with `InvalidName`/`InvalidValue` on bad input,
    /// `AlreadyDefined` if the name exists and `CapacityExceeded` when the
    /// area is full.
    pub fn append(
        &mut self,
        name: &str,
        value: &str,
        waiter: &dyn WaitStrategy,
    ) -> Result<PropRef<'_>, PropertyError> {
        self.append_locked(name, value, waiter)
    }

    /// `append` for a shared area; the caller holds the writer lock
    pub(crate) fn append_locked(
        &self,
        name: &str,
        value: &str,
        waiter: &dyn WaitStrategy,
    ) -> Result<PropRef<'_>, PropertyError> {
        validate(name, value)?;
        if self.find(name).is_some() {
            return Err(PropertyError::AlreadyDefined(name.to_string()));
        }

        let index = self.header.count.load(Ordering::Relaxed) as usize;
        let (Some(info), Some(toc)) = (self.records.get(index), self.header.toc.get(index)) else {
            return Err(PropertyError::CapacityExceeded(name.to_string()));
        };

        info.init(name.as_bytes(), value.as_bytes());
        toc.store(serial::toc_encode(name.len(), index), Ordering::Relaxed);

        #[allow(clippy::cast_possible_truncation)]
        self.header.count.store(index as u32 + 1, Ordering::Release);
        self.bump_serial(waiter);

        Ok(PropRef { info, index })
    }

    /// Advance the global serial and wake "any change" waiters
    pub(crate) fn bump_serial(&self, waiter: &dyn WaitStrategy) -> u32 {
        let serial = self
            .header
            .serial
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        waiter.wake_all(WaitKey::AreaSerial, serial);
        serial
    }

    /// Serialize the area into its binary layout.
    ///
    /// Values go through the read protocol, so no record in the image is
    /// torn. Bytes past a value's terminator are not carried over.
    #[must_use]
    pub fn to_image(&self, waiter: &dyn WaitStrategy) -> Vec<u8> {
        let mut image = vec![0u8; PA_SIZE];
        let count = self.count();

        #[allow(clippy::cast_possible_truncation)]
        put_word(&mut image, COUNT_OFFSET, count as u32);
        put_word(&mut image, SERIAL_OFFSET, self.serial());

        for n in 0..count {
            let toc = self.header.toc[n].load(Ordering::Relaxed);
            put_word(&mut image, TOC_OFFSET + 4 * n, toc);

            let Some(prop) = serial::toc_index(toc).and_then(|index| self.record(index)) else {
                continue;
            };
            let base = serial::toc_offset(toc);
            let mut value = [0u8; PROP_VALUE_MAX];
            let (_, serial) = prop.info.read_into(&mut value, prop.key(), waiter);

            image[base..base + PROP_NAME_MAX].copy_from_slice(&prop.info.raw_name());
            put_word(&mut image, base + INFO_SERIAL_OFFSET, serial);
            image[base + INFO_VALUE_OFFSET..base + PA_INFO_SIZE].copy_from_slice(&value);
        }

        image
    }

    /// Rebuild an area from `to_image` output
    pub fn from_image(image: &[u8]) -> Result<Self, PropertyError> {
        if image.len() != PA_SIZE {
            return Err(malformed(format!(
                "expected {PA_SIZE} bytes, got {}",
                image.len()
            )));
        }

        let area = Self::create()?;
        let mut names = HashSet::new();
        let count = word_at(image, COUNT_OFFSET) as usize;
        if count > PA_COUNT_MAX {
            return Err(malformed(format!("count {count} exceeds {PA_COUNT_MAX}")));
        }

        for n in 0..count {
            let toc = word_at(image, TOC_OFFSET + 4 * n);
            if serial::toc_index(toc) != Some(n) {
                return Err(malformed(format!("toc[{n}] = {toc:#010x} does not address record {n}")));
            }

            let base = serial::toc_offset(toc);
            let mut name = [0u8; PROP_NAME_MAX];
            name.copy_from_slice(&image[base..base + PROP_NAME_MAX]);
            let name_len = serial::toc_name_len(toc);
            let name_end = name.iter().position(|&b| b == 0);
            if name_len == 0 || name_end != Some(name_len) {
                return Err(malformed(format!("record {n}: name does not match toc length {name_len}")));
            }
            let Ok(name_str) = std::str::from_utf8(&name[..name_len]) else {
                return Err(malformed(format!("record {n}: name is not UTF-8")));
            };
            if !names.insert(name_str.to_string()) {
                return Err(malformed(format!("record {n}: duplicate name {name_str:?}")));
            }

            let serial = word_at(image, base + INFO_SERIAL_OFFSET);
            let mut value = [0u8; PROP_VALUE_MAX];
            value.copy_from_slice(&image[base + INFO_VALUE_OFFSET..base + PA_INFO_SIZE]);
            let value_len = serial::value_len(serial);
            if serial::is_dirty(serial) {
                return Err(malformed(format!("record {n}: serial {serial:#010x} is dirty")));
            }
            if value_len >= PROP_VALUE_MAX || value[value_len] != 0 {
                return Err(malformed(format!("record {n}: bad value length {value_len}")));
            }

            area.records[n].restore(&name, serial, &value);
            area.header.toc[n].store(toc, Ordering::Relaxed);
        }

        #[allow(clippy::cast_possible_truncation)]
        area.header.count.store(count as u32, Ordering::Release);
        area.header
            .serial
            .store(word_at(image, SERIAL_OFFSET), Ordering::Release);

        Ok(area)
    }
}

impl fmt::Debug for PropArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PropArea(count={}, serial={})",
            self.count(),
            self.serial()
        )
    }
}

fn malformed(msg: String) -> PropertyError {
    PropertyError::MalformedImage(msg)
}

fn put_word(image: &mut [u8], offset: usize, word: u32) {
    image[offset..offset + 4].copy_from_slice(&word.to_ne_bytes());
}

fn word_at(image: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&image[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification_queue::SleepWait;

    #[test]
    fn test_create_is_empty() {
        let area = PropArea::create().unwrap();
        assert_eq!(area.count(), 0);
        assert_eq!(area.serial(), 0);
        assert!(area.find("anything").is_none());
        assert!(area.find_nth(0).is_none());
    }

    #[test]
    fn test_append_bumps_count_then_serial() {
        let mut area = PropArea::create().unwrap();
        let waiter = SleepWait::default();

        let prop = area.append("a.b", "c", &waiter).unwrap();
        assert_eq!(prop.index(), 0);
        assert_eq!(area.count(), 1);
        assert_eq!(area.serial(), 1);

        area.append("a.c", "d", &waiter).unwrap();
        assert_eq!(area.count(), 2);
        assert_eq!(area.serial(), 2);
    }

    #[test]
    fn test_find_uses_exact_name() {
        let mut area = PropArea::create().unwrap();
        let waiter = SleepWait::default();
        area.append("abc", "1", &waiter).unwrap();
        area.append("abd", "2", &waiter).unwrap();
        area.append("ab", "3", &waiter).unwrap();

        assert_eq!(area.find("abd").unwrap().value(&waiter), "2");
        assert_eq!(area.find("ab").unwrap().value(&waiter), "3");
        assert!(area.find("abcd").is_none());
        assert!(area.find("").is_none());
    }

    #[test]
    fn test_find_nth_follows_creation_order() {
        let mut area = PropArea::create().unwrap();
        let waiter = SleepWait::default();
        for name in ["z", "a", "m"] {
            area.append(name, name, &waiter).unwrap();
        }
        let names: Vec<String> = (0..3).filter_map(|n| area.find_nth(n)).map(|p| p.name()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
        assert!(area.find_nth(3).is_none());
    }

    #[test]
    fn test_append_fails_when_full() {
        let mut area = PropArea::create().unwrap();
        let waiter = SleepWait::default();
        for i in 0..PA_COUNT_MAX {
            area.append(&format!("key.{i}"), "v", &waiter).unwrap();
        }
        let err = area.append("one.more", "v", &waiter).unwrap_err();
        assert!(matches!(err, PropertyError::CapacityExceeded(name) if name == "one.more"));
        assert_eq!(area.count(), PA_COUNT_MAX);
    }

    #[test]
    fn test_toc_entries_hold_byte_offsets() {
        let mut area = PropArea::create().unwrap();
        let waiter = SleepWait::default();
        area.append("first", "1", &waiter).unwrap();
        area.append("second", "2", &waiter).unwrap();

        let image = area.to_image(&waiter);
        assert_eq!(word_at(&image, TOC_OFFSET), (5 << 24) | 1024);
        assert_eq!(word_at(&image, TOC_OFFSET + 4), (6 << 24) | (1024 + 128));
        assert_eq!(&image[1024..1030], b"first\0");
        assert_eq!(&image[1024 + 128..1024 + 135], b"second\0");
    }

    #[test]
    fn test_append_validates_input() {
        let mut area = PropArea::create().unwrap();
        let waiter = SleepWait::default();

        let long_name = "n".repeat(PROP_NAME_MAX + 8);
        assert!(matches!(
            area.append(&long_name, "v", &waiter),
            Err(PropertyError::InvalidName(_))
        ));
        assert!(matches!(
            area.append("k", &"v".repeat(200), &waiter),
            Err(PropertyError::InvalidValue { len: 200, .. })
        ));
        assert!(matches!(
            area.append("", "v", &waiter),
            Err(PropertyError::InvalidName(_))
        ));
        assert_eq!(area.count(), 0);
        assert_eq!(area.serial(), 0);
    }

    #[test]
    fn test_append_rejects_existing_name() {
        let mut area = PropArea::create().unwrap();
        let waiter = SleepWait::default();
        area.append("ro.dup", "1", &waiter).unwrap();

        let err = area.append("ro.dup", "2", &waiter).unwrap_err();
        assert!(matches!(err, PropertyError::AlreadyDefined(name) if name == "ro.dup"));
        assert_eq!(area.count(), 1);
        assert_eq!(area.find("ro.dup").unwrap().value(&waiter), "1");
    }
}
