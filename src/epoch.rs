//! Epoch and transaction-identifier primitives.
//!
//! Epoch zero is reserved as invalid so it renders distinctly (`<INVALID>`) from any epoch a
//! record was actually written under. XIDs pack the status bits `locate_record`/`migrate_record`
//! check on every slot they touch directly into the 64-bit word so no separate lock table is
//! needed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A 32-bit monotone epoch. Zero is reserved as "invalid": no record was ever written with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch(u32);

pub const INVALID_EPOCH: Epoch = Epoch(0);

impl Epoch {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// The epoch following this one, wrapping past `u32::MAX` back to 1 (never back to the
    /// reserved invalid value 0).
    pub fn next(self) -> Epoch {
        let n = self.0.wrapping_add(1);
        Epoch(if n == 0 { 1 } else { n })
    }

    /// Wrap-around "happens before" comparison: half the 32-bit space is considered ahead,
    /// half behind, so the clock can wrap without losing ordering across any single comparison
    /// that's within `u32::MAX / 2` of the current epoch.
    pub fn precedes(self, other: Epoch) -> bool {
        let diff = other.0.wrapping_sub(self.0);
        diff != 0 && diff < (1u32 << 31)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<INVALID>")
        }
    }
}

const LOCKED_BIT: u64 = 1 << 0;
const MOVED_BIT: u64 = 1 << 1;
const DELETED_BIT: u64 = 1 << 2;
const STATUS_BITS: u32 = 3;
const ORDINAL_BITS: u32 = 29;
const ORDINAL_MASK: u64 = (1 << ORDINAL_BITS) - 1;

/// A 64-bit transaction identifier: `[epoch: 32][ordinal: 29][deleted: 1][moved: 1][locked: 1]`.
///
/// Installed atomically on every record mutation. The status bits distinguish physical
/// visibility (is there a record at all, at this slot) from logical commit-time validity (is
/// the record locked by an in-flight writer, has it been superseded by a migration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Xid(u64);

impl Xid {
    pub const ZERO: Xid = Xid(0);

    pub fn new(epoch: Epoch, ordinal: u32) -> Self {
        debug_assert!(ordinal <= ORDINAL_MASK as u32);
        Xid(((epoch.value() as u64) << (STATUS_BITS + ORDINAL_BITS))
            | (((ordinal as u64) & ORDINAL_MASK) << STATUS_BITS))
    }

    pub fn from_raw(raw: u64) -> Self {
        Xid(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn epoch(self) -> Epoch {
        Epoch::new((self.0 >> (STATUS_BITS + ORDINAL_BITS)) as u32)
    }

    pub fn ordinal(self) -> u32 {
        ((self.0 >> STATUS_BITS) & ORDINAL_MASK) as u32
    }

    pub fn is_locked(self) -> bool {
        self.0 & LOCKED_BIT != 0
    }

    pub fn is_moved(self) -> bool {
        self.0 & MOVED_BIT != 0
    }

    pub fn is_deleted(self) -> bool {
        self.0 & DELETED_BIT != 0
    }

    #[must_use]
    pub fn with_locked(self, locked: bool) -> Xid {
        Xid(set_bit(self.0, LOCKED_BIT, locked))
    }

    #[must_use]
    pub fn with_moved(self, moved: bool) -> Xid {
        Xid(set_bit(self.0, MOVED_BIT, moved))
    }

    #[must_use]
    pub fn with_deleted(self, deleted: bool) -> Xid {
        Xid(set_bit(self.0, DELETED_BIT, deleted))
    }
}

fn set_bit(word: u64, bit: u64, set: bool) -> u64 {
    if set {
        word | bit
    } else {
        word & !bit
    }
}

/// An atomic wrapper around a [`Xid`] word, used for in-page record headers.
///
/// This is a plain heap-resident atomic (not the raw-pointer-over-shared-memory trick used for
/// page-internal `DualPagePointer`s) because `Slot::xid` is read through the page's own byte
/// buffer via [`std::sync::atomic::AtomicU64::from_ptr`] at the call site — see `data_page.rs`.
pub struct AtomicXid(AtomicU64);

impl AtomicXid {
    pub const fn new(xid: Xid) -> Self {
        Self(AtomicU64::new(xid.0))
    }

    pub fn load(&self, order: Ordering) -> Xid {
        Xid(self.0.load(order))
    }

    pub fn store(&self, value: Xid, order: Ordering) {
        self.0.store(value.0, order);
    }

    pub fn compare_exchange(
        &self,
        current: Xid,
        new: Xid,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<Xid, Xid> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(Xid)
            .map_err(Xid)
    }
}

impl fmt::Debug for AtomicXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicXid")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_epoch_displays_as_invalid() {
        assert_eq!(INVALID_EPOCH.to_string(), "<INVALID>");
        assert_eq!(Epoch::new(5).to_string(), "5");
    }

    #[test]
    fn epoch_precedes_handles_wraparound() {
        let a = Epoch::new(u32::MAX - 1);
        let b = a.next();
        assert!(a.precedes(b));
        assert!(!b.precedes(a));
    }

    #[test]
    fn xid_round_trips_epoch_and_ordinal() {
        let xid = Xid::new(Epoch::new(42), 17);
        assert_eq!(xid.epoch(), Epoch::new(42));
        assert_eq!(xid.ordinal(), 17);
        assert!(!xid.is_locked());
        assert!(!xid.is_moved());
        assert!(!xid.is_deleted());
    }

    #[test]
    fn xid_status_bits_are_independent() {
        let xid = Xid::new(Epoch::new(1), 0)
            .with_locked(true)
            .with_deleted(true);
        assert!(xid.is_locked());
        assert!(xid.is_deleted());
        assert!(!xid.is_moved());
        let unlocked = xid.with_locked(false);
        assert!(!unlocked.is_locked());
        assert!(unlocked.is_deleted());
    }
}
