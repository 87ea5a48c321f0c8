use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::sync::atomic::{AtomicU64, Ordering};

/// Two independent 32-bit counters packed into one 64-bit word.
///
/// The low lane `c2` is an unsigned use count.  The high lane `c1` is a
/// signed count of transient observers and may dip below zero while readers
/// and writers race; the accounting always settles back to zero.  Arithmetic
/// is lane-wise with silent wraparound.  Equality is equality of the whole
/// word.  The ordering is pointwise and therefore only partial: two counts
/// compare only when both lanes agree.
///
/// # Examples
///
/// ```
/// use parc::PairedCount;
///
/// let a = PairedCount::new(-2, 5);
/// let b = PairedCount::new(1, 1);
/// assert_eq!((a + b) - b, a);
/// assert_eq!(a.c1(), -2);
/// assert_eq!(a.c2(), 5);
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct PairedCount {
    word: u64,
}

impl PairedCount {
    pub const ZERO: PairedCount = PairedCount { word: 0 };

    pub fn new(c1: i32, c2: u32) -> Self {
        Self {
            word: ((c1 as u32 as u64) << 32) | c2 as u64,
        }
    }

    pub(crate) fn from_word(word: u64) -> Self {
        Self { word }
    }

    pub fn c1(self) -> i32 {
        (self.word >> 32) as u32 as i32
    }

    pub fn c2(self) -> u32 {
        self.word as u32
    }

    pub fn word(self) -> u64 {
        self.word
    }

    pub fn is_zero(self) -> bool {
        self.word == 0
    }

    /// Pointwise strict order: true iff both lanes are strictly greater.
    ///
    /// Not a total order; `PairedCount::new(1, 0)` and `PairedCount::new(0, 1)`
    /// are incomparable.
    pub fn exceeds(self, rhs: Self) -> bool {
        self.c1() > rhs.c1() && self.c2() > rhs.c2()
    }

    /// Pointwise order: true iff both lanes are greater or equal.
    pub fn at_least(self, rhs: Self) -> bool {
        self.c1() >= rhs.c1() && self.c2() >= rhs.c2()
    }
}

impl Add for PairedCount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.c1().wrapping_add(rhs.c1()),
            self.c2().wrapping_add(rhs.c2()),
        )
    }
}

impl AddAssign for PairedCount {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for PairedCount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.c1().wrapping_sub(rhs.c1()),
            self.c2().wrapping_sub(rhs.c2()),
        )
    }
}

impl SubAssign for PairedCount {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Debug for PairedCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PairedCount")
            .field(&self.c1())
            .field(&self.c2())
            .finish()
    }
}

/// A [`PairedCount`] in a single 64-bit atomic.
///
/// All read-modify-write operations act on the whole word in one instruction,
/// so both lanes move together.  Lane-wise `fetch_add`/`fetch_sub` are exact
/// as long as the unsigned low lane does not cross zero; the counter protocol
/// maintains that invariant, and [`fetch_transfer`](Self::fetch_transfer)
/// picks the add or sub encoding that keeps the borrow out of the high lane.
pub struct AtomicPairedCount {
    word: AtomicU64,
}

impl AtomicPairedCount {
    pub fn new(count: PairedCount) -> Self {
        Self {
            word: AtomicU64::new(count.word()),
        }
    }

    pub fn load(&self, order: Ordering) -> PairedCount {
        PairedCount::from_word(self.word.load(order))
    }

    pub fn store(&self, count: PairedCount, order: Ordering) {
        self.word.store(count.word(), order)
    }

    pub fn swap(&self, count: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_word(self.word.swap(count.word(), order))
    }

    pub fn compare_exchange(
        &self,
        current: PairedCount,
        new: PairedCount,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, PairedCount> {
        match self
            .word
            .compare_exchange(current.word(), new.word(), success, failure)
        {
            Ok(word) => Ok(PairedCount::from_word(word)),
            Err(word) => Err(PairedCount::from_word(word)),
        }
    }

    pub fn compare_exchange_weak(
        &self,
        current: PairedCount,
        new: PairedCount,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, PairedCount> {
        match self
            .word
            .compare_exchange_weak(current.word(), new.word(), success, failure)
        {
            Ok(word) => Ok(PairedCount::from_word(word)),
            Err(word) => Err(PairedCount::from_word(word)),
        }
    }

    /// Returns the previous value.
    pub fn fetch_add(&self, count: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_word(self.word.fetch_add(count.word(), order))
    }

    /// Returns the previous value.
    pub fn fetch_sub(&self, count: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_word(self.word.fetch_sub(count.word(), order))
    }

    /// Atomically moves `amount` from `c1` to `c2` in a single fetch-add or
    /// fetch-sub, leaving the pair at `(c1 - amount, c2 + amount)`.  Returns
    /// the previous value.
    ///
    /// A negative `amount` moves in the other direction and is encoded as a
    /// subtraction so the shrinking `c2` lane borrows against the operand
    /// rather than against the neighbouring lane.
    ///
    /// # Examples
    ///
    /// ```
    /// use parc::{AtomicPairedCount, PairedCount};
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let a = AtomicPairedCount::new(PairedCount::new(4, 1));
    /// a.fetch_transfer(3, Relaxed);
    /// assert_eq!(a.load(Relaxed), PairedCount::new(1, 4));
    /// a.fetch_transfer(-2, Relaxed);
    /// assert_eq!(a.load(Relaxed), PairedCount::new(3, 2));
    /// ```
    pub fn fetch_transfer(&self, amount: i32, order: Ordering) -> PairedCount {
        if amount >= 0 {
            self.fetch_add(PairedCount::new(-amount, amount as u32), order)
        } else {
            self.fetch_sub(PairedCount::new(amount, amount.unsigned_abs()), order)
        }
    }

    /// Compare-exchange on the `c1` lane alone.
    ///
    /// Reads the whole word; if `c1` differs from `expected` the observed
    /// `c1` is returned in `Err`.  Otherwise the full-word CAS is retried,
    /// carrying the other lane along, until it succeeds or `c1` changes.
    pub fn compare_exchange_c1(
        &self,
        expected: i32,
        desired: i32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<i32, i32> {
        let mut current = self.load(failure);
        loop {
            if current.c1() != expected {
                return Err(current.c1());
            }
            match self.compare_exchange(
                current,
                PairedCount::new(desired, current.c2()),
                success,
                failure,
            ) {
                Ok(_) => return Ok(expected),
                Err(actual) => current = actual,
            }
        }
    }

    /// Weak form of [`compare_exchange_c1`](Self::compare_exchange_c1); the
    /// inner CAS may fail spuriously, in which case it is retried as long as
    /// the `c1` lane still matches.
    pub fn compare_exchange_weak_c1(
        &self,
        expected: i32,
        desired: i32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<i32, i32> {
        let mut current = self.load(failure);
        loop {
            if current.c1() != expected {
                return Err(current.c1());
            }
            match self.compare_exchange_weak(
                current,
                PairedCount::new(desired, current.c2()),
                success,
                failure,
            ) {
                Ok(_) => return Ok(expected),
                Err(actual) => current = actual,
            }
        }
    }

    /// Compare-exchange on the `c2` lane alone; see
    /// [`compare_exchange_c1`](Self::compare_exchange_c1).
    pub fn compare_exchange_c2(
        &self,
        expected: u32,
        desired: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u32, u32> {
        let mut current = self.load(failure);
        loop {
            if current.c2() != expected {
                return Err(current.c2());
            }
            match self.compare_exchange(
                current,
                PairedCount::new(current.c1(), desired),
                success,
                failure,
            ) {
                Ok(_) => return Ok(expected),
                Err(actual) => current = actual,
            }
        }
    }

    /// Weak form of [`compare_exchange_c2`](Self::compare_exchange_c2).
    pub fn compare_exchange_weak_c2(
        &self,
        expected: u32,
        desired: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u32, u32> {
        let mut current = self.load(failure);
        loop {
            if current.c2() != expected {
                return Err(current.c2());
            }
            match self.compare_exchange_weak(
                current,
                PairedCount::new(current.c1(), desired),
                success,
                failure,
            ) {
                Ok(_) => return Ok(expected),
                Err(actual) => current = actual,
            }
        }
    }

    pub const fn is_always_lock_free() -> bool {
        cfg!(target_has_atomic = "64")
    }
}

impl fmt::Debug for AtomicPairedCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicPairedCount")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}
