use std::mem;
use std::ptr::{self, NonNull};

use crossbeam_utils::CachePadded;

use crate::count::PairedCount;
use crate::header::Header;
use crate::ptr::{AtomicCountedPtr, CountedNonNull, CountedPtr};
use crate::shared::PairedArc;
use crate::sync::atomic::Ordering;

/// Readers that push the cell's counter this high hand the accumulated
/// slots back to the block as observer credits.
const NORMALIZE_THRESHOLD: i16 = 1 << 14;

/// A lock-free atomic cell holding an `Option<PairedArc<T>>`.
///
/// The cell packs the control-block pointer and a 16-bit counter into one
/// 64-bit word.  A reader takes a reference with a single fetch-add on that
/// word: the counter lane records its visit, and the block's contended
/// counter is only touched to register the handle being returned, never to
/// protect the read itself.  A writer that replaces the pointer sweeps the
/// accumulated counter out with the old word and settles it against the old
/// block in one decrement.  Every operation is lock-free except
/// [`wait`](Self::wait), which parks until the value changes.
///
/// The cell occupies a full cache line so that unrelated cells never share
/// one.
///
/// # Examples
///
/// ```
/// use parc::{AtomicOptionPairedArc, PairedArc};
///
/// let cell = AtomicOptionPairedArc::new(Some(PairedArc::new(3)));
/// assert_eq!(*cell.load().unwrap(), 3);
/// cell.store(None);
/// assert!(cell.load().is_none());
/// ```
pub struct AtomicOptionPairedArc<T> {
    cell: CachePadded<AtomicCountedPtr<Header<T>>>,
}

unsafe impl<T: Send + Sync> Send for AtomicOptionPairedArc<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicOptionPairedArc<T> {}

impl<T> AtomicOptionPairedArc<T> {
    pub fn new(value: Option<PairedArc<T>>) -> Self {
        Self {
            cell: CachePadded::new(AtomicCountedPtr::new(Self::to_counted(value))),
        }
    }

    /// Consumes the cell without an atomic round-trip.
    pub fn into_inner(self) -> Option<PairedArc<T>> {
        let current = self.cell.load(Ordering::Relaxed);
        mem::forget(self);
        Self::from_counted(current)
    }

    pub fn is_lock_free(&self) -> bool {
        AtomicCountedPtr::<Header<T>>::is_always_lock_free()
    }

    /// Takes a handle out of a value, carrying its local counter along.
    fn to_counted(value: Option<PairedArc<T>>) -> CountedPtr<Header<T>> {
        match value {
            None => CountedPtr::null(),
            Some(v) => v.into_counted().as_counted(),
        }
    }

    /// Wraps a raw word back into a handle that will settle the word's
    /// counter against the block when dropped.
    fn from_counted(p: CountedPtr<Header<T>>) -> Option<PairedArc<T>> {
        CountedNonNull::try_from_counted(p).map(PairedArc::from_counted)
    }

    fn raw(value: &Option<PairedArc<T>>) -> *mut Header<T> {
        value.as_ref().map_or(ptr::null_mut(), |v| v.header_ptr())
    }

    /// Opens a reader slot: one fetch-add on the counter lane, returning
    /// the word as this reader saw it (slot included).
    fn enter(&self) -> CountedPtr<Header<T>> {
        let old = self.cell.fetch_ctr_add(1, Ordering::Acquire);
        let mut current = old.with_ctr(old.ctr().wrapping_add(1));

        if current.ctr() >= NORMALIZE_THRESHOLD && !current.is_null() {
            let taken = current.ctr();
            if self.try_leave(current, taken) {
                // Safety: our slot kept the block reachable from the cell.
                unsafe { (*current.ptr()).unhold(taken as i32) };
                current = current.with_ctr(0);
            }
        }
        current
    }

    /// Closes `count` slots at once if the word is still exactly `current`.
    fn try_leave(&self, current: CountedPtr<Header<T>>, count: i16) -> bool {
        let desired = current.with_ctr(current.ctr().wrapping_sub(count));
        self.cell
            .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Closes the slot opened by [`enter`](Self::enter).  If a writer has
    /// replaced the pointer meanwhile, the slot was swept into the old
    /// block's observer count and is paid back there instead.
    fn leave(&self, current: CountedPtr<Header<T>>) {
        let mut observed = current;
        loop {
            let desired = observed.with_ctr(observed.ctr().wrapping_sub(1));
            match self.cell.compare_exchange_weak(
                observed,
                desired,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    if actual.ptr() != current.ptr() {
                        unsafe { Header::release(current.ptr(), PairedCount::new(1, 0)) };
                        return;
                    }
                    observed = actual;
                }
            }
        }
    }

    /// Refreshes a slot after a wake-up: cheap reload while the pointer is
    /// unchanged, otherwise pay the old block and open a fresh slot.
    fn reenter(&self, previous: CountedPtr<Header<T>>) -> CountedPtr<Header<T>> {
        let current = self.cell.load(Ordering::Relaxed);
        if current.ptr() == previous.ptr() {
            return current;
        }
        unsafe { Header::release(previous.ptr(), PairedCount::new(1, 0)) };
        self.enter()
    }

    /// Loads the current handle.
    ///
    /// The hot path is one fetch-add on the cell plus one fetch-add on the
    /// block: the block is charged an owner credit for the returned handle
    /// and an observer credit that pre-pays for the slot this load leaves
    /// behind in the cell.
    pub fn load(&self) -> Option<PairedArc<T>> {
        let current = self.enter();
        let header = NonNull::new(current.ptr())?;
        unsafe { header.as_ref() }.acquire_pair(PairedCount::new(1, 1));
        Some(PairedArc::from_header(header))
    }

    /// Replaces the held value, returning the previous one.
    ///
    /// The returned handle carries the cell's accumulated counter and
    /// settles it with the old block when dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use parc::{AtomicOptionPairedArc, PairedArc};
    ///
    /// let cell = AtomicOptionPairedArc::new(Some(PairedArc::new(1)));
    /// let old = cell.swap(Some(PairedArc::new(2)));
    /// assert_eq!(*old.unwrap(), 1);
    /// assert_eq!(*cell.load().unwrap(), 2);
    /// ```
    pub fn swap(&self, value: Option<PairedArc<T>>) -> Option<PairedArc<T>> {
        Self::from_counted(self.cell.swap(Self::to_counted(value), Ordering::AcqRel))
    }

    /// Replaces the held value, dropping the previous one.
    pub fn store(&self, value: Option<PairedArc<T>>) {
        drop(self.swap(value));
    }

    /// If the cell holds the same allocation as `expected`, replaces it
    /// with `desired` and returns true.  Otherwise writes the actual value
    /// into `expected` and returns false; `desired` is dropped.
    ///
    /// Linearizable: a false return reports a value that was really in the
    /// cell, observed through a protected reader slot.
    ///
    /// # Examples
    ///
    /// ```
    /// use parc::{AtomicOptionPairedArc, PairedArc};
    ///
    /// let cell = AtomicOptionPairedArc::new(None);
    /// let mut expected = None;
    /// assert!(cell.compare_exchange(&mut expected, Some(PairedArc::new(1))));
    ///
    /// // Stale expectation: fails and reports the live value.
    /// let mut expected = None;
    /// assert!(!cell.compare_exchange(&mut expected, None));
    /// assert_eq!(*expected.unwrap(), 1);
    /// ```
    pub fn compare_exchange(
        &self,
        expected: &mut Option<PairedArc<T>>,
        desired: Option<PairedArc<T>>,
    ) -> bool {
        self.cas_move(expected, desired, true)
    }

    /// Like [`compare_exchange`](Self::compare_exchange) but may fail
    /// spuriously even when the cell matches `expected`.
    pub fn compare_exchange_weak(
        &self,
        expected: &mut Option<PairedArc<T>>,
        desired: Option<PairedArc<T>>,
    ) -> bool {
        self.cas_move(expected, desired, false)
    }

    /// Compare-exchange that borrows `desired`, for retry loops that reuse
    /// it.  A fresh owner credit is taken on `desired`'s block for the
    /// cell; `desired` itself is untouched either way.
    pub fn compare_exchange_ref(
        &self,
        expected: &mut Option<PairedArc<T>>,
        desired: &Option<PairedArc<T>>,
    ) -> bool {
        self.cas_ref(expected, desired, true)
    }

    /// Weak form of [`compare_exchange_ref`](Self::compare_exchange_ref).
    pub fn compare_exchange_weak_ref(
        &self,
        expected: &mut Option<PairedArc<T>>,
        desired: &Option<PairedArc<T>>,
    ) -> bool {
        self.cas_ref(expected, desired, false)
    }

    fn cell_cas(
        &self,
        current: CountedPtr<Header<T>>,
        new: CountedPtr<Header<T>>,
        strong: bool,
    ) -> Result<CountedPtr<Header<T>>, CountedPtr<Header<T>>> {
        if strong {
            self.cell
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
        } else {
            self.cell
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
        }
    }

    // The exchange is optimistic: CAS against the word we saw when opening
    // a reader slot, without acquiring anything up front.  On success the
    // removed word settles the old block.  On a pointer mismatch the slot
    // lets us materialize the live value into `expected` safely.  The slot
    // itself is not closed on the match path; instead `expected`'s local
    // counter absorbs it, so its eventual release squares the books.
    fn cas_move(
        &self,
        expected: &mut Option<PairedArc<T>>,
        desired: Option<PairedArc<T>>,
        strong: bool,
    ) -> bool {
        let expected_ptr = Self::raw(expected);
        let desired_cp = Self::to_counted(desired);

        'restart: loop {
            let mut observed = self.enter();
            if observed.ptr() != expected_ptr {
                if let Some(header) = NonNull::new(observed.ptr()) {
                    unsafe { header.as_ref() }.acquire_pair(PairedCount::new(1, 1));
                    *expected = Some(PairedArc::from_header(header));
                } else {
                    *expected = None;
                }
                drop(Self::from_counted(desired_cp));
                return false;
            }
            if let Some(e) = expected.as_mut() {
                e.counter_sub(1);
            }
            loop {
                match self.cell_cas(observed, desired_cp, strong) {
                    Ok(old) => {
                        drop(Self::from_counted(old));
                        return true;
                    }
                    Err(actual) => {
                        if actual.ptr() != expected_ptr {
                            continue 'restart;
                        }
                        observed = actual;
                    }
                }
            }
        }
    }

    fn cas_ref(
        &self,
        expected: &mut Option<PairedArc<T>>,
        desired: &Option<PairedArc<T>>,
        strong: bool,
    ) -> bool {
        let expected_ptr = Self::raw(expected);
        let desired_ptr = Self::raw(desired);
        let desired_cp = CountedPtr::new(0, desired_ptr);
        let mut acquired_desired = false;

        'restart: loop {
            let mut observed = self.enter();
            if observed.ptr() != expected_ptr {
                if acquired_desired {
                    // Give back the credit taken for a success that never
                    // came.
                    unsafe { Header::release(desired_ptr, PairedCount::new(0, 1)) };
                }
                if let Some(header) = NonNull::new(observed.ptr()) {
                    unsafe { header.as_ref() }.acquire_pair(PairedCount::new(1, 1));
                    *expected = Some(PairedArc::from_header(header));
                } else {
                    *expected = None;
                }
                return false;
            }
            if let Some(e) = expected.as_mut() {
                e.counter_sub(1);
            }
            // The cell needs its own owner credit on the incoming block
            // before any install can succeed, since `desired` keeps its.
            if !acquired_desired {
                if let Some(d) = desired.as_ref() {
                    d.header().acquire(1);
                }
                acquired_desired = true;
            }
            loop {
                match self.cell_cas(observed, desired_cp, strong) {
                    Ok(old) => {
                        unsafe {
                            Header::release(old.ptr(), PairedCount::new(old.ctr() as i32, 1))
                        };
                        return true;
                    }
                    Err(actual) => {
                        if actual.ptr() != expected_ptr {
                            continue 'restart;
                        }
                        observed = actual;
                    }
                }
            }
        }
    }

    /// Blocks until the cell holds a different allocation than `old`.
    ///
    /// Spurious wake-ups re-check through a fresh reader slot, so a return
    /// really means the value changed at some point after the call began.
    pub fn wait(&self, old: &Option<PairedArc<T>>) {
        self.wait_raw(Self::raw(old));
    }

    pub(crate) fn wait_raw(&self, old_ptr: *mut Header<T>) {
        let mut current = self.enter();
        loop {
            if current.ptr() != old_ptr {
                self.leave(current);
                return;
            }
            self.cell.wait(current);
            current = self.reenter(current);
        }
    }

    /// Wakes one thread blocked in [`wait`](Self::wait).
    pub fn notify_one(&self) {
        self.cell.notify_one();
    }

    /// Wakes every thread blocked in [`wait`](Self::wait).
    pub fn notify_all(&self) {
        self.cell.notify_all();
    }
}

impl<T> Default for AtomicOptionPairedArc<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> From<Option<PairedArc<T>>> for AtomicOptionPairedArc<T> {
    fn from(value: Option<PairedArc<T>>) -> Self {
        Self::new(value)
    }
}

impl<T> From<PairedArc<T>> for AtomicOptionPairedArc<T> {
    fn from(value: PairedArc<T>) -> Self {
        Self::new(Some(value))
    }
}

impl<T> Drop for AtomicOptionPairedArc<T> {
    fn drop(&mut self) {
        // The resting counter may be negative after enter/leave churn; the
        // block expects exactly this cell's contribution back.
        let current = self.cell.load(Ordering::Acquire);
        unsafe { Header::release(current.ptr(), PairedCount::new(current.ctr() as i32, 1)) };
    }
}

/// A lock-free atomic cell holding a [`PairedArc<T>`] that is never null.
///
/// A thin wrapper over [`AtomicOptionPairedArc`] for slots that always hold
/// a value, sparing callers the `Option` plumbing.
///
/// # Examples
///
/// ```
/// use parc::{AtomicPairedArc, PairedArc};
///
/// let cell = AtomicPairedArc::new(PairedArc::new(1));
/// let old = cell.swap(PairedArc::new(2));
/// assert_eq!(*old, 1);
/// assert_eq!(*cell.load(), 2);
/// ```
pub struct AtomicPairedArc<T> {
    cell: AtomicOptionPairedArc<T>,
}

impl<T> AtomicPairedArc<T> {
    pub fn new(value: PairedArc<T>) -> Self {
        Self {
            cell: AtomicOptionPairedArc::new(Some(value)),
        }
    }

    pub fn into_inner(self) -> PairedArc<T> {
        self.cell.into_inner().unwrap()
    }

    pub fn is_lock_free(&self) -> bool {
        self.cell.is_lock_free()
    }

    pub fn load(&self) -> PairedArc<T> {
        self.cell.load().unwrap()
    }

    pub fn store(&self, value: PairedArc<T>) {
        self.cell.store(Some(value))
    }

    pub fn swap(&self, value: PairedArc<T>) -> PairedArc<T> {
        self.cell.swap(Some(value)).unwrap()
    }

    /// On success returns `Ok` with the caller's `current`, which is known
    /// to match what the cell held; on failure returns `Err` with the
    /// value actually observed.
    ///
    /// # Examples
    ///
    /// ```
    /// use parc::{AtomicPairedArc, PairedArc};
    ///
    /// let a = PairedArc::new(1);
    /// let b = PairedArc::new(2);
    /// let cell = AtomicPairedArc::new(a.clone());
    /// assert!(cell.compare_exchange(a.clone(), b.clone()).is_ok());
    /// let err = cell.compare_exchange(a, PairedArc::new(3)).unwrap_err();
    /// assert!(PairedArc::ptr_eq(&err, &b));
    /// ```
    pub fn compare_exchange(
        &self,
        current: PairedArc<T>,
        new: PairedArc<T>,
    ) -> Result<PairedArc<T>, PairedArc<T>> {
        let mut expected = Some(current);
        if self.cell.compare_exchange(&mut expected, Some(new)) {
            Ok(expected.unwrap())
        } else {
            Err(expected.unwrap())
        }
    }

    /// Weak form of [`compare_exchange`](Self::compare_exchange); may fail
    /// spuriously with an `Err` that matches `current`.
    pub fn compare_exchange_weak(
        &self,
        current: PairedArc<T>,
        new: PairedArc<T>,
    ) -> Result<PairedArc<T>, PairedArc<T>> {
        let mut expected = Some(current);
        if self.cell.compare_exchange_weak(&mut expected, Some(new)) {
            Ok(expected.unwrap())
        } else {
            Err(expected.unwrap())
        }
    }

    /// Blocks until the cell holds a different allocation than `old`.
    pub fn wait(&self, old: &PairedArc<T>) {
        self.cell.wait_raw(old.header_ptr());
    }

    pub fn notify_one(&self) {
        self.cell.notify_one();
    }

    pub fn notify_all(&self) {
        self.cell.notify_all();
    }
}

impl<T: Default> Default for AtomicPairedArc<T> {
    fn default() -> Self {
        Self::new(PairedArc::default())
    }
}

impl<T> From<PairedArc<T>> for AtomicPairedArc<T> {
    fn from(value: PairedArc<T>) -> Self {
        Self::new(value)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn load_store_roundtrip() {
        let cell = AtomicOptionPairedArc::new(None);
        assert!(cell.load().is_none());
        cell.store(Some(PairedArc::new(7)));
        assert_eq!(*cell.load().unwrap(), 7);
        cell.store(None);
        assert!(cell.load().is_none());
    }

    #[test]
    fn loaded_handles_outlive_the_cell() {
        let cell = AtomicOptionPairedArc::new(Some(PairedArc::new(11)));
        let h = cell.load().unwrap();
        drop(cell);
        assert_eq!(*h, 11);
        assert_eq!(h.use_count(), 1);
    }

    #[test]
    fn cas_ref_retries_with_the_same_desired() {
        let cell = AtomicOptionPairedArc::new(Some(PairedArc::new(0)));
        let desired = Some(PairedArc::new(1));
        let mut expected = None;
        // First attempt fails and teaches us the live value.
        assert!(!cell.compare_exchange_ref(&mut expected, &desired));
        assert_eq!(**expected.as_ref().unwrap(), 0);
        // Second attempt lands, with `desired` untouched.
        assert!(cell.compare_exchange_ref(&mut expected, &desired));
        assert_eq!(*desired.unwrap(), 1);
        assert_eq!(*cell.load().unwrap(), 1);
    }

    #[test]
    fn normalization_caps_the_local_counter() {
        let cell = AtomicOptionPairedArc::new(Some(PairedArc::new(0u32)));
        for _ in 0..40_000 {
            let h = cell.load().unwrap();
            assert_eq!(*h, 0);
        }
        let ctr = cell.cell.load(Ordering::Relaxed).ctr();
        assert!(ctr >= 0);
        assert!(ctr < NORMALIZE_THRESHOLD);
    }

    #[test]
    fn into_inner_returns_the_resident() {
        let cell = AtomicPairedArc::new(PairedArc::new(5));
        cell.store(PairedArc::new(6));
        assert_eq!(*cell.into_inner(), 6);
    }
}
