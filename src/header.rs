use std::alloc::{handle_alloc_error, Layout};
use std::mem::{ManuallyDrop, MaybeUninit};
use std::ptr::{self, NonNull};

use allocator_api2::alloc::Allocator;

use crate::count::{AtomicPairedCount, PairedCount};
use crate::sync::atomic::{AtomicU8, Ordering};

/// The control block: one per object lifetime.
///
/// `strong` pairs a signed observer lane `c1` (credits pre-paid by atomic
/// cells on behalf of their readers) with an unsigned owner lane `c2` (live
/// handles plus one per cell).  The object dies when `strong` reaches zero
/// in both lanes at once.  `weak` counts weak handles in its `c2` lane,
/// plus one implicit credit held collectively by the strong side; the block
/// itself dies when `weak` reaches zero, which the implicit credit
/// guarantees can only happen after the object is gone.
///
/// Destruction is a closed set of strategies chosen at construction and
/// dispatched through two plain function pointers, one for the object and
/// one for the block.  A trait object will not do here: the packed word in
/// the atomic cell only has room for a thin pointer.
pub(crate) struct Header<T> {
    strong: AtomicPairedCount,
    weak: AtomicPairedCount,
    object: *mut T,
    drop_object: unsafe fn(*mut Header<T>),
    drop_header: unsafe fn(*mut Header<T>),
}

impl<T> Header<T> {
    fn new(
        object: *mut T,
        drop_object: unsafe fn(*mut Header<T>),
        drop_header: unsafe fn(*mut Header<T>),
    ) -> Self {
        Self {
            // One owner (the constructing handle) and the implicit weak
            // credit the strong side holds until the object is destroyed.
            strong: AtomicPairedCount::new(PairedCount::new(0, 1)),
            weak: AtomicPairedCount::new(PairedCount::new(0, 1)),
            object,
            drop_object,
            drop_header,
        }
    }

    pub(crate) fn object(&self) -> *mut T {
        self.object
    }

    pub(crate) fn use_count(&self) -> u32 {
        self.strong.load(Ordering::Relaxed).c2()
    }

    pub(crate) fn weak_count(&self) -> u32 {
        let weak = self.weak.load(Ordering::Relaxed).c2();
        if self.use_count() > 0 {
            // Hide the implicit credit while owners exist.
            weak.saturating_sub(1)
        } else {
            weak
        }
    }

    /// Adds `n` owners.
    pub(crate) fn acquire(&self, n: u32) {
        self.strong.fetch_add(PairedCount::new(0, n), Ordering::Relaxed);
    }

    /// Adds an arbitrary pair of credits in one step.
    pub(crate) fn acquire_pair(&self, count: PairedCount) {
        self.strong.fetch_add(count, Ordering::Relaxed);
    }

    /// Registers `n` transient observer credits.
    #[allow(dead_code)]
    pub(crate) fn hold(&self, n: i32) {
        self.strong.fetch_add(PairedCount::new(n, 0), Ordering::Relaxed);
    }

    /// Returns `n` observer credits.
    pub(crate) fn unhold(&self, n: i32) {
        self.strong.fetch_sub(PairedCount::new(n, 0), Ordering::Relaxed);
    }

    /// Gives back `count` strong credits; destroys the object when the
    /// counter reaches zero in both lanes, and then the block itself once
    /// the weak side drains.
    ///
    /// Tolerates null so callers can settle possibly-null cell words
    /// unconditionally.
    ///
    /// # Safety
    ///
    /// `this` must be null or point to a live block on which the caller
    /// owns the credits being released.
    pub(crate) unsafe fn release(this: *mut Self, count: PairedCount) {
        if this.is_null() {
            return;
        }
        // The zero-reaching decrement must observe every other thread's
        // last use of the object, and order the destructor after it.
        let old = (*this).strong.fetch_sub(count, Ordering::AcqRel);
        if old == count {
            ((*this).drop_object)(this);
            Self::release_weak(this, PairedCount::new(0, 1));
        }
    }

    /// Bumps the owner count iff it is still positive; the promotion path
    /// for weak handles.
    pub(crate) fn weak_lock(&self) -> bool {
        let mut current = self.strong.load(Ordering::Relaxed);
        loop {
            if current.c2() == 0 {
                return false;
            }
            match self.strong.compare_exchange_weak(
                current,
                current + PairedCount::new(0, 1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn acquire_weak(&self) {
        self.weak.fetch_add(PairedCount::new(0, 1), Ordering::Relaxed);
    }

    /// Gives back `count` weak credits; frees the block when the counter
    /// reaches zero.  By then the strong side is necessarily drained, since
    /// it held the implicit credit released in [`Header::release`].
    ///
    /// # Safety
    ///
    /// `this` must be null or point to a live block on which the caller
    /// owns the credits being released.
    pub(crate) unsafe fn release_weak(this: *mut Self, count: PairedCount) {
        if this.is_null() {
            return;
        }
        let old = (*this).weak.fetch_sub(count, Ordering::AcqRel);
        if old == count {
            debug_assert!((*this).strong.load(Ordering::Relaxed).is_zero());
            ((*this).drop_header)(this);
        }
    }
}

impl<T> Drop for Header<T> {
    fn drop(&mut self) {
        debug_assert!(self.strong.load(Ordering::Acquire).is_zero());
        debug_assert!(self.weak.load(Ordering::Acquire).is_zero());
    }
}

/// External object owned through the default `Box` delete path.
#[repr(C)]
pub(crate) struct BoxHeader<T> {
    hdr: Header<T>,
}

impl<T> BoxHeader<T> {
    /// `object` must have come out of `Box::into_raw`.
    pub(crate) fn new(object: *mut T) -> NonNull<Header<T>> {
        let boxed = Box::new(Self {
            hdr: Header::new(object, Self::drop_object, Self::drop_header),
        });
        // Safety: Box never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed) as *mut Header<T>) }
    }

    unsafe fn drop_object(this: *mut Header<T>) {
        drop(Box::from_raw((*this).object));
    }

    unsafe fn drop_header(this: *mut Header<T>) {
        drop(Box::from_raw(this as *mut Self));
    }
}

/// External object destroyed by a user-supplied deleter; the block itself
/// still lives in a `Box`.
#[repr(C)]
pub(crate) struct DeleterHeader<T, D> {
    hdr: Header<T>,
    deleter: ManuallyDrop<D>,
}

impl<T, D: FnOnce(*mut T)> DeleterHeader<T, D> {
    pub(crate) fn new(object: *mut T, deleter: D) -> NonNull<Header<T>> {
        let boxed = Box::new(Self {
            hdr: Header::new(object, Self::drop_object, Self::drop_header),
            deleter: ManuallyDrop::new(deleter),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed) as *mut Header<T>) }
    }

    unsafe fn drop_object(this: *mut Header<T>) {
        let this = this as *mut Self;
        let deleter = ManuallyDrop::take(&mut (*this).deleter);
        deleter((*this).hdr.object);
    }

    unsafe fn drop_header(this: *mut Header<T>) {
        drop(Box::from_raw(this as *mut Self));
    }
}

/// External object whose storage goes back to a user-supplied allocator;
/// the block itself still lives in a `Box`.
#[repr(C)]
pub(crate) struct AllocHeader<T, A> {
    hdr: Header<T>,
    alloc: ManuallyDrop<A>,
}

impl<T, A: Allocator> AllocHeader<T, A> {
    /// `object` must have been allocated by `alloc` with the layout of `T`.
    pub(crate) fn new(object: *mut T, alloc: A) -> NonNull<Header<T>> {
        let boxed = Box::new(Self {
            hdr: Header::new(object, Self::drop_object, Self::drop_header),
            alloc: ManuallyDrop::new(alloc),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed) as *mut Header<T>) }
    }

    unsafe fn drop_object(this: *mut Header<T>) {
        let this = this as *mut Self;
        let alloc = ManuallyDrop::take(&mut (*this).alloc);
        let object = (*this).hdr.object;
        ptr::drop_in_place(object);
        alloc.deallocate(NonNull::new_unchecked(object).cast(), Layout::new::<T>());
    }

    unsafe fn drop_header(this: *mut Header<T>) {
        drop(Box::from_raw(this as *mut Self));
    }
}

/// Header and object in one `Box` allocation; the object lives in aligned
/// storage inside the block.
#[repr(C)]
pub(crate) struct InPlaceHeader<T> {
    hdr: Header<T>,
    object: MaybeUninit<T>,
}

impl<T> InPlaceHeader<T> {
    pub(crate) fn new(value: T) -> NonNull<Header<T>> {
        let mut boxed = Box::new(Self {
            hdr: Header::new(ptr::null_mut(), Self::drop_object, Self::drop_header),
            object: MaybeUninit::new(value),
        });
        boxed.hdr.object = boxed.object.as_mut_ptr();
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed) as *mut Header<T>) }
    }

    unsafe fn drop_object(this: *mut Header<T>) {
        ptr::drop_in_place((*this).object);
    }

    unsafe fn drop_header(this: *mut Header<T>) {
        drop(Box::from_raw(this as *mut Self));
    }
}

const DESTROYING_OBJECT: u8 = 1;
const OBJECT_DESTROYED: u8 = 2;
const DESTROY_HEADER: u8 = 4;

/// Header and object in one allocation obtained from a user allocator, with
/// the two destructions split across an explicit state machine.
///
/// The machine settles the race where one thread is still inside the
/// object's destructor when another decides the block must go: whoever
/// loses the race hands its half of the teardown to the thread still
/// working.  Exactly one thread frees the block, and only after the object
/// destructor has returned.
#[repr(C)]
pub(crate) struct ShareableHeader<T, A> {
    hdr: Header<T>,
    state: AtomicU8,
    alloc: ManuallyDrop<A>,
    object: MaybeUninit<T>,
}

impl<T, A: Allocator> ShareableHeader<T, A> {
    pub(crate) fn new_in(value: T, alloc: A) -> NonNull<Header<T>> {
        let layout = Layout::new::<Self>();
        let raw = match alloc.allocate(layout) {
            Ok(p) => p.cast::<Self>(),
            Err(_) => handle_alloc_error(layout),
        };
        unsafe {
            raw.as_ptr().write(Self {
                hdr: Header::new(ptr::null_mut(), Self::drop_object, Self::drop_header),
                state: AtomicU8::new(0),
                alloc: ManuallyDrop::new(alloc),
                object: MaybeUninit::new(value),
            });
            (*raw.as_ptr()).hdr.object = (*raw.as_ptr()).object.as_mut_ptr();
            NonNull::new_unchecked(raw.as_ptr() as *mut Header<T>)
        }
    }

    unsafe fn drop_object(this: *mut Header<T>) {
        let this = this as *mut Self;
        let old = (*this).state.fetch_or(DESTROYING_OBJECT, Ordering::AcqRel);
        debug_assert_eq!(old & (DESTROYING_OBJECT | OBJECT_DESTROYED), 0);

        ptr::drop_in_place((*this).hdr.object);

        let old = (*this)
            .state
            .fetch_xor(DESTROYING_OBJECT | OBJECT_DESTROYED, Ordering::AcqRel);
        debug_assert_eq!(
            old & (DESTROYING_OBJECT | OBJECT_DESTROYED),
            DESTROYING_OBJECT
        );

        // A header-destroyer that arrived mid-destructor left its half of
        // the work to us.
        if old & DESTROY_HEADER != 0 {
            Self::free(this);
        }
    }

    unsafe fn drop_header(this: *mut Header<T>) {
        let this = this as *mut Self;
        let old = (*this).state.fetch_or(DESTROY_HEADER, Ordering::AcqRel);
        debug_assert_ne!(old & (DESTROYING_OBJECT | OBJECT_DESTROYED), 0);

        // Object destructor still running: it will free the block.
        if old & DESTROYING_OBJECT != 0 {
            return;
        }
        Self::free(this);
    }

    unsafe fn free(this: *mut Self) {
        let alloc = ManuallyDrop::take(&mut (*this).alloc);
        ptr::drop_in_place(this);
        alloc.deallocate(NonNull::new_unchecked(this).cast(), Layout::new::<Self>());
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use allocator_api2::alloc::{AllocError, Global};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct CountingAlloc {
        allocs: Arc<AtomicUsize>,
        deallocs: Arc<AtomicUsize>,
    }

    unsafe impl Allocator for CountingAlloc {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            self.allocs.fetch_add(1, Relaxed);
            Global.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.deallocs.fetch_add(1, Relaxed);
            Global.deallocate(ptr, layout)
        }
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Relaxed);
        }
    }

    #[test]
    fn release_destroys_object_then_header() {
        let dropped = Arc::new(AtomicBool::new(false));
        let h = InPlaceHeader::new(SetOnDrop(dropped.clone()));
        unsafe {
            assert_eq!((*h.as_ptr()).use_count(), 1);
            Header::release(h.as_ptr(), PairedCount::new(0, 1));
        }
        assert!(dropped.load(Relaxed));
    }

    #[test]
    fn observer_credits_keep_object_alive() {
        let dropped = Arc::new(AtomicBool::new(false));
        let h = InPlaceHeader::new(SetOnDrop(dropped.clone()));
        unsafe {
            // A straggling reader slot transferred from a cell.
            (*h.as_ptr()).hold(1);
            Header::release(h.as_ptr(), PairedCount::new(0, 1));
            assert!(!dropped.load(Relaxed));
            Header::release(h.as_ptr(), PairedCount::new(1, 0));
        }
        assert!(dropped.load(Relaxed));
    }

    #[test]
    fn weak_keeps_header_but_not_object() {
        let dropped = Arc::new(AtomicBool::new(false));
        let alloc = CountingAlloc::default();
        let h = ShareableHeader::new_in(SetOnDrop(dropped.clone()), alloc.clone());
        unsafe {
            (*h.as_ptr()).acquire_weak();
            Header::release(h.as_ptr(), PairedCount::new(0, 1));
            assert!(dropped.load(Relaxed));
            assert_eq!(alloc.deallocs.load(Relaxed), 0);

            assert!(!(*h.as_ptr()).weak_lock());
            Header::release_weak(h.as_ptr(), PairedCount::new(0, 1));
        }
        assert_eq!(alloc.allocs.load(Relaxed), 1);
        assert_eq!(alloc.deallocs.load(Relaxed), 1);
    }

    #[test]
    fn weak_lock_succeeds_while_owned() {
        let h = InPlaceHeader::new(17u32);
        unsafe {
            assert!((*h.as_ptr()).weak_lock());
            assert_eq!((*h.as_ptr()).use_count(), 2);
            Header::release(h.as_ptr(), PairedCount::new(0, 1));
            Header::release(h.as_ptr(), PairedCount::new(0, 1));
        }
    }

    struct Blocker {
        entered: Arc<AtomicBool>,
        unblock: Arc<AtomicBool>,
    }

    impl Drop for Blocker {
        fn drop(&mut self) {
            self.entered.store(true, Relaxed);
            while !self.unblock.load(Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    #[test]
    fn concurrent_teardown_frees_exactly_once() {
        // Drive the two destruction hooks from different threads while the
        // object destructor is deliberately stalled; the object-destroyer
        // must inherit the header destruction, and the block must be freed
        // exactly once, after the destructor returns.
        let entered = Arc::new(AtomicBool::new(false));
        let unblock = Arc::new(AtomicBool::new(false));
        let alloc = CountingAlloc::default();
        let h = ShareableHeader::new_in(
            Blocker {
                entered: entered.clone(),
                unblock: unblock.clone(),
            },
            alloc.clone(),
        );
        unsafe {
            // Quiesce the counters; the hooks are driven directly below.
            (*h.as_ptr())
                .strong
                .fetch_sub(PairedCount::new(0, 1), Ordering::AcqRel);
            (*h.as_ptr())
                .weak
                .fetch_sub(PairedCount::new(0, 1), Ordering::AcqRel);
        }

        let addr = h.as_ptr() as usize;
        let destroyer = std::thread::spawn(move || unsafe {
            ShareableHeader::<Blocker, CountingAlloc>::drop_object(addr as *mut Header<Blocker>);
        });

        while !entered.load(Relaxed) {
            std::hint::spin_loop();
        }
        unsafe {
            ShareableHeader::<Blocker, CountingAlloc>::drop_header(h.as_ptr());
        }
        // The destructor is still parked; the block must not be gone yet.
        assert_eq!(alloc.deallocs.load(Relaxed), 0);

        unblock.store(true, Relaxed);
        destroyer.join().unwrap();
        assert_eq!(alloc.allocs.load(Relaxed), 1);
        assert_eq!(alloc.deallocs.load(Relaxed), 1);
    }
}
