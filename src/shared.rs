use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::ptr::NonNull;

use allocator_api2::alloc::Allocator;

use crate::count::PairedCount;
use crate::header::{AllocHeader, BoxHeader, DeleterHeader, Header, InPlaceHeader, ShareableHeader};
use crate::ptr::CountedNonNull;
use crate::weak::PairedWeak;

/// A reference-counted shared pointer whose cells can be mutated atomically.
///
/// `PairedArc` plays the role of [`std::sync::Arc`], with a control block
/// designed so that [`AtomicOptionPairedArc`](crate::AtomicOptionPairedArc)
/// can load and swap handles lock-free.  The handle itself is always
/// non-null; use `Option<PairedArc<T>>` for a nullable slot, which costs
/// nothing: the niche of the packed word makes the option pointer-sized.
///
/// A handle normally carries a zero local counter.  Handles extracted from
/// an atomic cell carry the cell's accumulated counter and settle it with
/// the control block when dropped; this is invisible to users.
///
/// # Examples
///
/// ```
/// use parc::PairedArc;
///
/// let x = PairedArc::new(42);
/// let y = x.clone();
/// drop(x);
/// assert_eq!(*y, 42);
/// assert_eq!(y.use_count(), 1);
/// ```
pub struct PairedArc<T> {
    ptr: CountedNonNull<Header<T>>,
}

unsafe impl<T: Send + Sync> Send for PairedArc<T> {}
unsafe impl<T: Send + Sync> Sync for PairedArc<T> {}

impl<T> PairedArc<T> {
    /// Allocates a control block with the value stored in-place.
    pub fn new(value: T) -> Self {
        Self::from_header(InPlaceHeader::new(value))
    }

    /// Allocates the block and the value in one allocation obtained from
    /// `alloc`; the block's storage is returned to `alloc` when the last
    /// weak reference drains.
    ///
    /// # Examples
    ///
    /// ```
    /// use allocator_api2::alloc::Global;
    /// use parc::PairedArc;
    ///
    /// let a = PairedArc::new_in(String::from("hi"), Global);
    /// assert_eq!(a.len(), 2);
    /// ```
    pub fn new_in<A>(value: T, alloc: A) -> Self
    where
        A: Allocator + Send + 'static,
    {
        Self::from_header(ShareableHeader::new_in(value, alloc))
    }

    /// Takes ownership of a boxed value through an external control block.
    pub fn from_box(value: Box<T>) -> Self {
        Self::from_header(BoxHeader::new(Box::into_raw(value)))
    }

    /// Adopts a raw pointer; the last strong release passes it to `deleter`.
    ///
    /// # Safety
    ///
    /// `object` must be valid for reads and writes, not aliased elsewhere,
    /// and safe to pass to `deleter` on any thread.
    pub unsafe fn from_raw_with<D>(object: *mut T, deleter: D) -> Self
    where
        D: FnOnce(*mut T) + Send + 'static,
    {
        Self::from_header(DeleterHeader::new(object, deleter))
    }

    /// Adopts a raw pointer whose storage came from `alloc`; the last
    /// strong release drops the value and returns the storage to `alloc`.
    ///
    /// # Safety
    ///
    /// `object` must point to an initialized `T` allocated by `alloc` with
    /// `Layout::new::<T>()`, and must not be aliased elsewhere.
    pub unsafe fn from_raw_in<A>(object: *mut T, alloc: A) -> Self
    where
        A: Allocator + Send + 'static,
    {
        Self::from_header(AllocHeader::new(object, alloc))
    }

    pub(crate) fn from_header(header: NonNull<Header<T>>) -> Self {
        Self {
            ptr: CountedNonNull::new(0, header),
        }
    }

    pub(crate) fn from_counted(ptr: CountedNonNull<Header<T>>) -> Self {
        Self { ptr }
    }

    pub(crate) fn into_counted(self) -> CountedNonNull<Header<T>> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    pub(crate) fn header(&self) -> &Header<T> {
        // Safety: the handle owns a strong credit, so the block is alive.
        unsafe { self.ptr.ptr().as_ref() }
    }

    pub(crate) fn header_ptr(&self) -> *mut Header<T> {
        self.ptr.ptr().as_ptr()
    }

    /// Folds `n` out of the handle's local counter; the eventual release
    /// settles the difference with the block.  Used by the atomic cell to
    /// compensate reader slots it opened on the caller's behalf.
    pub(crate) fn counter_sub(&mut self, n: i16) {
        let (ctr, ptr) = self.ptr.get();
        self.ptr = CountedNonNull::new(ctr.wrapping_sub(n), ptr);
    }

    /// The raw object pointer, without touching any count.
    pub fn as_ptr(&self) -> *const T {
        self.header().object()
    }

    /// A relaxed snapshot of the number of strong owners.
    ///
    /// Other threads may change the count at any moment; the value is
    /// exact only when the caller otherwise knows the handle is unshared.
    pub fn use_count(&self) -> u32 {
        self.header().use_count()
    }

    /// A relaxed snapshot of the number of weak handles.
    pub fn weak_count(&self) -> u32 {
        self.header().weak_count()
    }

    /// True iff this is the only strong owner, as a relaxed snapshot.
    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }

    /// True iff both handles manage the same allocation.
    ///
    /// # Examples
    ///
    /// ```
    /// use parc::PairedArc;
    ///
    /// let a = PairedArc::new(1);
    /// let b = a.clone();
    /// let c = PairedArc::new(1);
    /// assert!(PairedArc::ptr_eq(&a, &b));
    /// assert!(!PairedArc::ptr_eq(&a, &c));
    /// ```
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.header_ptr() == other.header_ptr()
    }

    /// Creates a weak handle to the same allocation.
    ///
    /// # Examples
    ///
    /// ```
    /// use parc::PairedArc;
    ///
    /// let a = PairedArc::new(7);
    /// let w = PairedArc::downgrade(&a);
    /// assert_eq!(*w.upgrade().unwrap(), 7);
    /// drop(a);
    /// assert!(w.upgrade().is_none());
    /// ```
    pub fn downgrade(this: &Self) -> PairedWeak<T> {
        this.header().acquire_weak();
        PairedWeak::from_header(this.ptr.ptr())
    }
}

impl<T> Clone for PairedArc<T> {
    /// Adds a strong owner on the control block.  The clone always starts
    /// with a zero local counter, whatever the source carried.
    fn clone(&self) -> Self {
        self.header().acquire(1);
        Self::from_header(self.ptr.ptr())
    }
}

impl<T> Drop for PairedArc<T> {
    fn drop(&mut self) {
        let (ctr, ptr) = self.ptr.get();
        // The local counter rides along so credits taken from an atomic
        // cell flow back to the block in the same decrement.
        unsafe { Header::release(ptr.as_ptr(), PairedCount::new(ctr as i32, 1)) }
    }
}

impl<T> Deref for PairedArc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the strong credit keeps the object alive.
        unsafe { &*self.header().object() }
    }
}

impl<T: Default> Default for PairedArc<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for PairedArc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for PairedArc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

/// Equality is identity of the managed allocation, like a raw pointer.
impl<T> PartialEq for PairedArc<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T> Eq for PairedArc<T> {}

impl<T> Hash for PairedArc<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.as_ptr() as usize).hash(state)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn option_is_pointer_sized() {
        assert_eq!(
            std::mem::size_of::<Option<PairedArc<String>>>(),
            std::mem::size_of::<u64>()
        );
        assert_eq!(
            std::mem::size_of::<PairedArc<String>>(),
            std::mem::size_of::<u64>()
        );
    }

    #[test]
    fn counts_track_clones_and_weaks() {
        let a = PairedArc::new(5);
        assert_eq!(a.use_count(), 1);
        assert!(a.is_unique());
        assert_eq!(a.weak_count(), 0);

        let b = a.clone();
        assert_eq!(a.use_count(), 2);
        assert!(!a.is_unique());

        let w = PairedArc::downgrade(&a);
        assert_eq!(a.weak_count(), 1);
        drop(w);
        assert_eq!(a.weak_count(), 0);
        drop(b);
        assert!(a.is_unique());
    }

    #[test]
    fn eq_and_hash_are_by_identity() {
        use std::collections::hash_map::DefaultHasher;

        let a = PairedArc::new(9);
        let b = a.clone();
        let c = PairedArc::new(9);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }
}
