use std::fmt;
use std::ptr::NonNull;

use crate::count::PairedCount;
use crate::header::Header;
use crate::ptr::CountedNonNull;
use crate::shared::PairedArc;

/// A non-owning handle to a [`PairedArc`] allocation.
///
/// Keeps the control block alive but not the object.  Use
/// `Option<PairedWeak<T>>` for a nullable slot; like the strong handle, the
/// option is pointer-sized.
///
/// # Examples
///
/// ```
/// use parc::PairedArc;
///
/// let strong = PairedArc::new("alive");
/// let weak = PairedArc::downgrade(&strong);
/// assert!(!weak.expired());
/// drop(strong);
/// assert!(weak.expired());
/// assert!(weak.upgrade().is_none());
/// ```
pub struct PairedWeak<T> {
    ptr: CountedNonNull<Header<T>>,
}

unsafe impl<T: Send + Sync> Send for PairedWeak<T> {}
unsafe impl<T: Send + Sync> Sync for PairedWeak<T> {}

impl<T> PairedWeak<T> {
    pub(crate) fn from_header(header: NonNull<Header<T>>) -> Self {
        Self {
            ptr: CountedNonNull::new(0, header),
        }
    }

    fn header(&self) -> &Header<T> {
        // Safety: the weak credit keeps the block alive.
        unsafe { self.ptr.ptr().as_ref() }
    }

    /// Promotes to a strong handle if the object is still alive.
    ///
    /// The promotion is atomic with respect to releases: either it lands
    /// while an owner still exists and the object stays alive, or it
    /// observes the owner count at zero and returns `None`.
    pub fn upgrade(&self) -> Option<PairedArc<T>> {
        if self.header().weak_lock() {
            Some(PairedArc::from_header(self.ptr.ptr()))
        } else {
            None
        }
    }

    /// A relaxed snapshot of the number of strong owners; zero once the
    /// object is gone.
    pub fn use_count(&self) -> u32 {
        self.header().use_count()
    }

    /// A relaxed snapshot of the number of weak handles.
    pub fn weak_count(&self) -> u32 {
        self.header().weak_count()
    }

    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// An arbitrary total order over allocations, usable as a map key
    /// shared with other handles to the same block.
    pub fn owner_before(&self, other: &Self) -> bool {
        (self.ptr.ptr().as_ptr() as usize) < (other.ptr.ptr().as_ptr() as usize)
    }
}

impl<T> Clone for PairedWeak<T> {
    fn clone(&self) -> Self {
        self.header().acquire_weak();
        Self::from_header(self.ptr.ptr())
    }
}

impl<T> Drop for PairedWeak<T> {
    fn drop(&mut self) {
        let (ctr, ptr) = self.ptr.get();
        unsafe { Header::release_weak(ptr.as_ptr(), PairedCount::new(ctr as i32, 1)) }
    }
}

impl<T> fmt::Debug for PairedWeak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(PairedWeak)")
    }
}
