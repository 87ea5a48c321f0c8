//! # A lock-free atomic shared pointer built on paired reference counts
//!
//! This crate provides [`PairedArc`], a reference-counted shared pointer in
//! the mold of `std::sync::Arc`, and [`AtomicOptionPairedArc`] /
//! [`AtomicPairedArc`], cells holding such a pointer that many threads can
//! load, store, swap, and compare-exchange concurrently without locks.  A
//! lock-free shared-pointer cell is the missing primitive between
//! `AtomicPtr` (atomic but unmanaged) and `Mutex<Arc<T>>` (managed but
//! serializing), and is a building block for lock-free data structures.
//!
//! # How it works
//!
//! On the 64-bit architectures this crate supports, user-space addresses
//! fit in 48 bits, so a cell packs the control-block pointer together with
//! a signed 16-bit counter into one atomic word.  A reader takes a
//! reference by fetch-adding one in the counter lane: the returned word
//! tells it which block it now observes, and the bump records its visit in
//! the cell itself rather than in the block, whose counter would be
//! contended by every cell (and every handle) pointing at it.
//!
//! The block keeps the books with a *pair* of 32-bit counters updated in
//! one 64-bit atomic: an unsigned lane counting owners, and a signed lane
//! counting observer credits pre-paid on behalf of cells.  A load charges
//! the block once, `(+1, +1)`: the owner credit backs the handle it
//! returns, the observer credit pre-pays for the visit recorded in the
//! cell.  When a writer swaps the pointer out, the old word leaves with the
//! cell's whole accumulated counter, and one decrement of the pair settles
//! every visit at once.  The signed lane may dip below zero while these
//! settlements race; the sum always returns to zero, and the object dies
//! exactly when both lanes hit zero together.
//!
//! After sixteen thousand consecutive loads a cell's counter nears its
//! lane boundary; the reader that crosses the threshold converts the
//! accumulated visits into observer credits at the block and restarts the
//! lane at zero.  Readers never wait for this; whoever succeeds, succeeds.
//!
//! # Example
//!
//! ```
//! use parc::{AtomicOptionPairedArc, PairedArc};
//!
//! let cell = AtomicOptionPairedArc::new(Some(PairedArc::new(1)));
//! let current = cell.load().unwrap();
//! let next = Some(PairedArc::new(*current + 1));
//! let mut expected = Some(current);
//! while !cell.compare_exchange_ref(&mut expected, &next) {}
//! assert_eq!(*cell.load().unwrap(), 2);
//! ```
//!
//! # Safety
//!
//! The packing relies on 48-bit virtual addresses; the crate refuses to
//! compile on non-64-bit targets and debug-asserts the invariant on every
//! pointer it packs.  `T` must be `Sized`: a fat pointer does not fit in a
//! 64-bit word (store a `Box<T>` of the unsized type instead).
//!
//! [`PairedWeak`] handles observe without owning, and promote back with
//! [`PairedWeak::upgrade`] iff the object is still alive.  Values can also
//! be constructed with a custom deleter or through a user allocator; see
//! the constructors on [`PairedArc`].

#[cfg(not(target_pointer_width = "64"))]
compile_error!("parc packs a 16-bit counter into the high bits of a pointer and requires a 64-bit target");

mod atomic;
mod count;
mod header;
mod ptr;
mod shared;
mod sync;
mod weak;

pub use atomic::{AtomicOptionPairedArc, AtomicPairedArc};
pub use count::{AtomicPairedCount, PairedCount};
pub use ptr::{AtomicCountedPtr, CountedPtr};
pub use shared::PairedArc;
pub use weak::PairedWeak;
