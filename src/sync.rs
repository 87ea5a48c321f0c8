#[cfg(loom)]
pub(crate) mod atomic {
    pub(crate) use loom::sync::atomic::{AtomicU64, AtomicU8, Ordering};
}

#[cfg(not(loom))]
pub(crate) mod atomic {
    pub(crate) use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
}

/// Address-keyed blocking on a 64-bit atomic word.
///
/// The real implementation parks the thread in the global parking lot keyed
/// by the word's address, re-checking the value under the bucket lock so a
/// racing `wake` cannot be missed. Under loom there is no parking lot; the
/// shim yields instead, which preserves the protocol (callers always reload
/// and re-decide after waking).
#[cfg(not(loom))]
pub(crate) mod futex {
    use super::atomic::{AtomicU64, Ordering};
    use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

    pub(crate) fn wait(word: &AtomicU64, old: u64) {
        let key = word as *const AtomicU64 as usize;
        let validate = || word.load(Ordering::Relaxed) == old;
        // Safety: the callbacks neither park nor call into the parking lot.
        let _ = unsafe {
            parking_lot_core::park(key, validate, || {}, |_, _| {}, DEFAULT_PARK_TOKEN, None)
        };
    }

    pub(crate) fn wake_one(word: &AtomicU64) {
        let key = word as *const AtomicU64 as usize;
        let _ = unsafe { parking_lot_core::unpark_one(key, |_| DEFAULT_UNPARK_TOKEN) };
    }

    pub(crate) fn wake_all(word: &AtomicU64) {
        let key = word as *const AtomicU64 as usize;
        let _ = unsafe { parking_lot_core::unpark_all(key, DEFAULT_UNPARK_TOKEN) };
    }
}

#[cfg(loom)]
pub(crate) mod futex {
    use super::atomic::{AtomicU64, Ordering};

    pub(crate) fn wait(word: &AtomicU64, old: u64) {
        if word.load(Ordering::Relaxed) == old {
            loom::thread::yield_now();
        }
    }

    pub(crate) fn wake_one(_word: &AtomicU64) {}

    pub(crate) fn wake_all(_word: &AtomicU64) {}
}
