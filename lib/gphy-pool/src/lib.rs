// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-budget bump allocator for the receive side of the modem library.
//!
//! The host application hands the library one memory budget at session init,
//! and every long-lived receive-side structure is carved out of it. A `Pool`
//! tracks that budget: it hands out aligned, never-individually-freed `Block`s
//! and answers "how much is left" so the receive database can size itself from
//! the remainder.
//!
//! A `Block` is an `(offset, len)` pair within the pool's virtual region, not
//! a pointer. Components that hold slot arrays reserve their byte cost here
//! and back the slots with an ordinary one-time allocation; the pool is the
//! single authority on whether the caller's budget can pay for it.
//!
//! There is no `free`. The pool exists precisely so that everything allocated
//! during init is released in one motion when the session goes away.

use std::sync::{Mutex, PoisonError};

/// Allocations are aligned to the pointer width, which covers every slot type
/// the receive side stores.
pub const ALIGNMENT: usize = core::mem::size_of::<usize>();

/// A bump allocator over a fixed byte budget.
///
/// `alloc` is safe to call from any thread. Poisoned-lock recovery is the "keep
/// going" kind: the guarded state is two counters, which cannot be left
/// mid-update by a panic in this crate.
#[derive(Debug)]
pub struct Pool {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Bytes consumed so far, including each allocation's own pre-alignment
    /// padding.
    usage: usize,
    /// Offset of the next unallocated byte.
    cursor: usize,
}

/// An allocation handed out by [`Pool::alloc`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Block {
    offset: usize,
    len: usize,
}

impl Block {
    /// Aligned offset of the block within the pool's region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Requested length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Pool {
    /// Creates a pool over a budget of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                usage: 0,
                cursor: 0,
            }),
        }
    }

    /// Reserves `len` bytes, aligned to [`ALIGNMENT`].
    ///
    /// Returns `None` when the remaining budget cannot cover the request plus
    /// its alignment padding. The pad is always 1..=ALIGNMENT bytes and is
    /// charged to this allocation.
    pub fn alloc(&self, len: usize) -> Option<Block> {
        let mut inner = self.lock();
        let pad = ALIGNMENT - (inner.cursor % ALIGNMENT);
        let total = len.checked_add(pad)?;
        if self.capacity < inner.usage + total {
            log::debug!(
                "pool exhausted: want {} bytes, {} of {} used",
                total,
                inner.usage,
                self.capacity
            );
            return None;
        }
        let offset = inner.cursor + pad;
        inner.cursor += total;
        inner.usage += total;
        Some(Block { offset, len })
    }

    /// Bytes consumed so far (allocations plus their padding).
    pub fn usage(&self) -> usize {
        self.lock().usage
    }

    /// Total budget in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available to `alloc`, not counting the padding a future
    /// allocation will pay.
    pub fn remaining(&self) -> usize {
        let inner = self.lock();
        self.capacity - inner.usage
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_aligned() {
        let pool = Pool::new(1024);
        // Odd-sized allocations must not knock later ones out of alignment.
        for len in [1, 3, 8, 13] {
            let b = pool.alloc(len).unwrap();
            assert_eq!(b.offset() % ALIGNMENT, 0, "len {len}");
            assert_eq!(b.len(), len);
        }
    }

    #[test]
    fn padding_is_charged_to_the_allocation() {
        let pool = Pool::new(1024);
        pool.alloc(1).unwrap();
        // 1 byte + the mandatory pad in 1..=ALIGNMENT.
        assert!(pool.usage() > 1);
        assert!(pool.usage() <= 1 + ALIGNMENT);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = Pool::new(64);
        assert!(pool.alloc(32).is_some());
        assert!(pool.alloc(64).is_none());
        // A smaller request can still succeed afterwards.
        assert!(pool.alloc(8).is_some());
    }

    #[test]
    fn usage_plus_remaining_is_capacity() {
        let pool = Pool::new(4096);
        for _ in 0..7 {
            pool.alloc(100).unwrap();
        }
        assert_eq!(pool.usage() + pool.remaining(), pool.capacity());
    }

    #[test]
    fn concurrent_allocs_never_overlap() {
        use std::sync::Arc;

        let pool = Arc::new(Pool::new(64 * 1024));
        let mut joins = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            joins.push(std::thread::spawn(move || {
                let mut blocks = Vec::new();
                while let Some(b) = pool.alloc(61) {
                    blocks.push(b);
                }
                blocks
            }));
        }
        let mut all: Vec<Block> = joins
            .into_iter()
            .flat_map(|j| j.join().unwrap())
            .collect();
        all.sort_by_key(|b| b.offset());
        for pair in all.windows(2) {
            assert!(pair[0].offset() + pair[0].len() <= pair[1].offset());
        }
    }
}
