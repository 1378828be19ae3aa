// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License..

//! Bootstrap allocator for the EMM's own bookkeeping memory (EMA nodes,
//! eaccept bitmaps). Grounded on `examples/original_source/emalloc.c` in
//! full; the Rust-shaped scaffolding in `sgx_trts::emm::interior::Reserve`
//! is a `todo!()` stub for every body, so the block/list algorithms below
//! are translated directly from the C rather than adapted from Rust source.
//!
//! A segregated-fit allocator over one or more "reserves" — contiguous
//! chunks of raw memory obtained from the enclave memory manager itself.
//! Because the EMM needs this allocator to track its own EMA nodes, asking
//! it for a new reserve would ordinarily recurse back into the EMM, which
//! would recurse back here. [`Emalloc::add_reserve`] breaks that cycle with
//! the `adding_reserve` guard: while a reserve request is in flight, any
//! nested allocation is served out of a small static meta reserve instead.

use core::alloc::{AllocError, Allocator, Layout};
use core::ptr::NonNull;

use buddy_system_allocator::LockedHeap;
use spin::{Mutex, Once};

use crate::error::{EmmResult, Status};

const HEADER_SIZE: usize = 8;
const EXACT_MATCH_INCREMENT: usize = 8;
const MIN_BLOCK_SIZE: usize = 16;
const NUM_EXACT_LIST: usize = 256;
const MAX_EXACT_SIZE: usize = MIN_BLOCK_SIZE + EXACT_MATCH_INCREMENT * (NUM_EXACT_LIST - 1);
const ALLOC_BIT: u64 = 1;
const SIZE_MASK: u64 = !(EXACT_MATCH_INCREMENT as u64 - 1);

/// Only used to allocate memory for the EMAs that track reserve areas
/// themselves, so `Emalloc::emalloc` never recurses past one level deep
/// while `adding_reserve` is set. Sized per the donor's own budgeting note
/// in `emalloc.c` (64 KiB is enough bookkeeping for a 1.75 GiB total reserve).
const META_RESERVE_SIZE: usize = 0x1_0000;
const INITIAL_RESERVE_SIZE: usize = 0x1_0000;
const MAX_RESERVE_SIZE: usize = 0x1000_0000;

#[inline]
fn has_prev_slot(block_size: usize) -> bool {
    block_size > MIN_BLOCK_SIZE
}

#[inline]
fn round_to(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Raw, header-prefixed accessors over a block of emalloc-managed memory.
/// A block's header is a `u64` combining its size (always a multiple of
/// `EXACT_MATCH_INCREMENT`, so its low 3 bits are free) with an in-use bit.
/// Free blocks additionally carry next/prev free-list pointers in their
/// payload; `prev` only exists once a block is bigger than `MIN_BLOCK_SIZE`,
/// matching the donor's "used only when this block is 16 bytes+" comment.
mod block {
    use super::*;

    #[inline]
    unsafe fn header(b: NonNull<u8>) -> u64 {
        *(b.as_ptr() as *const u64)
    }

    #[inline]
    unsafe fn set_header(b: NonNull<u8>, v: u64) {
        *(b.as_ptr() as *mut u64) = v;
    }

    pub unsafe fn size(b: NonNull<u8>) -> usize {
        (header(b) & SIZE_MASK) as usize
    }

    pub unsafe fn is_alloced(b: NonNull<u8>) -> bool {
        header(b) & ALLOC_BIT != 0
    }

    pub unsafe fn end(b: NonNull<u8>) -> usize {
        b.as_ptr() as usize + size(b)
    }

    pub unsafe fn mark_alloced(b: NonNull<u8>, sz: usize) {
        set_header(b, sz as u64 | ALLOC_BIT);
    }

    pub unsafe fn mark_free(b: NonNull<u8>, sz: usize) {
        set_header(b, sz as u64);
    }

    pub unsafe fn payload(b: NonNull<u8>) -> NonNull<u8> {
        NonNull::new_unchecked(b.as_ptr().add(HEADER_SIZE))
    }

    pub unsafe fn from_payload(p: NonNull<u8>) -> NonNull<u8> {
        NonNull::new_unchecked(p.as_ptr().sub(HEADER_SIZE))
    }

    unsafe fn slot(b: NonNull<u8>, offset: usize) -> *mut usize {
        b.as_ptr().add(offset) as *mut usize
    }

    pub unsafe fn next(b: NonNull<u8>) -> Option<NonNull<u8>> {
        NonNull::new(*slot(b, HEADER_SIZE) as *mut u8)
    }

    pub unsafe fn set_next(b: NonNull<u8>, next: Option<NonNull<u8>>) {
        *slot(b, HEADER_SIZE) = next.map_or(0, |n| n.as_ptr() as usize);
    }

    pub unsafe fn prev(b: NonNull<u8>) -> Option<NonNull<u8>> {
        NonNull::new(*slot(b, HEADER_SIZE + 8) as *mut u8)
    }

    pub unsafe fn set_prev(b: NonNull<u8>, prev: Option<NonNull<u8>>) {
        *slot(b, HEADER_SIZE + 8) = prev.map_or(0, |n| n.as_ptr() as usize);
    }

    pub unsafe fn prepend(b: NonNull<u8>, head: &mut Option<NonNull<u8>>) {
        set_next(b, *head);
        if let Some(h) = *head {
            if has_prev_slot(size(h)) {
                set_prev(h, Some(b));
            }
        }
        *head = Some(b);
    }

    /// Unlinks `b` from `head`. Mirrors the donor exactly, including its one
    /// limitation: a block at `MIN_BLOCK_SIZE` has no prev slot, so it can
    /// only be safely unlinked from the head of its list (the only place
    /// this module ever removes such a block from).
    pub unsafe fn remove(b: NonNull<u8>, head: &mut Option<NonNull<u8>>) {
        let bsize = size(b);
        if *head == Some(b) {
            *head = next(b);
            if let Some(h) = *head {
                if has_prev_slot(size(h)) {
                    set_prev(h, None);
                }
            }
        } else {
            let p = if has_prev_slot(bsize) { prev(b) } else { None };
            let n = next(b);
            if let Some(pp) = p {
                set_next(pp, n);
            }
            if let Some(nn) = n {
                if has_prev_slot(size(nn)) {
                    set_prev(nn, p);
                }
            }
        }
    }
}

/// A contiguous chunk of raw memory the allocator draws new blocks from,
/// bump-allocated from `used` up to `size`. Stored at the base of the chunk
/// it describes, exactly as the donor's `mm_reserve_t` is.
struct ReserveChunk {
    base: usize,
    size: usize,
    used: usize,
    next: Option<NonNull<ReserveChunk>>,
}

impl ReserveChunk {
    unsafe fn find_containing(
        mut head: Option<NonNull<ReserveChunk>>,
        addr: usize,
        size: usize,
    ) -> Option<NonNull<ReserveChunk>> {
        if size == 0 {
            return None;
        }
        while let Some(r) = head {
            let rr = r.as_ref();
            if addr >= rr.base && addr + size <= rr.base + rr.used {
                return Some(r);
            }
            head = rr.next;
        }
        None
    }
}

/// The single sanctioned reentrant path out of this module: when a reserve
/// runs low, `Emalloc` asks its host for a fresh chunk of backing memory.
/// The enclave memory manager's own allocation entry point is the intended
/// implementor (out of scope here); kept as a trait so this module carries
/// no dependency on the EMA map.
pub trait ReserveSource {
    /// Returns the base address of a committed, writable region of exactly
    /// `size` bytes suitable for use as a new reserve.
    fn alloc_reserve(&self, size: usize) -> EmmResult<usize>;
}

/// Segregated-fit allocator: `EXACT_MATCH_INCREMENT`-granular exact-size
/// free lists up to `MAX_EXACT_SIZE`, one best-fit list for anything larger,
/// and a reserve chunk list blocks are bump-allocated from when no free
/// block satisfies a request.
pub struct Emalloc {
    exact_blocks: [Option<NonNull<u8>>; NUM_EXACT_LIST],
    large_blocks: Option<NonNull<u8>>,
    reserves: Option<NonNull<ReserveChunk>>,
    reserve_size_increment: usize,
    adding_reserve: bool,
    meta_reserve: [u8; META_RESERVE_SIZE],
    meta_used: usize,
}

// SAFETY: every access to the free lists and the meta reserve happens
// through `&mut self`, under the `spin::Mutex` the global instance is kept
// in (see `RESERVE_ALLOCATOR` below); the raw pointers never escape a call.
unsafe impl Send for Emalloc {}

impl Emalloc {
    pub fn new() -> Self {
        Self {
            exact_blocks: [None; NUM_EXACT_LIST],
            large_blocks: None,
            reserves: None,
            reserve_size_increment: INITIAL_RESERVE_SIZE,
            adding_reserve: false,
            meta_reserve: [0; META_RESERVE_SIZE],
            meta_used: 0,
        }
    }

    fn list_idx(bsize: usize) -> usize {
        debug_assert_eq!(bsize % EXACT_MATCH_INCREMENT, 0);
        if bsize < MIN_BLOCK_SIZE {
            return 0;
        }
        let idx = (bsize - MIN_BLOCK_SIZE) / EXACT_MATCH_INCREMENT;
        debug_assert!(idx < NUM_EXACT_LIST);
        idx
    }

    unsafe fn put_free_block(&mut self, b: NonNull<u8>) {
        let bsize = block::size(b);
        if bsize <= MAX_EXACT_SIZE {
            let idx = Self::list_idx(bsize);
            block::prepend(b, &mut self.exact_blocks[idx]);
        } else {
            block::prepend(b, &mut self.large_blocks);
        }
    }

    unsafe fn remove_from_lists(&mut self, b: NonNull<u8>) {
        let bsize = block::size(b);
        if bsize > MAX_EXACT_SIZE {
            block::remove(b, &mut self.large_blocks);
        } else {
            let idx = Self::list_idx(bsize);
            block::remove(b, &mut self.exact_blocks[idx]);
        }
    }

    /// Right-neighbor-only coalescing: absorbs free blocks immediately
    /// following `b` (within the same reserve chunk) into `b`. Left-merge
    /// would need a footer or a scan from the chunk base and isn't
    /// implemented, matching the donor; most blocks here are EMA/bitmap
    /// metadata of similar size, so the benefit would be marginal.
    unsafe fn possibly_merge(&mut self, b: NonNull<u8>) {
        loop {
            let end = block::end(b);
            let Some(r) = ReserveChunk::find_containing(self.reserves, b.as_ptr() as usize, block::size(b)) else {
                return;
            };
            let rr = r.as_ref();
            if end == rr.base + rr.used {
                return;
            }
            let right = NonNull::new_unchecked(end as *mut u8);
            if ReserveChunk::find_containing(self.reserves, end, block::size(right)) != Some(r) {
                return;
            }
            if block::is_alloced(right) {
                return;
            }
            self.remove_from_lists(right);
            let merged = block::size(b) + block::size(right);
            block::mark_free(b, merged);
        }
    }

    unsafe fn get_exact_match(&mut self, bsize: usize) -> Option<NonNull<u8>> {
        let idx = Self::list_idx(bsize);
        let head = self.exact_blocks[idx].take()?;
        self.exact_blocks[idx] = block::next(head);
        if let Some(h) = self.exact_blocks[idx] {
            if has_prev_slot(block::size(h)) {
                block::set_prev(h, None);
            }
        }
        Some(head)
    }

    unsafe fn split_free_block(&self, b: NonNull<u8>, want: usize) -> NonNull<u8> {
        let total = block::size(b);
        let remain = total - want;
        debug_assert!(remain >= MIN_BLOCK_SIZE);
        block::mark_free(b, want);
        let tail = NonNull::new_unchecked(b.as_ptr().add(want));
        block::mark_free(tail, remain);
        tail
    }

    unsafe fn get_free_block(&mut self, bsize: usize) -> Option<NonNull<u8>> {
        if bsize <= MAX_EXACT_SIZE {
            return self.get_exact_match(bsize);
        }
        let mut best: Option<NonNull<u8>> = None;
        let mut cur = self.large_blocks;
        while let Some(b) = cur {
            if block::size(b) >= bsize
                && best.map_or(true, |cur_best| block::size(cur_best) > block::size(b))
            {
                best = Some(b);
            }
            cur = block::next(b);
        }
        let best = best?;
        block::remove(best, &mut self.large_blocks);
        if block::size(best) >= bsize + MIN_BLOCK_SIZE {
            let tail = self.split_free_block(best, bsize);
            self.put_free_block(tail);
        }
        Some(best)
    }

    unsafe fn alloc_from_reserve(&mut self, bsize: usize) -> Option<NonNull<u8>> {
        let mut cur = self.reserves;
        while let Some(mut r) = cur {
            let rr = r.as_mut();
            if rr.size - rr.used >= bsize {
                let addr = rr.base + rr.used;
                rr.used += bsize;
                return NonNull::new(addr as *mut u8);
            }
            cur = rr.next;
        }
        None
    }

    unsafe fn alloc_from_meta(&mut self, bsize: usize) -> Option<NonNull<u8>> {
        debug_assert!(self.adding_reserve);
        if self.meta_used + bsize > META_RESERVE_SIZE {
            return None;
        }
        let b = NonNull::new_unchecked(self.meta_reserve.as_mut_ptr().add(self.meta_used));
        self.meta_used += bsize;
        block::mark_alloced(b, bsize);
        Some(block::payload(b))
    }

    fn new_reserve(&mut self, base: usize, size: usize) {
        let header_size = core::mem::size_of::<ReserveChunk>();
        unsafe {
            let node = base as *mut ReserveChunk;
            node.write(ReserveChunk {
                base: base + header_size,
                used: 0,
                size: size - header_size,
                next: self.reserves,
            });
            self.reserves = NonNull::new(node);
        }
    }

    /// Marks a reserve grow as abandoned after `source` failed to supply
    /// memory, so a later call can attempt a fresh grow instead of being
    /// stuck thinking one is permanently in flight.
    fn abandon_grow(&mut self) {
        self.adding_reserve = false;
    }

    /// Registers freshly obtained memory as a new reserve and clears the
    /// bootstrap guard. Doubles the next growth size, capped, matching the
    /// donor's geometric reserve growth.
    fn install_reserve(&mut self, base: usize, size: usize) {
        self.new_reserve(base, size);
        self.adding_reserve = false;
        self.reserve_size_increment = (self.reserve_size_increment * 2).min(MAX_RESERVE_SIZE);
    }

    fn request_size(size: usize) -> usize {
        round_to(size + HEADER_SIZE, EXACT_MATCH_INCREMENT).max(MIN_BLOCK_SIZE)
    }

    /// Attempts to satisfy `size` out of blocks already on hand. Returns the
    /// byte count the caller should obtain from [`ReserveSource`] and retry
    /// with when nothing is available, or `None` when the meta reserve
    /// itself is exhausted mid-bootstrap (nowhere left to turn).
    ///
    /// Deliberately does not call into `ReserveSource` itself: the single
    /// global lock model this crate assumes (spec's `mm_lock`, out of scope
    /// here) means the lock protecting this allocator must be released
    /// before any reentrant call that could recurse back into it — see
    /// `ResAlloc::allocate`, the only real caller.
    pub fn try_alloc(&mut self, size: usize) -> Result<NonNull<u8>, Option<usize>> {
        let bsize = Self::request_size(size);

        if self.adding_reserve {
            let b = unsafe { self.alloc_from_meta(bsize) };
            return b.ok_or(None);
        }

        unsafe {
            if let Some(b) = self.get_free_block(bsize) {
                block::mark_alloced(b, bsize);
                return Ok(block::payload(b));
            }
            if let Some(b) = self.alloc_from_reserve(bsize) {
                block::mark_alloced(b, bsize);
                return Ok(block::payload(b));
            }
        }

        let grow = round_to(bsize + core::mem::size_of::<ReserveChunk>(), INITIAL_RESERVE_SIZE);
        if self.reserve_size_increment < grow {
            self.reserve_size_increment = grow;
        }
        self.adding_reserve = true;
        Err(Some(self.reserve_size_increment))
    }

    /// `true` unless `payload` falls inside the static meta reserve outside
    /// of an in-flight `add_reserve` bootstrap — the one case where the
    /// underlying block isn't safe to hand back to the reserve-based
    /// realloc-in-place path `EmaMap::realloc_from_reserve_range` uses.
    pub fn can_erealloc(&self, payload: NonNull<u8>) -> bool {
        if self.adding_reserve {
            return true;
        }
        let b = unsafe { block::from_payload(payload) };
        let bstart = b.as_ptr() as usize;
        let bsize = unsafe { block::size(b) };
        let meta_start = self.meta_reserve.as_ptr() as usize;
        let meta_end = meta_start + META_RESERVE_SIZE;
        !(bstart < meta_end && bstart + bsize > meta_start)
    }

    /// Frees `payload`. Internal-only interface; any inconsistency (a
    /// pointer outside every known reserve, a meta-reserve free outside
    /// bootstrapping) is an invariant violation worth aborting over rather
    /// than propagating, matching the donor's "intentionally crash for any
    /// error" contract.
    pub fn efree(&mut self, payload: NonNull<u8>) {
        unsafe {
            let b = block::from_payload(payload);
            let bstart = b.as_ptr() as usize;
            let bsize = block::size(b);
            let meta_start = self.meta_reserve.as_ptr() as usize;
            let meta_end = meta_start + META_RESERVE_SIZE;

            if bstart < meta_end && bstart + bsize > meta_start {
                if self.adding_reserve {
                    // Freeing meta-reserve memory mid-bootstrap is rare and
                    // the meta reserve is never reclaimed; nothing to do.
                    return;
                }
                crate::error::abort_with("efree: freed a meta-reserve block outside bootstrap");
            }

            let Some(r) = ReserveChunk::find_containing(self.reserves, bstart, bsize) else {
                crate::error::abort_with("efree: freed block not found in any reserve");
            };

            block::mark_free(b, bsize);
            block::set_next(b, None);
            if has_prev_slot(bsize) {
                block::set_prev(b, None);
            }
            self.possibly_merge(b);

            let end = block::end(b);
            let rr = r.as_ptr();
            if end == (*rr).base + (*rr).used {
                (*rr).used -= block::size(b);
                self.merge_large_tail_into_reserve(r);
                return;
            }
            self.put_free_block(b);
        }
    }

    /// After a right-edge free shrinks a reserve's `used` high-water mark,
    /// any large free block now sitting at the new edge is itself folded
    /// back into unused reserve space rather than left on the large list.
    unsafe fn merge_large_tail_into_reserve(&mut self, r: NonNull<ReserveChunk>) {
        let rr = r.as_ptr();
        loop {
            let used_end = (*rr).base + (*rr).used;
            let mut cur = self.large_blocks;
            let mut found = None;
            while let Some(b) = cur {
                if b.as_ptr() as usize + block::size(b) == used_end {
                    found = Some(b);
                    break;
                }
                cur = block::next(b);
            }
            let Some(b) = found else { return };
            block::remove(b, &mut self.large_blocks);
            (*rr).used -= block::size(b);
        }
    }

    /// Combines [`Emalloc::try_alloc`] with inline growth, for standalone
    /// use where no shared lock needs to be dropped across the reentrant
    /// call into `source` (tests; any embedding that owns its `Emalloc`
    /// outright rather than through the global `ResAlloc` singleton below).
    pub fn emalloc(&mut self, size: usize, source: &dyn ReserveSource) -> EmmResult<NonNull<u8>> {
        loop {
            match self.try_alloc(size) {
                Ok(p) => return Ok(p),
                Err(None) => return Err(Status::OutOfMemory),
                Err(Some(grow_size)) => match source.alloc_reserve(grow_size) {
                    Ok(base) => self.install_reserve(base, grow_size),
                    Err(e) => {
                        self.abandon_grow();
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Seeds the pool with an initial reserve of at least `rsize` bytes.
    /// A no-op if a grow is already in flight.
    pub fn add_reserve(&mut self, rsize: usize, source: &dyn ReserveSource) -> EmmResult<()> {
        if self.adding_reserve {
            return Ok(());
        }
        if self.reserve_size_increment < rsize {
            self.reserve_size_increment = rsize;
        }
        self.adding_reserve = true;
        let requested = self.reserve_size_increment;
        match source.alloc_reserve(requested) {
            Ok(base) => {
                self.install_reserve(base, requested);
                Ok(())
            }
            Err(e) => {
                self.abandon_grow();
                Err(e)
            }
        }
    }
}

impl Default for Emalloc {
    fn default() -> Self {
        Self::new()
    }
}

static RESERVE_ALLOCATOR: Once<Mutex<Emalloc>> = Once::new();
static RESERVE_SOURCE: Once<&'static dyn ReserveSource> = Once::new();

/// Initializes the process-wide reserve allocator with `init_size` bytes
/// drawn from `source` up front, and records `source` as the callback later
/// reentrant grows use. Must run once before any `ResAlloc` use.
///
/// Builds the `Emalloc` directly inside the `Once`'s storage rather than
/// constructing it locally and moving it in: the allocator's free-list and
/// meta-reserve pointers are only valid for as long as its address is
/// stable, so it must never move after its first allocation.
pub fn init_reserve(init_size: usize, source: &'static dyn ReserveSource) -> EmmResult<()> {
    RESERVE_SOURCE.call_once(|| source);
    RESERVE_ALLOCATOR.call_once(|| Mutex::new(Emalloc::new()));
    grow(RESERVE_ALLOCATOR.get().unwrap(), init_size.max(INITIAL_RESERVE_SIZE), source)
}

fn reserve_source() -> &'static dyn ReserveSource {
    *RESERVE_SOURCE.get().expect("reserve allocator used before init_reserve")
}

/// Grows `cell`'s allocator by asking `source` for fresh memory, taking the
/// lock only for the short bookkeeping steps before and after the call into
/// `source` — never across it. `source`'s own allocation may itself recurse
/// into `ResAlloc::allocate` (it needs memory for its own EMA bookkeeping);
/// since that reentrant call also goes through `cell.lock()`, holding the
/// lock here across the `source` call would deadlock. The `adding_reserve`
/// flag (set before the lock is released, cleared after) is what makes that
/// reentrant call safe: it gets served from the meta reserve instead of
/// requesting a second concurrent grow.
fn grow(cell: &Mutex<Emalloc>, rsize: usize, source: &dyn ReserveSource) -> EmmResult<()> {
    let requested = {
        let mut guard = cell.lock();
        if guard.adding_reserve {
            return Ok(());
        }
        if guard.reserve_size_increment < rsize {
            guard.reserve_size_increment = rsize;
        }
        guard.adding_reserve = true;
        guard.reserve_size_increment
    };
    match source.alloc_reserve(requested) {
        Ok(base) => {
            cell.lock().install_reserve(base, requested);
            Ok(())
        }
        Err(e) => {
            cell.lock().abandon_grow();
            Err(e)
        }
    }
}

/// Allocates out of the process-wide emalloc reserve pool. The `Allocator`
/// impl backing `Ema<ResAlloc>` and its `BitArray<ResAlloc>` eaccept maps.
#[derive(Clone, Copy, Default)]
pub struct ResAlloc;

unsafe impl Allocator for ResAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let size = layout.size();
        let cell = RESERVE_ALLOCATOR.get().ok_or(AllocError)?;
        loop {
            let need = {
                let mut guard = cell.lock();
                match guard.try_alloc(size) {
                    Ok(p) => return Ok(NonNull::slice_from_raw_parts(p, size)),
                    Err(None) => return Err(AllocError),
                    Err(Some(grow_size)) => grow_size,
                }
            };
            grow(cell, need, reserve_source()).map_err(|_| AllocError)?;
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        if let Some(a) = RESERVE_ALLOCATOR.get() {
            a.lock().efree(ptr);
        }
    }
}

const STATIC_MEM_SIZE: usize = 0x1_0000;

static STATIC_HEAP: LockedHeap<32> = LockedHeap::empty();
static mut STATIC_MEM: [u8; STATIC_MEM_SIZE] = [0; STATIC_MEM_SIZE];
static STATIC_HEAP_INIT: Once<()> = Once::new();

/// Must run before any `StaticAlloc` use, from single-threaded enclave init.
/// Idempotent: a repeat call (harmless in tests, which may build multiple
/// fixtures sharing the process-wide static heap) is a no-op rather than
/// handing the same backing memory to `buddy_system_allocator` twice.
pub fn init_static() {
    STATIC_HEAP_INIT.call_once(|| unsafe {
        STATIC_HEAP
            .lock()
            .init(STATIC_MEM.as_mut_ptr() as usize, STATIC_MEM_SIZE);
    });
}

/// Allocates out of a small static heap carved out of enclave image memory,
/// for the handful of objects that must exist before the reserve pool is up
/// (the `ReserveSource` implementor itself, which cannot be served by the
/// allocator it is bootstrapping). Backed by `buddy_system_allocator`, the
/// donor's own choice for this role.
#[derive(Clone, Copy, Default)]
pub struct StaticAlloc;

unsafe impl Allocator for StaticAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        STATIC_HEAP
            .lock()
            .alloc(layout)
            .map(|p| NonNull::slice_from_raw_parts(p, layout.size()))
            .map_err(|_| AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        STATIC_HEAP.lock().dealloc(ptr, layout);
    }
}

/// Installs `source` as the reentrant-growth callback for [`init_reserve`].
/// Split from `init_reserve` itself so a `ReserveSource` whose construction
/// needs the static heap (`StaticAlloc`) can be built after `init_static`
/// but before the reserve pool takes its first real allocation.
pub fn init_reserve_source(source: &'static dyn ReserveSource) {
    RESERVE_SOURCE.call_once(|| source);
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc_crate::vec;
    use core::cell::Cell;

    struct HostMemory {
        buf: *mut u8,
        len: usize,
        taken: Cell<usize>,
    }

    // SAFETY: tests are single-threaded.
    unsafe impl Sync for HostMemory {}

    impl ReserveSource for HostMemory {
        fn alloc_reserve(&self, size: usize) -> EmmResult<usize> {
            let taken = self.taken.get();
            if taken + size > self.len {
                return Err(Status::OutOfMemory);
            }
            self.taken.set(taken + size);
            Ok(self.buf as usize + taken)
        }
    }

    fn host(buf: &mut [u8]) -> HostMemory {
        HostMemory {
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            taken: Cell::new(0),
        }
    }

    #[test]
    fn alloc_free_roundtrip() {
        let mut backing = vec![0u8; 4 * 1024 * 1024];
        let source = host(&mut backing);
        let mut e = Emalloc::new();
        e.add_reserve(INITIAL_RESERVE_SIZE, &source).unwrap();

        let a = e.emalloc(64, &source).unwrap();
        let b = e.emalloc(128, &source).unwrap();
        assert_ne!(a, b);
        e.efree(a);
        e.efree(b);

        let c = e.emalloc(64, &source).unwrap();
        assert!(e.can_erealloc(c));
        e.efree(c);
    }

    #[test]
    fn grows_reserve_when_exhausted() {
        let mut backing = vec![0u8; 8 * 1024 * 1024];
        let source = host(&mut backing);
        let mut e = Emalloc::new();
        e.add_reserve(INITIAL_RESERVE_SIZE, &source).unwrap();

        let mut ptrs = std::vec::Vec::new();
        for _ in 0..2000 {
            ptrs.push(e.emalloc(256, &source).unwrap());
        }
        for p in ptrs {
            e.efree(p);
        }
    }

    #[test]
    fn right_neighbor_coalesces() {
        let mut backing = vec![0u8; 1024 * 1024];
        let source = host(&mut backing);
        let mut e = Emalloc::new();
        e.add_reserve(INITIAL_RESERVE_SIZE, &source).unwrap();

        let a = e.emalloc(64, &source).unwrap();
        let b = e.emalloc(64, &source).unwrap();
        let c = e.emalloc(64, &source).unwrap();
        e.efree(b);
        e.efree(c);
        // freeing c then merging right neighbor b..c back toward the
        // reserve's used edge should not disturb a's contents.
        e.efree(a);
    }

    #[test]
    fn meta_reserve_allocations_occur_only_while_adding_reserve() {
        let mut backing = vec![0u8; 1024 * 1024];
        let source = host(&mut backing);
        let mut e = Emalloc::new();
        // Before any reserve exists, the very first emalloc call must grow
        // one (entering `adding_reserve`) rather than falling through to the
        // meta reserve directly.
        assert!(!e.adding_reserve);
        let p = e.emalloc(32, &source).unwrap();
        assert!(!e.adding_reserve);
        assert!(e.can_erealloc(p));
        e.efree(p);
    }

    use proptest::prelude::*;

    proptest! {
        /// Spec §8 "Emalloc correctness": any successful `emalloc(s)` returns
        /// a pointer whose block header records a size of at least
        /// `round_up(s + 8, 8)` and `>= 16`; freeing and re-requesting the
        /// same size always succeeds.
        #[test]
        fn emalloc_block_size_is_at_least_requested_rounded(size in 1usize..4096) {
            let mut backing = vec![0u8; 16 * 1024 * 1024];
            let source = host(&mut backing);
            let mut e = Emalloc::new();
            e.add_reserve(INITIAL_RESERVE_SIZE, &source).unwrap();

            let p = e.emalloc(size, &source).unwrap();
            let expected_min = round_to(size + HEADER_SIZE, EXACT_MATCH_INCREMENT).max(MIN_BLOCK_SIZE);
            let b = unsafe { block::from_payload(p) };
            let actual = unsafe { block::size(b) };
            prop_assert!(actual >= expected_min);
            prop_assert!(actual >= MIN_BLOCK_SIZE);
            prop_assert_eq!(actual % EXACT_MATCH_INCREMENT, 0);

            e.efree(p);
            let q = e.emalloc(size, &source).unwrap();
            prop_assert!(e.can_erealloc(q));
            e.efree(q);
        }

        /// Repeated alloc/free of varying sizes never corrupts the free
        /// lists or reserve bookkeeping enough to make a later request fail
        /// outright (modulo genuine backing exhaustion, avoided here by
        /// sizing the host memory generously relative to the request sizes).
        #[test]
        fn alloc_free_interleaving_stays_consistent(sizes in prop::collection::vec(1usize..512, 1..64)) {
            let mut backing = vec![0u8; 16 * 1024 * 1024];
            let source = host(&mut backing);
            let mut e = Emalloc::new();
            e.add_reserve(INITIAL_RESERVE_SIZE, &source).unwrap();

            let mut live = std::vec::Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                let p = e.emalloc(*size, &source).unwrap();
                live.push(p);
                if i % 3 == 2 {
                    if let Some(freed) = live.pop() {
                        e.efree(freed);
                    }
                }
            }
            for p in live {
                e.efree(p);
            }
        }
    }
}
