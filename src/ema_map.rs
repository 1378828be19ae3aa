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

//! The ordered collection of [`Ema`] nodes and the map-level operations that
//! search, place and splice them. Grounded on the donor's `emm::vmmgr::VmMgr`
//! for the two-region (`User`/`Rts`) split and on
//! `examples/original_source/ema.c` for the exact search/placement/splitting
//! algorithms, in particular `ema_new`'s stack-placeholder technique and
//! `ema_realloc_from_reserve_range`.
//!
//! Unlike the donor, which threads an intrusive list through
//! `intrusive_collections::LinkedList`, each [`EmaRoot`] here is a plain
//! doubly linked list of heap nodes addressed by raw pointer: no crate
//! dependency turned out to be load-bearing once the node itself already
//! carries its own `prev`/`next` links (see DESIGN.md).

use core::alloc::{Allocator, Layout};
use core::ptr::NonNull;

use crate::arch::SE_PAGE_SIZE;
use crate::ema::{Ema, HandlerFn};
use crate::error::{EmmResult, Status};
use crate::page::{AllocFlags, PageInfo, PageType, ProtFlags};
use crate::platform::Platform;
use crate::{round_to, trim_to};

/// The bounds of the "User" region; everything else inside the enclave that
/// the manager is asked to track falls into "Rts" (runtime-system) space.
/// A value, not a set of static ELF-layout accessors like the donor's
/// `MmLayout` — see SPEC_FULL.md §10.4 / DESIGN.md.
#[derive(Clone, Copy, Debug)]
pub struct AddressSpace {
    pub user_base: usize,
    pub user_end: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    User,
    Rts,
}

/// A plain doubly linked list of `Ema<A>` nodes, kept in ascending address
/// order. One instance covers either the `User` or the `Rts` region; see
/// [`EmaMap`] for the pair plus the region-aware operations that dispatch
/// between them.
pub struct EmaRoot<A: Allocator + Clone> {
    head: Option<NonNull<Ema<A>>>,
    tail: Option<NonNull<Ema<A>>>,
}

impl<A: Allocator + Clone> EmaRoot<A> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn front(&self) -> Option<NonNull<Ema<A>>> {
        self.head
    }

    pub fn back(&self) -> Option<NonNull<Ema<A>>> {
        self.tail
    }

    pub fn search(&self, addr: usize) -> Option<NonNull<Ema<A>>> {
        let mut cur = self.head;
        while let Some(node) = cur {
            let r = unsafe { node.as_ref() };
            if r.overlaps_addr(addr) {
                return Some(node);
            }
            if r.is_higher_than(addr) {
                return None;
            }
            cur = r.next;
        }
        None
    }

    /// The first node overlapping `start` and the last node overlapping
    /// `end - 1`, erroring if `[start, end)` isn't fully, contiguously
    /// covered by existing nodes (a gap, or the range running past the last
    /// node's end).
    fn covering_range(&self, start: usize, end: usize) -> EmmResult<(NonNull<Ema<A>>, NonNull<Ema<A>>)> {
        if start >= end {
            return Err(Status::InvalidParameter);
        }
        let first = self.search(start).ok_or(Status::InvalidParameter)?;
        let mut cur = first;
        loop {
            let r = unsafe { cur.as_ref() };
            if r.end() >= end {
                return Ok((first, cur));
            }
            match r.next {
                Some(next) => {
                    let next_start = unsafe { next.as_ref().start() };
                    if next_start != r.end() {
                        return Err(Status::InvalidParameter);
                    }
                    cur = next;
                }
                None => return Err(Status::InvalidParameter),
            }
        }
    }

    /// `Some(before)` if `[addr, addr + size)` is free (`before` is the node
    /// to insert ahead of; `None` means "append at the tail"); `Err` if it
    /// overlaps an existing node or fails `Platform::is_within_enclave`.
    pub fn find_free_region_at<P: Platform>(
        &self,
        platform: &P,
        addr: usize,
        size: usize,
    ) -> EmmResult<Option<NonNull<Ema<A>>>> {
        let end = addr.checked_add(size).ok_or(Status::InvalidParameter)?;
        if !platform.is_within_enclave(addr, size) {
            return Err(Status::AccessDenied);
        }
        let mut cur = self.head;
        while let Some(node) = cur {
            let r = unsafe { node.as_ref() };
            if r.start() >= end {
                return Ok(Some(node));
            }
            if r.end() > addr {
                return Err(Status::AccessDenied);
            }
            cur = r.next;
        }
        Ok(None)
    }

    /// Smallest `align`-aligned gap of at least `size` bytes in `[base,
    /// end_bound)`, walking adjacent-node gaps in ascending order the way
    /// `find_free_region` in the C reference does; used for the `User`
    /// region, whose upper bound is fixed. Per spec §4.3 every candidate
    /// must also satisfy `Platform::is_within_enclave`, so a gap that fits
    /// the subspace bound but falls outside the enclave is skipped rather
    /// than accepted.
    fn find_free_region_bounded<P: Platform>(
        &self,
        platform: &P,
        base: usize,
        end_bound: usize,
        size: usize,
        align: usize,
    ) -> EmmResult<(usize, Option<NonNull<Ema<A>>>)> {
        let fits = |candidate: usize, limit: usize| {
            candidate.checked_add(size).map_or(false, |e| e <= limit) && platform.is_within_enclave(candidate, size)
        };

        let Some(mut node) = self.head else {
            let candidate = round_to!(base, align);
            return if fits(candidate, end_bound) {
                Ok((candidate, None))
            } else {
                Err(Status::OutOfMemory)
            };
        };

        let first_start = unsafe { node.as_ref().start() };
        let candidate = round_to!(base, align);
        if candidate < first_start && fits(candidate, first_start) {
            return Ok((candidate, Some(node)));
        }

        loop {
            let r = unsafe { node.as_ref() };
            let candidate = r.aligned_end(align);
            match r.next {
                Some(next) => {
                    let next_start = unsafe { next.as_ref().start() };
                    if fits(candidate, next_start) {
                        return Ok((candidate, Some(next)));
                    }
                    node = next;
                }
                None => {
                    return if fits(candidate, end_bound) {
                        Ok((candidate, None))
                    } else {
                        Err(Status::OutOfMemory)
                    };
                }
            }
        }
    }

    /// Same walk, but with no upper bound on the last gap considered (used
    /// for `Rts` placement above `user_end`, which isn't itself bounded by
    /// anything this map tracks) — the enclave-membership check is the only
    /// constraint left on that final gap.
    fn find_free_region_unbounded<P: Platform>(
        &self,
        platform: &P,
        size: usize,
        align: usize,
    ) -> Option<(usize, Option<NonNull<Ema<A>>>)> {
        let mut node = self.head?;
        loop {
            let r = unsafe { node.as_ref() };
            let candidate = r.aligned_end(align);
            match r.next {
                Some(next) => {
                    let next_start = unsafe { next.as_ref().start() };
                    if candidate.checked_add(size).map_or(false, |e| e <= next_start)
                        && platform.is_within_enclave(candidate, size)
                    {
                        return Some((candidate, Some(next)));
                    }
                    node = next;
                }
                None => {
                    return if platform.is_within_enclave(candidate, size) {
                        Some((candidate, None))
                    } else {
                        None
                    };
                }
            }
        }
    }

    unsafe fn splice_before(&mut self, node: NonNull<Ema<A>>, before: Option<NonNull<Ema<A>>>) {
        match before {
            Some(b) => {
                let prev = b.as_ref().prev;
                node.as_ptr().as_mut().unwrap().prev = prev;
                node.as_ptr().as_mut().unwrap().next = Some(b);
                b.as_ptr().as_mut().unwrap().prev = Some(node);
                match prev {
                    Some(p) => p.as_ptr().as_mut().unwrap().next = Some(node),
                    None => self.head = Some(node),
                }
            }
            None => {
                node.as_ptr().as_mut().unwrap().prev = self.tail;
                node.as_ptr().as_mut().unwrap().next = None;
                match self.tail {
                    Some(t) => t.as_ptr().as_mut().unwrap().next = Some(node),
                    None => self.head = Some(node),
                }
                self.tail = Some(node);
            }
        }
    }

    unsafe fn unlink(&mut self, node: NonNull<Ema<A>>) {
        let prev = node.as_ref().prev;
        let next = node.as_ref().next;
        match prev {
            Some(p) => p.as_ptr().as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => n.as_ptr().as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    /// Swaps `old` for `new` at whatever position `old` currently occupies,
    /// repointing both neighbors. Used only by [`Self::new_ema`] to retire
    /// its stack placeholder.
    unsafe fn replace(&mut self, old: NonNull<Ema<A>>, new: NonNull<Ema<A>>) {
        let prev = old.as_ref().prev;
        let next = old.as_ref().next;
        new.as_ptr().as_mut().unwrap().prev = prev;
        new.as_ptr().as_mut().unwrap().next = next;
        match prev {
            Some(p) => p.as_ptr().as_mut().unwrap().next = Some(new),
            None => self.head = Some(new),
        }
        match next {
            Some(n) => n.as_ptr().as_mut().unwrap().prev = Some(new),
            None => self.tail = Some(new),
        }
    }

    fn box_node(alloc: &A, value: Ema<A>) -> EmmResult<NonNull<Ema<A>>> {
        let mem = alloc
            .allocate(Layout::new::<Ema<A>>())
            .map_err(|_| Status::OutOfMemory)?;
        let ptr = mem.cast::<Ema<A>>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    fn destroy_node(node: NonNull<Ema<A>>) {
        let alloc = unsafe { node.as_ref().allocator() };
        unsafe {
            core::ptr::drop_in_place(node.as_ptr());
            alloc.deallocate(node.cast::<u8>(), Layout::new::<Ema<A>>());
        }
    }

    /// Creates a new node covering `[start, start + length)` and splices it
    /// in ahead of `before` (`None` appends at the tail).
    ///
    /// Uses the stack-placeholder technique from the C reference's
    /// `ema_new`: the fully built node is spliced into the list at its
    /// stack address *before* the heap allocation for its permanent home
    /// runs, so that if `alloc` reentrantly grows its backing reserve (by
    /// asking this same map for more address space) it sees `[start,
    /// start + length)` already claimed and can't place a new reserve chunk
    /// on top of it. The placeholder is then swapped for the real heap
    /// node, or unlinked on allocation failure.
    pub fn new_ema(
        &mut self,
        start: usize,
        length: usize,
        alloc_flags: AllocFlags,
        info: PageInfo,
        handler: Option<HandlerFn>,
        priv_data: Option<NonNull<u8>>,
        alloc: A,
        before: Option<NonNull<Ema<A>>>,
    ) -> EmmResult<NonNull<Ema<A>>> {
        let mut placeholder = Ema::new(start, length, alloc_flags, info, handler, priv_data, alloc.clone())?;
        let placeholder_ptr = NonNull::from(&mut placeholder);
        unsafe { self.splice_before(placeholder_ptr, before) };

        match Self::box_node_uninit(&alloc) {
            Ok(ptr) => {
                unsafe {
                    core::ptr::write(ptr.as_ptr(), core::ptr::read(&placeholder));
                    self.replace(placeholder_ptr, ptr);
                }
                core::mem::forget(placeholder);
                Ok(ptr)
            }
            Err(e) => {
                unsafe { self.unlink(placeholder_ptr) };
                Err(e)
            }
        }
    }

    fn box_node_uninit(alloc: &A) -> EmmResult<NonNull<Ema<A>>> {
        let mem = alloc
            .allocate(Layout::new::<Ema<A>>())
            .map_err(|_| Status::OutOfMemory)?;
        Ok(mem.cast::<Ema<A>>())
    }

    /// Splits `node` at `addr`, which must fall strictly inside it. The
    /// original node keeps its identity and shrinks to `[node.start(),
    /// addr)`; a freshly allocated node covering `[addr, node.end())` is
    /// inserted right after it and returned. (The donor's `ema_split`
    /// instead lets the caller pick which half keeps the identity via a
    /// `new_lower` flag; every caller in this crate re-fetches its node
    /// pointers after a split rather than holding one across it, so that
    /// extra degree of freedom isn't needed here — see DESIGN.md.)
    pub fn split(&mut self, node: NonNull<Ema<A>>, addr: usize) -> EmmResult<NonNull<Ema<A>>> {
        let (node_start, node_end) = unsafe { (node.as_ref().start(), node.as_ref().end()) };
        if addr <= node_start || addr >= node_end {
            return Err(Status::InvalidParameter);
        }

        let (alloc_flags, info, handler, priv_data, alloc) = unsafe {
            let r = node.as_ref();
            (r.alloc_flags(), r.info(), r.handler(), r.priv_data(), r.allocator())
        };

        let pos = (addr - node_start) >> crate::arch::SE_PAGE_SHIFT;
        let (lo_map, hi_map) = match unsafe { (*node.as_ptr()).take_eaccept_map() } {
            Some(map) => map.split(pos)?,
            None => (None, None),
        };

        let new_node = Ema::from_parts(
            addr,
            node_end - addr,
            alloc_flags,
            info,
            hi_map,
            handler,
            priv_data,
            alloc.clone(),
        );
        let new_ptr = match Self::box_node(&alloc, new_node) {
            Ok(p) => p,
            Err(e) => {
                // restore the bitmap we just took out before giving up
                unsafe { (*node.as_ptr()).set_eaccept_map(lo_map) };
                return Err(e);
            }
        };

        unsafe {
            (*node.as_ptr()).set_start_length(node_start, addr - node_start);
            (*node.as_ptr()).set_eaccept_map(lo_map);
            let old_next = node.as_ref().next;
            new_ptr.as_ptr().as_mut().unwrap().prev = Some(node);
            new_ptr.as_ptr().as_mut().unwrap().next = old_next;
            node.as_ptr().as_mut().unwrap().next = Some(new_ptr);
            match old_next {
                Some(n) => n.as_ptr().as_mut().unwrap().prev = Some(new_ptr),
                None => self.tail = Some(new_ptr),
            }
        }

        Ok(new_ptr)
    }

    /// Isolates `[start, end)` inside `node` (which must already cover it)
    /// as its own node, splitting off whatever comes before `start` and
    /// after `end`. Returns `node` unchanged if it already matches exactly.
    pub fn split_ex(&mut self, node: NonNull<Ema<A>>, start: usize, end: usize) -> EmmResult<NonNull<Ema<A>>> {
        let (node_start, node_end) = unsafe { (node.as_ref().start(), node.as_ref().end()) };
        if start < node_start || end > node_end || start >= end {
            return Err(Status::InvalidParameter);
        }

        let mut middle = node;
        if start > node_start {
            middle = self.split(middle, start)?;
        }
        let middle_end = unsafe { middle.as_ref().end() };
        if end < middle_end {
            self.split(middle, end)?;
        }
        Ok(middle)
    }

    fn walk_range_ref<F>(&self, first: NonNull<Ema<A>>, last: NonNull<Ema<A>>, start: usize, end: usize, mut f: F) -> EmmResult<()>
    where
        F: FnMut(&Ema<A>, usize, usize) -> EmmResult<()>,
    {
        let mut cur = first;
        loop {
            let r = unsafe { cur.as_ref() };
            let seg_start = start.max(r.start());
            let seg_end = end.min(r.end());
            f(r, seg_start, seg_end)?;
            if cur == last {
                return Ok(());
            }
            cur = r.next.ok_or(Status::InvalidParameter)?;
        }
    }

    fn walk_range_mut<F>(&mut self, first: NonNull<Ema<A>>, last: NonNull<Ema<A>>, start: usize, end: usize, mut f: F) -> EmmResult<()>
    where
        F: FnMut(&mut Ema<A>, usize, usize) -> EmmResult<()>,
    {
        let mut cur = first;
        loop {
            let (next, seg_start, seg_end) = unsafe {
                let r = cur.as_ref();
                (r.next, start.max(r.start()), end.min(r.end()))
            };
            unsafe { f(&mut *cur.as_ptr(), seg_start, seg_end)? };
            if cur == last {
                return Ok(());
            }
            cur = next.ok_or(Status::InvalidParameter)?;
        }
    }

    fn dealloc_one<P: Platform>(
        &mut self,
        platform: &P,
        node: NonNull<Ema<A>>,
        start: usize,
        end: usize,
    ) -> EmmResult<()> {
        let (node_start, node_end, is_reserve) = unsafe {
            let r = node.as_ref();
            (r.start(), r.end(), r.is_reserve())
        };
        let seg_start = start.max(node_start);
        let seg_end = end.min(node_end);

        if !is_reserve {
            unsafe {
                let r = &mut *node.as_ptr();
                if r.info().prot.prot_bits() == ProtFlags::NONE {
                    r.modify_permissions(platform, ProtFlags::R)?;
                }
                r.uncommit(platform, seg_start, seg_end)?;
            }
        }

        let isolated = self.split_ex(node, seg_start, seg_end)?;
        unsafe { self.unlink(isolated) };
        Self::destroy_node(isolated);
        Ok(())
    }

    /// Reclaims one or more adjoining `RESERVE` placeholders covering
    /// exactly `[start, end)` and replaces them with a single freshly typed
    /// node, tracking `last` across the node-destroying splits at each end
    /// the way `ema_realloc_from_reserve_range` does (the boundary split can
    /// replace the very node the walk is about to continue from).
    pub fn realloc_from_reserve_range(
        &mut self,
        start: usize,
        end: usize,
        alloc_flags: AllocFlags,
        info: PageInfo,
        handler: Option<HandlerFn>,
        priv_data: Option<NonNull<u8>>,
        alloc: A,
    ) -> EmmResult<NonNull<Ema<A>>> {
        let (first, last) = self.covering_range(start, end)?;

        {
            let mut cur = first;
            loop {
                let r = unsafe { cur.as_ref() };
                if !r.is_reserve() {
                    return Err(Status::AccessDenied);
                }
                if cur == last {
                    break;
                }
                cur = r.next.ok_or(Status::InvalidParameter)?;
            }
        }

        // Isolate exactly `[start, end)` within the covered run. Splitting
        // the head off `first` (when `start` doesn't already land on its
        // boundary) produces a fresh node that becomes the new start of the
        // run; if `first == last` that's also the node the tail split below
        // must act on, so `run_last` is derived from `run_first` in that
        // case rather than from the now-stale original `last`.
        let first_start = unsafe { first.as_ref().start() };
        let run_first = if start > first_start {
            self.split(first, start)?
        } else {
            first
        };
        let run_last = if first == last { run_first } else { last };

        let run_last_end = unsafe { run_last.as_ref().end() };
        if end < run_last_end {
            // Shrinks `run_last` in place to `[.., end)`; its identity (and
            // hence `run_last` as a pointer) is unchanged.
            self.split(run_last, end)?;
        }

        let before = unsafe { run_last.as_ref().next };
        let mut cur = run_first;
        loop {
            let next = unsafe { cur.as_ref().next };
            unsafe { self.unlink(cur) };
            Self::destroy_node(cur);
            if cur == run_last {
                break;
            }
            cur = next.ok_or(Status::InvalidParameter)?;
        }

        self.new_ema(start, end - start, alloc_flags, info, handler, priv_data, alloc, before)
    }
}

impl<A: Allocator + Clone> Default for EmaRoot<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator + Clone> Drop for EmaRoot<A> {
    fn drop(&mut self) {
        let mut cur = self.head;
        while let Some(node) = cur {
            let next = unsafe { node.as_ref().next };
            Self::destroy_node(node);
            cur = next;
        }
    }
}

/// The top-level manager: a `User` region bounded by [`AddressSpace`] and an
/// unbounded `Rts` region, mirroring the donor's `VmMgr`. Every public
/// operation classifies its address range into one of the two regions (or
/// rejects a range straddling both) and dispatches to the matching
/// [`EmaRoot`].
pub struct EmaMap<A: Allocator + Clone> {
    user: EmaRoot<A>,
    rts: EmaRoot<A>,
    addrspace: AddressSpace,
}

impl<A: Allocator + Clone> EmaMap<A> {
    pub const fn new(addrspace: AddressSpace) -> Self {
        Self {
            user: EmaRoot::new(),
            rts: EmaRoot::new(),
            addrspace,
        }
    }

    pub fn address_space(&self) -> AddressSpace {
        self.addrspace
    }

    pub fn classify(&self, addr: usize, len: usize) -> EmmResult<RangeKind> {
        let end = addr.checked_add(len).ok_or(Status::InvalidParameter)?;
        if addr >= self.addrspace.user_base && end <= self.addrspace.user_end {
            Ok(RangeKind::User)
        } else if end <= self.addrspace.user_base || addr >= self.addrspace.user_end {
            Ok(RangeKind::Rts)
        } else {
            Err(Status::InvalidParameter)
        }
    }

    fn root(&self, kind: RangeKind) -> &EmaRoot<A> {
        match kind {
            RangeKind::User => &self.user,
            RangeKind::Rts => &self.rts,
        }
    }

    fn root_mut(&mut self, kind: RangeKind) -> &mut EmaRoot<A> {
        match kind {
            RangeKind::User => &mut self.user,
            RangeKind::Rts => &mut self.rts,
        }
    }

    pub fn search(&self, kind: RangeKind, addr: usize) -> Option<NonNull<Ema<A>>> {
        self.root(kind).search(addr)
    }

    pub fn find_free_region_at<P: Platform>(
        &self,
        platform: &P,
        kind: RangeKind,
        addr: usize,
        size: usize,
    ) -> EmmResult<Option<NonNull<Ema<A>>>> {
        self.root(kind).find_free_region_at(platform, addr, size)
    }

    /// Placement search for `size` bytes with no fixed address. `User`
    /// placement is bounded by [`AddressSpace`]; `Rts` placement prefers the
    /// gap directly below `user_base` when the `Rts` region is still empty,
    /// falling back to the region above `user_end` — the donor's own
    /// placement bias, kept unchanged (see SPEC_FULL.md §9 Open Questions).
    /// Every candidate this returns has also passed `Platform::is_within_enclave`
    /// per spec §4.3.
    pub fn find_free_region<P: Platform>(
        &self,
        platform: &P,
        kind: RangeKind,
        size: usize,
        align: usize,
    ) -> EmmResult<(usize, Option<NonNull<Ema<A>>>)> {
        match kind {
            RangeKind::User => self.user.find_free_region_bounded(
                platform,
                self.addrspace.user_base,
                self.addrspace.user_end,
                size,
                align,
            ),
            RangeKind::Rts if self.rts.is_empty() => {
                let below = trim_to!(self.addrspace.user_base.saturating_sub(size), align);
                if below.checked_add(size).map_or(false, |e| e <= self.addrspace.user_base)
                    && platform.is_within_enclave(below, size)
                {
                    return Ok((below, self.rts.front()));
                }
                let above = round_to!(self.addrspace.user_end, align);
                if platform.is_within_enclave(above, size) {
                    Ok((above, None))
                } else {
                    Err(Status::OutOfMemory)
                }
            }
            RangeKind::Rts => self
                .rts
                .find_free_region_unbounded(platform, size, align)
                .ok_or(Status::OutOfMemory),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn alloc<P: Platform>(
        &mut self,
        platform: &P,
        kind: RangeKind,
        addr: Option<usize>,
        size: usize,
        align: usize,
        alloc_flags: AllocFlags,
        info: PageInfo,
        handler: Option<HandlerFn>,
        priv_data: Option<NonNull<u8>>,
        alloc: A,
    ) -> EmmResult<NonNull<Ema<A>>> {
        if size == 0 || size & (SE_PAGE_SIZE - 1) != 0 {
            return Err(Status::InvalidParameter);
        }

        let (start, before) = match addr {
            Some(a) => {
                if a & (SE_PAGE_SIZE - 1) != 0 {
                    return Err(Status::InvalidParameter);
                }
                let before = self.find_free_region_at(platform, kind, a, size)?;
                (a, before)
            }
            None => self.find_free_region(platform, kind, size, align)?,
        };

        if alloc_flags.is_reserve() {
            return self
                .root_mut(kind)
                .new_ema(start, size, alloc_flags, info, handler, priv_data, alloc, before);
        }

        platform.alloc_ocall(start, size, info)?;

        let root = self.root_mut(kind);
        let node = root.new_ema(start, size, alloc_flags, info, handler, priv_data, alloc, before)?;

        if alloc_flags.contains(AllocFlags::COMMIT_NOW) {
            let commit_err = unsafe { (*node.as_ptr()).commit(platform, start, start + size) };
            if let Err(e) = commit_err {
                unsafe { root.unlink(node) };
                EmaRoot::<A>::destroy_node(node);
                return Err(e);
            }
        }
        Ok(node)
    }

    /// Precheck per spec §4.3's `ema_can_commit`: every covered EMA must be
    /// non-`RESERVE`, `REG`-typed, and writable — a read-only or execute-only
    /// node can never have pages committed into it, matching
    /// `original_source/ema.c`'s `ema_can_commit`.
    pub fn commit_loop<P: Platform>(&mut self, platform: &P, start: usize, end: usize) -> EmmResult<()> {
        let kind = self.classify(start, end.saturating_sub(start))?;
        let root = self.root_mut(kind);
        let (first, last) = root.covering_range(start, end)?;
        root.walk_range_ref(first, last, start, end, |ema, _s, _e| {
            if ema.is_reserve() || ema.info().typ != PageType::Reg {
                return Err(Status::AccessDenied);
            }
            if ema.info().prot.prot_bits() & ProtFlags::W != ProtFlags::W {
                return Err(Status::AccessDenied);
            }
            Ok(())
        })?;
        root.walk_range_mut(first, last, start, end, |ema, s, e| ema.commit(platform, s, e))
    }

    /// Precheck per spec §4.3's `ema_can_uncommit`: no covered EMA may be
    /// `RESERVE` (nothing to uncommit there). Mutation promotes a `NONE`
    /// node to `R` first — matching `ema_do_uncommit`'s `NONE`→`R` step —
    /// so the acknowledging `EACCEPT` inside `Ema::uncommit` can actually
    /// execute instead of hitting a page the hardware still has locked down.
    pub fn uncommit_loop<P: Platform>(&mut self, platform: &P, start: usize, end: usize) -> EmmResult<()> {
        let kind = self.classify(start, end.saturating_sub(start))?;
        let root = self.root_mut(kind);
        let (first, last) = root.covering_range(start, end)?;
        root.walk_range_ref(first, last, start, end, |ema, _s, _e| {
            if ema.is_reserve() {
                Err(Status::AccessDenied)
            } else {
                Ok(())
            }
        })?;
        root.walk_range_mut(first, last, start, end, |ema, s, e| {
            if ema.info().prot.prot_bits() == ProtFlags::NONE {
                ema.modify_permissions(platform, ProtFlags::R)?;
            }
            ema.uncommit(platform, s, e)
        })
    }

    pub fn modify_permissions_loop<P: Platform>(
        &mut self,
        platform: &P,
        start: usize,
        end: usize,
        new_prot: ProtFlags,
    ) -> EmmResult<()> {
        let kind = self.classify(start, end.saturating_sub(start))?;
        let root = self.root_mut(kind);
        let (first, last) = root.covering_range(start, end)?;
        root.walk_range_ref(first, last, start, end, |ema, s, e| {
            if ema.is_reserve() || ema.info().typ != PageType::Reg {
                return Err(Status::AccessDenied);
            }
            if !ema.range_committed_all(s, e)? {
                return Err(Status::AccessDenied);
            }
            Ok(())
        })?;
        root.walk_range_mut(first, last, start, end, |ema, _s, _e| {
            ema.modify_permissions(platform, new_prot)
        })
    }

    fn modify_permissions_loop_nocheck<P: Platform>(
        &mut self,
        platform: &P,
        start: usize,
        end: usize,
        new_prot: ProtFlags,
    ) -> EmmResult<()> {
        let kind = self.classify(start, end.saturating_sub(start))?;
        let root = self.root_mut(kind);
        let (first, last) = root.covering_range(start, end)?;
        root.walk_range_mut(first, last, start, end, |ema, _s, _e| {
            ema.modify_permissions(platform, new_prot)
        })
    }

    /// Atomically fills and accepts `[start, end)` from `src`, then finishes
    /// with an unchecked permission pass to `new_prot` across the whole
    /// range — mirroring `ema_do_commit_data_loop`, which always finalizes
    /// protection after every covered node has taken its data, rather than
    /// per node as it goes.
    pub fn commit_data_loop<P: Platform>(
        &mut self,
        platform: &P,
        start: usize,
        end: usize,
        src: *const u8,
        new_prot: ProtFlags,
    ) -> EmmResult<()> {
        let kind = self.classify(start, end.saturating_sub(start))?;
        {
            let root = self.root_mut(kind);
            let (first, last) = root.covering_range(start, end)?;
            root.walk_range_ref(first, last, start, end, |ema, s, e| {
                if ema.is_reserve() || ema.info().typ != PageType::Reg {
                    return Err(Status::AccessDenied);
                }
                if !ema.alloc_flags().contains(AllocFlags::COMMIT_ON_DEMAND) {
                    return Err(Status::AccessDenied);
                }
                if ema.info().prot.prot_bits() & ProtFlags::W != ProtFlags::W {
                    return Err(Status::AccessDenied);
                }
                if ema.range_committed_any(s, e)? {
                    return Err(Status::AccessDenied);
                }
                Ok(())
            })?;

            let mut cur_src = src;
            let mut cur = first;
            loop {
                let (next, seg_start, seg_end) = unsafe {
                    let r = cur.as_ref();
                    (r.next, start.max(r.start()), end.min(r.end()))
                };
                unsafe { (*cur.as_ptr()).commit_data(platform, seg_start, seg_end, cur_src)? };
                cur_src = unsafe { cur_src.add(seg_end - seg_start) };
                if cur == last {
                    break;
                }
                cur = next.ok_or(Status::InvalidParameter)?;
            }
        }

        self.modify_permissions_loop_nocheck(platform, start, end, new_prot)
    }

    /// Unlike the other four loop primitives, dealloc has no separate
    /// precheck pass in the C reference (`ema_do_dealloc_loop` goes
    /// straight to mutating); a failure partway through still leaves
    /// earlier nodes in the range deallocated, matching spec §7.
    pub fn dealloc_loop<P: Platform>(&mut self, platform: &P, start: usize, end: usize) -> EmmResult<()> {
        let kind = self.classify(start, end.saturating_sub(start))?;
        let root = self.root_mut(kind);
        let (first, last) = root.covering_range(start, end)?;

        let mut cur = first;
        loop {
            let next = unsafe { cur.as_ref().next };
            let is_last = cur == last;
            root.dealloc_one(platform, cur, start, end)?;
            if is_last {
                break;
            }
            cur = next.ok_or(Status::InvalidParameter)?;
        }
        Ok(())
    }

    /// Retypes the single page at `addr` to `TCS`, isolating it into its own
    /// node first so the retype never has to reason about a partial node.
    pub fn change_to_tcs<P: Platform>(&mut self, platform: &P, addr: usize) -> EmmResult<()> {
        if addr & (SE_PAGE_SIZE - 1) != 0 {
            return Err(Status::InvalidParameter);
        }
        let kind = self.classify(addr, SE_PAGE_SIZE)?;
        let root = self.root_mut(kind);
        let node = root.search(addr).ok_or(Status::InvalidParameter)?;
        let isolated = root.split_ex(node, addr, addr + SE_PAGE_SIZE)?;
        unsafe { (*isolated.as_ptr()).change_to_tcs(platform, addr) }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn realloc_from_reserve_range(
        &mut self,
        kind: RangeKind,
        start: usize,
        end: usize,
        alloc_flags: AllocFlags,
        info: PageInfo,
        handler: Option<HandlerFn>,
        priv_data: Option<NonNull<u8>>,
        alloc: A,
    ) -> EmmResult<NonNull<Ema<A>>> {
        self.root_mut(kind)
            .realloc_from_reserve_range(start, end, alloc_flags, info, handler, priv_data, alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::StaticAlloc;
    use crate::platform::{FailingPlatform, SimPlatform};

    const USER_BASE: usize = 0x2000_0000;
    const USER_END: usize = 0x2010_0000;
    const ENCLAVE_BASE: usize = 0x1000_0000;
    const ENCLAVE_SIZE: usize = 0x2000_0000;

    fn sim() -> SimPlatform {
        SimPlatform::new(ENCLAVE_BASE, ENCLAVE_SIZE)
    }

    fn new_map() -> EmaMap<StaticAlloc> {
        crate::alloc::init_static();
        EmaMap::new(AddressSpace {
            user_base: USER_BASE,
            user_end: USER_END,
        })
    }

    fn reg_rw() -> PageInfo {
        PageInfo {
            typ: PageType::Reg,
            prot: ProtFlags::RW,
        }
    }

    #[test]
    fn classify_splits_user_and_rts() {
        let map = new_map();
        assert_eq!(map.classify(USER_BASE, SE_PAGE_SIZE).unwrap(), RangeKind::User);
        assert_eq!(map.classify(USER_END, SE_PAGE_SIZE).unwrap(), RangeKind::Rts);
        assert_eq!(
            map.classify(USER_BASE - SE_PAGE_SIZE, SE_PAGE_SIZE).unwrap(),
            RangeKind::Rts
        );
        assert!(map.classify(USER_BASE - SE_PAGE_SIZE, 2 * SE_PAGE_SIZE).is_err());
    }

    #[test]
    fn alloc_commit_then_dealloc_round_trip() {
        let platform = sim();
        let mut map = new_map();
        let node = map
            .alloc(
                &platform,
                RangeKind::User,
                Some(USER_BASE),
                2 * SE_PAGE_SIZE,
                SE_PAGE_SIZE,
                AllocFlags::COMMIT_ON_DEMAND,
                reg_rw(),
                None,
                None,
                StaticAlloc,
            )
            .unwrap();
        assert_eq!(unsafe { node.as_ref().start() }, USER_BASE);

        map.commit_loop(&platform, USER_BASE, USER_BASE + SE_PAGE_SIZE)
            .unwrap();
        assert!(unsafe { node.as_ref().page_committed(USER_BASE) });

        map.dealloc_loop(&platform, USER_BASE, USER_BASE + 2 * SE_PAGE_SIZE)
            .unwrap();
        assert!(map.search(RangeKind::User, USER_BASE).is_none());
    }

    #[test]
    fn alloc_commit_now_commits_every_page() {
        let platform = sim();
        let mut map = new_map();
        let node = map
            .alloc(
                &platform,
                RangeKind::User,
                Some(USER_BASE),
                2 * SE_PAGE_SIZE,
                SE_PAGE_SIZE,
                AllocFlags::COMMIT_NOW,
                reg_rw(),
                None,
                None,
                StaticAlloc,
            )
            .unwrap();
        assert!(unsafe { node.as_ref().range_committed_all(USER_BASE, USER_BASE + 2 * SE_PAGE_SIZE) }.unwrap());
    }

    #[test]
    fn fixed_alloc_rejects_overlap() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::COMMIT_ON_DEMAND,
            reg_rw(),
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        let err = map
            .alloc(
                &platform,
                RangeKind::User,
                Some(USER_BASE),
                SE_PAGE_SIZE,
                SE_PAGE_SIZE,
                AllocFlags::COMMIT_ON_DEMAND,
                reg_rw(),
                None,
                None,
                StaticAlloc,
            )
            .unwrap_err();
        assert_eq!(err, Status::AccessDenied);
    }

    #[test]
    fn floating_alloc_places_after_existing() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::COMMIT_ON_DEMAND,
            reg_rw(),
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        let second = map
            .alloc(
                &platform,
                RangeKind::User,
                None,
                SE_PAGE_SIZE,
                SE_PAGE_SIZE,
                AllocFlags::COMMIT_ON_DEMAND,
                reg_rw(),
                None,
                None,
                StaticAlloc,
            )
            .unwrap();
        assert_eq!(unsafe { second.as_ref().start() }, USER_BASE + SE_PAGE_SIZE);
    }

    #[test]
    fn commit_loop_rejects_reserve_node() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::RESERVE,
            reg_rw(),
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        let err = map
            .commit_loop(&platform, USER_BASE, USER_BASE + SE_PAGE_SIZE)
            .unwrap_err();
        assert_eq!(err, Status::AccessDenied);
    }

    /// Spec §8 scenario 3: allocate `COMMIT_ON_DEMAND` with `si = R|REG`;
    /// `commit_loop` must reject without touching the bitmap.
    #[test]
    fn commit_loop_rejects_non_writable_ema() {
        let platform = sim();
        let mut map = new_map();
        let node = map
            .alloc(
                &platform,
                RangeKind::User,
                Some(USER_BASE),
                SE_PAGE_SIZE,
                SE_PAGE_SIZE,
                AllocFlags::COMMIT_ON_DEMAND,
                PageInfo {
                    typ: PageType::Reg,
                    prot: ProtFlags::R,
                },
                None,
                None,
                StaticAlloc,
            )
            .unwrap();

        let err = map
            .commit_loop(&platform, USER_BASE, USER_BASE + SE_PAGE_SIZE)
            .unwrap_err();
        assert_eq!(err, Status::AccessDenied);
        assert!(!unsafe { node.as_ref().page_committed(USER_BASE) });
    }

    #[test]
    fn uncommit_loop_rejects_reserve_node() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::RESERVE,
            reg_rw(),
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        let err = map
            .uncommit_loop(&platform, USER_BASE, USER_BASE + SE_PAGE_SIZE)
            .unwrap_err();
        assert_eq!(err, Status::AccessDenied);
    }

    /// A node previously stripped to `NONE` (e.g. via `modify_permissions_loop`)
    /// must still be uncommittable: `uncommit_loop` promotes it to `R` first
    /// instead of leaving it at `NONE` and aborting on the TRIM `EACCEPT`.
    #[test]
    fn uncommit_loop_promotes_none_protection_before_uncommitting() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::COMMIT_NOW,
            reg_rw(),
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        map.modify_permissions_loop(&platform, USER_BASE, USER_BASE + SE_PAGE_SIZE, ProtFlags::NONE)
            .unwrap();

        map.uncommit_loop(&platform, USER_BASE, USER_BASE + SE_PAGE_SIZE)
            .unwrap();

        let node = map.search(RangeKind::User, USER_BASE).unwrap();
        assert!(!unsafe { node.as_ref().page_committed(USER_BASE) });
    }

    #[test]
    fn commit_loop_propagates_platform_failure() {
        let ok_platform = sim();
        let failing = FailingPlatform::new(ENCLAVE_BASE, ENCLAVE_SIZE);
        let mut map = new_map();
        map.alloc(
            &ok_platform,
            RangeKind::User,
            Some(USER_BASE),
            SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::COMMIT_ON_DEMAND,
            reg_rw(),
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        let err = map
            .commit_loop(&failing, USER_BASE, USER_BASE + SE_PAGE_SIZE)
            .unwrap_err();
        assert_eq!(err, Status::Unexpected);
    }

    #[test]
    fn realloc_from_reserve_range_splits_middle_of_run() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            4 * SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::RESERVE,
            PageInfo {
                typ: PageType::Reg,
                prot: ProtFlags::NONE,
            },
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        let node = map
            .realloc_from_reserve_range(
                RangeKind::User,
                USER_BASE + SE_PAGE_SIZE,
                USER_BASE + 3 * SE_PAGE_SIZE,
                AllocFlags::COMMIT_ON_DEMAND,
                reg_rw(),
                None,
                None,
                StaticAlloc,
            )
            .unwrap();

        assert_eq!(unsafe { node.as_ref().start() }, USER_BASE + SE_PAGE_SIZE);
        assert_eq!(unsafe { node.as_ref().length() }, 2 * SE_PAGE_SIZE);
        assert!(!unsafe { node.as_ref().is_reserve() });

        // The untouched reserve slivers on either side should still be
        // tracked as separate nodes.
        let before = map.search(RangeKind::User, USER_BASE).unwrap();
        assert!(unsafe { before.as_ref().is_reserve() });
        let after = map.search(RangeKind::User, USER_BASE + 3 * SE_PAGE_SIZE).unwrap();
        assert!(unsafe { after.as_ref().is_reserve() });
    }

    #[test]
    fn realloc_from_reserve_range_rejects_non_reserve() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::COMMIT_ON_DEMAND,
            reg_rw(),
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        let err = map
            .realloc_from_reserve_range(
                RangeKind::User,
                USER_BASE,
                USER_BASE + SE_PAGE_SIZE,
                AllocFlags::COMMIT_ON_DEMAND,
                reg_rw(),
                None,
                None,
                StaticAlloc,
            )
            .unwrap_err();
        assert_eq!(err, Status::AccessDenied);
    }

    #[test]
    fn change_to_tcs_isolates_single_page() {
        let platform = sim();
        let mut map = new_map();
        map.alloc(
            &platform,
            RangeKind::User,
            Some(USER_BASE),
            2 * SE_PAGE_SIZE,
            SE_PAGE_SIZE,
            AllocFlags::COMMIT_NOW,
            PageInfo {
                typ: PageType::Reg,
                prot: ProtFlags::RW,
            },
            None,
            None,
            StaticAlloc,
        )
        .unwrap();

        map.change_to_tcs(&platform, USER_BASE).unwrap();

        let tcs = map.search(RangeKind::User, USER_BASE).unwrap();
        assert_eq!(unsafe { tcs.as_ref().info() }.typ, PageType::Tcs);
        assert_eq!(unsafe { tcs.as_ref().length() }, SE_PAGE_SIZE);

        let rest = map.search(RangeKind::User, USER_BASE + SE_PAGE_SIZE).unwrap();
        assert_eq!(unsafe { rest.as_ref().info() }.typ, PageType::Reg);
    }
}
