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

//! A single enclave memory area descriptor and the page-level operations
//! that mutate it in place. Grounded on the donor's `emm::ema::EMA<A>` for
//! shape and on `examples/original_source/ema.c` for the operations the
//! donor left as `todo!()` (`ema_do_commit`, `ema_do_uncommit_real`,
//! `ema_modify_permissions`, `ema_change_to_tcs`, `ema_do_commit_data`).
//!
//! List splicing (insert/remove/split) lives in [`crate::ema_map`], which is
//! the only code that knows where the head and tail of a range sit; this
//! module only touches the `prev`/`next` links of the node(s) it's given.

use core::alloc::Allocator;
use core::ptr::NonNull;

use crate::arch::{SE_PAGE_SHIFT, SE_PAGE_SIZE};
use crate::bitmap::{BitArray, Fill};
use crate::error::{abort_with, EmmResult, Status};
use crate::page::{AllocFlags, PageInfo, PageType, ProtFlags};
use crate::platform::Platform;
use crate::round_to;

/// Opaque page-fault callback, carried but never invoked by this crate; fault
/// dispatch is the enclave runtime's job (see SPEC_FULL.md §10.1).
pub type HandlerFn = fn(usize, Option<NonNull<u8>>) -> bool;

/// A single contiguous enclave memory area. `A` is the allocator its
/// descriptor and `eaccept_map` were drawn from — in practice always
/// [`crate::alloc::ResAlloc`], but kept generic so tests can swap in a
/// allocator that doesn't touch the process-wide reserve singleton.
pub struct Ema<A: Allocator + Clone> {
    start: usize,
    length: usize,
    alloc_flags: AllocFlags,
    info: PageInfo,
    eaccept_map: Option<BitArray<A>>,
    handler: Option<HandlerFn>,
    priv_data: Option<NonNull<u8>>,
    alloc: A,
    pub(crate) prev: Option<NonNull<Ema<A>>>,
    pub(crate) next: Option<NonNull<Ema<A>>>,
}

impl<A: Allocator + Clone> Ema<A> {
    /// Builds a free-standing node (not yet linked into any list). `start`
    /// and `length` must already be page-aligned and non-zero; callers at
    /// the map level are expected to have validated the address range
    /// itself (enclave membership, no overlap with a neighbor).
    ///
    /// The initial `eaccept_map` fill follows the allocation flags: a
    /// `RESERVE` area carries no bitmap at all (no pages are ever directly
    /// accepted in a reservation), `COMMIT_NOW` starts fully set, and
    /// `COMMIT_ON_DEMAND` starts fully clear — see SPEC_FULL.md §3.
    pub fn new(
        start: usize,
        length: usize,
        alloc_flags: AllocFlags,
        info: PageInfo,
        handler: Option<HandlerFn>,
        priv_data: Option<NonNull<u8>>,
        alloc: A,
    ) -> EmmResult<Self> {
        let alloc_flags = alloc_flags.validate()?;
        if length == 0 || start & (SE_PAGE_SIZE - 1) != 0 || length & (SE_PAGE_SIZE - 1) != 0 {
            return Err(Status::InvalidParameter);
        }

        let eaccept_map = if alloc_flags.is_reserve() {
            None
        } else {
            let bits = length >> SE_PAGE_SHIFT;
            let fill = if alloc_flags.contains(AllocFlags::COMMIT_NOW) {
                Fill::Ones
            } else {
                Fill::Zeros
            };
            Some(BitArray::new(bits, fill, alloc.clone())?)
        };

        Ok(Self {
            start,
            length,
            alloc_flags,
            info,
            eaccept_map,
            handler,
            priv_data,
            alloc,
            prev: None,
            next: None,
        })
    }

    /// Builds a node directly from parts, used by [`crate::ema_map`] when
    /// splitting an existing node (the bitmap has already been carved up by
    /// the caller, so there's no fill policy to apply here).
    pub(crate) fn from_parts(
        start: usize,
        length: usize,
        alloc_flags: AllocFlags,
        info: PageInfo,
        eaccept_map: Option<BitArray<A>>,
        handler: Option<HandlerFn>,
        priv_data: Option<NonNull<u8>>,
        alloc: A,
    ) -> Self {
        Self {
            start,
            length,
            alloc_flags,
            info,
            eaccept_map,
            handler,
            priv_data,
            alloc,
            prev: None,
            next: None,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn alloc_flags(&self) -> AllocFlags {
        self.alloc_flags
    }

    pub fn info(&self) -> PageInfo {
        self.info
    }

    pub fn is_reserve(&self) -> bool {
        self.alloc_flags.is_reserve()
    }

    pub fn allocator(&self) -> A {
        self.alloc.clone()
    }

    pub fn handler(&self) -> Option<HandlerFn> {
        self.handler
    }

    pub fn priv_data(&self) -> Option<NonNull<u8>> {
        self.priv_data
    }

    pub fn eaccept_map(&self) -> Option<&BitArray<A>> {
        self.eaccept_map.as_ref()
    }

    pub(crate) fn eaccept_map_mut(&mut self) -> Option<&mut BitArray<A>> {
        self.eaccept_map.as_mut()
    }

    pub(crate) fn take_eaccept_map(&mut self) -> Option<BitArray<A>> {
        self.eaccept_map.take()
    }

    pub(crate) fn set_eaccept_map(&mut self, map: Option<BitArray<A>>) {
        self.eaccept_map = map;
    }

    pub(crate) fn set_start_length(&mut self, start: usize, length: usize) {
        self.start = start;
        self.length = length;
    }

    pub(crate) fn set_info(&mut self, info: PageInfo) {
        self.info = info;
    }

    pub fn overlaps_addr(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn is_lower_than(&self, addr: usize) -> bool {
        self.end() <= addr
    }

    pub fn is_higher_than(&self, addr: usize) -> bool {
        self.start >= addr
    }

    /// The end of this EMA, rounded up to `align` — used by the map-level
    /// free-region search to find gaps between adjacent nodes.
    pub fn aligned_end(&self, align: usize) -> usize {
        round_to!(self.end(), align)
    }

    /// Whether every page in `[addr, addr + SE_PAGE_SIZE)` has already been
    /// accepted. A `RESERVE` node (no bitmap) never has committed pages.
    pub fn page_committed(&self, addr: usize) -> bool {
        match &self.eaccept_map {
            Some(map) => {
                let pos = (addr - self.start) >> SE_PAGE_SHIFT;
                map.test(pos).unwrap_or(false)
            }
            None => false,
        }
    }

    pub fn range_committed_all(&self, start: usize, end: usize) -> EmmResult<bool> {
        let map = self.eaccept_map.as_ref().ok_or(Status::AccessDenied)?;
        let pos = (start - self.start) >> SE_PAGE_SHIFT;
        let len = (end - start) >> SE_PAGE_SHIFT;
        map.test_range_all(pos, len)
    }

    pub fn range_committed_any(&self, start: usize, end: usize) -> EmmResult<bool> {
        let map = self.eaccept_map.as_ref().ok_or(Status::AccessDenied)?;
        let pos = (start - self.start) >> SE_PAGE_SHIFT;
        let len = (end - start) >> SE_PAGE_SHIFT;
        map.test_range_any(pos, len)
    }

    /// Accepts every page in `[start, end)` (clamped to this node's range)
    /// that isn't already accepted. Recoverable: a platform `EACCEPT`
    /// failure here leaves the bitmap consistent with what actually landed
    /// and is returned to the caller rather than aborting, matching
    /// `ema_do_commit` in the C reference.
    pub fn commit<P: Platform>(&mut self, platform: &P, start: usize, end: usize) -> EmmResult<()> {
        let real_start = start.max(self.start);
        let real_end = end.min(self.end());
        let base = self.start;
        let map = self.eaccept_map.as_mut().ok_or(Status::AccessDenied)?;

        let mut addr = real_start;
        while addr < real_end {
            let pos = (addr - base) >> SE_PAGE_SHIFT;
            if !map.test(pos)? {
                let info = PageInfo {
                    typ: PageType::Reg,
                    prot: ProtFlags::RW | ProtFlags::PENDING,
                };
                platform.eaccept(info, addr)?;
                map.set(pos, true)?;
            }
            addr += SE_PAGE_SIZE;
        }
        Ok(())
    }

    /// Trims committed pages in `[start, end)` back to `NONE`, in maximal
    /// committed runs (matching `ema_do_uncommit_real`'s `modify_ocall`
    /// bracketing so the host only ever sees one mmap/mprotect-equivalent
    /// call per contiguous run rather than one per page). A `RESERVE` node
    /// has nothing to uncommit and is a no-op.
    ///
    /// The per-page `EACCEPT` that acknowledges the TRIM retype is
    /// irrecoverable if it fails — the host has already retyped the page,
    /// so there's no way back — and aborts rather than returning an error,
    /// per spec §7.
    pub fn uncommit<P: Platform>(&mut self, platform: &P, start: usize, end: usize) -> EmmResult<()> {
        if self.alloc_flags.is_reserve() {
            return Ok(());
        }
        let real_start = start.max(self.start);
        let real_end = end.min(self.end());
        let base = self.start;
        let typ = self.info.typ;
        let prot = self.info.prot;
        let map = self.eaccept_map.as_mut().ok_or(Status::AccessDenied)?;

        let mut cur = real_start;
        while cur < real_end {
            let mut block_start = cur;
            while block_start < real_end {
                let pos = (block_start - base) >> SE_PAGE_SHIFT;
                if map.test(pos)? {
                    break;
                }
                block_start += SE_PAGE_SIZE;
            }
            if block_start == real_end {
                break;
            }
            let mut block_end = block_start + SE_PAGE_SIZE;
            while block_end < real_end {
                let pos = (block_end - base) >> SE_PAGE_SHIFT;
                if map.test(pos)? {
                    block_end += SE_PAGE_SIZE;
                } else {
                    break;
                }
            }
            let block_len = block_end - block_start;

            platform.modify_ocall(
                block_start,
                block_len,
                PageInfo { typ, prot },
                PageInfo {
                    typ: PageType::Trim,
                    prot,
                },
            )?;

            let mut addr = block_start;
            while addr < block_end {
                let info = PageInfo {
                    typ: PageType::Trim,
                    prot: ProtFlags::MODIFIED,
                };
                if platform.eaccept(info, addr).is_err() {
                    abort_with("uncommit: EACCEPT during TRIM retype failed");
                }
                addr += SE_PAGE_SIZE;
            }

            let pos = (block_start - base) >> SE_PAGE_SHIFT;
            map.clear_range(pos, block_len >> SE_PAGE_SHIFT)?;

            platform.modify_ocall(
                block_start,
                block_len,
                PageInfo {
                    typ: PageType::Trim,
                    prot,
                },
                PageInfo {
                    typ: PageType::Trim,
                    prot,
                },
            )?;

            cur = block_end;
        }
        Ok(())
    }

    /// Changes the protection of every page in this node to `new_prot`.
    /// Idempotent: if the node's current protection already matches, this
    /// is a no-op success, mirroring `ema_modify_permissions`'s early return.
    ///
    /// A widening `EMODPE` is issued before the matching `EACCEPT`
    /// acknowledgement when a bit is being added; the acknowledgement is
    /// skipped for `RWX` since hardware treats that combination as already
    /// maximally permissive. Both are recoverable and returned to the
    /// caller on failure — no retype is involved, only a permission change.
    pub fn modify_permissions<P: Platform>(&mut self, platform: &P, new_prot: ProtFlags) -> EmmResult<()> {
        if self.info.prot.prot_bits() == new_prot.prot_bits() {
            return Ok(());
        }
        let typ = self.info.typ;
        let old_prot = self.info.prot;

        platform.modify_ocall(
            self.start,
            self.length,
            PageInfo { typ, prot: old_prot },
            PageInfo { typ, prot: new_prot },
        )?;

        let mut addr = self.start;
        while addr < self.end() {
            if (new_prot | old_prot) != old_prot {
                let info = PageInfo {
                    typ: PageType::Reg,
                    prot: new_prot | ProtFlags::PR,
                };
                platform.emodpe(info, addr)?;
            }
            if new_prot.prot_bits() != ProtFlags::RWX {
                let info = PageInfo {
                    typ: PageType::Reg,
                    prot: new_prot | ProtFlags::PR,
                };
                platform.eaccept(info, addr)?;
            }
            addr += SE_PAGE_SIZE;
        }

        self.info.prot = new_prot;

        if new_prot.prot_bits() == ProtFlags::NONE {
            platform.modify_ocall(
                self.start,
                self.length,
                PageInfo {
                    typ,
                    prot: ProtFlags::NONE,
                },
                PageInfo {
                    typ,
                    prot: ProtFlags::NONE,
                },
            )?;
        }
        Ok(())
    }

    /// Retypes the single page at `addr` to `TCS`. Requires this node's
    /// current type/protection to already be `REG`/`RW`; the map-level
    /// caller is responsible for isolating `addr` into its own node first
    /// (splitting off a one-page range) so this method never has to reason
    /// about partial-node state.
    ///
    /// The acknowledging `EACCEPT` is irrecoverable on failure: the host has
    /// already retyped the page to `TCS`, so per spec §7 this aborts rather
    /// than propagating an error.
    pub fn change_to_tcs<P: Platform>(&mut self, platform: &P, addr: usize) -> EmmResult<()> {
        if self.info.typ == PageType::Tcs {
            return Ok(());
        }
        if self.info.typ != PageType::Reg || self.info.prot.prot_bits() != ProtFlags::RW {
            return Err(Status::AccessDenied);
        }

        platform.modify_ocall(
            addr,
            SE_PAGE_SIZE,
            PageInfo {
                typ: PageType::Reg,
                prot: ProtFlags::RW,
            },
            PageInfo {
                typ: PageType::Tcs,
                prot: ProtFlags::RW,
            },
        )?;

        let info = PageInfo {
            typ: PageType::Tcs,
            prot: ProtFlags::MODIFIED,
        };
        if platform.eaccept(info, addr).is_err() {
            abort_with("change_to_tcs: EACCEPT during TCS retype failed");
        }

        self.info = PageInfo {
            typ: PageType::Tcs,
            prot: ProtFlags::NONE,
        };
        Ok(())
    }

    /// Atomically accepts and fills `[start, end)` from `src` (`EACCEPTCOPY`
    /// per page), then marks those pages committed. The range must fall
    /// entirely within an as-yet-uncommitted, writable, `COMMIT_ON_DEMAND`
    /// subrange — the map-level `can_commit_data` precheck enforces that
    /// before this runs.
    pub fn commit_data<P: Platform>(
        &mut self,
        platform: &P,
        start: usize,
        end: usize,
        src: *const u8,
    ) -> EmmResult<()> {
        let prot = self.info.prot;
        let base = self.start;
        let mut addr = start;
        let mut cur_src = src;
        while addr < end {
            let info = PageInfo {
                typ: PageType::Reg,
                prot,
            };
            platform.eacceptcopy(info, addr, cur_src)?;
            addr += SE_PAGE_SIZE;
            // SAFETY: caller guarantees `src` covers exactly `end - start`
            // bytes, advanced one page at a time in lockstep with `addr`.
            cur_src = unsafe { cur_src.add(SE_PAGE_SIZE) };
        }

        let map = self.eaccept_map.as_mut().ok_or(Status::AccessDenied)?;
        let pos = (start - base) >> SE_PAGE_SHIFT;
        let len = (end - start) >> SE_PAGE_SHIFT;
        map.set_range(pos, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::StaticAlloc;
    use crate::platform::{FailingPlatform, SimPlatform};

    fn sim() -> SimPlatform {
        SimPlatform::new(0x1000_0000, 0x1000_0000)
    }

    fn new_ema(flags: AllocFlags) -> Ema<StaticAlloc> {
        crate::alloc::init_static();
        Ema::new(
            0x1000_0000,
            3 * SE_PAGE_SIZE,
            flags,
            PageInfo {
                typ: PageType::Reg,
                prot: ProtFlags::RW,
            },
            None,
            None,
            StaticAlloc,
        )
        .unwrap()
    }

    #[test]
    fn commit_on_demand_starts_clear() {
        let ema = new_ema(AllocFlags::COMMIT_ON_DEMAND);
        assert!(!ema.page_committed(0x1000_0000));
    }

    #[test]
    fn commit_now_starts_set() {
        let ema = new_ema(AllocFlags::COMMIT_NOW);
        assert!(ema.page_committed(0x1000_0000));
        assert!(ema.page_committed(0x1000_0000 + SE_PAGE_SIZE));
    }

    #[test]
    fn reserve_has_no_bitmap() {
        let ema = new_ema(AllocFlags::RESERVE);
        assert!(ema.eaccept_map().is_none());
        assert!(!ema.page_committed(0x1000_0000));
    }

    #[test]
    fn commit_then_uncommit_round_trip() {
        let mut ema = new_ema(AllocFlags::COMMIT_ON_DEMAND);
        let platform = sim();
        ema.commit(&platform, ema.start(), ema.end()).unwrap();
        assert!(ema.page_committed(ema.start()));
        ema.uncommit(&platform, ema.start(), ema.end()).unwrap();
        assert!(!ema.page_committed(ema.start()));
    }

    #[test]
    fn modify_permissions_is_idempotent() {
        let mut ema = new_ema(AllocFlags::COMMIT_NOW);
        let platform = sim();
        ema.modify_permissions(&platform, ProtFlags::RW).unwrap();
        assert_eq!(ema.info().prot, ProtFlags::RW);
    }

    #[test]
    fn change_to_tcs_rejects_wrong_protection() {
        let mut ema = Ema::new(
            0x1000_0000,
            SE_PAGE_SIZE,
            AllocFlags::COMMIT_NOW,
            PageInfo {
                typ: PageType::Reg,
                prot: ProtFlags::RX,
            },
            None,
            None,
            {
                crate::alloc::init_static();
                StaticAlloc
            },
        )
        .unwrap();
        let platform = sim();
        assert_eq!(
            ema.change_to_tcs(&platform, ema.start()),
            Err(Status::AccessDenied)
        );
    }

    #[test]
    fn change_to_tcs_is_idempotent() {
        let mut ema = new_ema(AllocFlags::COMMIT_NOW);
        ema.set_info(PageInfo {
            typ: PageType::Tcs,
            prot: ProtFlags::NONE,
        });
        let platform = sim();
        assert!(ema.change_to_tcs(&platform, ema.start()).is_ok());
    }

    #[test]
    fn commit_propagates_platform_failure() {
        let mut ema = new_ema(AllocFlags::COMMIT_ON_DEMAND);
        let platform = FailingPlatform::new(0x1000_0000, 0x1000_0000);
        assert!(ema.commit(&platform, ema.start(), ema.start() + SE_PAGE_SIZE).is_err());
        assert!(!ema.page_committed(ema.start()));
    }
}
