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

//! The seam to the platform primitives spec §6.1 treats as external
//! collaborators. See SPEC_FULL.md §10.1 and DESIGN.md for how this mirrors
//! the donor's `emm::ocall` hw/sw split and `inst::{hw,sim}` split.

use crate::error::{EmmResult, Status};
use crate::page::PageInfo;

/// The six platform primitives the core issues but does not implement.
pub trait Platform {
    /// Issue `EACCEPT` with the given sec-info at `addr`.
    fn eaccept(&self, info: PageInfo, addr: usize) -> EmmResult<()>;
    /// Issue `EACCEPTCOPY`, atomically accepting and filling a page from `src`.
    fn eacceptcopy(&self, info: PageInfo, dst_page: usize, src_page: *const u8) -> EmmResult<()>;
    /// Issue `EMODPE`, a permission-extension request.
    fn emodpe(&self, info: PageInfo, page: usize) -> EmmResult<()>;
    /// Host-side `mmap`/`mprotect` equivalent; non-zero becomes `Unexpected`.
    fn modify_ocall(&self, addr: usize, size: usize, from: PageInfo, to: PageInfo) -> EmmResult<()>;
    /// Host-side page reservation/commit preparation.
    fn alloc_ocall(&self, addr: usize, size: usize, info: PageInfo) -> EmmResult<()>;
    /// Enclave membership test.
    fn is_within_enclave(&self, addr: usize, size: usize) -> bool;
}

/// `abort()` primitive used by [`crate::error::abort_with`]. Grounded on the
/// donor's `crate::error::abort()` (referenced from `inst/sim/inst.rs`).
#[cold]
#[inline(never)]
pub fn abort() -> ! {
    #[cfg(any(test, feature = "sim"))]
    {
        panic!("emm: abort");
    }
    #[cfg(not(any(test, feature = "sim")))]
    {
        // A real enclave runtime supplies its own abort (typically an
        // illegal instruction trap); wiring that up is out of scope here,
        // see SPEC_FULL.md §10.1.
        loop {
            core::hint::spin_loop();
        }
    }
}

/// A host-testable platform backend: every privileged-instruction call
/// succeeds unconditionally, `is_within_enclave` is checked against a
/// configured address range instead of real ELRANGE metadata. Mirrors the
/// donor's `sw` OCALL module and `inst::sim` instruction module (see
/// DESIGN.md).
#[derive(Clone, Copy, Debug)]
pub struct SimPlatform {
    enclave_base: usize,
    enclave_size: usize,
}

impl SimPlatform {
    pub fn new(enclave_base: usize, enclave_size: usize) -> Self {
        Self {
            enclave_base,
            enclave_size,
        }
    }
}

impl Platform for SimPlatform {
    fn eaccept(&self, _info: PageInfo, _addr: usize) -> EmmResult<()> {
        Ok(())
    }

    fn eacceptcopy(&self, _info: PageInfo, _dst_page: usize, _src_page: *const u8) -> EmmResult<()> {
        Ok(())
    }

    fn emodpe(&self, _info: PageInfo, _page: usize) -> EmmResult<()> {
        Ok(())
    }

    fn modify_ocall(
        &self,
        _addr: usize,
        _size: usize,
        _from: PageInfo,
        _to: PageInfo,
    ) -> EmmResult<()> {
        Ok(())
    }

    fn alloc_ocall(&self, _addr: usize, _size: usize, _info: PageInfo) -> EmmResult<()> {
        Ok(())
    }

    fn is_within_enclave(&self, addr: usize, size: usize) -> bool {
        let Some(end) = addr.checked_add(size) else {
            return false;
        };
        addr >= self.enclave_base && end <= self.enclave_base + self.enclave_size
    }
}

/// A platform that fails every primitive; used to exercise the `EFAULT`
/// propagation paths of the commit/uncommit/modify-permissions loops
/// without relying on `SimPlatform`'s always-succeed behavior.
#[derive(Clone, Copy, Debug)]
pub struct FailingPlatform {
    enclave_base: usize,
    enclave_size: usize,
}

impl FailingPlatform {
    pub fn new(enclave_base: usize, enclave_size: usize) -> Self {
        Self {
            enclave_base,
            enclave_size,
        }
    }
}

impl Platform for FailingPlatform {
    fn eaccept(&self, _info: PageInfo, _addr: usize) -> EmmResult<()> {
        Err(Status::Unexpected)
    }

    fn eacceptcopy(&self, _info: PageInfo, _dst_page: usize, _src_page: *const u8) -> EmmResult<()> {
        Err(Status::Unexpected)
    }

    fn emodpe(&self, _info: PageInfo, _page: usize) -> EmmResult<()> {
        Err(Status::Unexpected)
    }

    fn modify_ocall(
        &self,
        _addr: usize,
        _size: usize,
        _from: PageInfo,
        _to: PageInfo,
    ) -> EmmResult<()> {
        Err(Status::Unexpected)
    }

    fn alloc_ocall(&self, _addr: usize, _size: usize, _info: PageInfo) -> EmmResult<()> {
        Err(Status::Unexpected)
    }

    fn is_within_enclave(&self, addr: usize, size: usize) -> bool {
        let Some(end) = addr.checked_add(size) else {
            return false;
        };
        addr >= self.enclave_base && end <= self.enclave_base + self.enclave_size
    }
}
