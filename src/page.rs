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

//! Page-level flag and sec-info types, grounded on `sgx_trts::emm::page`.

use bitflags::bitflags;

bitflags! {
    /// Allocation-time flags. RESERVE and the two COMMIT_* variants are
    /// mutually exclusive; callers are expected to pick exactly one.
    #[derive(Default)]
    pub struct AllocFlags: u32 {
        const RESERVE          = 0x0000_0001;
        const COMMIT_NOW       = 0x0000_0002;
        const COMMIT_ON_DEMAND = 0x0000_0004;
        const GROWSDOWN        = 0x0000_0008;
        const GROWSUP          = 0x0000_0010;
        const FIXED            = 0x0000_0020;
        const SYSTEM           = 0x0000_0040;
    }
}

impl AllocFlags {
    /// Rejects nonsensical combinations: RESERVE/COMMIT_NOW/COMMIT_ON_DEMAND
    /// are pairwise exclusive, and GROWSDOWN/GROWSUP cannot both be set.
    pub fn validate(self) -> crate::error::EmmResult<Self> {
        let commit_bits = (self.contains(AllocFlags::RESERVE) as u8)
            + (self.contains(AllocFlags::COMMIT_NOW) as u8)
            + (self.contains(AllocFlags::COMMIT_ON_DEMAND) as u8);
        if commit_bits > 1 {
            return Err(crate::error::Status::InvalidParameter);
        }
        if self.contains(AllocFlags::GROWSDOWN) && self.contains(AllocFlags::GROWSUP) {
            return Err(crate::error::Status::InvalidParameter);
        }
        Ok(self)
    }

    pub fn is_reserve(self) -> bool {
        self.contains(AllocFlags::RESERVE)
    }
}

bitflags! {
    /// Sec-info bit fields: low 3 bits are protection, next bits page type,
    /// top bits are in-flight state markers. Layout is architectural
    /// (spec §6.2) and must not be reordered.
    #[derive(Default)]
    pub struct ProtFlags: u32 {
        const NONE     = 0x00;
        const R        = 0x01;
        const W        = 0x02;
        const X        = 0x04;
        const PENDING  = 0x08;
        const MODIFIED = 0x10;
        const PR       = 0x20;

        const RW  = Self::R.bits | Self::W.bits;
        const RX  = Self::R.bits | Self::X.bits;
        const RWX = Self::R.bits | Self::W.bits | Self::X.bits;
    }
}

impl ProtFlags {
    /// The protection bits only, masking off state markers.
    pub fn prot_bits(self) -> ProtFlags {
        self & (ProtFlags::R | ProtFlags::W | ProtFlags::X)
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Reg = 0,
    Tcs = 1,
    Trim = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub typ: PageType,
    pub prot: ProtFlags,
}

/// 64-byte-aligned sec-info structure handed to `EACCEPT`/`EACCEPTCOPY`/
/// `EMODPE`. Only the first 8 bytes carry meaningful bits (spec §6.1); the
/// remainder is reserved padding mandated by the hardware ABI.
#[repr(C, align(64))]
#[derive(Clone, Copy, Debug)]
pub struct SecInfo {
    pub flags: u64,
    _reserved: [u64; 7],
}

impl SecInfo {
    pub fn new(info: PageInfo, state: ProtFlags) -> Self {
        let page_type_bits = (info.typ as u64) << 8;
        let flags = (info.prot.prot_bits().bits() as u64)
            | page_type_bits
            | (state.bits() as u64 & 0x38);
        Self {
            flags,
            _reserved: [0; 7],
        }
    }
}
