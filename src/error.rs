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

//! Status taxonomy for the core, modeled after `sgx_types::error::SgxStatus`
//! without depending on that crate (see DESIGN.md).

/// Integer error taxonomy, POSIX-flavored for ABI fidelity with the donor source.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    /// Emalloc or BitMap creation failed.
    OutOfMemory = 1,
    /// Malformed range: null, non-aligned, gaps in covered EMAs, range
    /// extends past coverage, or another precondition violated.
    InvalidParameter = 2,
    /// Semantic violation: writing to a non-writable EMA, committing inside
    /// a RESERVE region, retyping an unaccepted page, and so on.
    AccessDenied = 3,
    /// A platform OCALL or privileged instruction returned non-zero.
    Unexpected = 4,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

pub type EmmResult<T> = Result<T, Status>;

/// Logs the invariant violated, then aborts the process. Reserved for
/// irrecoverable inconsistencies per spec §7: corrupt list links, a freed
/// block outside any reserve, a meta-reserve free outside bootstrapping,
/// or an EACCEPT/EACCEPTCOPY failure during a mid-flight TCS/TRIM retype.
#[cold]
#[inline(never)]
pub fn abort_with(reason: &str) -> ! {
    log::error!("emm: aborting, invariant violated: {reason}");
    crate::platform::abort();
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}
