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

//! Page-granularity constants. Trimmed from the donor's `arch` module, which
//! carries a great deal of enclave-image/ELF metadata this crate has no use
//! for (see DESIGN.md "Deviations").

pub const SE_PAGE_SHIFT: usize = 12;
pub const SE_PAGE_SIZE: usize = 1 << SE_PAGE_SHIFT;

#[macro_export]
macro_rules! is_page_aligned {
    ($num:expr) => {
        $num & ($crate::arch::SE_PAGE_SIZE - 1) == 0
    };
}

#[macro_export]
macro_rules! round_to {
    ($num:expr, $align:expr) => {
        ($num + $align - 1) & (!($align - 1))
    };
}

#[macro_export]
macro_rules! trim_to {
    ($num:expr, $align:expr) => {
        $num & (!($align - 1))
    };
}
