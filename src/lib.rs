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

//! # Enclave Memory Manager core
//!
//! Tracks every address range an enclave has carved out of its reserved
//! memory, page by page: which ranges are committed, what protection and
//! page type they carry, and which pages the hardware has actually
//! `EACCEPT`ed. It does not perform any of the privileged operations
//! itself (that's [`platform::Platform`]'s job) and it does not manage the
//! enclave's heap or thread stacks, which are built on top of it.
//!
//! The map is organized as two address-ordered lists of [`ema::Ema`]
//! descriptors, one for the fixed `User` region and one for the open-ended
//! `Rts` region (see [`ema_map::EmaMap`]), backed by a small bootstrap
//! allocator ([`alloc`]) so the manager never depends on a general-purpose
//! heap being available yet.

#![no_std]
#![feature(allocator_api)]
#![allow(clippy::too_many_arguments)]

extern crate alloc as alloc_crate;

pub mod alloc;
pub mod arch;
pub mod bitmap;
pub mod ema;
pub mod ema_map;
pub mod error;
pub mod page;
pub mod platform;

pub use ema::Ema;
pub use ema_map::{AddressSpace, EmaMap, EmaRoot, RangeKind};
pub use error::{EmmResult, Status};
pub use page::{AllocFlags, PageInfo, PageType, ProtFlags, SecInfo};
pub use platform::Platform;
