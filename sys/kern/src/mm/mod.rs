// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory management.
//!
//! Four allocators live here, initialized bottom-up at boot: the physical
//! frame pool ([`phys`]), the paging machinery with its per-process
//! directories and kernel scratch channels ([`page`]), the break-point
//! kernel heap ([`heap`]), and the per-process virtual range maps
//! ([`vaddr`]). The flat descriptor table is here too ([`gdt`]) because it
//! is, at heart, a memory-layout concern.

pub mod gdt;
pub mod heap;
pub mod page;
pub mod phys;
pub mod vaddr;
