// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Microkernel for the 32-bit x86 protected-mode PC.
//!
//! This is the machine-independent portion of the kernel plus an `arch`
//! module holding everything that touches the processor. The kernel owns
//! four concerns: the task/thread scheduler, synchronous message-passing
//! IPC, the paged memory manager, and the interrupt/system-call plumbing
//! that user processes drive all of these through.
//!
//! # Design principles
//!
//! 1. Static configuration. Every table in the kernel has its size fixed at
//!    compile time; nothing is allocated after `startup` finishes.
//! 2. Ids, not pointers. Tasks, directories, timers, and message buffers
//!    refer to each other by index. All cross-references survive on either
//!    side of a context switch, and the whole kernel runs unmodified on the
//!    host for testing.
//! 3. A strong preference for safe code where reasonable; `unsafe` is
//!    confined to `arch` and the few places that touch raw frames.
//! 4. Simple and clear algorithms over fast and clever ones.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod arch;

pub mod bootinfo;
pub mod elf;
pub mod err;
pub mod interrupt;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod services;
pub mod startup;
pub mod task;
pub mod time;
pub mod umem;

#[cfg(test)]
pub(crate) mod testutil;
