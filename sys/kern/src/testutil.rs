// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for host tests: a booted kernel against the
//! simulated machine, plus helpers for minting processes and user memory.
//!
//! The simulated physical window covers the first 16 MiB and the user
//! window 16 MiB from `USER_BASE`; all test addresses live inside these.

use abi::bootinfo::{E820Entry, E820_AVAILABLE};
use abi::memmap::{page_round_down, page_round_up, PAGE_SIZE, USER_BASE};
use abi::{ProcType, TaskId};

use crate::arch;
use crate::interrupt;
use crate::kernel::Kernel;
use crate::mm::page::{PageFlags, PageMgr, DIR_IDLE};
use crate::mm::phys::PhysAllocator;
use crate::mm::vaddr::RangeMap;

/// Simulated layout knobs.
pub const IDLE_PD: u32 = 0x0040_0000;
pub const KPT_BASE: u32 = 0x0040_1000;
pub const IDENTITY_END: u32 = 0x0100_0000;
pub const POOL_BASE: u32 = 0x0060_0000;
pub const POOL_SIZE: u32 = 0x0080_0000;

/// A frame pool over `[base, base+size)`.
pub fn seeded_phys(base: u32, size: u32) -> PhysAllocator {
    let mut p = PhysAllocator::new();
    let e = [E820Entry {
        base: base as u64,
        length: size as u64,
        kind: E820_AVAILABLE,
        attrs: 0,
    }];
    p.seed_from_e820(e, &[]);
    p
}

/// Frame pool plus an initialized page manager, the standard mm fixture.
pub fn seeded_mm() -> (PhysAllocator, PageMgr) {
    let mut pages = PageMgr::new();
    pages.init(IDLE_PD, KPT_BASE, IDENTITY_END);
    (seeded_phys(POOL_BASE, POOL_SIZE), pages)
}

/// A fully initialized kernel on the simulated machine: memory, idle
/// task, scheduler, IPC, timers, interrupt table.
pub fn boot_kernel() -> &'static mut Kernel {
    let k = Box::leak(Box::new(Kernel::new()));
    k.pages.init(IDLE_PD, KPT_BASE, IDENTITY_END);
    k.phys = seeded_phys(POOL_BASE, POOL_SIZE);
    k.heap.init(arch::kernel_image_end());
    k.gdt.init(arch::tss_addr(), arch::tss_limit());
    k.tasks.init_idle(k.pages.dir_frame(DIR_IDLE));
    k.sched.init();
    k.ipc.init();
    k.timers.init();
    interrupt::init(k);
    crate::services::install(k);
    k
}

/// Mints a live single-thread process of the given class, without an ELF
/// image: directory, break bookkeeping, virtual-range map, and a
/// scheduled initial thread.
pub fn spawn(k: &mut Kernel, ptype: ProcType) -> TaskId {
    let pid = k.tasks.alloc_pid().unwrap();
    let dir = k.pages.alloc_dir(&mut k.phys, pid).unwrap();
    let pdbr = k.pages.dir_frame(dir);
    let brk_base = USER_BASE + 0x0010_0000;
    {
        let p = k.tasks.proc_mut(pid);
        p.live = true;
        p.ptype = ptype;
        p.dir = dir;
        p.pdbr = pdbr;
        p.break_point = brk_base;
        p.brk_base = brk_base;
        p.vaddr = RangeMap::new();
        p.vaddr
            .init(brk_base + 0x0010_0000, 0x0200_0000);
    }
    crate::task::create_thread(k, pid, USER_BASE, USER_BASE + 0x1000)
        .unwrap()
}

/// Maps a fresh user buffer at window offset `off` in `owner`'s space and
/// returns its virtual address. Offsets must be distinct per live buffer:
/// the simulated machine backs all user windows with one arena.
pub fn user_buf(k: &mut Kernel, owner: TaskId, off: u32, len: usize) -> u32 {
    map_user(k, owner, off, len, PageFlags::RW | PageFlags::USER)
}

/// As `user_buf`, but read-only.
pub fn user_buf_ro(
    k: &mut Kernel,
    owner: TaskId,
    off: u32,
    len: usize,
) -> u32 {
    map_user(k, owner, off, len, PageFlags::USER)
}

fn map_user(
    k: &mut Kernel,
    owner: TaskId,
    off: u32,
    len: usize,
    flags: PageFlags,
) -> u32 {
    let va = USER_BASE + off;
    let dir = k.tasks.proc(owner.pid()).dir;
    let first = page_round_down(va);
    let last = page_round_up(va + len.max(1) as u32);
    let mut page = first;
    while page < last {
        if k.pages.walk(dir, page).is_none() {
            let frame = k.phys.alloc(PAGE_SIZE as u32).unwrap();
            k.pages
                .map(&mut k.phys, dir, page, frame, PAGE_SIZE as u32, flags)
                .unwrap();
        }
        page += PAGE_SIZE as u32;
    }
    va
}

/// Raw poke into simulated user memory, bypassing access checks.
pub fn user_write(_k: &mut Kernel, _owner: TaskId, va: u32, data: &[u8]) {
    let dst = unsafe { arch::mem_slice(va, data.len()) };
    dst.copy_from_slice(data);
}

/// Raw peek at simulated user memory.
pub fn user_read(_k: &Kernel, _owner: TaskId, va: u32, n: usize) -> Vec<u8> {
    let src = unsafe { arch::mem_slice(va, n) };
    src.to_vec()
}
