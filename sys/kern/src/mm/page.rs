// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-process page directories and the kernel's view of physical memory.
//!
//! Directory id 0 belongs to the idle kernel context; every other directory
//! inherits the kernel half from it at creation, so the kernel region is
//! identical (entry for entry) across all address spaces, always. The
//! kernel half is identity-mapped out of a fixed block of page tables the
//! boot loader reserves, which is what lets the kernel touch directory and
//! table frames below that horizon directly.
//!
//! Frames outside the identity horizon are reached through the two scratch
//! channels: fixed virtual windows in the idle directory that the copy/set
//! services map arbitrary physical ranges into, operate through, and unmap.
//! At most one operation is in flight per channel; the uniprocessor rule
//! (interrupts off across the critical section) is the only lock required.

use abi::memmap::{
    self, page_round_down, page_round_up, PAGE_SIZE, USER_BASE,
};
use abi::Error;

use super::phys::PhysAllocator;
use crate::arch;

bitflags::bitflags! {
    /// Hardware page-table entry bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const GLOBAL = 1 << 8;
    }
}

/// Identifies a page directory. Id 0 is the idle directory.
pub type DirId = u16;

pub const DIR_IDLE: DirId = 0;

const DIR_NUM: usize = abi::PROC_NUM;

/// Number of directory entries covering the kernel half.
const KERNEL_PDE_COUNT: usize = (USER_BASE >> 22) as usize;

const ENTRIES: usize = 1024;

#[derive(Copy, Clone)]
struct DirSlot {
    live: bool,
    frame: u32,
}

pub struct PageMgr {
    dirs: [DirSlot; DIR_NUM],
    current: DirId,
    /// Extent of the identity-mapped kernel region; frames below this can
    /// be addressed directly, everything else goes through a scratch
    /// channel.
    identity_end: u32,
}

impl PageMgr {
    pub const fn new() -> Self {
        Self {
            dirs: [DirSlot {
                live: false,
                frame: 0,
            }; DIR_NUM],
            current: DIR_IDLE,
            identity_end: 0,
        }
    }

    /// Builds the idle directory. The whole kernel half gets its page
    /// tables up front, out of the fixed block at `kernel_pt_base`:
    /// `[0, identity_end)` is identity-mapped as supervisor global memory,
    /// and the remaining tables (the scratch windows among them) start out
    /// empty. Kernel-half tables are therefore shared by every directory
    /// ever created and are never allocated later.
    pub fn init(&mut self, idle_pd: u32, kernel_pt_base: u32, identity_end: u32) {
        uassert!(identity_end <= USER_BASE);
        self.identity_end = identity_end;

        for i in 0..KERNEL_PDE_COUNT {
            let pt = kernel_pt_base + (i * PAGE_SIZE) as u32;
            self.with_table(pt, |t| {
                for (j, e) in t.iter_mut().enumerate() {
                    let va = ((i << 22) + (j << 12)) as u32;
                    *e = if va < identity_end {
                        va | (PageFlags::PRESENT
                            | PageFlags::RW
                            | PageFlags::GLOBAL)
                            .bits()
                    } else {
                        0
                    };
                }
            });
        }
        self.with_table(idle_pd, |d| {
            for (i, e) in d.iter_mut().enumerate() {
                *e = if i < KERNEL_PDE_COUNT {
                    let pt = kernel_pt_base + (i * PAGE_SIZE) as u32;
                    pt | (PageFlags::PRESENT | PageFlags::RW).bits()
                } else {
                    0
                };
            }
        });
        self.dirs[0] = DirSlot {
            live: true,
            frame: idle_pd,
        };
        self.current = DIR_IDLE;
    }

    /// Allocates a directory for process `pid`, inheriting the kernel half
    /// from the idle directory.
    pub fn alloc_dir(
        &mut self,
        phys: &mut PhysAllocator,
        pid: u32,
    ) -> Result<DirId, Error> {
        let id = pid as usize;
        uassert!(id < DIR_NUM && id != 0);
        if self.dirs[id].live {
            return Err(Error::NoResource);
        }
        let frame = phys.alloc(PAGE_SIZE as u32).ok_or(Error::NoMemory)?;

        let mut kernel_half = [0u32; KERNEL_PDE_COUNT];
        let idle = self.dirs[0].frame;
        self.with_table(idle, |d| {
            kernel_half.copy_from_slice(&d[..KERNEL_PDE_COUNT]);
        });
        self.with_table(frame, |d| {
            d[..KERNEL_PDE_COUNT].copy_from_slice(&kernel_half);
            for e in &mut d[KERNEL_PDE_COUNT..] {
                *e = 0;
            }
        });

        self.dirs[id] = DirSlot { live: true, frame };
        Ok(id as DirId)
    }

    /// Releases a directory and the user-half page tables it owns. Frames
    /// mapped *through* those tables belong to whoever mapped them.
    pub fn free_dir(&mut self, phys: &mut PhysAllocator, dir: DirId) {
        let id = dir as usize;
        uassert!(id != 0 && id < DIR_NUM && self.dirs[id].live);
        let frame = self.dirs[id].frame;

        for pde_idx in KERNEL_PDE_COUNT..ENTRIES {
            let mut pt = 0;
            self.with_table(frame, |d| {
                if d[pde_idx] & PageFlags::PRESENT.bits() != 0 {
                    pt = page_round_down(d[pde_idx]);
                }
            });
            if pt != 0 {
                phys.free(pt);
            }
        }
        phys.free(frame);
        self.dirs[id] = DirSlot {
            live: false,
            frame: 0,
        };
    }

    /// Loads the address-translation base register with `dir`'s directory.
    pub fn switch_dir(&mut self, dir: DirId) {
        uassert!(self.dirs[dir as usize].live);
        self.current = dir;
        arch::set_pdbr(self.dirs[dir as usize].frame);
    }

    pub fn current_dir(&self) -> DirId {
        self.current
    }

    /// Physical base of `dir`'s directory frame; the value loaded into the
    /// translation base register on switch.
    pub fn dir_frame(&self, dir: DirId) -> u32 {
        uassert!(self.dirs[dir as usize].live);
        self.dirs[dir as usize].frame
    }

    /// Maps `[vaddr, vaddr+size)` to `[paddr, ...)` in `dir`. Sizes are
    /// rounded up to whole pages; intermediate tables are allocated on
    /// demand. Kernel-half mappings may only be made through the idle
    /// directory (they are shared by construction).
    pub fn map(
        &mut self,
        phys: &mut PhysAllocator,
        dir: DirId,
        vaddr: u32,
        paddr: u32,
        size: u32,
        flags: PageFlags,
    ) -> Result<(), Error> {
        uassert!(vaddr & 0xFFF == 0 && paddr & 0xFFF == 0);
        let pages = page_round_up(size) / PAGE_SIZE as u32;
        if vaddr < USER_BASE {
            uassert!(dir == DIR_IDLE);
        }
        for i in 0..pages {
            let va = vaddr + i * PAGE_SIZE as u32;
            let pa = paddr + i * PAGE_SIZE as u32;
            self.map_one(phys, dir, va, pa, flags)?;
        }
        Ok(())
    }

    fn map_one(
        &mut self,
        phys: &mut PhysAllocator,
        dir: DirId,
        va: u32,
        pa: u32,
        flags: PageFlags,
    ) -> Result<(), Error> {
        let dir_frame = self.dir_frame(dir);
        let pde_idx = (va >> 22) as usize;
        let pte_idx = (va >> 12 & 0x3FF) as usize;

        let mut pt = 0;
        self.with_table(dir_frame, |d| {
            if d[pde_idx] & PageFlags::PRESENT.bits() != 0 {
                pt = page_round_down(d[pde_idx]);
            }
        });
        if pt == 0 {
            // Kernel-half tables are fixed at init; a miss here is a bug.
            uassert!(va >= USER_BASE);
            pt = phys.alloc(PAGE_SIZE as u32).ok_or(Error::NoMemory)?;
            self.with_table(pt, |t| t.fill(0));
            let pde = pt
                | (PageFlags::PRESENT | PageFlags::RW | PageFlags::USER)
                    .bits();
            self.with_table(dir_frame, |d| d[pde_idx] = pde);
        }
        let entry = pa | (flags | PageFlags::PRESENT).bits();
        self.with_table(pt, |t| t[pte_idx] = entry);
        Ok(())
    }

    /// Removes the translations covering `[vaddr, vaddr+size)`. Tables
    /// drained to empty are returned to the frame pool, so a map/unmap pair
    /// leaves the directory byte-identical.
    pub fn unmap(
        &mut self,
        phys: &mut PhysAllocator,
        dir: DirId,
        vaddr: u32,
        size: u32,
    ) {
        uassert!(vaddr & 0xFFF == 0);
        if vaddr < USER_BASE {
            uassert!(dir == DIR_IDLE);
        }
        let dir_frame = self.dir_frame(dir);
        let pages = page_round_up(size) / PAGE_SIZE as u32;
        for i in 0..pages {
            let va = vaddr + i * PAGE_SIZE as u32;
            let pde_idx = (va >> 22) as usize;
            let pte_idx = (va >> 12 & 0x3FF) as usize;

            let mut pt = 0;
            self.with_table(dir_frame, |d| {
                if d[pde_idx] & PageFlags::PRESENT.bits() != 0 {
                    pt = page_round_down(d[pde_idx]);
                }
            });
            if pt == 0 {
                continue;
            }
            let mut empty = true;
            self.with_table(pt, |t| {
                t[pte_idx] = 0;
                empty = t.iter().all(|&e| e == 0);
            });
            if empty && va >= USER_BASE {
                self.with_table(dir_frame, |d| d[pde_idx] = 0);
                phys.free(pt);
            }
        }
    }

    /// Resolves one page translation.
    pub fn walk(&self, dir: DirId, va: u32) -> Option<(u32, PageFlags)> {
        let dir_frame = self.dir_frame(dir);
        let pde_idx = (va >> 22) as usize;
        let pte_idx = (va >> 12 & 0x3FF) as usize;

        let mut pt = 0;
        self.with_table(dir_frame, |d| {
            if d[pde_idx] & PageFlags::PRESENT.bits() != 0 {
                pt = page_round_down(d[pde_idx]);
            }
        });
        if pt == 0 {
            return None;
        }
        let mut entry = 0;
        self.with_table(pt, |t| entry = t[pte_idx]);
        if entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((
            page_round_down(entry),
            PageFlags::from_bits_truncate(entry & 0xFFF),
        ))
    }

    /// Calls `f(va, pa, flags)` for every present user-half mapping of
    /// `dir`, in ascending address order.
    pub fn for_each_user_mapping(
        &self,
        dir: DirId,
        f: &mut dyn FnMut(u32, u32, PageFlags),
    ) {
        let mut cursor = USER_BASE;
        while let Some((va, pa, fl)) = self.next_user_mapping(dir, cursor) {
            f(va, pa, fl);
            cursor = va + PAGE_SIZE as u32;
        }
    }

    /// Returns the lowest present user-half mapping at or above `from_va`,
    /// or `None`. Fork walks the parent space with this, one page at a
    /// time, without needing a mapping list anywhere.
    pub fn next_user_mapping(
        &self,
        dir: DirId,
        from_va: u32,
    ) -> Option<(u32, u32, PageFlags)> {
        let dir_frame = self.dir_frame(dir);
        let start = from_va.max(USER_BASE);
        for pde_idx in (start >> 22) as usize..ENTRIES {
            let mut pt = 0;
            self.with_table(dir_frame, |d| {
                if d[pde_idx] & PageFlags::PRESENT.bits() != 0 {
                    pt = page_round_down(d[pde_idx]);
                }
            });
            if pt == 0 {
                continue;
            }
            let first_pte = if pde_idx == (start >> 22) as usize {
                (start >> 12 & 0x3FF) as usize
            } else {
                0
            };
            let mut found = None;
            self.with_table(pt, |t| {
                for (pte_idx, &entry) in
                    t.iter().enumerate().skip(first_pte)
                {
                    if entry & PageFlags::PRESENT.bits() != 0 {
                        let va = ((pde_idx as u32) << 22)
                            | ((pte_idx as u32) << 12);
                        found = Some((
                            va,
                            page_round_down(entry),
                            PageFlags::from_bits_truncate(entry & 0xFFF),
                        ));
                        break;
                    }
                }
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Copies `n` bytes between arbitrary physical ranges through both
    /// scratch channels.
    pub fn copy_phys_to_phys(&mut self, dst: u32, src: u32, n: usize) {
        let prev = arch::interrupts_disable();
        let mut done = 0usize;
        while done < n {
            let s = src + done as u32;
            let d = dst + done as u32;
            let s_page = page_round_down(s);
            let d_page = page_round_down(d);
            let s_off = (s - s_page) as usize;
            let d_off = (d - d_page) as usize;
            let window = memmap::CTRL_SIZE as usize;
            let chunk = (n - done)
                .min(window - s_off)
                .min(window - d_off);

            let s_pages = (s_off + chunk).div_ceil(PAGE_SIZE);
            let d_pages = (d_off + chunk).div_ceil(PAGE_SIZE);
            let sp = arch::ctrl_map(0, s_page, s_pages);
            let dp = arch::ctrl_map(1, d_page, d_pages);
            // Safety: both windows were just mapped over the ranges we
            // touch, and the channels are held exclusively with interrupts
            // off.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    sp.add(s_off),
                    dp.add(d_off),
                    chunk,
                );
            }
            arch::ctrl_unmap(0);
            arch::ctrl_unmap(1);
            done += chunk;
        }
        arch::interrupts_restore(prev);
    }

    /// Copies `n` bytes from a kernel-visible virtual address into an
    /// arbitrary physical range through scratch channel 1.
    pub fn copy_virt_to_phys(&mut self, dst_phys: u32, src_va: u32, n: usize) {
        // Safety: callers pass ranges inside the mapped kernel region.
        let src = unsafe { arch::mem_slice(src_va, n) };
        self.fill_phys(dst_phys, src);
    }

    /// Writes `data` into an arbitrary physical range.
    pub fn fill_phys(&mut self, dst_phys: u32, data: &[u8]) {
        let prev = arch::interrupts_disable();
        let mut done = 0usize;
        while done < data.len() {
            let d = dst_phys + done as u32;
            let d_page = page_round_down(d);
            let d_off = (d - d_page) as usize;
            let window = memmap::CTRL_SIZE as usize;
            let chunk = (data.len() - done).min(window - d_off);
            let d_pages = (d_off + chunk).div_ceil(PAGE_SIZE);
            let dp = arch::ctrl_map(0, d_page, d_pages);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[done..].as_ptr(),
                    dp.add(d_off),
                    chunk,
                );
            }
            arch::ctrl_unmap(0);
            done += chunk;
        }
        arch::interrupts_restore(prev);
    }

    /// Fills `n` bytes of an arbitrary physical range with `byte`.
    pub fn set_phys(&mut self, dst: u32, byte: u8, n: usize) {
        let prev = arch::interrupts_disable();
        let mut done = 0usize;
        while done < n {
            let d = dst + done as u32;
            let d_page = page_round_down(d);
            let d_off = (d - d_page) as usize;
            let window = memmap::CTRL_SIZE as usize;
            let chunk = (n - done).min(window - d_off);
            let d_pages = (d_off + chunk).div_ceil(PAGE_SIZE);
            let dp = arch::ctrl_map(0, d_page, d_pages);
            unsafe {
                dp.add(d_off).write_bytes(byte, chunk);
            }
            arch::ctrl_unmap(0);
            done += chunk;
        }
        arch::interrupts_restore(prev);
    }

    /// Reads `n` bytes out of an arbitrary physical range. The inverse of
    /// `fill_phys`; fork uses it to seed copied frames and tests use it to
    /// observe them.
    pub fn read_phys(&self, src: u32, out: &mut [u8]) {
        let prev = arch::interrupts_disable();
        let mut done = 0usize;
        while done < out.len() {
            let s = src + done as u32;
            let s_page = page_round_down(s);
            let s_off = (s - s_page) as usize;
            let window = memmap::CTRL_SIZE as usize;
            let chunk = (out.len() - done).min(window - s_off);
            let s_pages = (s_off + chunk).div_ceil(PAGE_SIZE);
            let sp = arch::ctrl_map(0, s_page, s_pages);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    sp.add(s_off),
                    out[done..].as_mut_ptr(),
                    chunk,
                );
            }
            arch::ctrl_unmap(0);
            done += chunk;
        }
        arch::interrupts_restore(prev);
    }

    /// Runs `f` over the page-table frame at `frame`. Frames inside the
    /// identity region are touched directly; others through scratch
    /// channel 1.
    fn with_table<R>(
        &self,
        frame: u32,
        f: impl FnOnce(&mut [u32; ENTRIES]) -> R,
    ) -> R {
        uassert!(frame & 0xFFF == 0);
        if frame < self.identity_end || cfg!(not(target_os = "none")) {
            // Safety: identity region (or simulated physical memory).
            unsafe { f(&mut *(arch::mem_ptr(frame) as *mut [u32; ENTRIES])) }
        } else {
            let p = arch::ctrl_map(0, frame, 1);
            let r = unsafe { f(&mut *(p as *mut [u32; ENTRIES])) };
            arch::ctrl_unmap(0);
            r
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    const IDLE_PD: u32 = 0x0040_0000;
    const KPT_BASE: u32 = 0x0040_1000;
    const IDENTITY_END: u32 = 0x0100_0000;

    fn fresh() -> (PageMgr, PhysAllocator) {
        let mut pg = PageMgr::new();
        pg.init(IDLE_PD, KPT_BASE, IDENTITY_END);
        let phys = testutil::seeded_phys(0x0060_0000, 0x0080_0000);
        (pg, phys)
    }

    #[test]
    fn idle_directory_identity_maps_kernel_region() {
        let (pg, _) = fresh();
        let (pa, flags) = pg.walk(DIR_IDLE, 0x0012_3000).unwrap();
        assert_eq!(pa, 0x0012_3000);
        assert!(flags.contains(PageFlags::GLOBAL));
        assert!(flags.contains(PageFlags::RW));
        assert!(!flags.contains(PageFlags::USER));
        assert!(pg.walk(DIR_IDLE, USER_BASE).is_none());
    }

    #[test]
    fn new_directories_share_the_kernel_half() {
        let (mut pg, mut phys) = fresh();
        let d = pg.alloc_dir(&mut phys, 1).unwrap();
        let idle_frame = pg.dir_frame(DIR_IDLE);
        let new_frame = pg.dir_frame(d);
        let mut a = [0u8; 4 * KERNEL_PDE_COUNT];
        let mut b = [0u8; 4 * KERNEL_PDE_COUNT];
        pg.read_phys(idle_frame, &mut a);
        pg.read_phys(new_frame, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn map_unmap_round_trip_restores_directory() {
        let (mut pg, mut phys) = fresh();
        let d = pg.alloc_dir(&mut phys, 1).unwrap();
        let frame = pg.dir_frame(d);

        let mut before = [0u8; 4096];
        pg.read_phys(frame, &mut before);
        let free_before = phys.free_pages();

        let target = phys.alloc(0x3000).unwrap();
        pg.map(
            &mut phys,
            d,
            USER_BASE,
            target,
            0x2800, // rounds to 3 pages
            PageFlags::RW | PageFlags::USER,
        )
        .unwrap();
        assert_eq!(
            pg.walk(d, USER_BASE + 0x2000),
            Some((target + 0x2000, PageFlags::RW | PageFlags::USER | PageFlags::PRESENT)),
        );

        pg.unmap(&mut phys, d, USER_BASE, 0x2800);
        phys.free(target);

        let mut after = [0u8; 4096];
        pg.read_phys(frame, &mut after);
        assert_eq!(before[..], after[..]);
        assert_eq!(free_before, phys.free_pages());
    }

    #[test]
    fn mapping_failure_surfaces_no_memory() {
        let mut pg = PageMgr::new();
        pg.init(IDLE_PD, KPT_BASE, IDENTITY_END);
        // Pool with a single page: consumed by the directory itself.
        let mut phys = testutil::seeded_phys(0x0060_0000, 0x1000);
        let d = pg.alloc_dir(&mut phys, 1).unwrap();
        assert_eq!(
            pg.map(&mut phys, d, USER_BASE, 0x0060_0000, 0x1000, PageFlags::RW),
            Err(Error::NoMemory),
        );
    }

    #[test]
    fn phys_copy_and_set_round_trip() {
        let (mut pg, mut phys) = fresh();
        let a = phys.alloc(0x1000).unwrap();
        let b = phys.alloc(0x1000).unwrap();
        pg.set_phys(a, 0xAA, 0x1000);
        pg.set_phys(b, 0x00, 0x1000);
        pg.copy_phys_to_phys(b, a, 0x1000);
        let mut out = [0u8; 16];
        pg.read_phys(b + 0x800, &mut out);
        assert_eq!(out, [0xAA; 16]);
    }

    #[test]
    fn user_mapping_enumeration_sees_all_pages() {
        let (mut pg, mut phys) = fresh();
        let d = pg.alloc_dir(&mut phys, 1).unwrap();
        let f1 = phys.alloc(0x1000).unwrap();
        let f2 = phys.alloc(0x1000).unwrap();
        pg.map(&mut phys, d, USER_BASE, f1, 0x1000, PageFlags::RW | PageFlags::USER)
            .unwrap();
        pg.map(
            &mut phys,
            d,
            memmap::USER_STACK_BASE,
            f2,
            0x1000,
            PageFlags::RW | PageFlags::USER,
        )
        .unwrap();
        let mut seen = Vec::new();
        pg.for_each_user_mapping(d, &mut |va, pa, _| seen.push((va, pa)));
        assert_eq!(seen, vec![(USER_BASE, f1), (memmap::USER_STACK_BASE, f2)]);
    }
}
