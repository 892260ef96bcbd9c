// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed physical and virtual memory map shared with the boot loader.
//!
//! The loader links the kernel at [`KERNEL_BASE`], places the boot data and
//! the process-image blob at the physical addresses below, and enters the
//! kernel with paging disabled on a flat stack at [`KERNEL_STACK_TOP`]. The
//! kernel half of every address space reproduces this layout; the user half
//! starts at [`USER_BASE`].

/// Hardware page size, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Rounds `x` up to the next page boundary.
pub const fn page_round_up(x: u32) -> u32 {
    (x + (PAGE_SIZE as u32 - 1)) & !(PAGE_SIZE as u32 - 1)
}

/// Rounds `x` down to a page boundary.
pub const fn page_round_down(x: u32) -> u32 {
    x & !(PAGE_SIZE as u32 - 1)
}

/* Physical map. */

/// Physical load address and entry point of the kernel image.
pub const KERNEL_PHYS_BASE: u32 = 0x0010_0000;

/// Physical base of the boot-reserved debug log page(s).
pub const DEBUG_PHYS_BASE: u32 = 0x0500_0000;

/// Size of the debug log region.
pub const DEBUG_PHYS_SIZE: u32 = 0x0100_0000;

/// Physical frame holding the idle process's page directory.
pub const IDLE_PD_PHYS: u32 = 0x0600_0000;

/// Physical base of the block of page tables that back the kernel half.
/// These are shared by every directory in the system.
pub const KERNEL_PT_PHYS: u32 = 0x0600_1000;

/* Virtual map, kernel half. */

/// Virtual base of the kernel region. The kernel half is identity-mapped,
/// so this equals [`KERNEL_PHYS_BASE`].
pub const KERNEL_BASE: u32 = KERNEL_PHYS_BASE;

/// First byte past the kernel region proper; the scratch windows sit
/// between here and the user half.
pub const KERNEL_END: u32 = 0x3EFF_C000;

/// Initial stack pointer handed to the kernel by the loader.
pub const KERNEL_STACK_TOP: u32 = 0x3EFF_BFFC;

/// Scratch channel windows. Each can hold a mapping of up to
/// [`CTRL_SIZE`] bytes of arbitrary physical memory. The four page tables
/// backing them occupy the tail of the kernel page-table block at
/// [`KERNEL_PT_PHYS`], which is how the low-level channel code finds them
/// without any further bookkeeping.
pub const CTRL1_BASE: u32 = 0x3F00_0000;
pub const CTRL2_BASE: u32 = 0x3F80_0000;
pub const CTRL_SIZE: u32 = 0x0080_0000;

/* Virtual map, user half. */

/// Base of the user half. Everything below is kernel and identical across
/// address spaces.
pub const USER_BASE: u32 = 0x4000_0000;

/// Size of the user half.
pub const USER_SIZE: u32 = 0x8000_0000;

/// First byte past the user half.
pub const USER_END: u32 = USER_BASE.wrapping_add(USER_SIZE);

/// Base of the fixed user stack window.
pub const USER_STACK_BASE: u32 = 0xBFFF_8000;

/// Size of the user stack window.
pub const USER_STACK_SIZE: u32 = 0x0000_8000;

/// Checks whether `[addr, addr+size)` lies entirely inside the user half.
pub const fn user_range_ok(addr: u32, size: u32) -> bool {
    if size == 0 {
        return addr >= USER_BASE && addr < USER_END;
    }
    match addr.checked_add(size - 1) {
        Some(last) => addr >= USER_BASE && last < USER_END,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(1), 0x1000);
        assert_eq!(page_round_up(0x1000), 0x1000);
        assert_eq!(page_round_down(0x1fff), 0x1000);
    }

    #[test]
    fn user_range_bounds() {
        assert!(user_range_ok(USER_BASE, 0x1000));
        assert!(user_range_ok(USER_STACK_BASE, USER_STACK_SIZE));
        assert!(!user_range_ok(USER_BASE - 0x1000, 0x1000));
        assert!(!user_range_ok(0xFFFF_F000, 0x2000));
    }
}
