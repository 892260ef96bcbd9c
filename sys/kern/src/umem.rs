// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Safely interacting with untrusted user memory.
//!
//! A task hands the kernel addresses -- parameter blocks, message
//! payloads, port-transfer buffers. An address is an *allegation*: before
//! touching it the kernel checks that the range lies in the caller's half
//! of the address space and that every page of it is actually mapped there
//! (writably, for writes). Only then is the memory read or written, through
//! the live mapping.

use abi::memmap::{page_round_down, user_range_ok, PAGE_SIZE, USER_END};
use abi::{ProcType, TaskId};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::arch;
use crate::err::FaultInfo;
use crate::kernel::Kernel;
use crate::mm::page::PageFlags;

/// Checks that `[va, va+len)` is accessible to `caller` -- inside its
/// legal address range and fully mapped, with write permission when
/// `write` is set. Kernel-class tasks may also name kernel addresses; the
/// kernel half is mapped identically everywhere, so only the range check
/// differs for them.
fn can_access(
    k: &Kernel,
    caller: TaskId,
    va: u32,
    len: usize,
    write: bool,
) -> bool {
    if len == 0 {
        return true;
    }
    let ptype = k.tasks.ptype_of(caller);
    let end = match va.checked_add(len as u32 - 1) {
        Some(e) => e,
        None => return false,
    };
    let range_ok = match ptype {
        // Kernel tasks run in the kernel half; null page stays off-limits.
        ProcType::Kernel => va >= PAGE_SIZE as u32 && end < USER_END,
        _ => user_range_ok(va, len as u32),
    };
    if !range_ok {
        return false;
    }
    if ptype == ProcType::Kernel {
        return true;
    }

    let dir = k.tasks.proc(caller.pid()).dir;
    let mut page = page_round_down(va);
    loop {
        match k.pages.walk(dir, page) {
            Some((_, flags)) => {
                if write && !flags.contains(PageFlags::RW) {
                    return false;
                }
                if !flags.contains(PageFlags::USER) {
                    return false;
                }
            }
            None => return false,
        }
        if page >= page_round_down(end) {
            return true;
        }
        page += PAGE_SIZE as u32;
    }
}

fn fault(va: u32) -> FaultInfo {
    FaultInfo::MemoryAccess { address: Some(va) }
}

/// Copies `out.len()` bytes of `caller`'s memory at `va` into `out`.
pub fn read_bytes(
    k: &Kernel,
    caller: TaskId,
    va: u32,
    out: &mut [u8],
) -> Result<(), FaultInfo> {
    if !can_access(k, caller, va, out.len(), false) {
        return Err(fault(va));
    }
    // Safety: the range was just validated against the caller's space,
    // which is the active one (or kernel memory).
    let src = unsafe { arch::mem_slice(va, out.len()) };
    out.copy_from_slice(src);
    Ok(())
}

/// Copies `data` into `caller`'s memory at `va`.
pub fn write_bytes(
    k: &Kernel,
    caller: TaskId,
    va: u32,
    data: &[u8],
) -> Result<(), FaultInfo> {
    if !can_access(k, caller, va, data.len(), true) {
        return Err(fault(va));
    }
    // Safety: as in read_bytes, plus write permission.
    let dst = unsafe { arch::mem_slice(va, data.len()) };
    dst.copy_from_slice(data);
    Ok(())
}

/// Reads a `T` out of `caller`'s memory. Alignment is not required of the
/// user address; the bytes are copied out.
pub fn read_obj<T: FromBytes>(
    k: &Kernel,
    caller: TaskId,
    va: u32,
) -> Result<T, FaultInfo> {
    if !can_access(k, caller, va, core::mem::size_of::<T>(), false) {
        return Err(fault(va));
    }
    let src =
        unsafe { arch::mem_slice(va, core::mem::size_of::<T>()) };
    T::read_from_bytes(src).map_err(|_| fault(va))
}

/// Writes a `T` into `caller`'s memory.
pub fn write_obj<T: IntoBytes + Immutable>(
    k: &Kernel,
    caller: TaskId,
    va: u32,
    val: &T,
) -> Result<(), FaultInfo> {
    write_bytes(k, caller, va, val.as_bytes())
}

/// Reads a NUL-terminated string of at most `cap` payload bytes into
/// `out`, returning its length. Overlong or unterminated input is an
/// access fault from the caller's point of view.
pub fn read_cstr(
    k: &Kernel,
    caller: TaskId,
    va: u32,
    out: &mut [u8],
) -> Result<usize, FaultInfo> {
    for i in 0..out.len() {
        let mut b = [0u8];
        read_bytes(k, caller, va + i as u32, &mut b)?;
        if b[0] == 0 {
            return Ok(i);
        }
        out[i] = b[0];
    }
    Err(fault(va))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, user_buf};
    use abi::memmap::USER_BASE;
    use abi::ProcType;

    #[test]
    fn unmapped_user_memory_is_rejected() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::User);
        let mut out = [0u8; 4];
        assert!(read_bytes(k, t, USER_BASE + 0x7000, &mut out).is_err());
    }

    #[test]
    fn kernel_half_addresses_are_rejected_for_user_tasks() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::User);
        let mut out = [0u8; 4];
        assert!(read_bytes(k, t, 0x0010_0000, &mut out).is_err());
    }

    #[test]
    fn mapped_round_trip_works_and_respects_page_spans() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Server);
        let va = user_buf(k, t, 0xFF0, 0x20); // spans a page boundary
        write_bytes(k, t, va, b"0123456789abcdef0123456789abcdef").unwrap();
        let mut out = [0u8; 32];
        read_bytes(k, t, va, &mut out).unwrap();
        assert_eq!(&out, b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn read_only_mappings_refuse_writes() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Server);
        let va = testutil::user_buf_ro(k, t, 0x3000, 0x10);
        let mut out = [0u8; 4];
        assert!(read_bytes(k, t, va, &mut out).is_ok());
        assert!(write_bytes(k, t, va, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn cstr_reads_stop_at_nul_and_cap() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Server);
        let va = user_buf(k, t, 0x5000, 0x20);
        write_bytes(k, t, va, b"disk\0junk").unwrap();
        let mut name = [0u8; 16];
        assert_eq!(read_cstr(k, t, va, &mut name), Ok(4));
        assert_eq!(&name[..4], b"disk");

        write_bytes(k, t, va, &[b'x'; 0x20]).unwrap();
        let mut small = [0u8; 8];
        assert!(read_cstr(k, t, va, &mut small).is_err());
    }
}
