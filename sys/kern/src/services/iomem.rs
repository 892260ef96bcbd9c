// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `io-memory` family. Driver tasks only.
//!
//! Allocation is three sub-steps -- claim the physical window, reserve a
//! virtual range, establish the mapping -- and each failure unwinds the
//! earlier steps in reverse order and reports which phase died.

use abi::memmap::page_round_up;
use abi::{iomem, Error, IoMemParam, TaskId};

use crate::arch::InterruptFrame;
use crate::err::UserError;
use crate::kernel::Kernel;
use crate::mm::page::PageFlags;

const CLAIM_NUM: usize = 32;

#[derive(Copy, Clone)]
struct Claim {
    used: bool,
    base: u32,
    size: u32,
    pid: u32,
}

const CLAIM_EMPTY: Claim = Claim {
    used: false,
    base: 0,
    size: 0,
    pid: 0,
};

/// Registry of claimed physical I/O windows, guarding devices against
/// concurrent claims from different processes.
pub struct IoClaims {
    claims: [Claim; CLAIM_NUM],
}

impl IoClaims {
    pub const fn new() -> Self {
        Self {
            claims: [CLAIM_EMPTY; CLAIM_NUM],
        }
    }

    /// Claims `[base, base+size)` for `pid`. Fails on any overlap with an
    /// existing claim or on table exhaustion.
    fn claim(&mut self, pid: u32, base: u32, size: u32) -> bool {
        let end = match base.checked_add(size) {
            Some(e) => e,
            None => return false,
        };
        if self
            .claims
            .iter()
            .any(|c| c.used && base < c.base + c.size && c.base < end)
        {
            return false;
        }
        match self.claims.iter_mut().find(|c| !c.used) {
            Some(slot) => {
                *slot = Claim {
                    used: true,
                    base,
                    size,
                    pid,
                };
                true
            }
            None => false,
        }
    }

    fn release(&mut self, pid: u32, base: u32) {
        for c in self.claims.iter_mut() {
            if c.used && c.pid == pid && c.base == base {
                *c = CLAIM_EMPTY;
                return;
            }
        }
    }
}

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<IoMemParam>(k, frame, |k, caller, p| {
        super::require_driver(k, caller)?;
        match p.header.func_id {
            iomem::FUNC_ALLOC => {
                p.virt = alloc(k, caller, p.phys, p.size)?;
                Ok(())
            }
            _ => Err(Error::Param.into()),
        }
    });
}

/// Produces a user-side window onto the physical range `[phys,
/// phys+size)`.
pub fn alloc(
    k: &mut Kernel,
    caller: TaskId,
    phys: u32,
    size: u32,
) -> Result<u32, UserError> {
    if size == 0 || phys & 0xFFF != 0 {
        return Err(Error::Param.into());
    }
    let size = page_round_up(size);
    let pid = caller.pid();

    if !k.iomem.claim(pid, phys, size) {
        return Err(Error::IoAlloc.into());
    }
    let virt = match k.tasks.proc_mut(pid).vaddr.alloc(size) {
        Some(v) => v,
        None => {
            k.iomem.release(pid, phys);
            return Err(Error::VirtAlloc.into());
        }
    };
    let dir = k.tasks.proc(pid).dir;
    if k
        .pages
        .map(
            &mut k.phys,
            dir,
            virt,
            phys,
            size,
            PageFlags::RW | PageFlags::USER,
        )
        .is_err()
    {
        k.tasks.proc_mut(pid).vaddr.free(virt);
        k.iomem.release(pid, phys);
        return Err(Error::PageSet.into());
    }
    Ok(virt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use abi::ProcType;

    #[test]
    fn alloc_maps_the_window_into_the_caller() {
        let k = testutil::boot_kernel();
        let d = testutil::spawn(k, ProcType::Driver);
        let virt = alloc(k, d, 0x000A_0000, 0x2000).unwrap();
        let dir = k.tasks.proc(d.pid()).dir;
        assert_eq!(
            k.pages.walk(dir, virt).map(|(pa, _)| pa),
            Some(0x000A_0000)
        );
        assert_eq!(
            k.pages.walk(dir, virt + 0x1000).map(|(pa, _)| pa),
            Some(0x000A_1000)
        );
    }

    #[test]
    fn conflicting_claims_fail_with_io_alloc() {
        let k = testutil::boot_kernel();
        let d1 = testutil::spawn(k, ProcType::Driver);
        let d2 = testutil::spawn(k, ProcType::Driver);
        alloc(k, d1, 0x000A_0000, 0x2000).unwrap();
        assert_eq!(
            alloc(k, d2, 0x000A_1000, 0x1000),
            Err(UserError::Recoverable(Error::IoAlloc))
        );
        // A disjoint window is fine.
        alloc(k, d2, 0x000B_0000, 0x1000).unwrap();
    }

    #[test]
    fn virt_alloc_failure_releases_the_claim() {
        let k = testutil::boot_kernel();
        let d = testutil::spawn(k, ProcType::Driver);
        // Exhaust the process's virtual range map.
        let total = {
            let p = k.tasks.proc_mut(d.pid());
            let mut total = 0;
            while p.vaddr.alloc(0x0010_0000).is_some() {
                total += 1;
            }
            total
        };
        assert!(total > 0);
        assert_eq!(
            alloc(k, d, 0x000A_0000, 0x0010_0000),
            Err(UserError::Recoverable(Error::VirtAlloc))
        );
        // The physical claim was rolled back: a second driver can take it.
        let d2 = testutil::spawn(k, ProcType::Driver);
        alloc(k, d2, 0x000A_0000, 0x1000).unwrap();
    }
}
