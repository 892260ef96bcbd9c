// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! I/O-memory windows. Driver tasks only.

use crate::stubs::trap_iomem;
use crate::take_result;
use abi::{iomem, Error, IoMemParam, ParamHeader};

/// Maps the physical window `[phys, phys+size)` into the caller and
/// returns the virtual base.
pub fn alloc(phys: u32, size: u32) -> Result<u32, Error> {
    let mut p = IoMemParam {
        header: ParamHeader {
            func_id: iomem::FUNC_ALLOC,
            err: 0,
            ret: 0,
        },
        phys,
        size,
        virt: 0,
    };
    unsafe {
        trap_iomem(&mut p as *mut _ as *mut u8);
    }
    take_result(&p.header)?;
    Ok(p.virt)
}
