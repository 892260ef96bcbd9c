// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process control: fork and break-point adjustment.

use crate::stubs::trap_process;
use crate::take_result;
use abi::{proc, Error, ParamHeader, ProcParam};

fn call(func_id: u32, quantity: i32) -> ProcParam {
    let mut p = ProcParam {
        header: ParamHeader {
            func_id,
            err: 0,
            ret: 0,
        },
        quantity,
        break_point: 0,
        pid: 0,
    };
    unsafe {
        trap_process(&mut p as *mut _ as *mut u8);
    }
    p
}

/// Moves the caller's break by `quantity` bytes (negative shrinks) and
/// returns the new break address.
pub fn set_break_point(quantity: i32) -> Result<u32, Error> {
    let p = call(proc::FUNC_SET_BREAKPOINT, quantity);
    take_result(&p.header)?;
    Ok(p.break_point)
}

/// Forks the calling process. The parent gets the child's pid; the child
/// gets zero.
pub fn fork() -> Result<u32, Error> {
    let p = call(proc::FUNC_FORK, 0);
    take_result(&p.header)?;
    Ok(p.pid)
}
