// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware-interrupt monitoring. Driver tasks only.

use crate::stubs::trap_interrupt;
use crate::take_result;
use abi::{int, Error, IntParam, ParamHeader};

fn call(func_id: u32, irq_no: u32) -> IntParam {
    let mut p = IntParam {
        header: ParamHeader {
            func_id,
            err: 0,
            ret: 0,
        },
        irq_no,
        flags: 0,
    };
    unsafe {
        trap_interrupt(&mut p as *mut _ as *mut u8);
    }
    p
}

/// Claims an IRQ line and unmasks it.
pub fn start_monitoring(irq: u8) -> Result<(), Error> {
    take_result(&call(int::FUNC_START_MONITORING, irq as u32).header)
}

/// Releases an IRQ line and masks it.
pub fn stop_monitoring(irq: u8) -> Result<(), Error> {
    take_result(&call(int::FUNC_STOP_MONITORING, irq as u32).header)
}

/// Blocks until one of the caller's monitored lines fires; returns the
/// pending bitmap, cleared in the kernel.
pub fn wait() -> Result<u16, Error> {
    let p = call(int::FUNC_WAIT, 0);
    take_result(&p.header)?;
    Ok(p.flags as u16)
}

/// Acknowledges a serviced interrupt and re-enables the line.
pub fn complete(irq: u8) -> Result<(), Error> {
    take_result(&call(int::FUNC_COMPLETE, irq as u32).header)
}

/// Unmasks a monitored line.
pub fn enable(irq: u8) -> Result<(), Error> {
    take_result(&call(int::FUNC_ENABLE, irq as u32).header)
}

/// Masks a monitored line.
pub fn disable(irq: u8) -> Result<(), Error> {
    take_result(&call(int::FUNC_DISABLE, irq as u32).header)
}
