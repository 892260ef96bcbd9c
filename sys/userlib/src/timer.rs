// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Timer services.

use crate::stubs::trap_timer;
use crate::take_result;
use abi::{timer, Error, ParamHeader, TimerParam};

/// Sleeps for at least `usec` microseconds, rounded down to whole kernel
/// ticks.
pub fn sleep(usec: u32) -> Result<(), Error> {
    let mut p = TimerParam {
        header: ParamHeader {
            func_id: timer::FUNC_SLEEP,
            err: 0,
            ret: 0,
        },
        usec,
    };
    unsafe {
        trap_timer(&mut p as *mut _ as *mut u8);
    }
    take_result(&p.header)
}
