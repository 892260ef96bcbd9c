// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `timer` family: sleep.

use abi::{timer, Error, TimerParam};

use crate::arch::InterruptFrame;
use crate::kernel::Kernel;
use crate::time;

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<TimerParam>(k, frame, |k, caller, p| {
        match p.header.func_id {
            timer::FUNC_SLEEP => time::sleep(k, caller, p.usec),
            _ => Err(Error::Param.into()),
        }
    });
}
