// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `process` family: fork and break-point adjustment.

use abi::{proc, Error, ProcParam};

use crate::arch::InterruptFrame;
use crate::kernel::Kernel;
use crate::task;

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<ProcParam>(k, frame, |k, caller, p| {
        match p.header.func_id {
            proc::FUNC_SET_BREAKPOINT => {
                let brk = task::set_break(k, caller, p.quantity)?;
                p.break_point = brk;
                Ok(())
            }
            proc::FUNC_FORK => {
                // Returns the child pid on the parent path; the child path
                // passes through here again when first scheduled and sees
                // zero.
                p.pid = task::proc_fork(k, caller)?;
                Ok(())
            }
            _ => Err(Error::Param.into()),
        }
    });
}
