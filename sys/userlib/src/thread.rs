// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread creation.

use crate::stubs::trap_thread;
use crate::take_result;
use abi::{thread, Error, ParamHeader, TaskId, ThreadParam};

/// Starts a new thread of the calling process at `entry`, on the caller-
/// provided stack. The stack must stay alive for the thread's lifetime.
pub fn create(
    entry: extern "C" fn() -> !,
    stack: &'static mut [u8],
) -> Result<TaskId, Error> {
    let mut p = ThreadParam {
        header: ParamHeader {
            func_id: thread::FUNC_CREATE,
            err: 0,
            ret: 0,
        },
        entry: entry as usize as u32,
        stack_addr: stack.as_mut_ptr() as u32,
        stack_size: stack.len() as u32,
        task_id: TaskId::NONE,
    };
    unsafe {
        trap_thread(&mut p as *mut _ as *mut u8);
    }
    take_result(&p.header)?;
    Ok(p.task_id)
}
