// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task identity.

use crate::stubs::trap_task;
use crate::take_result;
use abi::{task, Error, ParamHeader, TaskId, TaskParam};

/// The caller's own task id.
pub fn get_id() -> Result<TaskId, Error> {
    let mut p = TaskParam {
        header: ParamHeader {
            func_id: task::FUNC_GET_ID,
            err: 0,
            ret: 0,
        },
        task_id: TaskId::NONE,
    };
    unsafe {
        trap_task(&mut p as *mut _ as *mut u8);
    }
    take_result(&p.header)?;
    Ok(p.task_id)
}
