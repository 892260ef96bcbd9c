// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task-name registry.

use crate::stubs::trap_taskname;
use crate::take_result;
use abi::{
    taskname, Error, ParamHeader, TaskId, TaskNameParam, TASKNAME_LEN_MAX,
};

fn call(func_id: u32, name: u32) -> TaskNameParam {
    let mut p = TaskNameParam {
        header: ParamHeader {
            func_id,
            err: 0,
            ret: 0,
        },
        task_id: TaskId::NONE,
        name,
    };
    unsafe {
        trap_taskname(&mut p as *mut _ as *mut u8);
    }
    p
}

/// Copies `name` into a NUL-terminated buffer the kernel can walk.
fn name_buf(name: &str) -> Result<[u8; TASKNAME_LEN_MAX + 1], Error> {
    if name.is_empty() || name.len() > TASKNAME_LEN_MAX {
        return Err(Error::Param);
    }
    let mut buf = [0u8; TASKNAME_LEN_MAX + 1];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(buf)
}

/// Registers the caller under `name`. Not available to user-class tasks.
pub fn register(name: &str) -> Result<(), Error> {
    let buf = name_buf(name)?;
    let p = call(taskname::FUNC_REGISTER, buf.as_ptr() as u32);
    take_result(&p.header)
}

/// Drops the caller's registration.
pub fn unregister() -> Result<(), Error> {
    let p = call(taskname::FUNC_UNREGISTER, 0);
    take_result(&p.header)
}

/// Looks up the task registered under `name`.
pub fn get(name: &str) -> Result<TaskId, Error> {
    let buf = name_buf(name)?;
    let p = call(taskname::FUNC_GET, buf.as_ptr() as u32);
    take_result(&p.header)?;
    Ok(p.task_id)
}
