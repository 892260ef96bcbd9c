// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message passing.

use crate::stubs::trap_message;
use crate::take_result;
use abi::{msg, Error, MsgParam, ParamHeader, TaskId};

fn call(func_id: u32, peer: TaskId, buf: u32, size: u32, timeout_ms: u32) -> MsgParam {
    let mut p = MsgParam {
        header: ParamHeader {
            func_id,
            err: 0,
            ret: 0,
        },
        peer,
        buffer: buf,
        size,
        timeout_ms,
    };
    unsafe {
        trap_message(&mut p as *mut _ as *mut u8);
    }
    p
}

/// Sends `data` to `dst` and waits until the receiver has consumed it.
pub fn send(dst: TaskId, data: &[u8]) -> Result<(), Error> {
    let p = call(
        msg::FUNC_SEND,
        dst,
        data.as_ptr() as u32,
        data.len() as u32,
        0,
    );
    take_result(&p.header)
}

/// Queues `data` for `dst` and returns immediately. The payload is copied
/// out before the call returns; the buffer is free to reuse.
pub fn send_nb(dst: TaskId, data: &[u8]) -> Result<(), Error> {
    let p = call(
        msg::FUNC_SEND_NB,
        dst,
        data.as_ptr() as u32,
        data.len() as u32,
        0,
    );
    take_result(&p.header)
}

/// Receives a message into `buf`. `src` filters to one sender; `None`
/// accepts anyone. With a timeout, `Ok(None)` reports expiry.
///
/// Returns the sender and the number of bytes copied (the message is
/// truncated to `buf`).
pub fn receive(
    src: Option<TaskId>,
    buf: &mut [u8],
    timeout_ms: Option<u32>,
) -> Result<Option<(TaskId, usize)>, Error> {
    let p = call(
        msg::FUNC_RECEIVE,
        src.unwrap_or(TaskId::NONE),
        buf.as_mut_ptr() as u32,
        buf.len() as u32,
        timeout_ms.unwrap_or(0),
    );
    take_result(&p.header)?;
    if p.peer == TaskId::NONE {
        return Ok(None);
    }
    Ok(Some((p.peer, p.header.ret as usize)))
}
