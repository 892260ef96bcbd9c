// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `message` family: send, non-blocking send, receive.

use abi::{msg, Error, MsgParam};

use crate::arch::InterruptFrame;
use crate::ipc;
use crate::kernel::Kernel;

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<MsgParam>(k, frame, |k, caller, p| {
        match p.header.func_id {
            msg::FUNC_SEND => {
                ipc::send(k, caller, p.peer, p.buffer, p.size, true)
            }
            msg::FUNC_SEND_NB => {
                ipc::send(k, caller, p.peer, p.buffer, p.size, false)
            }
            msg::FUNC_RECEIVE => {
                let (src, n) =
                    ipc::recv(k, caller, p.peer, p.buffer, p.size, p.timeout_ms)?;
                p.peer = src;
                p.header.ret = n as i32;
                Ok(())
            }
            _ => Err(Error::Param.into()),
        }
    });
}
