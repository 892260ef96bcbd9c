// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! I/O-port access. Driver tasks only.

use crate::stubs::trap_ioport;
use crate::take_result;
use abi::{ioport, Error, IoPortBulkEntry, IoPortParam, ParamHeader};

fn call(func_id: u32, port_no: u16, data: u32, count: u32) -> IoPortParam {
    let mut p = IoPortParam {
        header: ParamHeader {
            func_id,
            err: 0,
            ret: 0,
        },
        port_no,
        reserved: 0,
        data,
        count,
    };
    unsafe {
        trap_ioport(&mut p as *mut _ as *mut u8);
    }
    p
}

/// Reads `buf.len()` bytes from `port` into `buf`.
pub fn in_byte(port: u16, buf: &mut [u8]) -> Result<(), Error> {
    let p = call(
        ioport::FUNC_IN_BYTE,
        port,
        buf.as_mut_ptr() as u32,
        buf.len() as u32,
    );
    take_result(&p.header)
}

/// Reads `buf.len()` words from `port` into `buf`.
pub fn in_word(port: u16, buf: &mut [u16]) -> Result<(), Error> {
    let p = call(
        ioport::FUNC_IN_WORD,
        port,
        buf.as_mut_ptr() as u32,
        buf.len() as u32,
    );
    take_result(&p.header)
}

/// Reads `buf.len()` double words from `port` into `buf`.
pub fn in_dword(port: u16, buf: &mut [u32]) -> Result<(), Error> {
    let p = call(
        ioport::FUNC_IN_DWORD,
        port,
        buf.as_mut_ptr() as u32,
        buf.len() as u32,
    );
    take_result(&p.header)
}

/// Writes every byte of `data` to `port`, in order.
pub fn out_byte(port: u16, data: &[u8]) -> Result<(), Error> {
    let p = call(
        ioport::FUNC_OUT_BYTE,
        port,
        data.as_ptr() as u32,
        data.len() as u32,
    );
    take_result(&p.header)
}

/// Writes every word of `data` to `port`, in order.
pub fn out_word(port: u16, data: &[u16]) -> Result<(), Error> {
    let p = call(
        ioport::FUNC_OUT_WORD,
        port,
        data.as_ptr() as u32,
        data.len() as u32,
    );
    take_result(&p.header)
}

/// Writes every double word of `data` to `port`, in order.
pub fn out_dword(port: u16, data: &[u32]) -> Result<(), Error> {
    let p = call(
        ioport::FUNC_OUT_DWORD,
        port,
        data.as_ptr() as u32,
        data.len() as u32,
    );
    take_result(&p.header)
}

/// Runs a batch of independent transfers in one trap. Input entries have
/// their `data` fields rewritten with the value read.
pub fn bulk(entries: &mut [IoPortBulkEntry]) -> Result<(), Error> {
    let p = call(
        ioport::FUNC_BULK,
        0,
        entries.as_mut_ptr() as u32,
        entries.len() as u32,
    );
    take_result(&p.header)
}
