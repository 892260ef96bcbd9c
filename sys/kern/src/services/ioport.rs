// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `io-port` family. Driver tasks only.
//!
//! Every single-width function transfers `count` units between the port
//! and the caller's buffer, in order. The bulk function batches up to
//! [`abi::IOPORT_BULK_MAX`] independent (port, direction, width, data)
//! entries in one trap; inputs are written back into the entry table.

use abi::{ioport, Error, IoPortBulkEntry, IoPortParam, TaskId};

use crate::arch::{self, InterruptFrame};
use crate::err::UserError;
use crate::kernel::Kernel;
use crate::umem;

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<IoPortParam>(k, frame, |k, caller, p| {
        super::require_driver(k, caller)?;
        match p.header.func_id {
            ioport::FUNC_IN_BYTE => transfer(k, caller, p, 1, false),
            ioport::FUNC_IN_WORD => transfer(k, caller, p, 2, false),
            ioport::FUNC_IN_DWORD => transfer(k, caller, p, 4, false),
            ioport::FUNC_OUT_BYTE => transfer(k, caller, p, 1, true),
            ioport::FUNC_OUT_WORD => transfer(k, caller, p, 2, true),
            ioport::FUNC_OUT_DWORD => transfer(k, caller, p, 4, true),
            ioport::FUNC_BULK => bulk(k, caller, p),
            _ => Err(Error::Param.into()),
        }
    });
}

fn port_in(port: u16, width: u8) -> u32 {
    match width {
        1 => arch::port_in8(port) as u32,
        2 => arch::port_in16(port) as u32,
        _ => arch::port_in32(port),
    }
}

fn port_out(port: u16, width: u8, value: u32) {
    match width {
        1 => arch::port_out8(port, value as u8),
        2 => arch::port_out16(port, value as u16),
        _ => arch::port_out32(port, value),
    }
}

/// Repeated single-port transfer, the string-I/O shape: `count` units
/// to or from consecutive buffer positions.
fn transfer(
    k: &mut Kernel,
    caller: TaskId,
    p: &mut IoPortParam,
    width: u8,
    out: bool,
) -> Result<(), UserError> {
    if p.count == 0 {
        return Err(Error::Param.into());
    }
    for i in 0..p.count {
        let va = p.data + i * width as u32;
        if out {
            let mut bytes = [0u8; 4];
            umem::read_bytes(k, caller, va, &mut bytes[..width as usize])?;
            port_out(p.port_no, width, u32::from_le_bytes(bytes));
        } else {
            let v = port_in(p.port_no, width).to_le_bytes();
            umem::write_bytes(k, caller, va, &v[..width as usize])?;
        }
    }
    Ok(())
}

fn bulk(
    k: &mut Kernel,
    caller: TaskId,
    p: &mut IoPortParam,
) -> Result<(), UserError> {
    if p.count == 0 || p.count as usize > abi::IOPORT_BULK_MAX {
        return Err(Error::Param.into());
    }
    let stride = core::mem::size_of::<IoPortBulkEntry>() as u32;

    // Validate the whole batch before touching any port.
    for i in 0..p.count {
        let e: IoPortBulkEntry =
            umem::read_obj(k, caller, p.data + i * stride)?;
        if !matches!(e.width, 1 | 2 | 4)
            || !matches!(e.dir, ioport::DIR_IN | ioport::DIR_OUT)
        {
            return Err(Error::Param.into());
        }
    }
    for i in 0..p.count {
        let va = p.data + i * stride;
        let mut e: IoPortBulkEntry = umem::read_obj(k, caller, va)?;
        if e.dir == ioport::DIR_OUT {
            port_out(e.port_no, e.width, e.data);
        } else {
            e.data = port_in(e.port_no, e.width);
            umem::write_obj(k, caller, va, &e)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{push_port_input, take_ops, HwOp};
    use crate::testutil::{self, user_buf, user_read, user_write};
    use abi::ProcType;

    #[test]
    fn out_transfers_walk_the_buffer() {
        let k = testutil::boot_kernel();
        let d = testutil::spawn(k, ProcType::Driver);
        let va = user_buf(k, d, 0x100, 8);
        user_write(k, d, va, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut p = IoPortParam {
            header: abi::ParamHeader {
                func_id: 0,
                err: 0,
                ret: 0,
            },
            port_no: 0x1F0,
            reserved: 0,
            data: va,
            count: 4,
        };
        let _ = take_ops();
        transfer(k, d, &mut p, 2, true).unwrap();
        let ops = take_ops();
        assert_eq!(
            ops,
            vec![
                HwOp::PortOut { port: 0x1F0, width: 2, value: 0x0201 },
                HwOp::PortOut { port: 0x1F0, width: 2, value: 0x0403 },
                HwOp::PortOut { port: 0x1F0, width: 2, value: 0x0605 },
                HwOp::PortOut { port: 0x1F0, width: 2, value: 0x0807 },
            ]
        );
    }

    #[test]
    fn in_transfers_fill_the_buffer() {
        let k = testutil::boot_kernel();
        let d = testutil::spawn(k, ProcType::Driver);
        let va = user_buf(k, d, 0x100, 4);
        push_port_input(0x11);
        push_port_input(0x22);
        let mut p = IoPortParam {
            header: abi::ParamHeader {
                func_id: 0,
                err: 0,
                ret: 0,
            },
            port_no: 0x60,
            reserved: 0,
            data: va,
            count: 2,
        };
        transfer(k, d, &mut p, 1, false).unwrap();
        assert_eq!(user_read(k, d, va, 2), [0x11, 0x22]);
    }

    #[test]
    fn bulk_mixes_directions_and_writes_inputs_back() {
        let k = testutil::boot_kernel();
        let d = testutil::spawn(k, ProcType::Driver);
        let va = user_buf(k, d, 0x200, 16);
        let entries = [
            IoPortBulkEntry {
                port_no: 0x3F8,
                dir: ioport::DIR_OUT,
                width: 1,
                data: 0x42,
            },
            IoPortBulkEntry {
                port_no: 0x3FD,
                dir: ioport::DIR_IN,
                width: 1,
                data: 0,
            },
        ];
        for (i, e) in entries.iter().enumerate() {
            umem::write_obj(k, d, va + (i * 8) as u32, e).unwrap();
        }
        push_port_input(0x60);
        let mut p = IoPortParam {
            header: abi::ParamHeader {
                func_id: 0,
                err: 0,
                ret: 0,
            },
            port_no: 0,
            reserved: 0,
            data: va,
            count: 2,
        };
        let _ = take_ops();
        bulk(k, d, &mut p).unwrap();
        let ops = take_ops();
        assert!(ops.contains(&HwOp::PortOut {
            port: 0x3F8,
            width: 1,
            value: 0x42
        }));
        let back: IoPortBulkEntry = umem::read_obj(k, d, va + 8).unwrap();
        assert_eq!(back.data, 0x60);
    }

    #[test]
    fn bulk_rejects_oversized_batches_and_bad_widths() {
        let k = testutil::boot_kernel();
        let d = testutil::spawn(k, ProcType::Driver);
        let va = user_buf(k, d, 0x200, 8);
        let mut p = IoPortParam {
            header: abi::ParamHeader {
                func_id: 0,
                err: 0,
                ret: 0,
            },
            port_no: 0,
            reserved: 0,
            data: va,
            count: abi::IOPORT_BULK_MAX as u32 + 1,
        };
        assert_eq!(
            bulk(k, d, &mut p),
            Err(UserError::Recoverable(Error::Param))
        );
        umem::write_obj(
            k,
            d,
            va,
            &IoPortBulkEntry {
                port_no: 0x80,
                dir: ioport::DIR_OUT,
                width: 3,
                data: 0,
            },
        )
        .unwrap();
        p.count = 1;
        let _ = take_ops();
        assert_eq!(
            bulk(k, d, &mut p),
            Err(UserError::Recoverable(Error::Param))
        );
        // Validation failed before any port was touched.
        assert!(take_ops().iter().all(|op| !matches!(
            op,
            HwOp::PortOut { .. } | HwOp::PortIn { .. }
        )));
    }
}
