// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The system-call surface.
//!
//! One software-interrupt vector per service family; user code puts the
//! address of a parameter block in `ESI` and traps. The family handler
//! pulls the block out of the caller's memory, routes on `func_id`, and
//! writes `ret`/`err` (plus family out-params) back in place. Recoverable
//! errors become an `err` number with all other state untouched; a caller
//! that hands over a bad block is halted, not argued with.

use abi::{vector, Error, ParamHeader, TaskId, RET_FAILURE, RET_SUCCESS};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::arch::InterruptFrame;
use crate::err::UserError;
use crate::interrupt::hdl_set;
use crate::kernel::Kernel;
use crate::task;
use crate::umem;

pub mod intmng;
pub mod iomem;
pub mod ioport;
pub mod msg;
pub mod proc;
pub mod taskname;
pub mod thread;
pub mod timer;

/// A family parameter block: starts with the common header.
pub(crate) trait Param:
    FromBytes + IntoBytes + Immutable + Copy
{
    fn header_mut(&mut self) -> &mut ParamHeader;
}

macro_rules! impl_param {
    ($($t:ty),* $(,)?) => {
        $(impl Param for $t {
            fn header_mut(&mut self) -> &mut ParamHeader {
                &mut self.header
            }
        })*
    };
}

impl_param!(
    abi::IntParam,
    abi::IoMemParam,
    abi::IoPortParam,
    abi::MsgParam,
    abi::ProcParam,
    abi::TaskNameParam,
    abi::TaskParam,
    abi::ThreadParam,
    abi::TimerParam,
);

/// Installs every family handler, gates opened to ring 3.
pub fn install(k: &mut Kernel) {
    hdl_set(k, vector::INTERRUPT, intmng::handler, 3);
    hdl_set(k, vector::IOMEM, iomem::handler, 3);
    hdl_set(k, vector::IOPORT, ioport::handler, 3);
    hdl_set(k, vector::MESSAGE, msg::handler, 3);
    hdl_set(k, vector::PROCESS, proc::handler, 3);
    hdl_set(k, vector::TASK, task_handler, 3);
    hdl_set(k, vector::TASKNAME, taskname::handler, 3);
    hdl_set(k, vector::THREAD, thread::handler, 3);
    hdl_set(k, vector::TIMER, timer::handler, 3);
}

/// Common dispatch: block in, route, result out.
pub(crate) fn dispatch<T: Param>(
    k: &mut Kernel,
    frame: &mut InterruptFrame,
    route: impl FnOnce(&mut Kernel, TaskId, &mut T) -> Result<(), UserError>,
) {
    let caller = k.sched.current();
    let block_va = frame.esi;

    let mut p: T = match umem::read_obj(k, caller, block_va) {
        Ok(p) => p,
        Err(fault) => {
            task::halt(k, caller, fault);
            return;
        }
    };
    p.header_mut().err = Error::None as u32;
    p.header_mut().ret = RET_FAILURE;

    match route(k, caller, &mut p) {
        Ok(()) => {
            let h = p.header_mut();
            if h.ret == RET_FAILURE {
                h.ret = RET_SUCCESS;
            }
        }
        Err(UserError::Recoverable(e)) => {
            p.header_mut().err = e as u32;
        }
        Err(UserError::Unrecoverable(fault)) => {
            task::halt(k, caller, fault);
            return;
        }
    }

    if let Err(fault) = umem::write_obj(k, caller, block_va, &p) {
        task::halt(k, caller, fault);
    }
}

/// The `task` family: get-id is its whole surface.
pub fn task_handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    dispatch::<abi::TaskParam>(k, frame, |_k, caller, p| {
        match p.header.func_id {
            abi::task::FUNC_GET_ID => {
                p.task_id = caller;
                Ok(())
            }
            _ => Err(Error::Param.into()),
        }
    });
}

/// Authority check shared by the driver-only families.
pub(crate) fn require_driver(
    k: &Kernel,
    caller: TaskId,
) -> Result<(), UserError> {
    if k.tasks.ptype_of(caller) != abi::ProcType::Driver {
        return Err(Error::Unauthorized.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, user_buf};
    use abi::ProcType;

    #[test]
    fn dispatch_fills_result_fields_in_place() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Server);
        crate::sched::exec(k);
        assert_eq!(k.sched.current(), t);

        let va = user_buf(k, t, 0x100, 64);
        let p = abi::TaskParam {
            header: ParamHeader {
                func_id: abi::task::FUNC_GET_ID,
                err: 0xFFFF,
                ret: 77,
            },
            task_id: TaskId::NONE,
        };
        umem::write_obj(k, t, va, &p).unwrap();

        let mut frame = InterruptFrame {
            esi: va,
            cs: 0x1B,
            ..Default::default()
        };
        task_handler(k, abi::vector::TASK, &mut frame);

        let out: abi::TaskParam = umem::read_obj(k, t, va).unwrap();
        assert_eq!(out.header.ret, RET_SUCCESS);
        assert_eq!(out.header.err, Error::None as u32);
        assert_eq!(out.task_id, t);
    }

    #[test]
    fn bad_func_id_reports_param_error() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Server);
        crate::sched::exec(k);

        let va = user_buf(k, t, 0x100, 64);
        let p = abi::TaskParam {
            header: ParamHeader {
                func_id: 0x99,
                err: 0,
                ret: 0,
            },
            task_id: TaskId::NONE,
        };
        umem::write_obj(k, t, va, &p).unwrap();
        let mut frame = InterruptFrame {
            esi: va,
            cs: 0x1B,
            ..Default::default()
        };
        task_handler(k, abi::vector::TASK, &mut frame);
        let out: abi::TaskParam = umem::read_obj(k, t, va).unwrap();
        assert_eq!(out.header.ret, RET_FAILURE);
        assert_eq!(out.header.err, Error::Param as u32);
    }

    #[test]
    fn unmapped_param_block_halts_the_caller() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::User);
        crate::sched::exec(k);
        assert_eq!(k.sched.current(), t);

        let mut frame = InterruptFrame {
            esi: abi::memmap::USER_BASE + 0x9000, // never mapped
            cs: 0x1B,
            ..Default::default()
        };
        task_handler(k, abi::vector::TASK, &mut frame);
        assert_eq!(
            k.tasks.thread(t).state(),
            crate::task::ThreadState::Waiting
        );
    }
}
