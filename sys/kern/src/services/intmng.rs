// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `interrupt` family: the user-space face of IRQ monitoring.
//! Driver tasks only; the state machine itself lives in `interrupt`.

use abi::{int, Error, IntParam};

use crate::arch::InterruptFrame;
use crate::interrupt;
use crate::kernel::Kernel;

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<IntParam>(k, frame, |k, caller, p| {
        super::require_driver(k, caller)?;
        match p.header.func_id {
            int::FUNC_START_MONITORING => {
                interrupt::start_monitoring(k, caller, p.irq_no)
            }
            int::FUNC_STOP_MONITORING => {
                interrupt::stop_monitoring(k, caller, p.irq_no)
            }
            int::FUNC_WAIT => {
                p.flags = interrupt::wait(k, caller)? as u32;
                Ok(())
            }
            int::FUNC_COMPLETE => interrupt::complete(k, caller, p.irq_no),
            int::FUNC_ENABLE => interrupt::enable(k, caller, p.irq_no),
            int::FUNC_DISABLE => interrupt::disable(k, caller, p.irq_no),
            _ => Err(Error::Param.into()),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::UserError;
    use crate::testutil;
    use abi::ProcType;

    #[test]
    fn non_driver_callers_are_unauthorized() {
        let k = testutil::boot_kernel();
        for ptype in [ProcType::Server, ProcType::User] {
            let t = testutil::spawn(k, ptype);
            assert_eq!(
                super::super::require_driver(k, t),
                Err(UserError::Recoverable(Error::Unauthorized))
            );
        }
        let d = testutil::spawn(k, ProcType::Driver);
        assert!(super::super::require_driver(k, d).is_ok());
    }
}
