// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `thread` family: create.

use abi::memmap::user_range_ok;
use abi::{thread, Error, ThreadParam};

use crate::arch::InterruptFrame;
use crate::kernel::Kernel;
use crate::task;

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<ThreadParam>(k, frame, |k, caller, p| {
        match p.header.func_id {
            thread::FUNC_CREATE => {
                if !user_range_ok(p.entry, 1)
                    || p.stack_size < 16
                    || !user_range_ok(p.stack_addr, p.stack_size)
                {
                    return Err(Error::Param.into());
                }
                let user_sp = p.stack_addr + p.stack_size - 16;
                let id =
                    task::create_thread(k, caller.pid(), p.entry, user_sp)?;
                p.task_id = id;
                Ok(())
            }
            _ => Err(Error::Param.into()),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ThreadState;
    use crate::testutil;
    use abi::memmap::USER_BASE;
    use abi::{ProcType, THREAD_NUM_PER_PROC};
    use crate::err::UserError;

    #[test]
    fn created_thread_is_scheduled_in_callers_process() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Server);
        let id = task::create_thread(
            k,
            t.pid(),
            USER_BASE + 0x100,
            USER_BASE + 0x2000,
        )
        .unwrap();
        assert_eq!(id.pid(), t.pid());
        assert_ne!(id.tid(), t.tid());
        assert_eq!(k.tasks.thread(id).state(), ThreadState::Ready);
    }

    #[test]
    fn thread_slots_are_bounded_per_process() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Server);
        // Slot 0 is taken by the initial thread.
        for _ in 1..THREAD_NUM_PER_PROC {
            task::create_thread(k, t.pid(), USER_BASE, USER_BASE + 0x1000)
                .unwrap();
        }
        assert_eq!(
            task::create_thread(k, t.pid(), USER_BASE, USER_BASE + 0x1000),
            Err(UserError::Recoverable(abi::Error::NoResource))
        );
    }
}
