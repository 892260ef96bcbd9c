// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-task support library.
//!
//! This contains the system-call stubs and typed wrappers, and re-exports
//! the contents of the `abi` crate that gets shared with the kernel.
//!
//! # Call convention
//!
//! Each wrapper builds the family's parameter block on the caller's
//! stack, loads its address into `ESI`, and issues the family's software
//! interrupt. The kernel fills `err`, `ret`, and the out-params in place
//! before the `int` returns; wrappers translate that into a `Result`.
//! The trap instruction needs its vector as an immediate, so each family
//! carries its own two-line stub.

#![no_std]

pub use abi::*;

pub mod intctl;
pub mod iomem;
pub mod ioport;
pub mod msg;
pub mod proc;
pub mod task;
pub mod taskname;
pub mod thread;
pub mod timer;

/// Emits the software-interrupt stub for one service family.
///
/// The block address travels in `ESI`; everything else is preserved by
/// the kernel's save/restore trampoline. The default memory clobber is
/// what lets the compiler see the kernel's in-place writes to the block.
macro_rules! family_trap {
    ($name:ident, $vector:expr) => {
        pub(crate) unsafe fn $name(block: *mut u8) {
            cfg_if::cfg_if! {
                if #[cfg(target_arch = "x86")] {
                    unsafe {
                        core::arch::asm!(
                            concat!("int ", stringify!($vector)),
                            in("esi") block,
                            options(nostack),
                        );
                    }
                } else {
                    let _ = block;
                    unimplemented!("syscalls only exist on the target");
                }
            }
        }
    };
}

pub(crate) mod stubs {
    family_trap!(trap_interrupt, 0x30);
    family_trap!(trap_iomem, 0x31);
    family_trap!(trap_ioport, 0x32);
    family_trap!(trap_message, 0x33);
    family_trap!(trap_process, 0x34);
    family_trap!(trap_task, 0x35);
    family_trap!(trap_taskname, 0x36);
    family_trap!(trap_thread, 0x37);
    family_trap!(trap_timer, 0x38);

    // The immediates above must track the assignments in `abi::vector`.
    const _: () = {
        assert!(abi::vector::INTERRUPT == 0x30);
        assert!(abi::vector::IOMEM == 0x31);
        assert!(abi::vector::IOPORT == 0x32);
        assert!(abi::vector::MESSAGE == 0x33);
        assert!(abi::vector::PROCESS == 0x34);
        assert!(abi::vector::TASK == 0x35);
        assert!(abi::vector::TASKNAME == 0x36);
        assert!(abi::vector::THREAD == 0x37);
        assert!(abi::vector::TIMER == 0x38);
    };
}

/// Converts a completed parameter block into the caller's `Result`.
pub(crate) fn take_result(header: &abi::ParamHeader) -> Result<(), Error> {
    if header.ret == abi::RET_FAILURE {
        Err(Error::try_from(header.err).unwrap_or(Error::Param))
    } else {
        Ok(())
    }
}
