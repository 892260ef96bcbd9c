// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, tailored for the current target. For this to work,
//! each architecture support module must define the same set of names.
//!
//! The `x86` module drives the real machine. The `host` module backs the
//! same surface with a simulated machine -- a per-thread memory arena and
//! recorded hardware operations -- so the rest of the kernel runs as
//! ordinary code under `cargo test`.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        #[macro_use]
        pub mod x86;
        pub use x86::*;
    } else {
        #[macro_use]
        pub mod host;
        pub use host::*;
    }
}

/// Saved context of a suspended thread: just enough to resume after a
/// voluntary switch. Every switch resumes at a kernel-text address, so no
/// other register survives by design; `eax` is the exception, carrying the
/// return value a resumed `fork_capture` observes.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct Context {
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    pub eax: u32,
}

/// Register snapshot built by the common interrupt trampoline. Field order
/// matches the push sequence in `interrupt_entry_common`, lowest address
/// first.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only valid when the interrupt arrived from ring 3.
    pub user_esp: u32,
    pub ss: u32,
}

impl InterruptFrame {
    /// Checks whether the interrupted code was running in user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 3 != 0
    }
}

// The switch primitive stores through these by fixed offset.
static_assertions::const_assert_eq!(core::mem::size_of::<Context>(), 16);
