// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated machine for host builds.
//!
//! Physical memory is a lazily allocated per-thread arena; two fixed windows
//! of the 32-bit address space are backed by it, one for "physical" memory
//! (which the identity-mapped kernel half also resolves through) and one for
//! user addresses. Hardware side effects -- interrupt controller writes,
//! port I/O, context switches, PDBR loads -- are recorded where tests can
//! inspect them. Each test thread gets a fresh machine.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::kernel::Kernel;

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel assertion failed");
        }
    };
}

/// Kernel log. On the host this forwards to stderr under test and is
/// swallowed otherwise.
macro_rules! klog {
    ($($tt:tt)*) => {
        $crate::arch::klog_write(core::format_args!($($tt)*))
    };
}

#[cfg(test)]
pub fn klog_write(args: core::fmt::Arguments<'_>) {
    eprintln!("kern: {args}");
}

#[cfg(not(test))]
pub fn klog_write(_args: core::fmt::Arguments<'_>) {}

/// Window of the 32-bit space treated as physical memory (and, because the
/// kernel half is identity-mapped, as kernel virtual memory too).
pub const PHYS_WINDOW_BASE: u32 = 0;
pub const PHYS_WINDOW_SIZE: u32 = 0x0100_0000;

/// Window of the 32-bit space treated as mapped user memory.
pub const USER_WINDOW_BASE: u32 = 0x4000_0000;
pub const USER_WINDOW_SIZE: u32 = 0x0100_0000;

/// Kernel image end stand-in, used to seed the heap break.
pub fn kernel_image_end() -> u32 {
    0x0030_0000
}

#[cfg(test)]
mod machine {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    /// One recorded hardware operation.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum HwOp {
        IrqAllow(u8),
        IrqDeny(u8),
        IrqEoi(u8),
        IrqEnableAll,
        IrqDisableAll,
        PortIn { port: u16, width: u8 },
        PortOut { port: u16, width: u8, value: u32 },
        SetPdbr(u32),
        SetEsp0(u32),
        IdtGate { vector: u8, dpl: u8 },
        Switch { pdbr: u32 },
    }

    pub struct Machine {
        pub mem: RefCell<Option<Box<[u8]>>>,
        pub msg: RefCell<Option<Box<[u8]>>>,
        pub ops: RefCell<Vec<HwOp>>,
        pub port_input: RefCell<VecDeque<u32>>,
        pub pdbr: Cell<u32>,
        pub int_enabled: Cell<bool>,
    }

    std::thread_local! {
        pub static MACHINE: Machine = Machine {
            mem: RefCell::new(None),
            msg: RefCell::new(None),
            ops: RefCell::new(Vec::new()),
            port_input: RefCell::new(VecDeque::new()),
            pdbr: Cell::new(0),
            int_enabled: Cell::new(false),
        };
    }

    pub fn record(op: HwOp) {
        MACHINE.with(|m| m.ops.borrow_mut().push(op));
    }

    /// Returns the operations recorded so far, clearing the log.
    pub fn take_ops() -> Vec<HwOp> {
        MACHINE.with(|m| std::mem::take(&mut *m.ops.borrow_mut()))
    }

    /// Queues a value to be returned by the next port input.
    pub fn push_port_input(v: u32) {
        MACHINE.with(|m| m.port_input.borrow_mut().push_back(v));
    }

    pub fn pop_port_input() -> u32 {
        MACHINE.with(|m| m.port_input.borrow_mut().pop_front().unwrap_or(0))
    }

    pub fn arena_ptr(which: Which, len: usize) -> *mut u8 {
        MACHINE.with(|m| {
            let cell = match which {
                Which::Mem => &m.mem,
                Which::Msg => &m.msg,
            };
            let mut slot = cell.borrow_mut();
            let buf = slot
                .get_or_insert_with(|| vec![0u8; len].into_boxed_slice());
            buf.as_mut_ptr()
        })
    }

    #[derive(Copy, Clone)]
    pub enum Which {
        Mem,
        Msg,
    }
}

#[cfg(test)]
pub use machine::{take_ops, push_port_input, HwOp};

#[cfg(test)]
fn translate(addr: u32) -> *mut u8 {
    let mem_len = (PHYS_WINDOW_SIZE + USER_WINDOW_SIZE) as usize;
    let base = machine::arena_ptr(machine::Which::Mem, mem_len);
    if addr >= PHYS_WINDOW_BASE
        && addr < PHYS_WINDOW_BASE + PHYS_WINDOW_SIZE
    {
        // Safety: in-bounds offset of the arena allocation.
        unsafe { base.add((addr - PHYS_WINDOW_BASE) as usize) }
    } else if addr >= USER_WINDOW_BASE
        && addr < USER_WINDOW_BASE + USER_WINDOW_SIZE
    {
        unsafe {
            base.add(
                (PHYS_WINDOW_SIZE + (addr - USER_WINDOW_BASE)) as usize,
            )
        }
    } else {
        panic!("simulated access outside arena windows: {addr:#010x}");
    }
}

#[cfg(not(test))]
fn translate(_addr: u32) -> *mut u8 {
    unreachable!("host arch has no memory outside of test builds")
}

/// Resolves a kernel-visible address (kernel half, or a frame in the
/// simulated physical window) to a dereferenceable pointer.
pub fn mem_ptr(addr: u32) -> *mut u8 {
    translate(addr)
}

/// Builds a byte slice over kernel-visible memory. Callers guarantee the
/// range stays inside one contiguous region.
pub unsafe fn mem_slice<'a>(addr: u32, len: usize) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(mem_ptr(addr), len) }
}

/// Maps `pages` pages of physical memory starting at `paddr` into scratch
/// channel `ch`. The simulated machine addresses physical memory directly,
/// so this simply hands back a pointer into the arena.
pub fn ctrl_map(_ch: usize, paddr: u32, _pages: usize) -> *mut u8 {
    mem_ptr(paddr)
}

pub fn ctrl_unmap(_ch: usize) {}

/// Backing storage of message-buffer payload `idx`.
pub fn msg_payload(idx: usize) -> *mut u8 {
    uassert!(idx < abi::MSG_BUFFER_NUM);
    #[cfg(test)]
    {
        let base = machine::arena_ptr(
            machine::Which::Msg,
            abi::MSG_BUFFER_NUM * abi::MSG_SIZE_MAX,
        );
        unsafe { base.add(idx * abi::MSG_SIZE_MAX) }
    }
    #[cfg(not(test))]
    unreachable!("host arch has no memory outside of test builds")
}

pub fn set_pdbr(pdbr: u32) {
    #[cfg(test)]
    {
        machine::MACHINE.with(|m| m.pdbr.set(pdbr));
        machine::record(machine::HwOp::SetPdbr(pdbr));
    }
    let _ = pdbr;
}

pub fn current_pdbr() -> u32 {
    #[cfg(test)]
    return machine::MACHINE.with(|m| m.pdbr.get());
    #[cfg(not(test))]
    0
}

pub fn tss_set_esp0(sp: u32) {
    #[cfg(test)]
    machine::record(machine::HwOp::SetEsp0(sp));
    let _ = sp;
}

/// Address the TSS descriptor points at.
pub fn tss_addr() -> u32 {
    0x0000_1000
}

/// Descriptor limit of the TSS (size minus one).
pub fn tss_limit() -> u32 {
    103
}

/// Loads the translation base and turns paging on. The simulated machine
/// just records the base load.
pub fn enable_paging(pdbr: u32) {
    set_pdbr(pdbr);
}

/// Simulated context switch: records the PDBR load and returns, leaving the
/// "suspended" side to be resumed by the test driving the other side.
pub unsafe fn switch_context(
    save: *mut Context,
    _load: *const Context,
    pdbr: u32,
) {
    #[cfg(test)]
    machine::record(machine::HwOp::Switch { pdbr });
    let _ = pdbr;
    unsafe {
        (*save).eip = 0;
    }
}

/// On the host the child side of a fork never executes, so this always
/// reports the parent path.
pub fn fork_capture(ctx: &mut Context) -> bool {
    ctx.eip = 0;
    ctx.esp = current_stack_pointer();
    ctx.ebp = 0;
    ctx.eax = 1;
    false
}

pub fn current_stack_pointer() -> u32 {
    0
}

/// Builds the initial context of a fresh thread. The host variant just
/// records the pair; nothing ever jumps through it.
pub fn thread_entry_context(
    kstack_top: u32,
    entry: u32,
    user_sp: u32,
    _user_segments: bool,
) -> Context {
    Context {
        eip: entry,
        esp: kstack_top,
        ebp: 0,
        eax: user_sp,
    }
}

pub fn irq_allow(irq: u8) {
    #[cfg(test)]
    machine::record(machine::HwOp::IrqAllow(irq));
    let _ = irq;
}

pub fn irq_deny(irq: u8) {
    #[cfg(test)]
    machine::record(machine::HwOp::IrqDeny(irq));
    let _ = irq;
}

pub fn irq_eoi(irq: u8) {
    #[cfg(test)]
    machine::record(machine::HwOp::IrqEoi(irq));
    let _ = irq;
}

pub fn irq_enable_all() {
    #[cfg(test)]
    machine::record(machine::HwOp::IrqEnableAll);
}

pub fn irq_disable_all() {
    #[cfg(test)]
    machine::record(machine::HwOp::IrqDisableAll);
}

pub fn idt_set_gate(vector: u8, dpl: u8) {
    #[cfg(test)]
    machine::record(machine::HwOp::IdtGate { vector, dpl });
    let _ = (vector, dpl);
}

pub fn port_in8(port: u16) -> u8 {
    #[cfg(test)]
    {
        machine::record(machine::HwOp::PortIn { port, width: 1 });
        return machine::pop_port_input() as u8;
    }
    #[cfg(not(test))]
    {
        let _ = port;
        0
    }
}

pub fn port_in16(port: u16) -> u16 {
    #[cfg(test)]
    {
        machine::record(machine::HwOp::PortIn { port, width: 2 });
        return machine::pop_port_input() as u16;
    }
    #[cfg(not(test))]
    {
        let _ = port;
        0
    }
}

pub fn port_in32(port: u16) -> u32 {
    #[cfg(test)]
    {
        machine::record(machine::HwOp::PortIn { port, width: 4 });
        return machine::pop_port_input();
    }
    #[cfg(not(test))]
    {
        let _ = port;
        0
    }
}

pub fn port_out8(port: u16, value: u8) {
    #[cfg(test)]
    machine::record(machine::HwOp::PortOut {
        port,
        width: 1,
        value: value as u32,
    });
    let _ = (port, value);
}

pub fn port_out16(port: u16, value: u16) {
    #[cfg(test)]
    machine::record(machine::HwOp::PortOut {
        port,
        width: 2,
        value: value as u32,
    });
    let _ = (port, value);
}

pub fn port_out32(port: u16, value: u32) {
    #[cfg(test)]
    machine::record(machine::HwOp::PortOut {
        port,
        width: 4,
        value,
    });
    let _ = (port, value);
}

/// Disables interrupts, returning whether they were previously enabled.
pub fn interrupts_disable() -> bool {
    #[cfg(test)]
    return machine::MACHINE.with(|m| m.int_enabled.replace(false));
    #[cfg(not(test))]
    false
}

pub fn interrupts_restore(enabled: bool) {
    #[cfg(test)]
    machine::MACHINE.with(|m| m.int_enabled.set(enabled));
    let _ = enabled;
}

pub fn interrupts_enable() {
    interrupts_restore(true);
}

pub fn wait_for_interrupt() {}

pub fn read_cr2() -> u32 {
    0
}

pub fn pic_init() {
    irq_disable_all();
}

pub fn pit_init(_hz: u32) {}

pub fn idt_init() {}

pub fn load_gdt(_entries: &[u64]) {}

use super::Context;

static KERNEL_PTR: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Stashes the kernel singleton for `with_kernel`.
///
/// # Safety
///
/// `k` must stay valid for the rest of the program, and nothing else may
/// hold a reference into it while `with_kernel` runs.
pub unsafe fn set_kernel(k: *mut Kernel) {
    KERNEL_PTR.store(k, Ordering::Release);
}

/// Runs `f` against the kernel singleton.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let p = KERNEL_PTR.load(Ordering::Acquire);
    uassert!(!p.is_null());
    // Safety: see set_kernel; the single-processor execution model means no
    // second control flow observes the kernel while we hold this.
    f(unsafe { &mut *p })
}
