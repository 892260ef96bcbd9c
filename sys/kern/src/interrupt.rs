// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt routing.
//!
//! Every one of the 256 vectors funnels through the common trampoline into
//! [`interrupt_dispatch`], which indexes the per-vector handler table.
//! The default entry is a halt-and-log trap; subsystems install real
//! handlers at init (`hdl_set`), which also sets the IDT gate's privilege
//! so user code can (or cannot) raise the vector.
//!
//! Hardware IRQ lines get the monitoring state machine: a driver task
//! claims a line, waits for its pending bit, and completes the interrupt
//! when its device is serviced. While a line is monitored, the low-level
//! handler masks it, marks it pending, and wakes a waiting owner; the
//! `complete` operation acknowledges the controller and unmasks.

use abi::{vector, Error, TaskId, IRQ_NUM, TASK_NUM};

use crate::arch::{self, InterruptFrame};
use crate::err::{FaultInfo, UserError};
use crate::kernel::Kernel;
use crate::sched;
use crate::task;
use crate::time;

pub type Handler = fn(&mut Kernel, u8, &mut InterruptFrame);

pub struct IrqCtl {
    handlers: [Handler; 256],
    /// Monitoring owner per IRQ line; `TaskId::NONE` when idle.
    owner: [TaskId; IRQ_NUM],
    /// Pending-flag bitmap, one bit per line. Written by the low-level
    /// handler, read-and-cleared by `wait`.
    pending: u16,
    /// Lines masked by the low-level handler, pending `complete`.
    masked: u16,
    /// Owners parked in `wait`.
    waiting: [bool; TASK_NUM],
}

impl IrqCtl {
    pub const fn new() -> Self {
        Self {
            handlers: [default_handler; 256],
            owner: [TaskId::NONE; IRQ_NUM],
            pending: 0,
            masked: 0,
            waiting: [false; TASK_NUM],
        }
    }

    pub fn monitor_owner(&self, irq: u8) -> TaskId {
        self.owner[irq as usize]
    }

    pub fn pending_bits(&self) -> u16 {
        self.pending
    }

    /// Bitmap of lines owned by `id`.
    fn owned_mask(&self, id: TaskId) -> u16 {
        let mut mask = 0;
        for (irq, &owner) in self.owner.iter().enumerate() {
            if owner == id {
                mask |= 1 << irq;
            }
        }
        mask
    }
}

/// Installs a handler for `vec` and opens its gate at privilege `dpl`.
pub fn hdl_set(k: &mut Kernel, vec: u8, f: Handler, dpl: u8) {
    k.irqs.handlers[vec as usize] = f;
    arch::idt_set_gate(vec, dpl);
}

/// Common dispatcher behind the per-vector stubs. `frame` points at the
/// register snapshot the trampoline saved; handlers may rewrite it.
#[no_mangle]
pub extern "C" fn interrupt_dispatch(frame: *mut InterruptFrame) {
    arch::with_kernel(|k| {
        // Safety: the trampoline hands us a live frame on the interrupted
        // stack.
        let frame = unsafe { &mut *frame };
        let vec = frame.vector as u8;
        (k.irqs.handlers[vec as usize])(k, vec, frame);
    });
}

/// Installs the fixed vectors: fault traps and the hardware-IRQ range.
pub fn init(k: &mut Kernel) {
    hdl_set(k, 0, divide_error, 0);
    hdl_set(k, 14, page_fault, 0);
    for irq in 0..IRQ_NUM as u8 {
        hdl_set(k, vector::IRQ_BASE + irq, hw_irq, 0);
    }
}

/// Default entry for every vector: log it and halt whoever raised it. A
/// trap taken in kernel mode is not survivable.
fn default_handler(k: &mut Kernel, vec: u8, frame: &mut InterruptFrame) {
    if !frame.from_user() {
        klog!("unhandled trap {vec} in kernel, eip={:#010x}", frame.eip);
        panic!("unhandled kernel trap");
    }
    let cur = k.sched.current();
    task::halt(k, cur, FaultInfo::UnknownVector(vec));
}

fn divide_error(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    if !frame.from_user() {
        klog!("divide error in kernel, eip={:#010x}", frame.eip);
        panic!("kernel divide error");
    }
    let cur = k.sched.current();
    task::halt(k, cur, FaultInfo::DivideByZero);
}

fn page_fault(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    let addr = arch::read_cr2();
    if !frame.from_user() {
        klog!(
            "page fault in kernel: addr={addr:#010x} eip={:#010x} err={:#x}",
            frame.eip,
            frame.err_code
        );
        panic!("kernel page fault");
    }
    let cur = k.sched.current();
    task::halt(
        k,
        cur,
        FaultInfo::MemoryAccess {
            address: Some(addr),
        },
    );
}

/// Low-level hardware-IRQ handler. IRQ 0 is the kernel tick; everything
/// else follows the monitoring protocol.
fn hw_irq(k: &mut Kernel, vec: u8, _frame: &mut InterruptFrame) {
    let irq = vec - vector::IRQ_BASE;
    if irq == 0 {
        arch::irq_eoi(0);
        time::tick(k);
        sched::exec(k);
        return;
    }

    let owner = k.irqs.owner[irq as usize];
    if owner == TaskId::NONE {
        klog!("spurious irq {irq}");
        arch::irq_eoi(irq);
        return;
    }
    let bit = 1u16 << irq;
    k.irqs.pending |= bit;
    arch::irq_deny(irq);
    k.irqs.masked |= bit;
    if k.irqs.waiting[owner.index()] {
        k.irqs.waiting[owner.index()] = false;
        sched::start(&mut k.sched, &mut k.tasks, owner);
    }
}

/* Monitoring state machine, driven by the interrupt service family. The
 * caller's class has already been checked (driver only). */

fn check_irq(irq: u32) -> Result<u8, UserError> {
    // IRQ 0 is the tick, IRQ 2 the cascade; neither is claimable.
    if irq == 0 || irq == 2 || irq >= IRQ_NUM as u32 {
        return Err(Error::Param.into());
    }
    Ok(irq as u8)
}

pub fn start_monitoring(
    k: &mut Kernel,
    caller: TaskId,
    irq: u32,
) -> Result<(), UserError> {
    let irq = check_irq(irq)?;
    if k.irqs.owner[irq as usize] != TaskId::NONE {
        return Err(Error::AlreadyStart.into());
    }
    k.irqs.owner[irq as usize] = caller;
    k.irqs.pending &= !(1 << irq);
    k.irqs.masked &= !(1 << irq);
    arch::irq_allow(irq);
    Ok(())
}

pub fn stop_monitoring(
    k: &mut Kernel,
    caller: TaskId,
    irq: u32,
) -> Result<(), UserError> {
    let irq = check_irq(irq)?;
    if k.irqs.owner[irq as usize] != caller {
        return Err(Error::Unauthorized.into());
    }
    k.irqs.owner[irq as usize] = TaskId::NONE;
    k.irqs.pending &= !(1 << irq);
    k.irqs.masked &= !(1 << irq);
    arch::irq_deny(irq);
    Ok(())
}

/// Blocks until any line owned by `caller` has a pending bit, then
/// returns the bits, cleared.
pub fn wait(k: &mut Kernel, caller: TaskId) -> Result<u16, UserError> {
    if k.irqs.owned_mask(caller) == 0 {
        return Err(Error::Param.into());
    }
    loop {
        let fired = k.irqs.pending & k.irqs.owned_mask(caller);
        if fired != 0 {
            k.irqs.pending &= !fired;
            return Ok(fired);
        }
        k.irqs.waiting[caller.index()] = true;
        sched::block_current(k);

        if cfg!(not(target_os = "none")) {
            // The simulated machine cannot resume a suspended call; tests
            // observe the wait flag and re-issue after raising the IRQ.
            return Ok(0);
        }
    }
}

/// Acknowledges a serviced interrupt: end-of-interrupt to the controller,
/// and unmask the line if the low-level handler masked it.
pub fn complete(
    k: &mut Kernel,
    caller: TaskId,
    irq: u32,
) -> Result<(), UserError> {
    let irq = check_irq(irq)?;
    if k.irqs.owner[irq as usize] != caller {
        return Err(Error::Unauthorized.into());
    }
    arch::irq_eoi(irq);
    let bit = 1u16 << irq;
    if k.irqs.masked & bit != 0 {
        k.irqs.masked &= !bit;
        arch::irq_allow(irq);
    }
    Ok(())
}

/// Unmasks a monitored line at the controller.
pub fn enable(
    k: &mut Kernel,
    caller: TaskId,
    irq: u32,
) -> Result<(), UserError> {
    let irq = check_irq(irq)?;
    if k.irqs.owner[irq as usize] != caller {
        return Err(Error::Unauthorized.into());
    }
    arch::irq_allow(irq);
    Ok(())
}

/// Masks a monitored line at the controller.
pub fn disable(
    k: &mut Kernel,
    caller: TaskId,
    irq: u32,
) -> Result<(), UserError> {
    let irq = check_irq(irq)?;
    if k.irqs.owner[irq as usize] != caller {
        return Err(Error::Unauthorized.into());
    }
    arch::irq_deny(irq);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{take_ops, HwOp};
    use crate::task::ThreadState;
    use crate::testutil;
    use abi::ProcType;

    fn raise(k: &mut Kernel, irq: u8) {
        let mut frame = InterruptFrame {
            vector: (vector::IRQ_BASE + irq) as u32,
            cs: 0x1B,
            ..Default::default()
        };
        hw_irq(k, vector::IRQ_BASE + irq, &mut frame);
    }

    #[test]
    fn monitoring_round_trip() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Driver);

        start_monitoring(k, t, 14).unwrap();
        let _ = take_ops();

        // Wait with nothing pending blocks.
        assert_eq!(wait(k, t).unwrap(), 0);
        assert!(k.irqs.waiting[t.index()]);
        assert_eq!(k.tasks.thread(t).state(), ThreadState::Waiting);

        // The line fires: pending set, line masked, owner woken.
        raise(k, 14);
        assert_eq!(k.irqs.pending_bits(), 1 << 14);
        assert_eq!(k.tasks.thread(t).state(), ThreadState::Ready);
        assert!(take_ops().contains(&HwOp::IrqDeny(14)));

        // Re-issued wait returns exactly the one bit, cleared.
        assert_eq!(wait(k, t).unwrap(), 1 << 14);
        assert_eq!(k.irqs.pending_bits(), 0);

        // Complete acknowledges and unmasks; the next fire repeats it all.
        complete(k, t, 14).unwrap();
        let ops = take_ops();
        assert!(ops.contains(&HwOp::IrqEoi(14)));
        assert!(ops.contains(&HwOp::IrqAllow(14)));

        raise(k, 14);
        assert_eq!(wait(k, t).unwrap(), 1 << 14);
    }

    #[test]
    fn double_start_reports_already_started() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Driver);
        let u = testutil::spawn(k, ProcType::Driver);
        start_monitoring(k, t, 5).unwrap();
        assert_eq!(
            start_monitoring(k, u, 5),
            Err(UserError::Recoverable(Error::AlreadyStart))
        );
        assert_eq!(
            start_monitoring(k, t, 5),
            Err(UserError::Recoverable(Error::AlreadyStart))
        );
    }

    #[test]
    fn only_the_owner_may_stop_or_complete() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Driver);
        let u = testutil::spawn(k, ProcType::Driver);
        start_monitoring(k, t, 9).unwrap();
        assert_eq!(
            stop_monitoring(k, u, 9),
            Err(UserError::Recoverable(Error::Unauthorized))
        );
        assert_eq!(
            complete(k, u, 9),
            Err(UserError::Recoverable(Error::Unauthorized))
        );
        stop_monitoring(k, t, 9).unwrap();
        assert_eq!(k.irqs.monitor_owner(9), TaskId::NONE);
    }

    #[test]
    fn tick_and_cascade_lines_are_not_claimable() {
        let k = testutil::boot_kernel();
        let t = testutil::spawn(k, ProcType::Driver);
        for irq in [0u32, 2, 16, 99] {
            assert_eq!(
                start_monitoring(k, t, irq),
                Err(UserError::Recoverable(Error::Param))
            );
        }
    }

    #[test]
    fn unmonitored_irq_is_acknowledged_and_dropped() {
        let k = testutil::boot_kernel();
        let _ = take_ops();
        raise(k, 7);
        assert_eq!(k.irqs.pending_bits(), 0);
        assert!(take_ops().contains(&HwOp::IrqEoi(7)));
    }

    #[test]
    fn tick_irq_drives_timer_and_scheduler() {
        let k = testutil::boot_kernel();
        let a = testutil::spawn(k, ProcType::Server);
        let before = k.timers.now();
        raise(k, 0);
        assert_eq!(k.timers.now(), before + 1);
        // The tick exec picked up the runnable task.
        assert_eq!(k.sched.current(), a);
    }

    #[test]
    fn user_fault_halts_the_offender() {
        let k = testutil::boot_kernel();
        let a = testutil::spawn(k, ProcType::User);
        crate::sched::exec(k);
        assert_eq!(k.sched.current(), a);
        let mut frame = InterruptFrame {
            vector: 13,
            cs: 0x1B,
            ..Default::default()
        };
        default_handler(k, 13, &mut frame);
        assert_eq!(k.tasks.thread(a).state(), ThreadState::Waiting);
        assert_ne!(k.sched.current(), a);
    }

    #[test]
    #[should_panic]
    fn kernel_fault_is_fatal() {
        let k = testutil::boot_kernel();
        let mut frame = InterruptFrame {
            vector: 14,
            cs: 0x08,
            ..Default::default()
        };
        page_fault(k, 14, &mut frame);
    }
}
