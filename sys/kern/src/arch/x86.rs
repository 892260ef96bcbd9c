// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for 32-bit x86 protected mode.
//!
//! # Interrupt entry
//!
//! Every IDT entry points at a tiny generated stub (`build.rs`) that
//! normalizes the stack -- pushing a zero where the hardware did not push an
//! error code -- pushes its vector number, and jumps to
//! `interrupt_entry_common`. The common trampoline saves the full register
//! state, loads kernel data segments, and calls the kernel dispatcher with a
//! pointer to the saved frame. One trampoline, 256 two-instruction stubs; no
//! macro explosion.
//!
//! # Context switch
//!
//! A voluntary switch saves three registers plus a resume address: EIP, ESP,
//! EBP (and EAX for the benefit of `fork_capture`'s double return). The
//! resume address is a single shared kernel-text label that immediately
//! returns into the suspended call chain. Everything else is dead across a
//! switch by construction, because switches only happen at function-call
//! boundaries inside the kernel.

use core::sync::atomic::{AtomicPtr, Ordering};

use abi::memmap;

use super::Context;
use crate::kernel::Kernel;
use crate::mm::gdt::{KERNEL_DS, USER_CS, USER_DS};

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel assertion failed");
        }
    };
}

/// Kernel log: formats into the debug ring in the boot-reserved page. The
/// external VGA renderer drains the ring; the kernel never waits on it.
macro_rules! klog {
    ($($tt:tt)*) => {
        $crate::arch::klog_write(core::format_args!($($tt)*))
    };
}

// Generated per-vector entry stubs; see build.rs.
include!(concat!(env!("OUT_DIR"), "/vectors.rs"));

/// Common save/restore trampoline behind all 256 vector stubs. On entry the
/// stack holds (err_code, vector, eip, cs, eflags[, user_esp, ss]).
#[unsafe(naked)]
unsafe extern "C" fn interrupt_entry_common() {
    core::arch::naked_asm!(
        "
            pushad
            push ds
            push es
            push fs
            push gs
            mov ax, {kernel_ds}
            mov ds, ax
            mov es, ax
            mov fs, ax
            mov gs, ax
            push esp
            call {dispatch}
            add esp, 4
            pop gs
            pop fs
            pop es
            pop ds
            popad
            add esp, 8
            iretd
        ",
        kernel_ds = const KERNEL_DS as u32,
        dispatch = sym crate::interrupt::interrupt_dispatch,
    );
}

/* Memory access */

/// Resolves a kernel-visible address to a pointer. The kernel half is
/// identity-mapped, so this is the identity function; it exists so that
/// machine-independent code stays portable to the simulated host machine.
pub fn mem_ptr(addr: u32) -> *mut u8 {
    addr as *mut u8
}

/// Builds a byte slice over kernel-visible memory. Callers guarantee the
/// range is mapped and contiguous.
pub unsafe fn mem_slice<'a>(addr: u32, len: usize) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(mem_ptr(addr), len) }
}

/* Scratch channels */

const CTRL_BASE: [u32; 2] = [memmap::CTRL1_BASE, memmap::CTRL2_BASE];

/// Pages one page table maps.
const PT_SPAN: usize = 1024;

/// Physical frame of the `half`th page table backing channel `ch`. The
/// kernel page-table block covers the whole kernel half, so the scratch
/// tables sit at its tail, identity-mapped and directly writable.
fn ctrl_pt_frame(ch: usize, half: usize) -> u32 {
    let pde = (CTRL_BASE[ch] >> 22) as usize + half;
    memmap::KERNEL_PT_PHYS + (pde * memmap::PAGE_SIZE) as u32
}

/// Maps `pages` pages of arbitrary physical memory into scratch channel
/// `ch` of the idle directory and returns the window base.
pub fn ctrl_map(ch: usize, paddr: u32, pages: usize) -> *mut u8 {
    uassert!(ch < 2);
    uassert!(pages <= (memmap::CTRL_SIZE as usize) / memmap::PAGE_SIZE);
    uassert!(paddr & 0xFFF == 0);
    for i in 0..pages {
        let pt = ctrl_pt_frame(ch, i / PT_SPAN) as *mut u32;
        // Present, writable, supervisor.
        let entry = (paddr + (i * memmap::PAGE_SIZE) as u32) | 0x3;
        // Safety: the scratch tables belong to this channel and are
        // identity-mapped by the kernel half.
        unsafe {
            pt.add(i % PT_SPAN).write_volatile(entry);
            invlpg(CTRL_BASE[ch] + (i * memmap::PAGE_SIZE) as u32);
        }
    }
    mem_ptr(CTRL_BASE[ch])
}

/// Tears down the scratch mapping of channel `ch`.
pub fn ctrl_unmap(ch: usize) {
    uassert!(ch < 2);
    let pages = (memmap::CTRL_SIZE as usize) / memmap::PAGE_SIZE;
    for i in 0..pages {
        let pt = ctrl_pt_frame(ch, i / PT_SPAN) as *mut u32;
        unsafe {
            if pt.add(i % PT_SPAN).read_volatile() & 1 != 0 {
                pt.add(i % PT_SPAN).write_volatile(0);
                invlpg(CTRL_BASE[ch] + (i * memmap::PAGE_SIZE) as u32);
            }
        }
    }
}

unsafe fn invlpg(va: u32) {
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) va, options(nostack));
    }
}

/* Message-buffer payload storage */

static mut MSG_PAYLOADS: [u8; abi::MSG_BUFFER_NUM * abi::MSG_SIZE_MAX] =
    [0; abi::MSG_BUFFER_NUM * abi::MSG_SIZE_MAX];

/// Backing storage of message-buffer payload `idx`.
pub fn msg_payload(idx: usize) -> *mut u8 {
    uassert!(idx < abi::MSG_BUFFER_NUM);
    // Safety: callers hand out disjoint buffers by index; the single-CPU
    // execution model serializes access.
    unsafe {
        (&raw mut MSG_PAYLOADS)
            .cast::<u8>()
            .add(idx * abi::MSG_SIZE_MAX)
    }
}

/* Address-translation base register */

pub fn set_pdbr(pdbr: u32) {
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) pdbr, options(nostack));
    }
}

pub fn current_pdbr() -> u32 {
    let v: u32;
    unsafe {
        core::arch::asm!("mov {0}, cr3", out(reg) v, options(nostack));
    }
    v
}

/* TSS */

/// 32-bit task-state segment. Only `ss0`/`esp0` are live; everything else
/// exists because the processor insists on the layout.
#[repr(C, packed)]
struct Tss {
    link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 22],
    iobase: u16,
    iomap: u16,
}

static mut TSS: Tss = Tss {
    link: 0,
    esp0: 0,
    ss0: KERNEL_DS as u32,
    unused: [0; 22],
    iobase: 0,
    iomap: core::mem::size_of::<Tss>() as u16,
};

/// Rewrites the stack pointer the processor loads on a ring 3 -> ring 0
/// transition. Called on every context switch.
pub fn tss_set_esp0(sp: u32) {
    unsafe {
        (&raw mut TSS.esp0).write_volatile(sp);
    }
}

pub fn tss_addr() -> u32 {
    (&raw const TSS) as u32
}

/// Descriptor limit of the TSS (size minus one).
pub fn tss_limit() -> u32 {
    core::mem::size_of::<Tss>() as u32 - 1
}

/// Loads the translation base and sets CR0.PG.
pub fn enable_paging(pdbr: u32) {
    set_pdbr(pdbr);
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

/* Context switch */

/// Saves the running context into `save` and resumes `load`, switching the
/// address-translation base to `pdbr` in between.
///
/// # Safety
///
/// `save` and `load` must point at live thread contexts; `load` must have
/// been produced by this function, `fork_capture`, or
/// `thread_entry_context`, and its stack must still exist.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    save: *mut Context,
    load: *const Context,
    pdbr: u32,
) {
    core::arch::naked_asm!(
        "
            mov eax, [esp + 4]
            mov ecx, [esp + 8]
            mov edx, [esp + 12]
            mov dword ptr [eax + 0], offset {resume}
            mov [eax + 4], esp
            mov [eax + 8], ebp
            mov cr3, edx
            mov esp, [ecx + 4]
            mov ebp, [ecx + 8]
            mov eax, [ecx + 12]
            jmp dword ptr [ecx + 0]
        ",
        resume = sym switch_resume,
    );
}

/// Shared resume point of every saved context: the stored ESP points at the
/// return address of the `switch_context` call that saved it.
#[unsafe(naked)]
unsafe extern "C" fn switch_resume() {
    core::arch::naked_asm!("ret");
}

/// setjmp-style capture for fork: records a context that, when resumed,
/// makes this call appear to return a second time with result `true`.
/// Returns `false` on the capturing (parent) path.
pub fn fork_capture(ctx: &mut Context) -> bool {
    unsafe { fork_capture_raw(ctx) != 0 }
}

#[unsafe(naked)]
unsafe extern "C" fn fork_capture_raw(ctx: *mut Context) -> u32 {
    core::arch::naked_asm!(
        "
            mov eax, [esp + 4]
            mov ecx, [esp]
            mov [eax + 0], ecx
            lea ecx, [esp + 4]
            mov [eax + 4], ecx
            mov [eax + 8], ebp
            mov dword ptr [eax + 12], 1
            xor eax, eax
            ret
        ",
    );
}

pub fn current_stack_pointer() -> u32 {
    let v: u32;
    unsafe {
        core::arch::asm!("mov {0}, esp", out(reg) v, options(nostack));
    }
    v
}

/// Builds the initial context of a fresh thread.
///
/// User threads resume in a trampoline that loads user segments and `iretd`s
/// into `(entry, user_sp)`; the two words are parked on the new kernel
/// stack where the trampoline pops them. Kernel-class threads just start at
/// `entry` on their kernel stack.
pub fn thread_entry_context(
    kstack_top: u32,
    entry: u32,
    user_sp: u32,
    user_segments: bool,
) -> Context {
    if !user_segments {
        return Context {
            eip: entry,
            esp: kstack_top,
            ebp: 0,
            eax: 0,
        };
    }
    let sp = kstack_top - 8;
    unsafe {
        (mem_ptr(sp) as *mut u32).write(entry);
        (mem_ptr(sp + 4) as *mut u32).write(user_sp);
    }
    Context {
        eip: thread_entry_trampoline as usize as u32,
        esp: sp,
        ebp: 0,
        eax: 0,
    }
}

#[unsafe(naked)]
unsafe extern "C" fn thread_entry_trampoline() {
    core::arch::naked_asm!(
        "
            pop ecx
            pop edx
            mov ax, {user_ds}
            mov ds, ax
            mov es, ax
            mov fs, ax
            mov gs, ax
            push {user_ds}
            push edx
            push 0x202
            push {user_cs}
            push ecx
            iretd
        ",
        user_ds = const (USER_DS | 3) as u32,
        user_cs = const (USER_CS | 3) as u32,
    );
}

/* Interrupt controller: cascaded i8259A pair */

const PIC_M_CMD: u16 = 0x20;
const PIC_M_DATA: u16 = 0x21;
const PIC_S_CMD: u16 = 0xA0;
const PIC_S_DATA: u16 = 0xA1;

/// Programs the controller pair: edge-triggered, cascade on line 2, vectors
/// remapped to `vector::IRQ_BASE`, all lines masked.
pub fn pic_init() {
    port_out8(PIC_M_CMD, 0x11);
    port_out8(PIC_S_CMD, 0x11);
    port_out8(PIC_M_DATA, abi::vector::IRQ_BASE);
    port_out8(PIC_S_DATA, abi::vector::IRQ_BASE + 8);
    port_out8(PIC_M_DATA, 0x04);
    port_out8(PIC_S_DATA, 0x02);
    port_out8(PIC_M_DATA, 0x01);
    port_out8(PIC_S_DATA, 0x01);
    irq_disable_all();
}

pub fn irq_allow(irq: u8) {
    uassert!((irq as usize) < abi::IRQ_NUM);
    let (port, bit) = if irq < 8 {
        (PIC_M_DATA, irq)
    } else {
        (PIC_S_DATA, irq - 8)
    };
    let mask = port_in8(port) & !(1 << bit);
    port_out8(port, mask);
    if irq >= 8 {
        // Cascade line must be open for slave lines to get through.
        let m = port_in8(PIC_M_DATA) & !(1 << 2);
        port_out8(PIC_M_DATA, m);
    }
}

pub fn irq_deny(irq: u8) {
    uassert!((irq as usize) < abi::IRQ_NUM);
    let (port, bit) = if irq < 8 {
        (PIC_M_DATA, irq)
    } else {
        (PIC_S_DATA, irq - 8)
    };
    let mask = port_in8(port) | (1 << bit);
    port_out8(port, mask);
}

/// Specific end-of-interrupt for `irq`.
pub fn irq_eoi(irq: u8) {
    uassert!((irq as usize) < abi::IRQ_NUM);
    if irq >= 8 {
        port_out8(PIC_S_CMD, 0x60 | (irq - 8));
        port_out8(PIC_M_CMD, 0x60 | 2);
    } else {
        port_out8(PIC_M_CMD, 0x60 | irq);
    }
}

pub fn irq_enable_all() {
    port_out8(PIC_M_DATA, 0x00);
    port_out8(PIC_S_DATA, 0x00);
}

pub fn irq_disable_all() {
    // Leave the cascade line open.
    port_out8(PIC_M_DATA, !(1 << 2));
    port_out8(PIC_S_DATA, 0xFF);
}

/* Tick source: i8254 PIT, counter 0, rate generator */

const PIT_CNTR0: u16 = 0x40;
const PIT_CTRL: u16 = 0x43;
const PIT_CLOCK_HZ: u32 = 1_193_182;

pub fn pit_init(hz: u32) {
    let cycle = PIT_CLOCK_HZ / hz;
    port_out8(PIT_CTRL, 0x34);
    port_out8(PIT_CNTR0, cycle as u8);
    port_out8(PIT_CNTR0, (cycle >> 8) as u8);
}

/* IDT */

static mut IDT: [u64; 256] = [0; 256];

fn gate(handler: u32, selector: u16, dpl: u8) -> u64 {
    let access = 0x8E | ((dpl & 3) << 5);
    (handler as u64 & 0xFFFF)
        | ((selector as u64) << 16)
        | ((access as u64) << 40)
        | ((handler as u64 & 0xFFFF_0000) << 32)
}

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Points every IDT entry at its generated stub, ring 0, and loads the
/// table.
pub fn idt_init() {
    for (i, stub) in VECTOR_STUBS.iter().enumerate() {
        let handler = *stub as usize as u32;
        unsafe {
            (&raw mut IDT[i])
                .write(gate(handler, crate::mm::gdt::KERNEL_CS, 0));
        }
    }
    let ptr = DescriptorPointer {
        limit: (core::mem::size_of::<[u64; 256]>() - 1) as u16,
        base: (&raw const IDT) as u32,
    };
    unsafe {
        core::arch::asm!("lidt [{0}]", in(reg) &ptr, options(nostack));
    }
}

/// Rewrites the descriptor privilege of one gate, so user code can reach
/// the service vectors.
pub fn idt_set_gate(vector: u8, dpl: u8) {
    unsafe {
        let p = &raw mut IDT[vector as usize];
        let v = p.read() & !(3u64 << 45);
        p.write(v | ((dpl as u64 & 3) << 45));
    }
}

/* GDT */

/// Loads the descriptor table built by `mm::gdt`, reloads the segment
/// registers, and installs the task register.
pub fn load_gdt(entries: &[u64]) {
    let ptr = DescriptorPointer {
        limit: (entries.len() * 8 - 1) as u16,
        base: entries.as_ptr() as u32,
    };
    unsafe {
        core::arch::asm!(
            "
            lgdt ({gdtr})
            movw ${kernel_ds}, %ax
            movw %ax, %ds
            movw %ax, %es
            movw %ax, %fs
            movw %ax, %gs
            movw %ax, %ss
            ljmp ${kernel_cs}, $2f
            2:
            movw ${tss_sel}, %ax
            ltr %ax
            ",
            gdtr = in(reg) &ptr,
            kernel_ds = const KERNEL_DS as u32,
            kernel_cs = const crate::mm::gdt::KERNEL_CS as u32,
            tss_sel = const crate::mm::gdt::TSS_SEL as u32,
            out("eax") _,
            options(att_syntax),
        );
    }
}

/* Port I/O */

pub fn port_in8(port: u16) -> u8 {
    let v: u8;
    unsafe {
        core::arch::asm!("in al, dx", out("al") v, in("dx") port,
            options(nostack, nomem));
    }
    v
}

pub fn port_in16(port: u16) -> u16 {
    let v: u16;
    unsafe {
        core::arch::asm!("in ax, dx", out("ax") v, in("dx") port,
            options(nostack, nomem));
    }
    v
}

pub fn port_in32(port: u16) -> u32 {
    let v: u32;
    unsafe {
        core::arch::asm!("in eax, dx", out("eax") v, in("dx") port,
            options(nostack, nomem));
    }
    v
}

pub fn port_out8(port: u16, value: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") value,
            options(nostack, nomem));
    }
}

pub fn port_out16(port: u16, value: u16) {
    unsafe {
        core::arch::asm!("out dx, ax", in("dx") port, in("ax") value,
            options(nostack, nomem));
    }
}

pub fn port_out32(port: u16, value: u32) {
    unsafe {
        core::arch::asm!("out dx, eax", in("dx") port, in("eax") value,
            options(nostack, nomem));
    }
}

/* Interrupt flag */

/// Disables interrupts, returning whether they were previously enabled.
pub fn interrupts_disable() -> bool {
    let flags: u32;
    unsafe {
        core::arch::asm!("pushfd", "pop {0}", "cli", out(reg) flags);
    }
    flags & 0x200 != 0
}

pub fn interrupts_restore(enabled: bool) {
    if enabled {
        interrupts_enable();
    }
}

pub fn interrupts_enable() {
    unsafe {
        core::arch::asm!("sti", options(nostack, nomem));
    }
}

pub fn wait_for_interrupt() {
    unsafe {
        core::arch::asm!("sti", "hlt", options(nostack, nomem));
    }
}

pub fn read_cr2() -> u32 {
    let v: u32;
    unsafe {
        core::arch::asm!("mov {0}, cr2", out(reg) v, options(nostack));
    }
    v
}

/* Linker-provided kernel image extent */

extern "C" {
    static __kernel_end: u8;
}

/// First byte past the kernel image (text, data, BSS), from the linker.
/// The heap break starts here, rounded up to a page.
pub fn kernel_image_end() -> u32 {
    unsafe { (&raw const __kernel_end) as u32 }
}

/* Kernel singleton */

static KERNEL_PTR: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Stashes the kernel singleton for `with_kernel`.
///
/// # Safety
///
/// `k` must stay valid for the rest of the boot, and nothing else may hold
/// a reference into it while `with_kernel` runs.
pub unsafe fn set_kernel(k: *mut Kernel) {
    KERNEL_PTR.store(k, Ordering::Release);
}

/// Runs `f` against the kernel singleton. Uniprocessor; callers run with
/// interrupts implicitly or explicitly off around multi-step updates.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let p = KERNEL_PTR.load(Ordering::Acquire);
    uassert!(!p.is_null());
    // Safety: see set_kernel.
    f(unsafe { &mut *p })
}

/* Kernel log ring */

#[cfg(feature = "klog-ring")]
mod ring {
    use abi::memmap;
    use core::fmt;

    /// Layout of the debug page: a write cursor, then the byte ring. The
    /// VGA-side renderer owns interpretation (including ANSI SGR); the
    /// kernel only appends.
    const CURSOR: u32 = memmap::DEBUG_PHYS_BASE;
    const DATA: u32 = memmap::DEBUG_PHYS_BASE + 4;
    const DATA_SIZE: u32 = memmap::DEBUG_PHYS_SIZE - 4;

    pub struct RingWriter;

    impl fmt::Write for RingWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let cursor = CURSOR as *mut u32;
            unsafe {
                let mut off = cursor.read_volatile() % DATA_SIZE;
                for &b in s.as_bytes() {
                    ((DATA + off) as *mut u8).write_volatile(b);
                    off = (off + 1) % DATA_SIZE;
                }
                cursor.write_volatile(off);
            }
            Ok(())
        }
    }
}

pub fn klog_write(args: core::fmt::Arguments<'_>) {
    #[cfg(feature = "klog-ring")]
    {
        use core::fmt::Write;
        let prev = interrupts_disable();
        let mut w = ring::RingWriter;
        let _ = w.write_fmt(args);
        let _ = w.write_str("\r\n");
        interrupts_restore(prev);
    }
    let _ = args;
}
