// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The boot loader enters `start_kernel` in 32-bit protected mode with
//! paging off, the boot data parked in low memory, and the process-image
//! blob at its fixed physical address. Initialization runs leaves-first:
//! physical memory, descriptor tables, paging, heap, interrupts, tasks,
//! IPC, timers, services -- then the embedded process images are loaded
//! and the boot context becomes the idle task.

use abi::bootinfo::{
    self, ImageHeader, RegionKind, IMAGE_TYPE_DRIVER, IMAGE_TYPE_SERVER,
};
use abi::memmap;
use abi::ProcType;

use crate::arch;
use crate::bootinfo::{parse_e820, parse_loader_map, ImageIter};
use crate::interrupt;
use crate::kernel::Kernel;
use crate::mm::page::DIR_IDLE;
use crate::mm::phys::{MapDesc, MapKind};
use crate::services;
use crate::task;

static mut KERNEL: Kernel = Kernel::new();

/// The main kernel entry point.
///
/// # Safety
///
/// This can be called exactly once per boot, from the loader's entry
/// shim, with the boot data in place.
pub unsafe fn start_kernel() -> ! {
    klog!("starting: memory");
    let k = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) };

    // Boot data, before anything overwrites low memory.
    let (proc_image_base, proc_image_size) = unsafe { init_phys(k) };

    k.gdt.init(arch::tss_addr(), arch::tss_limit());
    arch::load_gdt(k.gdt.entries());

    // Identity map up to the scratch windows; the windows' own tables stay
    // empty until a channel maps something.
    k.pages.init(
        memmap::IDLE_PD_PHYS,
        memmap::KERNEL_PT_PHYS,
        memmap::CTRL1_BASE,
    );
    arch::enable_paging(k.pages.dir_frame(DIR_IDLE));
    k.heap.init(arch::kernel_image_end());

    klog!("starting: interrupts");
    arch::idt_init();
    interrupt::init(k);
    arch::pic_init();

    klog!("starting: tasks");
    k.tasks.init_idle(k.pages.dir_frame(DIR_IDLE));
    k.sched.init();
    k.ipc.init();
    k.timers.init();
    services::install(k);

    arch::pit_init(abi::TICK_HZ);
    arch::irq_allow(0);

    // Everything below may switch contexts; the singleton must be
    // reachable from the interrupt path first.
    unsafe {
        arch::set_kernel(k);
    }

    klog!("starting: processes");
    let blob =
        unsafe { arch::mem_slice(proc_image_base, proc_image_size as usize) };
    load_images(k, blob);

    klog!("starting: scheduler");
    arch::interrupts_enable();
    loop {
        arch::wait_for_interrupt();
    }
}

/// Reads the E820 and loader maps and seeds the frame pool, leaving the
/// kernel's own footprint and the boot-reserved ranges out.
///
/// # Safety
///
/// Boot data must still be intact at its fixed addresses.
unsafe fn init_phys(k: &mut Kernel) -> (u32, u32) {
    let e820_count =
        unsafe { (arch::mem_ptr(bootinfo::E820_COUNT) as *const u32).read() }
            as usize;
    let e820_bytes = unsafe {
        arch::mem_slice(
            bootinfo::E820_ENTRIES,
            e820_count * core::mem::size_of::<bootinfo::E820Entry>(),
        )
    };
    let map_count = unsafe {
        (arch::mem_ptr(bootinfo::LOADER_MAP_COUNT) as *const u32).read()
    } as usize;
    let map_bytes = unsafe {
        arch::mem_slice(
            bootinfo::LOADER_MAP_ENTRIES,
            map_count * core::mem::size_of::<bootinfo::LoaderMapEntry>(),
        )
    };

    let mut proc_image = (bootinfo::PROC_IMAGE_BASE, 0);
    for e in parse_loader_map(map_bytes, map_count) {
        let kind = match RegionKind::try_from(e.kind) {
            Ok(kind) => kind,
            Err(()) => continue,
        };
        let mapped = match kind {
            RegionKind::Kernel => Some(MapKind::Kernel),
            RegionKind::ProcImage => {
                proc_image = (e.base, e.size);
                Some(MapKind::ProcImage)
            }
            RegionKind::BootData => Some(MapKind::BootData),
            _ => None,
        };
        if let Some(kind) = mapped {
            k.phys.add_map_desc(MapDesc {
                base: e.base,
                size: e.size,
                kind,
            });
        }
    }
    k.phys.add_map_desc(MapDesc {
        base: memmap::USER_STACK_BASE,
        size: memmap::USER_STACK_SIZE,
        kind: MapKind::UserStack,
    });

    let kernel_end = memmap::page_round_up(arch::kernel_image_end());
    let reserved = [
        // Low memory: boot data, real-mode leftovers.
        (0, 0x0010_0000),
        // Kernel image plus the heap window above it.
        (
            memmap::KERNEL_PHYS_BASE,
            kernel_end + crate::mm::heap::HEAP_MAX - memmap::KERNEL_PHYS_BASE,
        ),
        // Debug log page(s).
        (memmap::DEBUG_PHYS_BASE, memmap::DEBUG_PHYS_SIZE),
        // Idle directory and the kernel page-table block.
        (
            memmap::IDLE_PD_PHYS,
            0x1000 + (memmap::USER_BASE >> 22) * 0x1000,
        ),
        // Process images, until they are loaded.
        (proc_image.0, proc_image.1),
    ];
    k.phys
        .seed_from_e820(parse_e820(e820_bytes, e820_count), &reserved);
    klog!("phys: {} pages free", k.phys.free_pages());
    proc_image
}

/// Walks the image blob and starts a process per entry.
fn load_images(k: &mut Kernel, blob: &[u8]) {
    for (header, image) in ImageIter::new(blob) {
        let ptype = image_ptype(&header);
        match task::proc_add(k, ptype, image) {
            Ok(id) => {
                klog!(
                    "proc {}: {:?} ({} bytes)",
                    id.pid(),
                    core::str::from_utf8(header.name_bytes())
                        .unwrap_or("?"),
                    image.len()
                );
            }
            Err(_) => {
                klog!(
                    "proc load failed: {:?}",
                    core::str::from_utf8(header.name_bytes())
                        .unwrap_or("?")
                );
            }
        }
    }
}

fn image_ptype(header: &ImageHeader) -> ProcType {
    match header.file_type {
        IMAGE_TYPE_DRIVER => ProcType::Driver,
        IMAGE_TYPE_SERVER => ProcType::Server,
        _ => ProcType::User,
    }
}
