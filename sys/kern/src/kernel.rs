// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel singleton.
//!
//! Every table in the system lives in this one structure, built `const` so
//! the whole thing lands in BSS. Modules operate on the parts they own;
//! cross-cutting operations (scheduling, IPC, service dispatch) borrow the
//! pieces they need. Nothing here is allocated, constructed, or torn down
//! after boot.

use crate::interrupt::IrqCtl;
use crate::ipc::MsgCtl;
use crate::mm::gdt::Gdt;
use crate::mm::heap::Heap;
use crate::mm::page::PageMgr;
use crate::mm::phys::PhysAllocator;
use crate::sched::Scheduler;
use crate::services::iomem::IoClaims;
use crate::services::taskname::Registry;
use crate::task::Table;
use crate::time::TimerCtl;

pub struct Kernel {
    pub phys: PhysAllocator,
    pub gdt: Gdt,
    pub pages: PageMgr,
    pub heap: Heap,
    pub tasks: Table,
    pub sched: Scheduler,
    pub ipc: MsgCtl,
    pub timers: TimerCtl,
    pub irqs: IrqCtl,
    pub names: Registry,
    pub iomem: IoClaims,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            phys: PhysAllocator::new(),
            gdt: Gdt::new(),
            pages: PageMgr::new(),
            heap: Heap::new(),
            tasks: Table::new(),
            sched: Scheduler::new(),
            ipc: MsgCtl::new(),
            timers: TimerCtl::new(),
            irqs: IrqCtl::new(),
            names: Registry::new(),
            iomem: IoClaims::new(),
        }
    }
}
