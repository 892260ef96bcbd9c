// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process and thread tables.
//!
//! A task is one thread of one process; its id packs (pid, tid) and doubles
//! as its index in every table, so cross-references are ids everywhere and
//! never pointers. Process ids count up monotonically and are not reused
//! within an uptime.

use abi::memmap::{self, PAGE_SIZE, USER_BASE, USER_STACK_BASE, USER_STACK_SIZE};
use abi::{Error, ProcType, TaskId, KERNEL_STACK_SIZE, PROC_NUM, TASK_NUM, THREAD_NUM_PER_PROC};

use crate::arch;
use crate::elf;
use crate::err::{FaultInfo, UserError};
use crate::kernel::Kernel;
use crate::mm::page::{DirId, PageFlags, DIR_IDLE};
use crate::mm::vaddr::RangeMap;
use crate::sched;

/// Ceiling on per-process break growth above the image.
pub const PROC_BRK_MAX: u32 = 0x0100_0000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Ready,
    Running,
    Waiting,
}

pub struct Process {
    pub(crate) live: bool,
    pub(crate) ptype: ProcType,
    pub(crate) dir: DirId,
    /// Physical base of the page directory; loaded into the translation
    /// base register when a thread of this process is switched in.
    pub(crate) pdbr: u32,
    /// Current break, and the floor it can never sink below.
    pub(crate) break_point: u32,
    pub(crate) brk_base: u32,
    pub(crate) vaddr: RangeMap,
}

pub struct Thread {
    pub(crate) live: bool,
    pub(crate) state: ThreadState,
    pub(crate) context: arch::Context,
    pub(crate) kstack_base: u32,
    pub(crate) kstack_size: u32,
    pub(crate) entry: u32,
    pub(crate) user_sp: u32,
    // Scheduler/wait-list intrusive links; see sched.
    pub(crate) link_prev: TaskId,
    pub(crate) link_next: TaskId,
    pub(crate) queue_tag: u8,
}

impl Thread {
    const EMPTY: Thread = Thread {
        live: false,
        state: ThreadState::Waiting,
        context: arch::Context {
            eip: 0,
            esp: 0,
            ebp: 0,
            eax: 0,
        },
        kstack_base: 0,
        kstack_size: 0,
        entry: 0,
        user_sp: 0,
        link_prev: TaskId::NONE,
        link_next: TaskId::NONE,
        queue_tag: crate::sched::TAG_NONE,
    };

    /// The stack-pointer value loaded into the TSS when this thread runs:
    /// the high end of its kernel stack.
    pub fn kstack_top(&self) -> u32 {
        self.kstack_base + self.kstack_size
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }
}

const EMPTY_PROC: Process = Process {
    live: false,
    ptype: ProcType::User,
    dir: 0,
    pdbr: 0,
    break_point: 0,
    brk_base: 0,
    vaddr: RangeMap::new(),
};

pub struct Table {
    procs: [Process; PROC_NUM],
    threads: [Thread; TASK_NUM],
    next_pid: u32,
}

impl Table {
    pub const fn new() -> Self {
        Self {
            procs: [EMPTY_PROC; PROC_NUM],
            threads: [Thread::EMPTY; TASK_NUM],
            next_pid: 0,
        }
    }

    /// Installs process 0 / thread 0: the idle kernel context, running on
    /// the boot stack in the idle directory.
    pub fn init_idle(&mut self, pdbr: u32) {
        self.procs[0] = Process {
            live: true,
            ptype: ProcType::Kernel,
            dir: DIR_IDLE,
            pdbr,
            break_point: 0,
            brk_base: 0,
            vaddr: RangeMap::new(),
        };
        let idle = &mut self.threads[TaskId::IDLE.index()];
        *idle = Thread::EMPTY;
        idle.live = true;
        idle.state = ThreadState::Running;
        idle.kstack_base =
            memmap::KERNEL_STACK_TOP + 4 - KERNEL_STACK_SIZE as u32;
        idle.kstack_size = KERNEL_STACK_SIZE as u32;
        self.next_pid = 1;
    }

    pub fn proc(&self, pid: u32) -> &Process {
        &self.procs[pid as usize]
    }

    pub fn proc_mut(&mut self, pid: u32) -> &mut Process {
        &mut self.procs[pid as usize]
    }

    pub fn thread(&self, id: TaskId) -> &Thread {
        &self.threads[id.index()]
    }

    pub fn thread_mut(&mut self, id: TaskId) -> &mut Thread {
        &mut self.threads[id.index()]
    }

    /// Checks that `id` names a live task.
    pub fn exists(&self, id: TaskId) -> bool {
        id.is_valid()
            && self.threads[id.index()].live
            && self.procs[id.pid() as usize].live
    }

    /// Process class of a live task.
    pub fn ptype_of(&self, id: TaskId) -> ProcType {
        self.procs[id.pid() as usize].ptype
    }

    /// Reserves the next process id. Ids are never reused, so the table
    /// running out ends process creation for this uptime.
    pub(crate) fn alloc_pid(&mut self) -> Option<u32> {
        if (self.next_pid as usize) < PROC_NUM {
            let pid = self.next_pid;
            self.next_pid += 1;
            Some(pid)
        } else {
            None
        }
    }

    /// Reserves a free thread slot in `pid`.
    fn alloc_tid(&mut self, pid: u32) -> Option<u32> {
        (0..THREAD_NUM_PER_PROC as u32).find(|&tid| {
            !self.threads[TaskId::from_parts(pid, tid).index()].live
        })
    }
}

/// Creates and schedules a thread of `pid` entering `entry` on `user_sp`.
pub fn create_thread(
    k: &mut Kernel,
    pid: u32,
    entry: u32,
    user_sp: u32,
) -> Result<TaskId, UserError> {
    let tid = k
        .tasks
        .alloc_tid(pid)
        .ok_or(Error::NoResource)?;
    let id = TaskId::from_parts(pid, tid);

    let kstack = k
        .heap
        .alloc(&mut k.phys, &mut k.pages, KERNEL_STACK_SIZE as u32)
        .ok_or(Error::NoMemory)?;
    let kstack_top = kstack + KERNEL_STACK_SIZE as u32;

    let user = k.tasks.proc(pid).ptype != ProcType::Kernel;
    let t = k.tasks.thread_mut(id);
    *t = Thread::EMPTY;
    t.live = true;
    t.state = ThreadState::Ready;
    t.kstack_base = kstack;
    t.kstack_size = KERNEL_STACK_SIZE as u32;
    t.entry = entry;
    t.user_sp = user_sp;
    t.context = arch::thread_entry_context(kstack_top, entry, user_sp, user);

    sched::add(&mut k.sched, &mut k.tasks, id);
    Ok(id)
}

/// Creates a process from an ELF image: directory, loaded segments, user
/// stack, initial thread. On any failure the pieces already built are torn
/// back down in reverse order.
pub fn proc_add(
    k: &mut Kernel,
    ptype: ProcType,
    image: &[u8],
) -> Result<TaskId, UserError> {
    let pid = k.tasks.alloc_pid().ok_or(Error::NoResource)?;
    let dir = k
        .pages
        .alloc_dir(&mut k.phys, pid)
        .map_err(UserError::Recoverable)?;

    let info = match elf::load(&mut k.phys, &mut k.pages, dir, image) {
        Ok(i) => i,
        Err(e) => {
            k.pages.free_dir(&mut k.phys, dir);
            return Err(e.into());
        }
    };

    // The fixed user stack window, zeroed.
    let stack = match k.phys.alloc(USER_STACK_SIZE) {
        Some(f) => f,
        None => {
            elf::unload(&mut k.phys, &mut k.pages, dir, &info);
            k.pages.free_dir(&mut k.phys, dir);
            return Err(Error::NoMemory.into());
        }
    };
    k.pages.set_phys(stack, 0, USER_STACK_SIZE as usize);
    if let Err(e) = k.pages.map(
        &mut k.phys,
        dir,
        USER_STACK_BASE,
        stack,
        USER_STACK_SIZE,
        PageFlags::RW | PageFlags::USER,
    ) {
        k.phys.free(stack);
        elf::unload(&mut k.phys, &mut k.pages, dir, &info);
        k.pages.free_dir(&mut k.phys, dir);
        return Err(e.into());
    }

    let brk_base = memmap::page_round_up(info.image_end);
    let pdbr = k.pages.dir_frame(dir);
    let p = k.tasks.proc_mut(pid);
    p.live = true;
    p.ptype = ptype;
    p.dir = dir;
    p.pdbr = pdbr;
    p.break_point = brk_base;
    p.brk_base = brk_base;
    p.vaddr = RangeMap::new();
    p.vaddr.init(
        brk_base + PROC_BRK_MAX,
        USER_STACK_BASE - (brk_base + PROC_BRK_MAX),
    );

    let user_sp = USER_STACK_BASE + USER_STACK_SIZE - 16;
    match create_thread(k, pid, info.entry, user_sp) {
        Ok(id) => Ok(id),
        Err(e) => {
            k.tasks.proc_mut(pid).live = false;
            k.phys.free(stack);
            elf::unload(&mut k.phys, &mut k.pages, dir, &info);
            k.pages.free_dir(&mut k.phys, dir);
            Err(e)
        }
    }
}

/// Forks the calling thread's process: a new directory with every user
/// page deep-copied, plus a clone of the calling thread made from a copy
/// of its kernel stack.
///
/// Returns the child's pid on the parent path and 0 on the child path,
/// which executes later, when the scheduler first runs the child.
pub fn proc_fork(k: &mut Kernel, caller: TaskId) -> Result<u32, UserError> {
    let parent_pid = caller.pid();

    let mut child_ctx = arch::Context::default();
    if arch::fork_capture(&mut child_ctx) {
        // Child path, resumed on the copied kernel stack. The stack frames
        // below this point still hold parent-stack frame pointers, so this
        // path must return straight out without unwinding through them.
        return Ok(0);
    }

    let pid = k.tasks.alloc_pid().ok_or(Error::NoResource)?;
    let dir = k
        .pages
        .alloc_dir(&mut k.phys, pid)
        .map_err(UserError::Recoverable)?;

    // Deep-copy every user mapping through the scratch channels, walking
    // the parent directory page by page.
    let parent_dir = k.tasks.proc(parent_pid).dir;
    let mut cursor = USER_BASE;
    while let Some((va, pa, fl)) =
        k.pages.next_user_mapping(parent_dir, cursor)
    {
        let frame = match k.phys.alloc(PAGE_SIZE as u32) {
            Some(f) => f,
            None => {
                unwind_fork_copies(k, dir);
                return Err(Error::NoMemory.into());
            }
        };
        k.pages.copy_phys_to_phys(frame, pa, PAGE_SIZE);
        if k
            .pages
            .map(&mut k.phys, dir, va, frame, PAGE_SIZE as u32, fl)
            .is_err()
        {
            k.phys.free(frame);
            unwind_fork_copies(k, dir);
            return Err(Error::NoMemory.into());
        }
        cursor = va + PAGE_SIZE as u32;
    }

    // Clone the calling thread: same kernel-stack image, context rebased
    // into the copy.
    let kstack_size = k.tasks.thread(caller).kstack_size;
    let parent_base = k.tasks.thread(caller).kstack_base;
    let child_stack = match k.heap.alloc(&mut k.phys, &mut k.pages, kstack_size)
    {
        Some(s) => s,
        None => {
            unwind_fork_copies(k, dir);
            return Err(Error::NoMemory.into());
        }
    };
    let delta = child_stack.wrapping_sub(parent_base);
    child_ctx.esp = child_ctx.esp.wrapping_add(delta);
    child_ctx.ebp = child_ctx.ebp.wrapping_add(delta);

    let pdbr = k.pages.dir_frame(dir);
    let parent = k.tasks.proc(parent_pid);
    let (ptype, break_point, brk_base, vaddr) = (
        parent.ptype,
        parent.break_point,
        parent.brk_base,
        parent.vaddr,
    );
    let p = k.tasks.proc_mut(pid);
    p.live = true;
    p.ptype = ptype;
    p.dir = dir;
    p.pdbr = pdbr;
    p.break_point = break_point;
    p.brk_base = brk_base;
    p.vaddr = vaddr;

    let child = TaskId::from_parts(pid, 0);
    {
        let parent_t = k.tasks.thread(caller);
        let (entry, user_sp) = (parent_t.entry, parent_t.user_sp);
        let t = k.tasks.thread_mut(child);
        *t = Thread::EMPTY;
        t.live = true;
        t.state = ThreadState::Ready;
        t.kstack_base = child_stack;
        t.kstack_size = kstack_size;
        t.entry = entry;
        t.user_sp = user_sp;
        t.context = child_ctx;
    }

    // Copy the stack last, so everything the child resumes with -- the
    // captured frame included -- is present in the image.
    unsafe {
        let src = arch::mem_slice(parent_base, kstack_size as usize);
        let dst = arch::mem_slice(child_stack, kstack_size as usize);
        dst.copy_from_slice(src);
    }

    sched::add(&mut k.sched, &mut k.tasks, child);
    Ok(pid)
}

/// Frees every page copied into a half-built child directory, then the
/// directory itself. All child user mappings are fork-created copies, so
/// the frames are ours to release.
fn unwind_fork_copies(k: &mut Kernel, dir: DirId) {
    while let Some((va, frame, _)) = k.pages.next_user_mapping(dir, USER_BASE)
    {
        k.pages.unmap(&mut k.phys, dir, va, PAGE_SIZE as u32);
        k.phys.free(frame);
    }
    k.pages.free_dir(&mut k.phys, dir);
}

/// Adjusts the caller's break by `quantity` bytes, mapping or releasing
/// frames page by page, and returns the new break.
pub fn set_break(
    k: &mut Kernel,
    caller: TaskId,
    quantity: i32,
) -> Result<u32, UserError> {
    let pid = caller.pid();
    let (dir, old_brk, brk_base) = {
        let p = k.tasks.proc(pid);
        (p.dir, p.break_point, p.brk_base)
    };
    let new_brk = old_brk.wrapping_add(quantity as u32);
    if new_brk < brk_base
        || new_brk > brk_base + PROC_BRK_MAX
        || !memmap::user_range_ok(brk_base, new_brk - brk_base + 1)
    {
        return Err(Error::Param.into());
    }

    let old_top = memmap::page_round_up(old_brk);
    let new_top = memmap::page_round_up(new_brk);

    let mut page = old_top;
    while page < new_top {
        let frame = match k.phys.alloc(PAGE_SIZE as u32) {
            Some(f) => f,
            None => {
                // Roll back this call's growth.
                while page > old_top {
                    page -= PAGE_SIZE as u32;
                    release_brk_page(k, dir, page);
                }
                return Err(Error::NoMemory.into());
            }
        };
        k.pages.set_phys(frame, 0, PAGE_SIZE);
        if k
            .pages
            .map(
                &mut k.phys,
                dir,
                page,
                frame,
                PAGE_SIZE as u32,
                PageFlags::RW | PageFlags::USER,
            )
            .is_err()
        {
            k.phys.free(frame);
            while page > old_top {
                page -= PAGE_SIZE as u32;
                release_brk_page(k, dir, page);
            }
            return Err(Error::NoMemory.into());
        }
        page += PAGE_SIZE as u32;
    }
    let mut page = old_top;
    while page > new_top {
        page -= PAGE_SIZE as u32;
        release_brk_page(k, dir, page);
    }

    k.tasks.proc_mut(pid).break_point = new_brk;
    Ok(new_brk)
}

fn release_brk_page(k: &mut Kernel, dir: DirId, page: u32) {
    if let Some((frame, _)) = k.pages.walk(dir, page) {
        k.pages.unmap(&mut k.phys, dir, page, PAGE_SIZE as u32);
        k.phys.free(frame);
    }
}

/// Halts a task after an unrecoverable fault: logged, parked in `waiting`
/// forever. If the victim is the running task this does not return to it
/// until the end of time.
pub fn halt(k: &mut Kernel, id: TaskId, fault: FaultInfo) {
    klog!("task {:#x} halted: {:?}", id.0, fault);
    let was_current = k.sched.current() == id;
    sched::stop(&mut k.sched, &mut k.tasks, id);
    if was_current {
        sched::exec(k);
    }
}

/// Sanity check used by tests and assertions: exactly one live thread is
/// in the running state.
#[cfg(test)]
pub(crate) fn running_count(tasks: &Table) -> usize {
    (0..TASK_NUM)
        .filter(|&i| {
            tasks.threads[i].live
                && tasks.threads[i].state == ThreadState::Running
        })
        .count()
}

/// Checks user-range plausibility of a mapped segment described by the
/// loader; kept here because proc setup owns the policy.
pub fn user_addr_ok(addr: u32, size: u32) -> bool {
    memmap::user_range_ok(addr, size) && addr >= USER_BASE
}
