// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The priority-class round-robin scheduler.
//!
//! Two run groups alternate roles: one is drained ("running") while the
//! other collects work ("reserved"). Each group holds a FIFO queue per
//! process class, scanned kernel -> driver -> server -> user, so a
//! higher-class task always runs before any lower-class one in the same
//! pass. When the running group drains, the groups swap roles -- but only
//! if anything ran this pass; otherwise the idle thread takes over. The
//! swap is what makes the round-robin cheap: re-queued tasks land in the
//! reserved group and become eligible in one move.
//!
//! Queues are intrusive: each thread record carries prev/next links plus a
//! tag naming the queue it is on. Everything here is ids; the tables are
//! borrowed per call.

use abi::{ProcType, TaskId};

use crate::arch;
use crate::kernel::Kernel;
use crate::task::{Table, ThreadState};

/// Queue tags. A thread is on at most one queue at any time.
pub(crate) const TAG_NONE: u8 = 0xFF;
pub(crate) const TAG_WAIT: u8 = 0xFE;

fn tag_of(group: usize, class: usize) -> u8 {
    (group * ProcType::COUNT + class) as u8
}

#[derive(Copy, Clone)]
struct Queue {
    head: TaskId,
    tail: TaskId,
}

const EMPTY_Q: Queue = Queue {
    head: TaskId::NONE,
    tail: TaskId::NONE,
};

pub struct Scheduler {
    queues: [Queue; 2 * ProcType::COUNT],
    wait: Queue,
    running_grp: usize,
    ran_anything: bool,
    current: TaskId,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            queues: [EMPTY_Q; 2 * ProcType::COUNT],
            wait: EMPTY_Q,
            running_grp: 0,
            ran_anything: false,
            current: TaskId::IDLE,
        }
    }

    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// The running task. Exactly one thread is in this role at all times.
    pub fn current(&self) -> TaskId {
        self.current
    }

    fn queue(&mut self, tag: u8) -> &mut Queue {
        if tag == TAG_WAIT {
            &mut self.wait
        } else {
            &mut self.queues[tag as usize]
        }
    }

    fn push_head(&mut self, tasks: &mut Table, tag: u8, id: TaskId) {
        uassert!(tasks.thread(id).queue_tag == TAG_NONE);
        let old = self.queue(tag).head;
        {
            let t = tasks.thread_mut(id);
            t.link_prev = TaskId::NONE;
            t.link_next = old;
            t.queue_tag = tag;
        }
        if old == TaskId::NONE {
            self.queue(tag).tail = id;
        } else {
            tasks.thread_mut(old).link_prev = id;
        }
        self.queue(tag).head = id;
    }

    fn pop_tail(&mut self, tasks: &mut Table, tag: u8) -> Option<TaskId> {
        let id = self.queue(tag).tail;
        if id == TaskId::NONE {
            return None;
        }
        self.unlink(tasks, id);
        Some(id)
    }

    /// Removes `id` from whatever queue it is on, if any.
    fn unlink(&mut self, tasks: &mut Table, id: TaskId) {
        let (tag, prev, next) = {
            let t = tasks.thread(id);
            (t.queue_tag, t.link_prev, t.link_next)
        };
        if tag == TAG_NONE {
            return;
        }
        if prev == TaskId::NONE {
            self.queue(tag).head = next;
        } else {
            tasks.thread_mut(prev).link_next = next;
        }
        if next == TaskId::NONE {
            self.queue(tag).tail = prev;
        } else {
            tasks.thread_mut(next).link_prev = prev;
        }
        let t = tasks.thread_mut(id);
        t.link_prev = TaskId::NONE;
        t.link_next = TaskId::NONE;
        t.queue_tag = TAG_NONE;
    }

    fn swap_groups(&mut self) {
        self.running_grp ^= 1;
        self.ran_anything = false;
    }

    /// Picks the next thread to run: the tail of the highest non-empty
    /// class queue in the running group, swapping group roles when the
    /// running group drains and anything ran this pass. Falls back to the
    /// idle thread.
    fn pick(&mut self, tasks: &mut Table) -> TaskId {
        loop {
            for class in 0..ProcType::COUNT {
                let tag = tag_of(self.running_grp, class);
                if let Some(id) = self.pop_tail(tasks, tag) {
                    return id;
                }
            }
            if !self.ran_anything {
                return TaskId::IDLE;
            }
            self.swap_groups();
        }
    }
}

/// Enqueues a runnable thread at the head of the reserved group's queue
/// for its class.
pub fn add(sched: &mut Scheduler, tasks: &mut Table, id: TaskId) {
    let class = tasks.ptype_of(id) as usize;
    let tag = tag_of(sched.running_grp ^ 1, class);
    sched.push_head(tasks, tag, id);
    tasks.thread_mut(id).state = ThreadState::Ready;
}

/// Takes `id` out of the scheduler: off any ready queue, onto the wait
/// list, state `waiting`. The running thread itself may be stopped; the
/// switch happens at the next `exec`.
pub fn stop(sched: &mut Scheduler, tasks: &mut Table, id: TaskId) {
    sched.unlink(tasks, id);
    sched.push_head(tasks, TAG_WAIT, id);
    tasks.thread_mut(id).state = ThreadState::Waiting;
}

/// Resumes a waiting thread: off the wait list, into the reserved group.
/// A thread that is not actually waiting is left alone.
pub fn start(sched: &mut Scheduler, tasks: &mut Table, id: TaskId) {
    if tasks.thread(id).queue_tag != TAG_WAIT {
        return;
    }
    sched.unlink(tasks, id);
    add(sched, tasks, id);
}

/// Runs the scheduler: accounts for the outgoing thread, picks the next
/// one, and switches to it.
pub fn exec(k: &mut Kernel) {
    let cur = k.sched.current;

    if cur == TaskId::IDLE {
        // Leaving idle: whatever accumulated in the reserved group becomes
        // eligible now. Idle is never queued; it is runnable by fiat.
        k.sched.swap_groups();
        k.tasks.thread_mut(cur).state = ThreadState::Ready;
    } else {
        match k.tasks.thread(cur).state {
            ThreadState::Running => {
                // Still runnable; it goes around again next pass.
                let class = k.tasks.ptype_of(cur) as usize;
                let tag = tag_of(k.sched.running_grp ^ 1, class);
                k.sched.push_head(&mut k.tasks, tag, cur);
                k.tasks.thread_mut(cur).state = ThreadState::Ready;
                k.sched.ran_anything = true;
            }
            ThreadState::Waiting => {
                k.sched.ran_anything = false;
            }
            ThreadState::Ready => {
                // The running thread can only be Running or Waiting here.
                uassert!(false);
            }
        }
    }

    let next = k.sched.pick(&mut k.tasks);
    k.sched.current = next;
    k.tasks.thread_mut(next).state = ThreadState::Running;

    if next == cur {
        return;
    }

    arch::tss_set_esp0(k.tasks.thread(next).kstack_top());
    let dir = k.tasks.proc(next.pid()).dir;
    let pdbr = k.tasks.proc(next.pid()).pdbr;
    k.pages.switch_dir(dir);

    let save: *mut arch::Context = &mut k.tasks.thread_mut(cur).context;
    let load: *const arch::Context = &k.tasks.thread(next).context;
    // Safety: both contexts belong to live threads with intact kernel
    // stacks; `load` was produced by a previous save, by fork_capture, or
    // by thread_entry_context.
    unsafe {
        arch::switch_context(save, load, pdbr);
    }
}

/// The standard blocking primitive: every suspension point in the kernel
/// (IPC wait, timer sleep, IRQ wait) is this call.
pub fn block_current(k: &mut Kernel) {
    let cur = k.sched.current;
    stop(&mut k.sched, &mut k.tasks, cur);
    exec(k);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn picks_idle_when_nothing_is_runnable() {
        let k = testutil::boot_kernel();
        // Idle is current; exec must keep it.
        exec(k);
        assert_eq!(k.sched.current(), TaskId::IDLE);
    }

    #[test]
    fn higher_class_always_runs_first() {
        let k = testutil::boot_kernel();
        let user = testutil::spawn(k, abi::ProcType::User);
        let driver = testutil::spawn(k, abi::ProcType::Driver);
        let server = testutil::spawn(k, abi::ProcType::Server);

        exec(k);
        assert_eq!(k.sched.current(), driver);
        exec(k);
        assert_eq!(k.sched.current(), server);
        exec(k);
        assert_eq!(k.sched.current(), user);
        assert_eq!(crate::task::running_count(&k.tasks), 1);
    }

    #[test]
    fn same_class_round_robins_fifo() {
        let k = testutil::boot_kernel();
        let a = testutil::spawn(k, abi::ProcType::Server);
        let b = testutil::spawn(k, abi::ProcType::Server);

        exec(k);
        assert_eq!(k.sched.current(), a);
        // a stays runnable: it yields, b runs, then a again.
        exec(k);
        assert_eq!(k.sched.current(), b);
        exec(k);
        assert_eq!(k.sched.current(), a);
        exec(k);
        assert_eq!(k.sched.current(), b);
    }

    #[test]
    fn blocked_task_is_skipped_until_started() {
        let k = testutil::boot_kernel();
        let a = testutil::spawn(k, abi::ProcType::Server);
        let b = testutil::spawn(k, abi::ProcType::Server);

        exec(k);
        assert_eq!(k.sched.current(), a);
        stop(&mut k.sched, &mut k.tasks, a);
        assert_eq!(
            k.tasks.thread(a).state(),
            crate::task::ThreadState::Waiting
        );
        exec(k);
        assert_eq!(k.sched.current(), b);
        // Only b is runnable now; it keeps the processor.
        exec(k);
        assert_eq!(k.sched.current(), b);

        start(&mut k.sched, &mut k.tasks, a);
        exec(k);
        assert_eq!(k.sched.current(), a);
    }

    #[test]
    fn all_blocked_falls_back_to_idle() {
        let k = testutil::boot_kernel();
        let a = testutil::spawn(k, abi::ProcType::Driver);
        exec(k);
        assert_eq!(k.sched.current(), a);
        stop(&mut k.sched, &mut k.tasks, a);
        exec(k);
        assert_eq!(k.sched.current(), TaskId::IDLE);
        // And a wake brings the machine back out of idle.
        start(&mut k.sched, &mut k.tasks, a);
        exec(k);
        assert_eq!(k.sched.current(), a);
    }

    #[test]
    fn start_of_non_waiting_task_is_a_no_op() {
        let k = testutil::boot_kernel();
        let a = testutil::spawn(k, abi::ProcType::Server);
        start(&mut k.sched, &mut k.tasks, a); // already ready
        exec(k);
        assert_eq!(k.sched.current(), a);
    }
}
