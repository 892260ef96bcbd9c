// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous message passing.
//!
//! A sender copies its payload into a buffer from the global pool and the
//! buffer joins the destination's inbound queue; the pool bound is the
//! system's back-pressure knob. A blocking sender then parks in
//! `send-wait` until a receiver drains that buffer; `send_nb` returns
//! immediately and the buffer simply belongs to the destination queue
//! until received (fire-and-forget -- the payload is pool-owned, never
//! charged to the sender after the call).
//!
//! Receivers drain their queue in FIFO order, optionally filtered to a
//! single source task, and block in `recv-wait` when nothing matches.
//! Both sides are subject to the adjacency rule: peers must be in the same
//! or a neighboring process class.

use abi::{Error, TaskId, MSG_BUFFER_NUM, MSG_SIZE_MAX, TASK_NUM};

use crate::arch;
use crate::err::UserError;
use crate::kernel::Kernel;
use crate::sched;
use crate::time::{self, TIMER_NIL};
use crate::umem;

const BUF_NIL: u16 = u16::MAX;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpcState {
    Idle,
    SendWait,
    RecvWait,
}

#[derive(Copy, Clone)]
struct BufMeta {
    /// Sending task, for receive filters and sender wake-up.
    src: TaskId,
    len: u16,
    next: u16,
}

const BUF_EMPTY: BufMeta = BufMeta {
    src: TaskId::NONE,
    len: 0,
    next: BUF_NIL,
};

#[derive(Copy, Clone)]
struct IpcRecord {
    state: IpcState,
    /// Receive filter while in recv-wait; `TaskId::NONE` is ANY.
    filter: TaskId,
    /// Inbound queue of undelivered buffers, oldest at head.
    q_head: u16,
    q_tail: u16,
    /// The buffer a blocking sender is parked on.
    wait_buf: u16,
    /// Armed receive-timeout timer, if any.
    timer: u16,
    timed_out: bool,
}

const REC_EMPTY: IpcRecord = IpcRecord {
    state: IpcState::Idle,
    filter: TaskId::NONE,
    q_head: BUF_NIL,
    q_tail: BUF_NIL,
    wait_buf: BUF_NIL,
    timer: TIMER_NIL,
    timed_out: false,
};

pub struct MsgCtl {
    rec: [IpcRecord; TASK_NUM],
    bufs: [BufMeta; MSG_BUFFER_NUM],
    free_head: u16,
}

impl MsgCtl {
    pub const fn new() -> Self {
        Self {
            rec: [REC_EMPTY; TASK_NUM],
            bufs: [BUF_EMPTY; MSG_BUFFER_NUM],
            free_head: BUF_NIL,
        }
    }

    /// Threads every buffer onto the free list.
    pub fn init(&mut self) {
        self.rec = [REC_EMPTY; TASK_NUM];
        self.free_head = BUF_NIL;
        for i in (0..MSG_BUFFER_NUM).rev() {
            self.bufs[i] = BUF_EMPTY;
            self.bufs[i].next = self.free_head;
            self.free_head = i as u16;
        }
    }

    pub fn state_of(&self, id: TaskId) -> IpcState {
        self.rec[id.index()].state
    }

    /// Number of buffers currently in the pool.
    pub fn free_buffers(&self) -> usize {
        let mut n = 0;
        let mut b = self.free_head;
        while b != BUF_NIL {
            n += 1;
            b = self.bufs[b as usize].next;
        }
        n
    }

    fn take_buffer(&mut self) -> Option<u16> {
        let b = self.free_head;
        if b == BUF_NIL {
            return None;
        }
        self.free_head = self.bufs[b as usize].next;
        self.bufs[b as usize] = BUF_EMPTY;
        Some(b)
    }

    fn release_buffer(&mut self, b: u16) {
        self.bufs[b as usize] = BUF_EMPTY;
        self.bufs[b as usize].next = self.free_head;
        self.free_head = b;
    }

    fn queue_push(&mut self, dst: TaskId, b: u16) {
        self.bufs[b as usize].next = BUF_NIL;
        let tail = self.rec[dst.index()].q_tail;
        if tail == BUF_NIL {
            self.rec[dst.index()].q_head = b;
        } else {
            self.bufs[tail as usize].next = b;
        }
        self.rec[dst.index()].q_tail = b;
    }

    /// Pops the oldest queued buffer matching `filter` (`NONE` = any).
    fn queue_pop(&mut self, dst: TaskId, filter: TaskId) -> Option<u16> {
        let mut prev = BUF_NIL;
        let mut cur = self.rec[dst.index()].q_head;
        while cur != BUF_NIL {
            let meta = self.bufs[cur as usize];
            if filter == TaskId::NONE || meta.src == filter {
                if prev == BUF_NIL {
                    self.rec[dst.index()].q_head = meta.next;
                } else {
                    self.bufs[prev as usize].next = meta.next;
                }
                if self.rec[dst.index()].q_tail == cur {
                    self.rec[dst.index()].q_tail = prev;
                }
                return Some(cur);
            }
            prev = cur;
            cur = meta.next;
        }
        None
    }
}

/// Checks destination validity and the adjacency rule for `caller`
/// against `peer`.
fn check_peer(
    k: &Kernel,
    caller: TaskId,
    peer: TaskId,
) -> Result<(), UserError> {
    if !k.tasks.exists(peer) {
        return Err(Error::NoExist.into());
    }
    let a = k.tasks.ptype_of(caller);
    let b = k.tasks.ptype_of(peer);
    if !a.is_adjacent_to(b) {
        return Err(Error::ProcType.into());
    }
    Ok(())
}

/// Sends `len` bytes at `msg_va` to `dst`. With `blocking` the caller
/// parks until the message is received; otherwise the call returns as
/// soon as the message is queued.
pub fn send(
    k: &mut Kernel,
    caller: TaskId,
    dst: TaskId,
    msg_va: u32,
    len: u32,
    blocking: bool,
) -> Result<(), UserError> {
    if len as usize > MSG_SIZE_MAX {
        return Err(Error::SizeOver.into());
    }
    check_peer(k, caller, dst)?;

    let buf = match k.ipc.take_buffer() {
        Some(b) => b,
        None => return Err(Error::NoMemory.into()),
    };

    // Copy the payload into the pool while the caller's space is current.
    let payload =
        unsafe { core::slice::from_raw_parts_mut(arch::msg_payload(buf as usize), len as usize) };
    if let Err(f) = umem::read_bytes(k, caller, msg_va, payload) {
        k.ipc.release_buffer(buf);
        return Err(f.into());
    }
    k.ipc.bufs[buf as usize].src = caller;
    k.ipc.bufs[buf as usize].len = len as u16;
    k.ipc.queue_push(dst, buf);

    // A receiver parked for us (or for anyone) wakes now.
    let dst_rec = k.ipc.rec[dst.index()];
    if dst_rec.state == IpcState::RecvWait
        && (dst_rec.filter == TaskId::NONE || dst_rec.filter == caller)
    {
        sched::start(&mut k.sched, &mut k.tasks, dst);
    }

    if blocking {
        let r = &mut k.ipc.rec[caller.index()];
        r.state = IpcState::SendWait;
        r.wait_buf = buf;
        sched::block_current(k);
        // Resumed: the receiver consumed the buffer and cleared our state.
    }
    Ok(())
}

/// Receives a message into `buf_va` (capacity `cap`). `filter` restricts
/// the source; `TaskId::NONE` accepts anyone. A zero `timeout_ms` waits
/// forever. Returns the source and the copied length; a timed-out wait
/// reports `(TaskId::NONE, 0)`.
pub fn recv(
    k: &mut Kernel,
    caller: TaskId,
    filter: TaskId,
    buf_va: u32,
    cap: u32,
    timeout_ms: u32,
) -> Result<(TaskId, u32), UserError> {
    if filter != TaskId::NONE {
        check_peer(k, caller, filter)?;
    }

    if timeout_ms != 0 {
        let ticks = time::ms_to_ticks(timeout_ms);
        let t = time::set(
            &mut k.timers,
            caller,
            ticks,
            time::TimerKind::Oneshot,
            recv_timeout,
            caller.0,
        )
        .ok_or(Error::NoResource)?;
        k.ipc.rec[caller.index()].timer = t;
    }

    loop {
        if let Some(buf) = k.ipc.queue_pop(caller, filter) {
            disarm_timeout(k, caller);
            let meta = k.ipc.bufs[buf as usize];
            let n = (meta.len as u32).min(cap);
            let payload = unsafe {
                core::slice::from_raw_parts(
                    arch::msg_payload(buf as usize),
                    n as usize,
                )
            };
            if let Err(f) = umem::write_bytes(k, caller, buf_va, payload) {
                k.ipc.release_buffer(buf);
                wake_sender(k, meta.src, buf);
                return Err(f.into());
            }
            k.ipc.release_buffer(buf);
            wake_sender(k, meta.src, buf);
            k.ipc.rec[caller.index()].state = IpcState::Idle;
            return Ok((meta.src, n));
        }

        if k.ipc.rec[caller.index()].timed_out {
            let r = &mut k.ipc.rec[caller.index()];
            r.timed_out = false;
            r.timer = TIMER_NIL;
            r.state = IpcState::Idle;
            return Ok((TaskId::NONE, 0));
        }

        let r = &mut k.ipc.rec[caller.index()];
        r.state = IpcState::RecvWait;
        r.filter = filter;
        sched::block_current(k);

        if cfg!(not(target_os = "none")) {
            // The simulated machine cannot resume a suspended call; tests
            // observe the recv-wait state and re-issue the receive after
            // the wake instead.
            return Ok((TaskId::NONE, 0));
        }
    }
}

/// Clears a drained sender's wait state and reschedules it.
fn wake_sender(k: &mut Kernel, src: TaskId, buf: u16) {
    if !k.tasks.exists(src) {
        return;
    }
    let r = &mut k.ipc.rec[src.index()];
    if r.state == IpcState::SendWait && r.wait_buf == buf {
        r.state = IpcState::Idle;
        r.wait_buf = BUF_NIL;
        sched::start(&mut k.sched, &mut k.tasks, src);
    }
}

/// Clears timeout state on a successful receive. The timer may have
/// fired already (between wake and drain); the stale flag goes too.
fn disarm_timeout(k: &mut Kernel, caller: TaskId) {
    let t = k.ipc.rec[caller.index()].timer;
    if t != TIMER_NIL {
        time::unset(&mut k.timers, t);
    }
    let r = &mut k.ipc.rec[caller.index()];
    r.timer = TIMER_NIL;
    r.timed_out = false;
}

/// Timer callback for a receive timeout: flags the receiver and pulls it
/// off the wait list.
fn recv_timeout(k: &mut Kernel, _timer: u16, arg: u32) {
    let id = TaskId(arg);
    let r = &mut k.ipc.rec[id.index()];
    r.timed_out = true;
    r.timer = TIMER_NIL;
    if r.state == IpcState::RecvWait {
        r.state = IpcState::Idle;
        sched::start(&mut k.sched, &mut k.tasks, id);
    }
}
