// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything that crosses the user/kernel boundary is defined here, once:
//! task identifiers, process classes, the stable error numbers, the software
//! interrupt vector assignments, the per-family function ids, and the
//! parameter block layouts. The kernel depends on this crate; applications
//! get it re-exported through `userlib`.

#![no_std]

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod bootinfo;
pub mod memmap;

/// Number of process slots. Process ids are indexes into this space and are
/// never reused within an uptime.
pub const PROC_NUM: usize = 64;

/// Number of thread slots per process.
pub const THREAD_NUM_PER_PROC: usize = 32;

/// Number of task slots overall. A task is one schedulable thread; its id
/// packs the owning process id and the thread id into one word.
pub const TASK_NUM: usize = PROC_NUM * THREAD_NUM_PER_PROC;

/// Kernel tick rate, in ticks per second.
pub const TICK_HZ: u32 = 100;

/// Upper bound on a single IPC payload, in bytes.
pub const MSG_SIZE_MAX: usize = 4096;

/// Number of message buffers in the global pool. This bounds the total
/// number of in-flight, unreceived messages and is the system's back-pressure
/// knob.
pub const MSG_BUFFER_NUM: usize = 1024;

/// Number of timer records (sleepers plus kernel-internal timers).
pub const TIMER_NUM: usize = 256;

/// Number of task-name registry slots.
pub const TASKNAME_NUM: usize = 256;

/// Longest registrable task name, in bytes, not counting the terminator.
pub const TASKNAME_LEN_MAX: usize = 255;

/// Per-thread kernel stack size, in bytes.
pub const KERNEL_STACK_SIZE: usize = 0x2000;

/// Upper bound on entries in one bulk I/O-port request.
pub const IOPORT_BULK_MAX: usize = 32;

/// Number of hardware IRQ lines behind the cascaded interrupt controller.
pub const IRQ_NUM: usize = 16;

/// Names a schedulable task: one thread of one process.
///
/// The low [`TaskId::TID_BITS`] bits are the thread id within the owning
/// process; the bits above are the process id. The packed value doubles as
/// the task's index in every kernel table, so `pid_of`/`tid_of` style
/// projections are the *only* legal way to take a `TaskId` apart.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Number of bits used for the thread id part.
    pub const TID_BITS: u32 = 5;

    /// Derived mask of the thread id part.
    pub const TID_MASK: u32 = (1 << Self::TID_BITS) - 1;

    /// Reserved "no task" value, used as the null link in wait lists and as
    /// the ANY filter in receive.
    pub const NONE: Self = Self(!0);

    /// The idle task: thread 0 of process 0.
    pub const IDLE: Self = Self(0);

    /// Fabricates a `TaskId` from a process id and thread id.
    pub const fn from_parts(pid: u32, tid: u32) -> Self {
        TaskId((pid << Self::TID_BITS) | (tid & Self::TID_MASK))
    }

    /// Extracts the process id part.
    pub const fn pid(self) -> u32 {
        self.0 >> Self::TID_BITS
    }

    /// Extracts the thread id part.
    pub const fn tid(self) -> u32 {
        self.0 & Self::TID_MASK
    }

    /// Returns the task table index this id designates. The packing is chosen
    /// so that this is the identity function on the packed value.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Checks whether this id can name a real task slot at all.
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < TASK_NUM
    }
}

static_assertions::const_assert!(TASK_NUM <= 1 << 16);
static_assertions::const_assert_eq!(
    THREAD_NUM_PER_PROC,
    1 << TaskId::TID_BITS
);

/// Process class. Determines scheduling order, IPC adjacency, and service
/// authority.
///
/// The numeric values are load-bearing: the scheduler scans classes in
/// ascending order, and IPC adjacency is defined as a difference of at most
/// one between the ordinals of the two peers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ProcType {
    Kernel = 0,
    Driver = 1,
    Server = 2,
    User = 3,
}

impl ProcType {
    /// Number of distinct classes.
    pub const COUNT: usize = 4;

    /// Checks the IPC adjacency rule: peers must be in the same or a
    /// neighboring class. This enforces the kernel-driver-server-user
    /// cascade.
    pub fn is_adjacent_to(self, other: Self) -> bool {
        (self as i8 - other as i8).abs() <= 1
    }

    /// Descriptor privilege level for code of this class. Kernel processes
    /// run in ring 0, everything else in ring 3.
    pub fn dpl(self) -> u8 {
        match self {
            ProcType::Kernel => 0,
            _ => 3,
        }
    }
}

impl core::convert::TryFrom<u8> for ProcType {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Kernel),
            1 => Ok(Self::Driver),
            2 => Ok(Self::Server),
            3 => Ok(Self::User),
            _ => Err(()),
        }
    }
}

/// Service error numbers. These are on-the-wire values written into the
/// `err` field of parameter blocks and must stay stable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Error {
    /// Success.
    None = 0,
    /// An argument was invalid.
    Param = 1,
    /// The caller's process class is not allowed to use this service.
    Unauthorized = 2,
    /// The target task does not exist.
    NoExist = 3,
    /// Sender and receiver are not in adjacent process classes.
    ProcType = 4,
    /// The payload exceeds the size cap.
    SizeOver = 5,
    /// The message-buffer pool or frame pool is exhausted.
    NoMemory = 6,
    /// No free slot in a fixed-size table.
    NoResource = 7,
    /// The IRQ line is already being monitored.
    AlreadyStart = 8,
    /// The task name is already in use.
    Registered = 9,
    /// No matching task-name entry.
    NoRegistered = 10,
    /// I/O-memory allocation failed claiming the physical window.
    IoAlloc = 11,
    /// I/O-memory allocation failed reserving the virtual range.
    VirtAlloc = 12,
    /// I/O-memory allocation failed establishing the mapping.
    PageSet = 13,
}

/// We use an explicit `TryFrom` impl instead of a `FromPrimitive` derive
/// because the kernel doesn't otherwise depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Error {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x {
            0 => Ok(Self::None),
            1 => Ok(Self::Param),
            2 => Ok(Self::Unauthorized),
            3 => Ok(Self::NoExist),
            4 => Ok(Self::ProcType),
            5 => Ok(Self::SizeOver),
            6 => Ok(Self::NoMemory),
            7 => Ok(Self::NoResource),
            8 => Ok(Self::AlreadyStart),
            9 => Ok(Self::Registered),
            10 => Ok(Self::NoRegistered),
            11 => Ok(Self::IoAlloc),
            12 => Ok(Self::VirtAlloc),
            13 => Ok(Self::PageSet),
            _ => Err(()),
        }
    }
}

/// `ret` field value for a failed call.
pub const RET_FAILURE: i32 = -1;
/// `ret` field value for a successful call.
pub const RET_SUCCESS: i32 = 0;

/// Software-interrupt vector assignments, one per service family. These are
/// stable: user code compiled against them must keep working across kernel
/// releases.
pub mod vector {
    /// First vector taken by hardware IRQ lines (IRQ0..15 occupy 16 vectors
    /// from here).
    pub const IRQ_BASE: u8 = 0x20;

    pub const INTERRUPT: u8 = 0x30;
    pub const IOMEM: u8 = 0x31;
    pub const IOPORT: u8 = 0x32;
    pub const MESSAGE: u8 = 0x33;
    pub const PROCESS: u8 = 0x34;
    pub const TASK: u8 = 0x35;
    pub const TASKNAME: u8 = 0x36;
    pub const THREAD: u8 = 0x37;
    pub const TIMER: u8 = 0x38;
}

/// Function ids of the `message` family.
pub mod msg {
    pub const FUNC_RECEIVE: u32 = 0x0000_0001;
    pub const FUNC_SEND: u32 = 0x0000_0002;
    pub const FUNC_SEND_NB: u32 = 0x0000_0003;
}

/// Function ids of the `interrupt` family.
pub mod int {
    pub const FUNC_START_MONITORING: u32 = 0x0000_0001;
    pub const FUNC_STOP_MONITORING: u32 = 0x0000_0002;
    pub const FUNC_WAIT: u32 = 0x0000_0003;
    pub const FUNC_COMPLETE: u32 = 0x0000_0004;
    pub const FUNC_ENABLE: u32 = 0x0000_0005;
    pub const FUNC_DISABLE: u32 = 0x0000_0006;
}

/// Function ids of the `io-port` family.
pub mod ioport {
    pub const FUNC_IN_BYTE: u32 = 0x0000_0001;
    pub const FUNC_IN_WORD: u32 = 0x0000_0002;
    pub const FUNC_IN_DWORD: u32 = 0x0000_0003;
    pub const FUNC_OUT_BYTE: u32 = 0x0000_0004;
    pub const FUNC_OUT_WORD: u32 = 0x0000_0005;
    pub const FUNC_OUT_DWORD: u32 = 0x0000_0006;
    pub const FUNC_BULK: u32 = 0x0000_0007;

    /// Direction of one bulk entry.
    pub const DIR_IN: u8 = 0;
    pub const DIR_OUT: u8 = 1;
}

/// Function ids of the `io-memory` family.
pub mod iomem {
    pub const FUNC_ALLOC: u32 = 0x0000_0001;
}

/// Function ids of the `process` family.
pub mod proc {
    pub const FUNC_SET_BREAKPOINT: u32 = 0x0000_0001;
    pub const FUNC_FORK: u32 = 0x0000_0002;
}

/// Function ids of the `task` family.
pub mod task {
    pub const FUNC_GET_ID: u32 = 0x0000_0001;
}

/// Function ids of the `task-name` family.
pub mod taskname {
    pub const FUNC_GET: u32 = 0x0000_0001;
    pub const FUNC_UNREGISTER: u32 = 0x0000_0002;
    pub const FUNC_REGISTER: u32 = 0x0000_0003;
}

/// Function ids of the `thread` family.
pub mod thread {
    pub const FUNC_CREATE: u32 = 0x0000_0001;
}

/// Function ids of the `timer` family.
pub mod timer {
    pub const FUNC_SLEEP: u32 = 0x0000_0001;
}

/// Common header of every parameter block.
///
/// User code builds a family-specific block whose first three fields are
/// exactly these, places the block's address in `ESI`, and issues the
/// family's software interrupt. The kernel routes on `func_id` and fills
/// `err` and `ret` (plus family out-params) in place before returning.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ParamHeader {
    pub func_id: u32,
    pub err: u32,
    pub ret: i32,
}

/// Parameter block of the `message` family.
///
/// `peer` is the destination for send, the source filter for receive
/// ([`TaskId::NONE`] meaning ANY), and carries the actual source back out of
/// a successful receive. `timeout_ms` of zero means wait forever.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct MsgParam {
    pub header: ParamHeader,
    pub peer: TaskId,
    pub buffer: u32,
    pub size: u32,
    pub timeout_ms: u32,
}

/// Parameter block of the `interrupt` family. `flags` carries the pending
/// IRQ bitmap out of a successful wait.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct IntParam {
    pub header: ParamHeader,
    pub irq_no: u32,
    pub flags: u32,
}

/// Parameter block of the `io-port` family. For the single-width functions
/// `data` points at `count` units of the transfer width; for `FUNC_BULK` it
/// points at `count` [`IoPortBulkEntry`] records.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct IoPortParam {
    pub header: ParamHeader,
    pub port_no: u16,
    pub reserved: u16,
    pub data: u32,
    pub count: u32,
}

/// One entry of a bulk I/O-port request.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct IoPortBulkEntry {
    pub port_no: u16,
    pub dir: u8,
    pub width: u8,
    pub data: u32,
}

/// Parameter block of the `io-memory` family. `virt` receives the mapped
/// user-side window address.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct IoMemParam {
    pub header: ParamHeader,
    pub phys: u32,
    pub size: u32,
    pub virt: u32,
}

/// Parameter block of the `process` family. For `FUNC_SET_BREAKPOINT`,
/// `quantity` is the signed delta and `break_point` receives the new break.
/// For `FUNC_FORK`, `pid` receives the child's process id in the parent and
/// zero in the child.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ProcParam {
    pub header: ParamHeader,
    pub quantity: i32,
    pub break_point: u32,
    pub pid: u32,
}

/// Parameter block of the `task` family.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct TaskParam {
    pub header: ParamHeader,
    pub task_id: TaskId,
}

/// Parameter block of the `task-name` family. `name` points at a
/// NUL-terminated string of at most [`TASKNAME_LEN_MAX`] bytes.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct TaskNameParam {
    pub header: ParamHeader,
    pub task_id: TaskId,
    pub name: u32,
}

/// Parameter block of the `thread` family. `task_id` receives the new
/// thread's task id.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ThreadParam {
    pub header: ParamHeader,
    pub entry: u32,
    pub stack_addr: u32,
    pub stack_size: u32,
    pub task_id: TaskId,
}

/// Parameter block of the `timer` family.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct TimerParam {
    pub header: ParamHeader,
    pub usec: u32,
}
