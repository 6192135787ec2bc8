// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and task code.
//!
//! Everything in this crate crosses the user/kernel boundary: identifiers,
//! flag words, error codes, the message wire format, and the boot protocol.
//! Types that are copied as raw bytes carry `zerocopy` derives and fixed
//! `repr(C)` layouts with no padding.

#![cfg_attr(not(test), no_std)]

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

/// Task identifier. Valid tasks are numbered starting at 1; 0 is reserved
/// for the per-CPU idle tasks, which never participate in IPC.
pub type Tid = i32;

/// Physical address.
pub type PAddr = usize;

/// Virtual address in a task's user address space.
pub type UAddr = usize;

/// Size of one physical/virtual page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Capacity of the task table. TIDs range over `1..=NUM_TASKS_MAX`.
pub const NUM_TASKS_MAX: usize = 16;

/// Maximum number of CPUs the kernel will bring online.
pub const NUM_CPUS_MAX: usize = 4;

/// Bound on task name length, in bytes.
pub const TASK_NAME_LEN: usize = 16;

/// Timer interrupt frequency the kernel is configured for.
pub const TICK_HZ: u64 = 100;

/// Scheduler time slice, in ticks.
pub const TASK_QUANTUM: u32 = (20 * TICK_HZ as u32) / 1000;

/// Number of distinct external interrupt lines.
pub const IRQ_MAX: usize = 32;

/// Bound on entries in each half of the boot memory map.
pub const MEMORY_MAP_ENTRIES_MAX: usize = 8;

/// `src` filter value accepting a message from any sender.
pub const IPC_ANY: Tid = 0;

/// `src` filter value refusing both messages and notifications.
pub const IPC_DENY: Tid = -1;

/// Source TID stamped on kernel-synthesized notification messages.
pub const FROM_KERNEL: Tid = 0;

/// Errors returned from syscalls, as small negative integers distinct from
/// every valid return domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Error {
    InvalidArg = -1,
    AlreadyUsed = -2,
    NotAllowed = -3,
    NoMemory = -4,
    TooManyTasks = -5,
    StillUsed = -6,
    InvalidPaddr = -7,
    InvalidUaddr = -8,
    WouldBlock = -9,
    TryAgain = -10,
    Aborted = -11,
    NotFound = -12,
}

impl Error {
    /// The integer form delivered through the syscall return register.
    pub const fn code(self) -> isize {
        self as i32 as isize
    }

    /// Decodes a syscall return value back into an error, if it is one.
    pub fn from_code(code: isize) -> Option<Error> {
        Some(match code {
            -1 => Error::InvalidArg,
            -2 => Error::AlreadyUsed,
            -3 => Error::NotAllowed,
            -4 => Error::NoMemory,
            -5 => Error::TooManyTasks,
            -6 => Error::StillUsed,
            -7 => Error::InvalidPaddr,
            -8 => Error::InvalidUaddr,
            -9 => Error::WouldBlock,
            -10 => Error::TryAgain,
            -11 => Error::Aborted,
            -12 => Error::NotFound,
            _ => return None,
        })
    }
}

/// Reasons a task stops, reported to its pager in an [`ExceptionPayload`].
///
/// User code may pass any value through `task_exit`; the kernel reserves the
/// values below for conditions it detects itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ExceptionReason {
    /// Voluntary exit through `task_exit` with no specific code.
    GraceExit = 1,
    /// The task touched an address outside the user-mappable window.
    InvalidUaddr = 2,
    /// The task's pager answered a page fault with the wrong message kind.
    InvalidPagerReply = 3,
}

bitflags::bitflags! {
    /// Pending asynchronous event bits. Notifications accumulate by OR and
    /// are consumed all at once by a single `NOTIFY_MSG` delivery. Bits
    /// beyond the named ones are available to applications.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct Notifications: u32 {
        const TIMER = 1 << 0;
        const IRQ = 1 << 1;
        const ABORTED = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Operation flags for the `ipc` syscall.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct IpcFlags: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const NOBLOCK = 1 << 2;
        /// Set by the kernel on messages it originates; never accepted from
        /// user code.
        const KERNEL = 1 << 3;
        const CALL = Self::SEND.bits() | Self::RECV.bits();
    }
}

bitflags::bitflags! {
    /// Flags for `pm_alloc`. An empty set requests uninitialized pages at
    /// any page-aligned address.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct AllocFlags: u32 {
        /// Zero the returned pages.
        const ZEROED = 1 << 0;
        /// Return only a base address aligned to the (rounded-up) size.
        const ALIGNED = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Page permissions for `vm_map`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct MapAttrs: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Page-fault description bits, as reported by the architecture.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct FaultKind: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Fault taken while the CPU was in user mode (or performing a
        /// checked user-pointer access on a task's behalf).
        const USER = 1 << 3;
        /// The translation existed but the access kind was not permitted.
        const PRESENT = 1 << 4;
    }
}

/// Receive filter, decoded from the raw `src` syscall argument.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpcFilter {
    /// Accept a message from any sender.
    Any,
    /// Refuse messages and notifications alike.
    Deny,
    /// Accept only from this task.
    Task(Tid),
}

impl IpcFilter {
    pub fn decode(raw: i32) -> Result<Self, Error> {
        match raw {
            IPC_ANY => Ok(IpcFilter::Any),
            IPC_DENY => Ok(IpcFilter::Deny),
            t if t > 0 && t as usize <= NUM_TASKS_MAX => Ok(IpcFilter::Task(t)),
            _ => Err(Error::InvalidArg),
        }
    }

    /// Whether a message from `tid` passes this filter.
    pub fn accepts(self, tid: Tid) -> bool {
        match self {
            IpcFilter::Any => true,
            IpcFilter::Deny => false,
            IpcFilter::Task(t) => t == tid,
        }
    }
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Sysnum {
    Ipc = 1,
    Notify = 2,
    TaskCreate = 3,
    TaskDestroy = 4,
    TaskExit = 5,
    TaskSelf = 6,
    PmAlloc = 7,
    VmMap = 8,
    VmUnmap = 9,
    IrqListen = 10,
    IrqUnlisten = 11,
    SerialWrite = 12,
    SerialRead = 13,
    Time = 14,
    Uptime = 15,
    Shutdown = 16,
    Hinavm = 17,
    Epoch = 18,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<usize> for Sysnum {
    type Error = ();

    fn try_from(x: usize) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Ipc),
            2 => Ok(Self::Notify),
            3 => Ok(Self::TaskCreate),
            4 => Ok(Self::TaskDestroy),
            5 => Ok(Self::TaskExit),
            6 => Ok(Self::TaskSelf),
            7 => Ok(Self::PmAlloc),
            8 => Ok(Self::VmMap),
            9 => Ok(Self::VmUnmap),
            10 => Ok(Self::IrqListen),
            11 => Ok(Self::IrqUnlisten),
            12 => Ok(Self::SerialWrite),
            13 => Ok(Self::SerialRead),
            14 => Ok(Self::Time),
            15 => Ok(Self::Uptime),
            16 => Ok(Self::Shutdown),
            17 => Ok(Self::Hinavm),
            18 => Ok(Self::Epoch),
            _ => Err(()),
        }
    }
}

//
// Message wire format.
//

/// Payload capacity of a [`Message`], chosen so the whole message is 2 KiB.
pub const MSG_PAYLOAD_CAPACITY: usize = 2040;

// The transport copies whole messages; keep them comfortably under a page.
const_assert!(core::mem::size_of::<Message>() < 4096);

/// Packs a message id and payload length into the 16-bit `kind` field.
pub const fn msg_kind(id: u16, len: usize) -> u16 {
    (id << 12) | len as u16
}

/// Extracts the message id from a `kind` field.
pub const fn msg_id(kind: u16) -> u16 {
    kind >> 12
}

/// Extracts the payload length from a `kind` field.
pub const fn msg_len(kind: u16) -> usize {
    (kind & 0x0fff) as usize
}

/// The fixed-size IPC message. The `src` field is written by the kernel on
/// delivery; senders cannot forge it.
#[derive(Copy, Clone, FromBytes, AsBytes)]
#[repr(C)]
pub struct Message {
    /// `(id << 12) | payload_length`.
    pub kind: u16,
    reserved: u16,
    /// Sending task, stamped on delivery. [`FROM_KERNEL`] for notification
    /// messages.
    pub src: Tid,
    payload: [u8; MSG_PAYLOAD_CAPACITY],
}

impl Default for Message {
    fn default() -> Self {
        Message {
            kind: 0,
            reserved: 0,
            src: 0,
            payload: [0; MSG_PAYLOAD_CAPACITY],
        }
    }
}

impl Message {
    /// Builds a message of the given kind from a typed payload record.
    ///
    /// The length packed into `kind` must match the payload type; the
    /// message constants below are defined that way.
    pub fn new<P: AsBytes>(kind: u16, payload: &P) -> Message {
        let mut m = Message::default();
        let bytes = payload.as_bytes();
        debug_assert_eq!(bytes.len(), msg_len(kind));
        m.kind = kind;
        m.payload[..bytes.len()].copy_from_slice(bytes);
        m
    }

    /// Builds a payload-free message of the given kind.
    pub fn empty(kind: u16) -> Message {
        debug_assert_eq!(msg_len(kind), 0);
        Message {
            kind,
            ..Message::default()
        }
    }

    pub fn id(&self) -> u16 {
        msg_id(self.kind)
    }

    pub fn payload_len(&self) -> usize {
        msg_len(self.kind)
    }

    /// Reinterprets the payload as a typed record. Returns `None` when the
    /// declared length doesn't match the requested type.
    pub fn payload<P: FromBytes + AsBytes + Default>(&self) -> Option<P> {
        let n = core::mem::size_of::<P>();
        if self.payload_len() != n || n > MSG_PAYLOAD_CAPACITY {
            return None;
        }
        let mut p = P::default();
        p.as_bytes_mut().copy_from_slice(&self.payload[..n]);
        Some(p)
    }

    /// Raw payload bytes, bounded by the declared length.
    pub fn payload_bytes(&self) -> &[u8] {
        let n = self.payload_len().min(MSG_PAYLOAD_CAPACITY);
        &self.payload[..n]
    }
}

/// Kernel -> pager: a task stopped and should be reaped.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, AsBytes)]
#[repr(C)]
pub struct ExceptionPayload {
    pub task: Tid,
    pub reason: i32,
}

/// Kernel -> pager: a task took a page fault and waits for a mapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, AsBytes)]
#[repr(C)]
pub struct PageFaultPayload {
    pub uaddr: u64,
    pub ip: u64,
    pub task: Tid,
    pub fault: u32,
}

/// Kernel -> receiver: coalesced notification bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, AsBytes)]
#[repr(C)]
pub struct NotifyPayload {
    pub notifications: u32,
}

/// Round-trip test payload used by the loopback examples and the test
/// suite.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, AsBytes)]
#[repr(C)]
pub struct PingPayload {
    pub value: i32,
}

pub const EXCEPTION_MSG: u16 =
    msg_kind(1, core::mem::size_of::<ExceptionPayload>());
pub const PAGE_FAULT_MSG: u16 =
    msg_kind(2, core::mem::size_of::<PageFaultPayload>());
pub const PAGE_FAULT_REPLY_MSG: u16 = msg_kind(3, 0);
pub const NOTIFY_MSG: u16 = msg_kind(4, core::mem::size_of::<NotifyPayload>());
pub const PING_MSG: u16 = msg_kind(5, core::mem::size_of::<PingPayload>());
pub const PING_REPLY_MSG: u16 =
    msg_kind(6, core::mem::size_of::<PingPayload>());

const_assert!(core::mem::size_of::<ExceptionPayload>() <= MSG_PAYLOAD_CAPACITY);
const_assert!(core::mem::size_of::<PageFaultPayload>() <= MSG_PAYLOAD_CAPACITY);
const_assert!(core::mem::size_of::<NotifyPayload>() <= MSG_PAYLOAD_CAPACITY);

//
// Interpreter tasks.
//

/// One instruction word of an interpreter-task program.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, AsBytes)]
#[repr(C)]
pub struct ProgramWord {
    pub op: u32,
    pub arg: i32,
}

/// Bound on interpreter program length, in words.
pub const PROGRAM_WORDS_MAX: usize = 128;

//
// Boot protocol.
//

/// One contiguous physical range in the boot memory map.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub paddr: PAddr,
    pub size: usize,
}

/// The loader-provided memory map: RAM ranges and device (MMIO) ranges,
/// each of bounded length. All sizes must be page multiples.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    frees: [MemoryMapEntry; MEMORY_MAP_ENTRIES_MAX],
    devices: [MemoryMapEntry; MEMORY_MAP_ENTRIES_MAX],
    num_frees: usize,
    num_devices: usize,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a RAM range. Panics when the map is full; the loader
    /// controls the entry count.
    pub fn push_free(&mut self, paddr: PAddr, size: usize) {
        self.frees[self.num_frees] = MemoryMapEntry { paddr, size };
        self.num_frees += 1;
    }

    /// Appends an MMIO range.
    pub fn push_device(&mut self, paddr: PAddr, size: usize) {
        self.devices[self.num_devices] = MemoryMapEntry { paddr, size };
        self.num_devices += 1;
    }

    pub fn frees(&self) -> &[MemoryMapEntry] {
        &self.frees[..self.num_frees]
    }

    pub fn devices(&self) -> &[MemoryMapEntry] {
        &self.devices[..self.num_devices]
    }
}

/// Everything the loader hands to the kernel.
#[derive(Clone, Debug, Default)]
pub struct BootInfo {
    /// Physical address of the boot ELF image for the first user task.
    pub boot_elf: PAddr,
    pub memory_map: MemoryMap,
}
