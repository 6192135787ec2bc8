// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Microkernel core: tasks, scheduling, synchronous IPC with notifications,
//! refcounted physical memory, pager-backed virtual memory, and the
//! cross-CPU plumbing that holds it together.
//!
//! Userland is a set of cooperating server tasks (pager, filesystem,
//! drivers, ...) that talk to each other over the rendezvous IPC provided
//! here; the kernel's own job ends at enforcing ownership rules and moving
//! messages.
//!
//! # Design principles
//!
//! 1. Simple, clear algorithms over fast, clever ones. Tables are small and
//!    scans are linear; nothing here needs to be sublinear.
//! 2. A strong preference for safe code. Task records live in a fixed slab
//!    and every cross-reference (pager, page owner, queue entry) is an
//!    index or TID resolved through a checked lookup, never a pointer.
//! 3. Syscalls run to completion under the kernel lock. A task that cannot
//!    complete an operation records its wait state in its own control block
//!    and is finished later by whichever task (or interrupt) unblocks it.
//!
//! All CPUs are serialized inside the kernel by a single lock (see [`mp`]);
//! the data structures in this crate are therefore single-threaded while
//! mutated, and none of them need interior synchronization.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
mod klog;

pub mod arch;

pub mod hinavm;
pub mod ipc;
pub mod irq;
pub mod mp;
pub mod pm;
pub mod serial;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod umem;
pub mod vm;

#[cfg(test)]
mod test_support;

use abi::{Notifications, Tid, IRQ_MAX, NUM_CPUS_MAX, NUM_TASKS_MAX};

use crate::mp::CpuVar;
use crate::pm::PhysMemory;
use crate::serial::Serial;
use crate::task::Task;

/// Index into the kernel task slab. Slots `0..NUM_TASKS_MAX` hold user
/// tasks (TID = index + 1); the remaining slots hold the per-CPU idle
/// tasks (TID 0).
pub type TaskIndex = usize;

/// Total slab capacity: user slots plus one idle slot per CPU.
pub const TASK_SLOTS: usize = NUM_TASKS_MAX + NUM_CPUS_MAX;

/// Slab index of the idle task belonging to `cpu`.
pub const fn idle_index(cpu: usize) -> TaskIndex {
    NUM_TASKS_MAX + cpu
}

/// The whole kernel state. Exactly one of these exists, wrapped in a
/// [`mp::KernelLock`]; every trap handler acquires the lock and works on
/// the inside.
pub struct Kernel {
    pub(crate) tasks: [Task; TASK_SLOTS],
    /// FIFO of runnable, non-idle tasks not currently executing anywhere.
    pub(crate) runqueue: arrayvec::ArrayVec<TaskIndex, NUM_TASKS_MAX>,
    pub(crate) pm: PhysMemory,
    pub(crate) irq_listeners: [Option<Tid>; IRQ_MAX],
    pub(crate) serial: Serial,
    pub(crate) uptime_ticks: u64,
    pub(crate) cpus: [CpuVar; NUM_CPUS_MAX],
    /// CPU currently executing inside the kernel. Meaningful only while
    /// the kernel lock is held, which serializes all of this state anyway.
    pub(crate) current_cpu: usize,
    /// Simulated (or real) machine this kernel runs on.
    pub machine: arch::Machine,
}

impl Kernel {
    /// Per-CPU variables of the CPU executing in the kernel.
    pub fn cpuvar(&self) -> &CpuVar {
        &self.cpus[self.current_cpu]
    }

    /// Slab index of the task currently executing on this CPU.
    pub fn current(&self) -> TaskIndex {
        self.cpuvar().current_task
    }

    /// Resolves a TID to a slab index, treating out-of-range values and
    /// unused slots as absent.
    pub fn task_find(&self, tid: Tid) -> Option<TaskIndex> {
        if tid < 1 || tid as usize > NUM_TASKS_MAX {
            return None;
        }
        let idx = tid as usize - 1;
        if self.tasks[idx].is_unused() {
            None
        } else {
            Some(idx)
        }
    }

    /// Posts notification bits to a task; see [`ipc::notify`].
    pub fn notify(&mut self, idx: TaskIndex, bits: Notifications) {
        ipc::notify(self, idx, bits);
    }

    /// Number of ticks since boot.
    pub fn uptime_ticks(&self) -> u64 {
        self.uptime_ticks
    }
}
