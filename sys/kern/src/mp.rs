// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-processor coordination: the big kernel lock, per-CPU variables,
//! and inter-processor interrupts.
//!
//! One lock serializes all in-kernel execution. A CPU acquires it at
//! every trap entry and releases it when returning to user code, so the
//! kernel proper is single-threaded and the data structures need no finer
//! locking. The lock has a third state besides locked/unlocked: `HALTED`,
//! which a panic or shutdown drives it into; every other CPU observes it
//! at its next acquisition attempt and stops.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch;
use crate::task;
use crate::{Kernel, TaskIndex};

use abi::NUM_CPUS_MAX;

bitflags::bitflags! {
    /// Work requested of another CPU.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct IpiSet: u32 {
        /// Flush stale translations after an unmap.
        const TLB_FLUSH = 1 << 0;
        /// Run the scheduler: preempt, or drop a task being destroyed.
        const RESCHEDULE = 1 << 1;
    }
}

/// Sentinel detecting per-CPU state corruption (a trashed stack pointer
/// usually lands here first).
pub const CPUVAR_MAGIC: u32 = 0x5ca1_ab1e;

/// Per-CPU variables. Each CPU writes only its own slot; cross-CPU reads
/// and the IPI bits are covered by the kernel lock like everything else.
pub struct CpuVar {
    pub id: usize,
    pub online: bool,
    pub ipi_pending: IpiSet,
    pub idle_task: TaskIndex,
    pub current_task: TaskIndex,
    magic: u32,
}

impl CpuVar {
    pub(crate) fn offline(id: usize) -> CpuVar {
        CpuVar {
            id,
            online: false,
            ipi_pending: IpiSet::empty(),
            idle_task: crate::idle_index(id),
            current_task: crate::idle_index(id),
            magic: CPUVAR_MAGIC,
        }
    }

    pub fn check_magic(&self) {
        assert_eq!(self.magic, CPUVAR_MAGIC, "corrupt per-CPU state");
    }
}

/// Posts IPI bits to every other online CPU and kicks delivery.
pub fn send_ipi(k: &mut Kernel, kinds: IpiSet) {
    let sender = k.current_cpu;
    let mut any = false;
    for cpu in 0..NUM_CPUS_MAX {
        if cpu != sender && k.cpus[cpu].online {
            k.cpus[cpu].ipi_pending |= kinds;
            any = true;
        }
    }
    if any {
        arch::ipi_sent(k);
    }
}

/// Services every CPU's pending IPI bits. The architecture decides when
/// this runs; the simulator calls it straight from the send.
pub(crate) fn service_pending_ipis(k: &mut Kernel) {
    for cpu in 0..NUM_CPUS_MAX {
        if cpu == k.current_cpu || !k.cpus[cpu].online {
            continue;
        }
        let pending = core::mem::take(&mut k.cpus[cpu].ipi_pending);
        if pending.contains(IpiSet::TLB_FLUSH) {
            arch::tlb_flush(&mut k.machine);
        }
        if pending.contains(IpiSet::RESCHEDULE) {
            task::switch_on(k, cpu);
        }
    }
}

const UNLOCKED: u32 = 0xcafe;
const LOCKED: u32 = 0xb007;
const HALTED: u32 = 0xdead;

/// The big kernel lock, wrapped around the whole kernel state so there is
/// no way to reach the inside without holding it.
pub struct KernelLock {
    state: AtomicU32,
    kernel: UnsafeCell<Kernel>,
}

// Safety: the lock protocol grants exactly one CPU (thread) access to the
// inner Kernel at a time.
unsafe impl Sync for KernelLock {}
unsafe impl Send for KernelLock {}

impl KernelLock {
    pub fn new(kernel: Kernel) -> KernelLock {
        KernelLock {
            state: AtomicU32::new(UNLOCKED),
            kernel: UnsafeCell::new(kernel),
        }
    }

    /// Acquires the lock for `cpu`, spinning while another CPU is inside.
    /// Returns `None` once the system has halted; a hardware port parks
    /// the CPU at that point instead of returning.
    pub fn enter(&self, cpu: usize) -> Option<KernelGuard<'_>> {
        loop {
            match self.state.compare_exchange_weak(
                UNLOCKED,
                LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                // Halt is read without synchronization on purpose: a
                // panicking CPU must be able to stop the others even when
                // the lock state is torn.
                Err(HALTED) => return None,
                Err(_) => core::hint::spin_loop(),
            }
        }
        let k = unsafe { &mut *self.kernel.get() };
        k.current_cpu = cpu;
        k.cpuvar().check_magic();
        Some(KernelGuard { lock: self })
    }

    /// Drives the lock to `HALTED`. Used by shutdown and by assertion
    /// failures; other CPUs stop at their next `enter`.
    pub fn halt(&self) {
        self.state.store(HALTED, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.state.load(Ordering::Relaxed) == HALTED
    }
}

/// Proof of holding the kernel lock; dereferences to the kernel state.
pub struct KernelGuard<'a> {
    lock: &'a KernelLock,
}

impl core::ops::Deref for KernelGuard<'_> {
    type Target = Kernel;
    fn deref(&self) -> &Kernel {
        unsafe { &*self.lock.kernel.get() }
    }
}

impl core::ops::DerefMut for KernelGuard<'_> {
    fn deref_mut(&mut self) -> &mut Kernel {
        unsafe { &mut *self.lock.kernel.get() }
    }
}

impl Drop for KernelGuard<'_> {
    fn drop(&mut self) {
        // Leave a halted lock alone so no CPU gets back in.
        let _ = self.lock.state.compare_exchange(
            LOCKED,
            UNLOCKED,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }
}
