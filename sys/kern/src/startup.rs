// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! Boot order: validate what the loader handed us, build the zone list
//! and machine model from the memory map, bring up CPU 0 with its idle
//! task, then let the platform code create the first user task (the
//! pager everyone else will name). Secondary CPUs come up later through
//! [`cpu_up`].

use abi::{BootInfo, Tid, UAddr, IRQ_MAX, NUM_CPUS_MAX, PAGE_SIZE};

use crate::mp::CpuVar;
use crate::pm::PhysMemory;
use crate::serial::Serial;
use crate::task::{self, Task};
use crate::{arch, Kernel};

/// Builds the kernel from boot info and brings CPU 0 online.
pub fn boot(bootinfo: &BootInfo) -> Kernel {
    // Trust, but verify: a loader that hands us a garbage map would
    // otherwise corrupt the zone math much later.
    assert!(
        !bootinfo.memory_map.frees().is_empty(),
        "boot memory map has no RAM"
    );
    for e in bootinfo
        .memory_map
        .frees()
        .iter()
        .chain(bootinfo.memory_map.devices())
    {
        assert_eq!(e.paddr % PAGE_SIZE, 0, "unaligned memory map entry");
        assert_eq!(e.size % PAGE_SIZE, 0, "unaligned memory map entry");
        assert!(e.size > 0, "empty memory map entry");
    }

    let machine = arch::Machine::new(bootinfo);
    let mut k = Kernel {
        tasks: core::array::from_fn(|_| Task::unused()),
        runqueue: arrayvec::ArrayVec::new(),
        pm: PhysMemory::new(bootinfo),
        irq_listeners: [None; IRQ_MAX],
        serial: Serial::default(),
        uptime_ticks: 0,
        cpus: core::array::from_fn(CpuVar::offline),
        current_cpu: 0,
        machine,
    };

    cpu_up(&mut k, 0);
    k
}

/// Brings a CPU online: idle task, per-CPU variables, ready to schedule.
pub fn cpu_up(k: &mut Kernel, cpu: usize) {
    assert!(cpu < NUM_CPUS_MAX);
    assert!(!k.cpus[cpu].online, "CPU {cpu} brought up twice");
    task::init_percpu(k, cpu);
    k.cpus[cpu].online = true;
    ktrace!("CPU {} online", cpu);
}

/// Creates the first user task. It has no pager (faults in it are fatal)
/// and TID 1, and it cannot be destroyed; it will page for everyone else.
pub fn spawn_first_task(k: &mut Kernel, name: &str, ip: UAddr) -> Tid {
    assert!(k.tasks[0].is_unused(), "first task already exists");
    let tid = task::create(k, name, ip, None)
        .expect("an empty table cannot be full");
    debug_assert_eq!(tid, 1);
    tid
}
