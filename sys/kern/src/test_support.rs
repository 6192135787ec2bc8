// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the kernel test suite.
//!
//! Tests drive the kernel the way the trap layer would: the helpers here
//! rotate the scheduler until the acting task is current, load its saved
//! argument registers, invoke the operation, and hand the CPU over when
//! the task parks, so every kernel invariant holds at each step.

use alloc::vec;
use alloc::vec::Vec;

use abi::{
    AllocFlags, BootInfo, Error, IpcFilter, IpcFlags, MapAttrs, MemoryMap,
    Message, PAddr, Sysnum, Tid, UAddr, IPC_ANY, IPC_DENY, PAGE_SIZE,
};
use zerocopy::AsBytes;

use crate::ipc::{self, MsgSource};
use crate::{arch, startup, task, umem, vm, Kernel, TaskIndex, TASK_SLOTS};

pub const RAM_BASE: PAddr = 0x8020_0000;
pub const RAM_PAGES: usize = 64;
pub const MMIO_BASE: PAddr = 0x1000_0000;
pub const MMIO_PAGES: usize = 4;

/// Boots a kernel with a small RAM zone and one MMIO zone, creates the
/// first user task ("vm", TID 1), and schedules it.
pub fn boot_kernel() -> Kernel {
    let mut mm = MemoryMap::new();
    mm.push_free(RAM_BASE, RAM_PAGES * PAGE_SIZE);
    mm.push_device(MMIO_BASE, MMIO_PAGES * PAGE_SIZE);
    let bootinfo = BootInfo {
        boot_elf: RAM_BASE,
        memory_map: mm,
    };
    let mut k = startup::boot(&bootinfo);
    startup::spawn_first_task(&mut k, "vm", 0x1000);
    task::switch(&mut k);
    k
}

/// Creates a task paged by TID 1 and returns its slab index.
pub fn spawn(k: &mut Kernel, name: &str) -> TaskIndex {
    let tid = task::create(k, name, 0x1000, Some(1)).unwrap();
    k.task_find(tid).unwrap()
}

/// Rotates the scheduler until `idx` is current.
pub fn make_current(k: &mut Kernel, idx: TaskIndex) {
    for _ in 0..=TASK_SLOTS {
        if k.current() == idx {
            return;
        }
        task::switch(k);
    }
    panic!("task {idx} never became current");
}

/// Allocates pages owned by `idx`.
pub fn alloc_for(k: &mut Kernel, idx: TaskIndex, size: usize) -> PAddr {
    let Kernel {
        pm,
        machine,
        tasks,
        ..
    } = k;
    pm.alloc(size, Some(&mut tasks[idx]), AllocFlags::ZEROED, machine)
        .unwrap()
}

/// Maps a fresh zeroed page into `idx` at the next free user address.
pub fn give_page(k: &mut Kernel, idx: TaskIndex) -> UAddr {
    let mut uaddr = 0x0010_0000;
    while arch::vm_resolve(&k.tasks[idx].vm, uaddr).is_some() {
        uaddr += PAGE_SIZE;
    }
    let paddr = alloc_for(k, idx, PAGE_SIZE);
    vm::map(k, idx, uaddr, paddr, MapAttrs::all()).unwrap();
    uaddr
}

pub fn write_to(k: &mut Kernel, idx: TaskIndex, uaddr: UAddr, bytes: &[u8]) {
    umem::write_bytes(k, idx, uaddr, bytes).unwrap();
}

pub fn read_from(
    k: &Kernel,
    idx: TaskIndex,
    uaddr: UAddr,
    len: usize,
) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    umem::read_bytes(k, idx, uaddr, &mut buf).unwrap();
    buf
}

pub fn write_message_for(
    k: &mut Kernel,
    idx: TaskIndex,
    uaddr: UAddr,
    msg: Message,
) {
    umem::write_bytes(k, idx, uaddr, msg.as_bytes()).unwrap();
}

pub fn read_message(k: &Kernel, idx: TaskIndex, uaddr: UAddr) -> Message {
    umem::read_message(k, idx, uaddr).unwrap()
}

/// Loads IPC argument registers the way the trap sequence would.
pub fn set_ipc_args(
    k: &mut Kernel,
    idx: TaskIndex,
    dst: Tid,
    src: Tid,
    buf: UAddr,
    flags: IpcFlags,
) {
    k.tasks[idx].save.set_args(
        [
            dst as usize,
            src as usize,
            buf,
            flags.bits() as usize,
            0,
        ],
        Sysnum::Ipc as usize,
    );
}

/// Parks `idx` in an open receive (or completes it if something is
/// already waiting).
pub fn recv_any(k: &mut Kernel, idx: TaskIndex, buf: UAddr) {
    make_current(k, idx);
    set_ipc_args(k, idx, 0, IPC_ANY, buf, IpcFlags::RECV);
    ipc::ipc(
        k,
        idx,
        None,
        IpcFilter::Any,
        MsgSource::User(buf),
        IpcFlags::RECV,
    )
    .unwrap();
    if !k.tasks[idx].is_runnable() {
        task::switch(k);
    }
}

/// Closed receive from a specific peer.
pub fn recv_from(k: &mut Kernel, idx: TaskIndex, buf: UAddr, src: Tid) {
    make_current(k, idx);
    set_ipc_args(k, idx, 0, src, buf, IpcFlags::RECV);
    ipc::ipc(
        k,
        idx,
        None,
        IpcFilter::Task(src),
        MsgSource::User(buf),
        IpcFlags::RECV,
    )
    .unwrap();
    if !k.tasks[idx].is_runnable() {
        task::switch(k);
    }
}

/// Sends `msg` from `idx` to `dst_tid` through the user path, handing
/// the CPU over if the sender parks.
pub fn send_user(
    k: &mut Kernel,
    idx: TaskIndex,
    dst_tid: Tid,
    buf: UAddr,
    msg: Message,
) -> Result<Option<isize>, Error> {
    write_message_for(k, idx, buf, msg);
    make_current(k, idx);
    set_ipc_args(k, idx, dst_tid, IPC_DENY, buf, IpcFlags::SEND);
    let dst = k.task_find(dst_tid).unwrap();
    let r = ipc::ipc(
        k,
        idx,
        Some(dst),
        IpcFilter::Deny,
        MsgSource::User(buf),
        IpcFlags::SEND,
    );
    if !k.tasks[idx].is_runnable() && k.current() == idx {
        task::switch(k);
    }
    r
}
