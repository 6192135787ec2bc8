// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual memory: ownership-checked mapping and user-space demand paging.
//!
//! The kernel holds no paging policy. It enforces exactly two rules at
//! `vm_map` time -- a RAM frame may be mapped only by its owner or the
//! owner's pager, and an MMIO frame belongs exclusively to its first
//! mapper -- and bounces every page fault to the faulting task's pager
//! over a kernel-origin IPC call. The pager maps something and replies;
//! the task retries its instruction. That bounce is what makes the rest
//! of memory management a userland problem.

use abi::{
    Error, ExceptionReason, FaultKind, IpcFilter, IpcFlags, MapAttrs,
    Message, PAddr, PageFaultPayload, UAddr, PAGE_FAULT_MSG,
    PAGE_FAULT_REPLY_MSG, PAGE_SIZE,
};

use crate::arch;
use crate::ipc::{self, MsgSource};
use crate::mp::{self, IpiSet};
use crate::pm::ZoneKind;
use crate::task::{self, TaskState};
use crate::{Kernel, TaskIndex};

/// Maps one page into `target`'s address space.
///
/// RAM frames must be allocated, and `target` must be the frame's owner
/// or the owner's pager. MMIO frames must be unmapped; the first mapper
/// becomes their exclusive owner.
pub fn map(
    k: &mut Kernel,
    target: TaskIndex,
    uaddr: UAddr,
    paddr: PAddr,
    attrs: MapAttrs,
) -> Result<(), Error> {
    if !arch::is_mappable_uaddr(uaddr)
        || uaddr % PAGE_SIZE != 0
        || paddr % PAGE_SIZE != 0
    {
        return Err(Error::InvalidArg);
    }

    let target_tid = k.tasks[target].tid();
    let Some((page, kind)) = k.pm.page(paddr) else {
        klog!("vm_map: no page record for {:#x}", paddr);
        return Err(Error::InvalidPaddr);
    };

    match kind {
        ZoneKind::Ram => {
            if page.ref_count == 0 {
                klog!("vm_map: {:#x} is not allocated", paddr);
                return Err(Error::InvalidPaddr);
            }
            let allowed = match page.owner {
                Some(owner) if owner == target_tid => true,
                Some(owner) => {
                    let oi =
                        k.task_find(owner).ok_or(Error::InvalidPaddr)?;
                    k.tasks[oi].pager() == Some(target_tid)
                }
                // Kernel-owned frames are not for tasks.
                None => false,
            };
            if !allowed {
                klog!(
                    "vm_map: {:#x} is not owned by \"{}\"",
                    paddr,
                    k.tasks[target].name()
                );
                return Err(Error::InvalidPaddr);
            }
        }
        ZoneKind::Mmio => {
            if page.ref_count > 0 {
                // Two drivers poking one device never ends well.
                klog!("vm_map: device page {:#x} is already mapped", paddr);
                return Err(Error::InvalidPaddr);
            }
        }
    }

    arch::vm_map(&mut k.tasks[target].vm, uaddr, paddr, attrs)?;

    if kind == ZoneKind::Mmio {
        let (page, _) = k.pm.page_mut(paddr).unwrap();
        page.owner = Some(target_tid);
        let Kernel { pm, tasks, .. } = k;
        pm.link_page(paddr, &mut tasks[target]);
    }
    let (page, _) = k.pm.page_mut(paddr).unwrap();
    page.ref_count += 1;
    Ok(())
}

/// Removes one page from `target`'s address space. Page-record
/// bookkeeping is reconciled when the task is destroyed; other CPUs get a
/// shootdown so no stale translation survives.
pub fn unmap(
    k: &mut Kernel,
    target: TaskIndex,
    uaddr: UAddr,
) -> Result<(), Error> {
    if !arch::is_mappable_uaddr(uaddr) || uaddr % PAGE_SIZE != 0 {
        return Err(Error::InvalidArg);
    }
    arch::vm_unmap(&mut k.tasks[target].vm, uaddr)?;
    arch::tlb_flush(&mut k.machine);
    mp::send_ipi(k, IpiSet::TLB_FLUSH);
    Ok(())
}

/// Page-fault handler for the current task.
///
/// Kernel-mode faults are fatal: checked user copies carry the `USER` bit
/// and everything else inside the kernel is a broken invariant. User
/// faults outside the mappable window end the task; the rest are bounced
/// to its pager.
pub fn handle_page_fault(
    k: &mut Kernel,
    uaddr: UAddr,
    ip: UAddr,
    fault: FaultKind,
) {
    if !fault.contains(FaultKind::USER) {
        panic!(
            "page fault in kernel: uaddr={:#x}, ip={:#x}, fault={:?}",
            uaddr, ip, fault
        );
    }

    let current = k.current();

    if !arch::is_mappable_uaddr(uaddr) {
        klog!(
            "\"{}\": fault at unmappable address {:#x} (ip={:#x})",
            k.tasks[current].name(),
            uaddr,
            ip
        );
        task::exit_on_exception(k, current, ExceptionReason::InvalidUaddr);
        return;
    }

    // Idle and the first user task have nobody to page for them; a fault
    // there means the kernel itself is broken.
    let pager = match k.tasks[current].pager() {
        Some(p) => p,
        None => panic!(
            "\"{}\": unexpected page fault: uaddr={:#x}, ip={:#x}",
            k.tasks[current].name(),
            uaddr,
            ip
        ),
    };
    let pi = k.task_find(pager).expect("pager outlives its clients");

    let msg = Message::new(
        PAGE_FAULT_MSG,
        &PageFaultPayload {
            uaddr: uaddr as u64,
            ip: ip as u64,
            task: k.tasks[current].tid(),
            fault: fault.bits(),
        },
    );

    let r = ipc::ipc(
        k,
        current,
        Some(pi),
        IpcFilter::Task(pager),
        MsgSource::Kernel(msg),
        IpcFlags::CALL | IpcFlags::KERNEL,
    );
    match r {
        // Parked waiting for the pager; the reply is validated on
        // delivery.
        Ok(None) => {}
        // Completed on the spot (the pager had something queued for us).
        _ => finish_pager_call(k, current),
    }
}

/// Validates what arrived in reply to a page-fault call. The only
/// acceptable answer is `PAGE_FAULT_REPLY_MSG`; anything else ends the
/// task, because a confused pager cannot be paged around.
pub(crate) fn finish_pager_call(k: &mut Kernel, idx: TaskIndex) {
    if k.tasks[idx].message.kind == PAGE_FAULT_REPLY_MSG {
        if k.tasks[idx].state() == TaskState::Blocked {
            task::resume(k, idx);
        }
        return;
    }
    klog!(
        "\"{}\": bogus pager reply (kind={:#x})",
        k.tasks[idx].name(),
        k.tasks[idx].message.kind
    );
    task::exit_on_exception(k, idx, ExceptionReason::InvalidPagerReply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use abi::{AllocFlags, ExceptionPayload, EXCEPTION_MSG};
    use pretty_assertions::assert_eq;

    const RWX: MapAttrs = MapAttrs::all();

    #[test]
    fn owner_and_pager_may_map_a_frame() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let paddr = alloc_for(&mut k, a, PAGE_SIZE);

        // The owner maps its own frame.
        map(&mut k, a, 0x5000, paddr, RWX).unwrap();
        // The owner's pager (task 1) maps the same frame into itself.
        map(&mut k, 0, 0x7000, paddr, MapAttrs::READ | MapAttrs::WRITE)
            .unwrap();
        assert_eq!(k.pm.page(paddr).unwrap().0.ref_count, 3);
    }

    #[test]
    fn unrelated_task_may_not_map_a_frame() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        let paddr = alloc_for(&mut k, a, PAGE_SIZE);
        assert_eq!(
            map(&mut k, b, 0x5000, paddr, RWX),
            Err(Error::InvalidPaddr)
        );
    }

    #[test]
    fn unallocated_and_kernel_frames_are_rejected() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        assert_eq!(
            map(&mut k, a, 0x5000, RAM_BASE + 8 * PAGE_SIZE, RWX),
            Err(Error::InvalidPaddr)
        );
        // Allocated but kernel-owned.
        let paddr = k
            .pm
            .alloc(PAGE_SIZE, None, AllocFlags::empty(), &mut k.machine)
            .unwrap();
        assert_eq!(map(&mut k, a, 0x5000, paddr, RWX), Err(Error::InvalidPaddr));
    }

    #[test]
    fn mmio_frames_are_exclusive() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        map(&mut k, a, 0x9000, MMIO_BASE, MapAttrs::READ | MapAttrs::WRITE)
            .unwrap();
        let (page, _) = k.pm.page(MMIO_BASE).unwrap();
        assert_eq!(page.owner, Some(k.tasks[a].tid()));
        assert_eq!(page.ref_count, 1);
        assert_eq!(
            map(&mut k, b, 0x9000, MMIO_BASE, MapAttrs::READ),
            Err(Error::InvalidPaddr)
        );
    }

    #[test]
    fn unmap_validates_and_flushes() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let paddr = alloc_for(&mut k, a, PAGE_SIZE);
        map(&mut k, a, 0x5000, paddr, RWX).unwrap();

        assert_eq!(unmap(&mut k, a, 0), Err(Error::InvalidArg));
        assert_eq!(unmap(&mut k, a, 0x6000), Err(Error::NotFound));

        let flushes = k.machine.tlb_flushes;
        unmap(&mut k, a, 0x5000).unwrap();
        assert!(k.machine.tlb_flushes > flushes);
        assert!(arch::vm_resolve(&k.tasks[a].vm, 0x5000).is_none());
    }

    #[test]
    fn page_fault_is_paged_by_the_pager() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let a_tid = k.tasks[a].tid();
        let pager_buf = give_page(&mut k, 0);

        // Task A starts at 0x1000 and immediately faults there.
        make_current(&mut k, a);
        handle_page_fault(
            &mut k,
            0x1000,
            0x1000,
            FaultKind::EXEC | FaultKind::USER,
        );
        assert_eq!(k.tasks[a].state(), TaskState::Blocked);
        task::switch(&mut k);

        // The pager picks up the fault message.
        recv_any(&mut k, 0, pager_buf);
        let m = read_message(&k, 0, pager_buf);
        assert_eq!(m.kind, PAGE_FAULT_MSG);
        assert_eq!(m.src, a_tid);
        let p: PageFaultPayload = m.payload().unwrap();
        assert_eq!(p.uaddr, 0x1000);
        assert_eq!(p.task, a_tid);

        // It maps a fresh frame at the faulting address and replies.
        let paddr = alloc_for(&mut k, a, PAGE_SIZE);
        map(&mut k, a, 0x1000, paddr, RWX).unwrap();
        send_user(&mut k, 0, a_tid, pager_buf, Message::empty(PAGE_FAULT_REPLY_MSG))
            .unwrap();

        // A resumes with the mapping in place.
        assert_eq!(k.tasks[a].state(), TaskState::Runnable);
        assert_eq!(
            arch::vm_resolve(&k.tasks[a].vm, 0x1000).map(|(p, _)| p),
            Some(paddr)
        );
    }

    #[test]
    fn bogus_pager_reply_ends_the_task() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let a_tid = k.tasks[a].tid();
        let pager_buf = give_page(&mut k, 0);

        make_current(&mut k, a);
        handle_page_fault(
            &mut k,
            0x2000,
            0x1000,
            FaultKind::READ | FaultKind::USER,
        );
        task::switch(&mut k);

        recv_any(&mut k, 0, pager_buf);
        // Reply with the wrong kind of message.
        send_user(
            &mut k,
            0,
            a_tid,
            pager_buf,
            Message::new(abi::PING_MSG, &abi::PingPayload { value: 0 }),
        )
        .unwrap();

        assert!(k.tasks[a].exited);
        // The pager is told about the death it caused.
        recv_any(&mut k, 0, pager_buf);
        let m = read_message(&k, 0, pager_buf);
        assert_eq!(m.kind, EXCEPTION_MSG);
        let p: ExceptionPayload = m.payload().unwrap();
        assert_eq!(p.task, a_tid);
        assert_eq!(p.reason, ExceptionReason::InvalidPagerReply as i32);
    }

    #[test]
    fn fault_outside_user_window_ends_the_task() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        make_current(&mut k, a);
        handle_page_fault(
            &mut k,
            arch::USER_TOP + 0x1000,
            0x1000,
            FaultKind::WRITE | FaultKind::USER,
        );
        assert!(k.tasks[a].exited);
    }

    #[test]
    #[should_panic(expected = "page fault in kernel")]
    fn kernel_mode_fault_panics() {
        let mut k = boot_kernel();
        handle_page_fault(&mut k, 0x3000, 0xffff_0000, FaultKind::READ);
    }
}
