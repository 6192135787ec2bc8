// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! The trap sequence stores the argument registers into the current
//! task's saved state and calls [`syscall_entry`]. Every handler
//! validates its arguments here -- TIDs through the checked lookup, flag
//! words through `from_bits`, pointers at the moment of use -- and
//! returns either a value, an error code, or "suspended" (the return
//! register is written later by whoever completes the operation). A
//! caller that parked itself hands the CPU over before we return to user
//! mode.

use core::convert::TryFrom;

use abi::{
    AllocFlags, Error, ExceptionReason, IpcFilter, IpcFlags, MapAttrs,
    Sysnum, Tid, PAGE_SIZE, TICK_HZ,
};

use crate::ipc::{self, MsgSource};
use crate::{arch, hinavm, irq, serial, task, umem, vm};
use crate::{Kernel, TaskIndex};

/// Entry point accessed by the arch-specific trap sequence: load the
/// saved argument registers, dispatch, reschedule if the caller parked.
///
/// Returns the caller's return register for the simulator's benefit;
/// `None` means the syscall is still in flight.
pub fn syscall_entry(
    k: &mut Kernel,
    cpu: usize,
    args: [usize; 5],
    nr: usize,
) -> Option<isize> {
    k.current_cpu = cpu;
    let caller = k.current();
    k.tasks[caller].save.set_args(args, nr);
    dispatch(k);
    k.tasks[caller].save.ret()
}

/// Dispatches the current task's pending syscall from its saved state.
pub fn dispatch(k: &mut Kernel) {
    let caller = k.current();
    let nr = k.tasks[caller].save.sysnum();

    let result = match Sysnum::try_from(nr) {
        Ok(sysnum) => handle(k, caller, sysnum),
        Err(()) => Err(Error::InvalidArg),
    };

    match result {
        Ok(Some(v)) => k.tasks[caller].save.set_ret(v),
        // Suspended: the completer writes the return register.
        Ok(None) => {}
        Err(e) => k.tasks[caller].save.set_ret(e.code()),
    }

    if !k.tasks[caller].is_runnable() {
        task::switch(k);
    }
}

fn handle(
    k: &mut Kernel,
    caller: TaskIndex,
    sysnum: Sysnum,
) -> Result<Option<isize>, Error> {
    // Snapshot the saved registers so argument reads don't tangle with
    // the mutable kernel borrows below.
    let save = k.tasks[caller].save.clone();
    let arg = |n: usize| save.arg(n);

    match sysnum {
        Sysnum::Ipc => {
            let (dst_raw, src_raw, msg, flags_raw) =
                (arg(0), arg(1), arg(2), arg(3));
            sys_ipc(k, caller, dst_raw, src_raw, msg, flags_raw)
        }
        Sysnum::Notify => {
            let dst = k
                .task_find(arg(0) as Tid)
                .ok_or(Error::InvalidArg)?;
            let bits = abi::Notifications::from_bits_retain(arg(1) as u32);
            ipc::notify(k, dst, bits);
            Ok(Some(0))
        }
        Sysnum::TaskCreate => {
            let name = umem::read_name(k, caller, arg(0))?;
            let ip = arg(1);
            let pager = arg(2) as Tid;
            // Syscall-created tasks always have a pager; only boot code
            // brings up pagerless tasks.
            k.task_find(pager).ok_or(Error::InvalidArg)?;
            let tid = task::create(k, &name, ip, Some(pager))?;
            Ok(Some(tid as isize))
        }
        Sysnum::TaskDestroy => {
            let idx =
                k.task_find(arg(0) as Tid).ok_or(Error::InvalidArg)?;
            task::destroy(k, idx)?;
            Ok(Some(0))
        }
        Sysnum::TaskExit => {
            let reason = match arg(0) as i32 {
                0 => ExceptionReason::GraceExit as i32,
                code => code,
            };
            task::exit(k, reason);
            Ok(None)
        }
        Sysnum::TaskSelf => Ok(Some(k.tasks[caller].tid() as isize)),
        Sysnum::PmAlloc => {
            let target =
                k.task_find(arg(0) as Tid).ok_or(Error::InvalidArg)?;
            authorize(k, caller, target)?;
            let size = arg(1);
            let flags = AllocFlags::from_bits(arg(2) as u32)
                .ok_or(Error::InvalidArg)?;
            let paddr = {
                let Kernel {
                    pm,
                    machine,
                    tasks,
                    ..
                } = k;
                pm.alloc(size, Some(&mut tasks[target]), flags, machine)
                    .ok_or(Error::NoMemory)?
            };
            // Returned as a page frame number to keep the value domain
            // disjoint from the error codes.
            Ok(Some((paddr / PAGE_SIZE) as isize))
        }
        Sysnum::VmMap => {
            let target =
                k.task_find(arg(0) as Tid).ok_or(Error::InvalidArg)?;
            authorize(k, caller, target)?;
            let attrs = MapAttrs::from_bits(arg(3) as u32)
                .ok_or(Error::InvalidArg)?;
            vm::map(k, target, arg(1), arg(2), attrs)?;
            Ok(Some(0))
        }
        Sysnum::VmUnmap => {
            let target =
                k.task_find(arg(0) as Tid).ok_or(Error::InvalidArg)?;
            authorize(k, caller, target)?;
            vm::unmap(k, target, arg(1))?;
            Ok(Some(0))
        }
        Sysnum::IrqListen => irq::listen(k, caller, arg(0)).map(|_| Some(0)),
        Sysnum::IrqUnlisten => {
            irq::unlisten(k, caller, arg(0)).map(|_| Some(0))
        }
        Sysnum::SerialWrite => {
            serial::write(k, caller, arg(0), arg(1)).map(Some)
        }
        Sysnum::SerialRead => serial::read(k, caller, arg(0), arg(1)),
        Sysnum::Time => {
            let ms = arg(0) as i32;
            if ms < 0 {
                return Err(Error::InvalidArg);
            }
            k.tasks[caller].timeout = ms_to_ticks(ms as u64);
            Ok(Some(0))
        }
        Sysnum::Uptime => {
            Ok(Some((k.uptime_ticks * 1000 / TICK_HZ) as isize))
        }
        Sysnum::Shutdown => {
            klog!("shutting down");
            arch::shutdown(&mut k.machine);
            // The caller never returns; the trap loop halts the kernel
            // lock once it sees the power-off request.
            task::block(k, caller);
            Ok(None)
        }
        Sysnum::Hinavm => {
            let name = umem::read_name(k, caller, arg(0))?;
            let words = hinavm::read_program(k, caller, arg(1), arg(2))?;
            let pager = arg(3) as Tid;
            k.task_find(pager).ok_or(Error::InvalidArg)?;
            let tid = hinavm::create(k, &name, &words, pager)?;
            Ok(Some(tid as isize))
        }
        Sysnum::Epoch => {
            let epoch = arch::rtc_epoch(&k.machine) as u64;
            umem::write_bytes(k, caller, arg(0), &epoch.to_le_bytes())?;
            Ok(Some(0))
        }
    }
}

fn sys_ipc(
    k: &mut Kernel,
    caller: TaskIndex,
    dst_raw: usize,
    src_raw: usize,
    msg: usize,
    flags_raw: usize,
) -> Result<Option<isize>, Error> {
    let flags =
        IpcFlags::from_bits(flags_raw as u32).ok_or(Error::InvalidArg)?;
    // Kernel-origin is the kernel's own mark; user code cannot claim it,
    // or it could forge exception messages.
    if flags.contains(IpcFlags::KERNEL) {
        return Err(Error::InvalidArg);
    }
    if !flags.intersects(IpcFlags::SEND | IpcFlags::RECV) {
        return Err(Error::InvalidArg);
    }

    let filter = IpcFilter::decode(src_raw as i32)?;
    let dst = if flags.contains(IpcFlags::SEND) {
        Some(k.task_find(dst_raw as Tid).ok_or(Error::InvalidArg)?)
    } else {
        None
    };

    ipc::ipc(k, caller, dst, filter, MsgSource::User(msg), flags)
}

// `pm_alloc`/`vm_map`/`vm_unmap` operate on some task's memory; only
// that task itself or its pager has any business doing so.
fn authorize(
    k: &Kernel,
    caller: TaskIndex,
    target: TaskIndex,
) -> Result<(), Error> {
    if caller == target {
        return Ok(());
    }
    let caller_tid = k.tasks[caller].tid();
    if k.tasks[target].pager() == Some(caller_tid) {
        return Ok(());
    }
    Err(Error::NotAllowed)
}

fn ms_to_ticks(ms: u64) -> u64 {
    (ms * TICK_HZ / 1000).max(if ms > 0 { 1 } else { 0 })
}
