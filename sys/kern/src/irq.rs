// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt subscription and the timer tick.
//!
//! Each external interrupt line has at most one subscriber, which hears
//! about firings as a `NOTIFY_IRQ` notification; coalescing is exactly
//! what an edge-triggered driver wants, and a driver that needs counts
//! keeps them itself. The timer is not routed through the table: it feeds
//! the scheduler and per-task timeouts directly.

use abi::{Error, Notifications, Tid, IRQ_MAX, NUM_TASKS_MAX};

use crate::arch;
use crate::ipc;
use crate::task;
use crate::{Kernel, TaskIndex};

/// Subscribes a task to an interrupt line and unmasks it.
pub fn listen(k: &mut Kernel, idx: TaskIndex, irq: usize) -> Result<(), Error> {
    if irq >= IRQ_MAX {
        return Err(Error::InvalidArg);
    }
    if k.irq_listeners[irq].is_some() {
        return Err(Error::AlreadyUsed);
    }
    arch::irq_enable(&mut k.machine, irq)?;
    k.irq_listeners[irq] = Some(k.tasks[idx].tid());
    Ok(())
}

/// Unsubscribes the current subscriber from a line and masks it. Only the
/// subscriber itself may do this.
pub fn unlisten(
    k: &mut Kernel,
    idx: TaskIndex,
    irq: usize,
) -> Result<(), Error> {
    if irq >= IRQ_MAX {
        return Err(Error::InvalidArg);
    }
    if k.irq_listeners[irq] != Some(k.tasks[idx].tid()) {
        return Err(Error::NotAllowed);
    }
    arch::irq_disable(&mut k.machine, irq)?;
    k.irq_listeners[irq] = None;
    Ok(())
}

/// Hardware interrupt entry (everything but the timer). Unhandled lines
/// are logged and dropped.
pub fn handle_interrupt(k: &mut Kernel, irq: usize) {
    if irq >= IRQ_MAX {
        klog!("invalid IRQ {}", irq);
        return;
    }
    let Some(tid) = k.irq_listeners[irq] else {
        klog!("unhandled IRQ {}", irq);
        return;
    };
    let idx = lookup_listener(k, tid);
    ipc::notify(k, idx, Notifications::IRQ);
}

fn lookup_listener(k: &Kernel, tid: Tid) -> TaskIndex {
    // Destruction scrubs the table, so a registered TID always resolves.
    k.task_find(tid).expect("stale IRQ subscription")
}

/// Timer interrupt entry for the calling CPU.
///
/// CPU 0 owns global time: it advances the uptime counter and runs down
/// per-task timeouts, firing `NOTIFY_TIMER` on expiry. Every CPU charges
/// its current task's quantum and preempts when the slice is gone.
pub fn handle_timer(k: &mut Kernel, ticks: u64) {
    if k.current_cpu == 0 {
        k.uptime_ticks += ticks;

        let mut expired = [false; NUM_TASKS_MAX];
        for idx in 0..NUM_TASKS_MAX {
            let t = &mut k.tasks[idx];
            if t.is_unused() || t.timeout == 0 {
                continue;
            }
            t.timeout -= t.timeout.min(ticks);
            if t.timeout == 0 {
                expired[idx] = true;
            }
        }
        for idx in 0..NUM_TASKS_MAX {
            if expired[idx] {
                ipc::notify(k, idx, Notifications::TIMER);
            }
        }
    }

    let current = k.current();
    let quantum = k.tasks[current].quantum;
    k.tasks[current].quantum = quantum - quantum.min(ticks as u32);
    if k.tasks[current].quantum == 0 {
        task::switch(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use abi::{NotifyPayload, TASK_QUANTUM};
    use pretty_assertions::assert_eq;

    #[test]
    fn listen_unlisten_round_trip_restores_state() {
        let mut k = boot_kernel();
        let s = spawn(&mut k, "driver");
        assert!(!k.machine.irq_enabled(5));

        listen(&mut k, s, 5).unwrap();
        assert!(k.machine.irq_enabled(5));
        unlisten(&mut k, s, 5).unwrap();
        assert!(!k.machine.irq_enabled(5));

        // The pair is repeatable.
        listen(&mut k, s, 5).unwrap();
        unlisten(&mut k, s, 5).unwrap();
        assert!(!k.machine.irq_enabled(5));
    }

    #[test]
    fn one_subscriber_per_line() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        listen(&mut k, a, 3).unwrap();
        assert_eq!(listen(&mut k, b, 3), Err(Error::AlreadyUsed));
        // And only the subscriber may detach.
        assert_eq!(unlisten(&mut k, b, 3), Err(Error::NotAllowed));
        unlisten(&mut k, a, 3).unwrap();
    }

    #[test]
    fn out_of_range_lines_are_rejected() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        assert_eq!(listen(&mut k, a, IRQ_MAX), Err(Error::InvalidArg));
        assert_eq!(unlisten(&mut k, a, IRQ_MAX), Err(Error::InvalidArg));
    }

    #[test]
    fn firings_coalesce_into_one_notification() {
        let mut k = boot_kernel();
        let s = spawn(&mut k, "driver");
        let buf = give_page(&mut k, s);
        listen(&mut k, s, 5).unwrap();

        // IRQ 5 fires three times while the driver is computing.
        handle_interrupt(&mut k, 5);
        handle_interrupt(&mut k, 5);
        handle_interrupt(&mut k, 5);

        recv_any(&mut k, s, buf);
        let m = read_message(&k, s, buf);
        let p: NotifyPayload = m.payload().unwrap();
        assert_eq!(p.notifications, Notifications::IRQ.bits());
        assert!(k.tasks[s].notifications().is_empty());
    }

    #[test]
    fn unhandled_interrupts_are_dropped() {
        let mut k = boot_kernel();
        handle_interrupt(&mut k, 9);
        handle_interrupt(&mut k, IRQ_MAX + 1);
    }

    #[test]
    fn timeout_fires_notify_timer() {
        let mut k = boot_kernel();
        let s = spawn(&mut k, "sleeper");
        let buf = give_page(&mut k, s);
        k.tasks[s].timeout = 5;
        recv_any(&mut k, s, buf);

        for _ in 0..4 {
            handle_timer(&mut k, 1);
            assert_eq!(k.tasks[s].state(), task::TaskState::Blocked);
        }
        handle_timer(&mut k, 1);
        assert_eq!(k.tasks[s].state(), task::TaskState::Runnable);
        let p: NotifyPayload = read_message(&k, s, buf).payload().unwrap();
        assert_eq!(p.notifications, Notifications::TIMER.bits());
    }

    #[test]
    fn quantum_exhaustion_preempts() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        make_current(&mut k, a);
        assert_eq!(k.tasks[a].quantum, TASK_QUANTUM);

        for _ in 0..TASK_QUANTUM - 1 {
            handle_timer(&mut k, 1);
            assert_eq!(k.current(), a);
        }
        // Final tick: slice exhausted, the other runnable task gets on.
        handle_timer(&mut k, 1);
        assert_ne!(k.current(), a);
        // Round-robin: the preempted task went to the queue tail.
        assert!(k.runqueue.contains(&a));
    }

    #[test]
    fn only_cpu0_advances_global_time() {
        let mut k = boot_kernel();
        crate::startup::cpu_up(&mut k, 1);
        handle_timer(&mut k, 3);
        assert_eq!(k.uptime_ticks(), 3);

        k.current_cpu = 1;
        handle_timer(&mut k, 3);
        assert_eq!(k.uptime_ticks(), 3);
        k.current_cpu = 0;
    }
}
