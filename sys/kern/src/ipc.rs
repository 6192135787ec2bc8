// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous IPC: rendezvous send/receive with a notification bitmask
//! folded into the receive side.
//!
//! There is no kernel-side message queue. A send either meets a receiver
//! that is already waiting, or the sender parks itself on the receiver's
//! FIFO with the message staged in its own control block; backpressure
//! falls out of that for free. Notifications are the asynchronous
//! complement: a bitmask that accumulates by OR and is consumed in one
//! `NOTIFY_MSG` delivery, which is all an edge-triggered event source like
//! an IRQ or timer needs.
//!
//! Because syscalls run to completion (see the crate docs), the side that
//! finds its peer already parked finishes the peer's syscall for it:
//! stamps the message into the peer's inbox, writes the peer's user buffer
//! and return register from the peer's saved state, and resumes it.

use abi::{
    Error, IpcFilter, IpcFlags, Message, Notifications, NotifyPayload, UAddr,
    FROM_KERNEL, NOTIFY_MSG,
};

use crate::task::{self, TaskState};
use crate::umem;
use crate::vm;
use crate::{Kernel, TaskIndex};

/// Where an outgoing message comes from: a user buffer to be checked and
/// copied, or a kernel-built message on the kernel stack.
pub enum MsgSource {
    User(UAddr),
    Kernel(Message),
}

enum SendOutcome {
    Delivered,
    Queued,
}

/// The single IPC entry point: `SEND`, `RECV`, or both (`CALL`).
///
/// Returns `Ok(Some(0))` when the operation completed, `Ok(None)` when the
/// caller suspended (its return value will be written by whoever finishes
/// the operation), and `Err` for immediate failures.
pub fn ipc(
    k: &mut Kernel,
    caller: TaskIndex,
    dst: Option<TaskIndex>,
    filter: IpcFilter,
    msg_src: MsgSource,
    flags: IpcFlags,
) -> Result<Option<isize>, Error> {
    if flags.contains(IpcFlags::SEND) {
        let dst = dst.ok_or(Error::InvalidArg)?;
        let msg = load_message(k, caller, &msg_src)?;
        // Remember the receive filter in case this is a CALL that has to
        // park in the send phase; the continuation needs it.
        k.tasks[caller].pending_filter = filter;
        match send(k, caller, dst, msg, flags)? {
            SendOutcome::Delivered => {}
            SendOutcome::Queued => return Ok(None),
        }
    }

    if flags.contains(IpcFlags::RECV) {
        let buf = match msg_src {
            MsgSource::User(uaddr) => Some(uaddr),
            MsgSource::Kernel(_) => None,
        };
        return recv(k, caller, filter, flags, buf);
    }

    Ok(Some(0))
}

fn load_message(
    k: &Kernel,
    caller: TaskIndex,
    src: &MsgSource,
) -> Result<Message, Error> {
    match src {
        MsgSource::Kernel(m) => Ok(*m),
        MsgSource::User(uaddr) => umem::read_message(k, caller, *uaddr),
    }
}

// Send phase. Either completes the rendezvous with a parked receiver or
// parks the caller on the receiver's sender FIFO.
fn send(
    k: &mut Kernel,
    caller: TaskIndex,
    dst: TaskIndex,
    msg: Message,
    flags: IpcFlags,
) -> Result<SendOutcome, Error> {
    let caller_tid = k.tasks[caller].tid();

    let ready = {
        let d = &k.tasks[dst];
        d.state() == TaskState::Blocked
            && d.wait_for != IpcFilter::Deny
            && d.wait_for.accepts(caller_tid)
    };

    if ready {
        deliver(k, caller, dst, msg);
        return Ok(SendOutcome::Delivered);
    }

    if flags.contains(IpcFlags::NOBLOCK) {
        return Err(Error::WouldBlock);
    }

    // Stage the message in the caller's own slot and wait in line. The
    // receiver (or the destination's destruction) finishes this send.
    k.tasks[caller].message = msg;
    k.tasks[caller].pending = flags;
    k.tasks[dst].senders.push(caller);
    if k.tasks[caller].state() == TaskState::Runnable {
        task::block(k, caller);
    }
    Ok(SendOutcome::Queued)
}

// Completes a rendezvous into a receiver that is parked in receive:
// stamps the source, fills the inbox, and finishes the receiver's
// suspended syscall.
fn deliver(k: &mut Kernel, src_idx: TaskIndex, dst: TaskIndex, mut msg: Message) {
    msg.src = k.tasks[src_idx].tid();
    k.tasks[dst].message = msg;
    finish_recv(k, dst);
}

// Finishes the receive of a task parked in receive whose inbox was just
// filled. For a user receive this copies the inbox out to the buffer the
// task named when it trapped, writes its return register, and resumes it.
// A kernel-origin receive is a pager call; the fault machinery validates
// the reply instead.
fn finish_recv(k: &mut Kernel, idx: TaskIndex) {
    let flags = core::mem::take(&mut k.tasks[idx].pending);
    k.tasks[idx].wait_for = IpcFilter::Deny;

    if flags.contains(IpcFlags::KERNEL) {
        vm::finish_pager_call(k, idx);
        return;
    }

    let buf = k.tasks[idx].save.arg(2);
    let ret = match umem::write_message(k, idx, buf) {
        Ok(()) => 0,
        Err(e) => e.code(),
    };
    k.tasks[idx].save.set_ret(ret);
    if k.tasks[idx].state() == TaskState::Blocked {
        task::resume(k, idx);
    }
}

// Receive phase for the running caller. Notifications win over queued
// senders; with neither present the caller parks.
fn recv(
    k: &mut Kernel,
    caller: TaskIndex,
    filter: IpcFilter,
    flags: IpcFlags,
    buf: Option<UAddr>,
) -> Result<Option<isize>, Error> {
    let kernel = flags.contains(IpcFlags::KERNEL);

    if !kernel && filter != IpcFilter::Deny {
        let bits = k.tasks[caller].notifications;
        if !bits.is_empty() {
            k.tasks[caller].notifications = Notifications::empty();
            k.tasks[caller].message = notification_message(bits);
            let buf = buf.expect("user receive names a buffer");
            umem::write_message(k, caller, buf)?;
            return Ok(Some(0));
        }
    }

    let matching = find_sender(k, caller, filter);
    if let Some(pos) = matching {
        let s = k.tasks[caller].senders.remove(pos);
        let mut msg = k.tasks[s].message;
        msg.src = k.tasks[s].tid();
        k.tasks[caller].message = msg;
        if !kernel {
            let buf = buf.expect("user receive names a buffer");
            let r = umem::write_message(k, caller, buf);
            wake_sender(k, s);
            r?;
        } else {
            wake_sender(k, s);
        }
        return Ok(Some(0));
    }

    if flags.contains(IpcFlags::NOBLOCK) {
        return Err(Error::WouldBlock);
    }

    k.tasks[caller].wait_for = filter;
    k.tasks[caller].pending = flags & (IpcFlags::RECV | IpcFlags::KERNEL);
    if k.tasks[caller].state() == TaskState::Runnable {
        task::block(k, caller);
    }
    Ok(None)
}

fn find_sender(
    k: &Kernel,
    receiver: TaskIndex,
    filter: IpcFilter,
) -> Option<usize> {
    k.tasks[receiver]
        .senders
        .iter()
        .position(|&s| filter.accepts(k.tasks[s].tid()))
}

// A parked sender's message was just consumed. Either the send stands
// alone (resume with OK) or it was the first half of a CALL, in which
// case the sender transitions straight into its receive phase.
fn wake_sender(k: &mut Kernel, s: TaskIndex) {
    let flags = core::mem::take(&mut k.tasks[s].pending);

    if k.tasks[s].exited {
        // Its farewell message is delivered; the task stays parked until
        // its pager reaps it.
        return;
    }

    if flags.contains(IpcFlags::RECV) {
        let filter = k.tasks[s].pending_filter;
        recv_parked(k, s, filter, flags & (IpcFlags::RECV | IpcFlags::KERNEL));
    } else {
        k.tasks[s].save.set_ret(0);
        task::resume(k, s);
    }
}

// Receive phase for a task that is already parked (the second half of a
// CALL whose send phase had to wait). Mirrors `recv`, but completion goes
// through the parked-receiver path.
fn recv_parked(
    k: &mut Kernel,
    idx: TaskIndex,
    filter: IpcFilter,
    flags: IpcFlags,
) {
    let kernel = flags.contains(IpcFlags::KERNEL);

    if !kernel && filter != IpcFilter::Deny {
        let bits = k.tasks[idx].notifications;
        if !bits.is_empty() {
            k.tasks[idx].notifications = Notifications::empty();
            k.tasks[idx].message = notification_message(bits);
            k.tasks[idx].pending = flags;
            finish_recv(k, idx);
            return;
        }
    }

    if let Some(pos) = find_sender(k, idx, filter) {
        let s = k.tasks[idx].senders.remove(pos);
        let mut msg = k.tasks[s].message;
        msg.src = k.tasks[s].tid();
        k.tasks[idx].message = msg;
        k.tasks[idx].pending = flags;
        finish_recv(k, idx);
        wake_sender(k, s);
        return;
    }

    k.tasks[idx].wait_for = filter;
    k.tasks[idx].pending = flags;
}

fn notification_message(bits: Notifications) -> Message {
    let mut m = Message::new(
        NOTIFY_MSG,
        &NotifyPayload {
            notifications: bits.bits(),
        },
    );
    m.src = FROM_KERNEL;
    m
}

/// Posts notification bits to a task. A task parked in a user receive
/// whose filter is not `Deny` gets the coalesced `NOTIFY_MSG` right away;
/// otherwise the bits wait for its next receive. A pager call in progress
/// is never preempted by notifications, so fault replies stay
/// unmistakable.
pub fn notify(k: &mut Kernel, idx: TaskIndex, bits: Notifications) {
    k.tasks[idx].notifications |= bits;

    let deliverable = {
        let t = &k.tasks[idx];
        t.state() == TaskState::Blocked
            && t.wait_for != IpcFilter::Deny
            && !t.pending.contains(IpcFlags::KERNEL)
    };
    if deliverable {
        let bits = core::mem::take(&mut k.tasks[idx].notifications);
        k.tasks[idx].message = notification_message(bits);
        finish_recv(k, idx);
    }
}

/// Aborts a parked send because its destination is being destroyed. The
/// sender observes `ERR_ABORTED` and finds `NOTIFY_ABORTED` pending.
pub(crate) fn abort_send(k: &mut Kernel, s: TaskIndex) {
    k.tasks[s].notifications |= Notifications::ABORTED;
    k.tasks[s].pending = IpcFlags::empty();
    k.tasks[s].pending_filter = IpcFilter::Deny;
    if k.tasks[s].exited {
        return;
    }
    k.tasks[s].save.set_ret(Error::Aborted.code());
    task::resume(k, s);
}

/// Kernel-origin, send-only delivery of an exception message to a pager.
/// Cannot fail: without `NOBLOCK` a send either completes or queues.
pub(crate) fn send_exception(
    k: &mut Kernel,
    from: TaskIndex,
    pager: TaskIndex,
    msg: Message,
) {
    let r = ipc(
        k,
        from,
        Some(pager),
        IpcFilter::Deny,
        MsgSource::Kernel(msg),
        IpcFlags::SEND | IpcFlags::KERNEL,
    );
    debug_assert!(r.is_ok());
}
