// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks and the scheduler.
//!
//! Task records live in a fixed slab ([`crate::Kernel::tasks`]); the first
//! `NUM_TASKS_MAX` slots are user tasks addressed by TID, the rest are the
//! per-CPU idle tasks. A slot cycles `Unused -> (Runnable | Blocked) ->
//! Unused`; idle tasks sit permanently in `Blocked` and are chosen only
//! when the run queue is empty, which keeps them out of every queue
//! invariant.
//!
//! Scheduling is a single FIFO run queue shared by all CPUs under the
//! kernel lock, with a uniform time slice. A task is in the run queue
//! exactly when it is `Runnable` and not currently executing on some CPU.

use arrayvec::ArrayString;

use abi::{
    Error, ExceptionReason, IpcFilter, IpcFlags, Message, Notifications,
    PAddr, Tid, UAddr, ExceptionPayload, EXCEPTION_MSG, NUM_TASKS_MAX,
    TASK_NAME_LEN, TASK_QUANTUM,
};

use crate::arch;
use crate::ipc;
use crate::mp::{self, IpiSet};
use crate::pm::PageList;
use crate::{idle_index, Kernel, TaskIndex};

// A zero quantum would park every task forever at its first tick.
static_assertions::const_assert!(TASK_QUANTUM > 0);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Unused,
    Runnable,
    Blocked,
}

/// What runs when this task is scheduled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskKind {
    /// Ordinary user code at some entry point.
    User,
    /// Kernel-mode interpreter over a program held in task-owned pages.
    Interpreter { program: PAddr, words: usize },
}

/// Internal representation of a task.
pub struct Task {
    tid: Tid,
    name: ArrayString<TASK_NAME_LEN>,
    state: TaskState,
    /// Tombstone: destruction is underway, schedulers must not pick this
    /// task up again.
    pub(crate) destroyed: bool,
    /// The task ended itself (or was ended by the kernel) and waits for
    /// its pager to reap it; it must never run again.
    pub(crate) exited: bool,
    /// Remaining time slice, in ticks.
    pub(crate) quantum: u32,
    /// Ticks until a `NOTIFY_TIMER`, or 0 when unarmed.
    pub(crate) timeout: u64,
    /// How many other tasks name this one as their pager.
    pub(crate) ref_count: u32,
    pub(crate) pager: Option<Tid>,
    /// Receive filter while blocked in receive; `Deny` otherwise.
    pub(crate) wait_for: IpcFilter,
    /// Flags of the suspended IPC operation, consulted by whoever
    /// completes it.
    pub(crate) pending: IpcFlags,
    /// Receive filter a suspended CALL will use once its send half
    /// completes.
    pub(crate) pending_filter: IpcFilter,
    pub(crate) notifications: Notifications,
    /// Single-slot message buffer: outbox while blocked sending, inbox on
    /// delivery.
    pub(crate) message: Message,
    /// Tasks blocked sending to this one, in arrival order.
    pub(crate) senders: arrayvec::ArrayVec<TaskIndex, NUM_TASKS_MAX>,
    /// Chain of owned physical pages; see [`crate::pm`].
    pub(crate) pages: PageList,
    pub(crate) vm: arch::AddrSpace,
    pub(crate) save: arch::SavedState,
    pub(crate) kind: TaskKind,
}

impl Task {
    pub(crate) fn unused() -> Task {
        Task {
            tid: 0,
            name: ArrayString::new(),
            state: TaskState::Unused,
            destroyed: false,
            exited: false,
            quantum: 0,
            timeout: 0,
            ref_count: 0,
            pager: None,
            wait_for: IpcFilter::Deny,
            pending: IpcFlags::empty(),
            pending_filter: IpcFilter::Deny,
            notifications: Notifications::empty(),
            message: Message::default(),
            senders: arrayvec::ArrayVec::new(),
            pages: PageList::default(),
            vm: arch::vm_init(),
            save: arch::SavedState::default(),
            kind: TaskKind::User,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn pager(&self) -> Option<Tid> {
        self.pager
    }

    pub fn is_unused(&self) -> bool {
        self.state == TaskState::Unused
    }

    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Runnable
    }

    pub fn notifications(&self) -> Notifications {
        self.notifications
    }

    /// Saved register state, readable for inspection (the trap layer and
    /// IPC completion write it through the kernel).
    pub fn save(&self) -> &arch::SavedState {
        &self.save
    }
}

fn bounded_name(name: &str) -> ArrayString<TASK_NAME_LEN> {
    let mut out = ArrayString::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

fn init_task_struct(
    k: &mut Kernel,
    idx: TaskIndex,
    tid: Tid,
    name: &str,
    ip: UAddr,
    pager: Option<Tid>,
    kind: TaskKind,
) -> Result<(), Error> {
    let pager_idx = match pager {
        Some(p) => Some(k.task_find(p).ok_or(Error::InvalidArg)?),
        None => None,
    };

    let mut task = Task::unused();
    task.tid = tid;
    task.name = bounded_name(name);
    task.kind = kind;
    task.pager = pager;
    task.save.pc = ip;
    task.state = TaskState::Blocked;
    k.tasks[idx] = task;

    if let Some(pi) = pager_idx {
        k.tasks[pi].ref_count += 1;
    }
    Ok(())
}

// Scans for an unused slot; 0 means the table is full.
fn alloc_tid(k: &Kernel) -> Tid {
    for i in 0..NUM_TASKS_MAX {
        if k.tasks[i].is_unused() {
            return i as Tid + 1;
        }
    }
    0
}

/// Creates a task and makes it runnable.
pub fn create(
    k: &mut Kernel,
    name: &str,
    ip: UAddr,
    pager: Option<Tid>,
) -> Result<Tid, Error> {
    create_with_kind(k, name, ip, pager, TaskKind::User)
}

pub(crate) fn create_with_kind(
    k: &mut Kernel,
    name: &str,
    ip: UAddr,
    pager: Option<Tid>,
    kind: TaskKind,
) -> Result<Tid, Error> {
    let tid = alloc_tid(k);
    if tid == 0 {
        return Err(Error::TooManyTasks);
    }
    let idx = tid as usize - 1;
    init_task_struct(k, idx, tid, name, ip, pager, kind)?;
    resume(k, idx);
    ktrace!("created task \"{}\" (tid={})", name, tid);
    Ok(tid)
}

/// Moves a task to `Blocked`. A task blocking itself must follow up with
/// a [`switch`] so the CPU moves on.
pub fn block(k: &mut Kernel, idx: TaskIndex) {
    debug_assert_eq!(k.tasks[idx].state, TaskState::Runnable);
    debug_assert!(!k.runqueue.contains(&idx));
    k.tasks[idx].state = TaskState::Blocked;
}

/// Moves a blocked task to `Runnable` and queues it at the tail.
pub fn resume(k: &mut Kernel, idx: TaskIndex) {
    debug_assert_eq!(k.tasks[idx].state, TaskState::Blocked);
    debug_assert!(!k.tasks[idx].exited);
    k.tasks[idx].state = TaskState::Runnable;
    k.runqueue.push(idx);
}

// Picks the next task for this CPU: run-queue head, else the current task
// if it can keep going, else idle.
fn scheduler(k: &mut Kernel) -> TaskIndex {
    if !k.runqueue.is_empty() {
        return k.runqueue.remove(0);
    }
    let current = k.current();
    if k.tasks[current].state == TaskState::Runnable
        && !k.tasks[current].destroyed
    {
        return current;
    }
    idle_index(k.current_cpu)
}

/// Voluntary task switch. Returns immediately when nothing else can run;
/// otherwise hands the CPU over and re-queues the outgoing task if it is
/// still runnable.
pub fn switch(k: &mut Kernel) {
    let cpu = k.current_cpu;
    let prev = k.cpus[cpu].current_task;
    let next = scheduler(k);

    if next != idle_index(cpu) {
        k.tasks[next].quantum = TASK_QUANTUM;
    }

    if next == prev {
        return;
    }

    if k.tasks[prev].state == TaskState::Runnable {
        // Used up its slice but still wants the CPU; round-robin it.
        k.runqueue.push(prev);
    }

    k.cpus[cpu].current_task = next;
    arch::context_switch(&mut k.machine);
}

/// Runs the scheduler on behalf of another CPU, as its reschedule-IPI
/// handler would.
pub(crate) fn switch_on(k: &mut Kernel, cpu: usize) {
    let prev_cpu = k.current_cpu;
    k.current_cpu = cpu;
    switch(k);
    k.current_cpu = prev_cpu;
}

/// Destroys a task and recycles its slot.
///
/// Refused for the current task, idle tasks, the first user task, and any
/// task still referenced as a pager. Blocked senders are woken with
/// `NOTIFY_ABORTED`; another CPU running the victim is interrupted and
/// waited out.
pub fn destroy(k: &mut Kernel, idx: TaskIndex) -> Result<(), Error> {
    if idx >= NUM_TASKS_MAX || idx == k.current() {
        return Err(Error::InvalidArg);
    }
    debug_assert!(!k.tasks[idx].is_unused());

    if k.tasks[idx].tid == 1 {
        // The first user task pages everyone else; nothing could reap its
        // children afterwards.
        klog!("refusing to destroy task #1");
        return Err(Error::InvalidArg);
    }

    if k.tasks[idx].ref_count > 0 {
        klog!(
            "\"{}\" (tid={}) is still a pager for {} task(s)",
            k.tasks[idx].name(),
            k.tasks[idx].tid,
            k.tasks[idx].ref_count
        );
        return Err(Error::StillUsed);
    }

    ktrace!(
        "destroying task \"{}\" (tid={})",
        k.tasks[idx].name(),
        k.tasks[idx].tid
    );

    // Keep other CPUs' schedulers from picking the victim up again while
    // we wait for it to stop running.
    k.tasks[idx].destroyed = true;

    loop {
        if k.tasks[idx].state != TaskState::Runnable {
            break;
        }
        if k.runqueue.contains(&idx) {
            break;
        }
        // Runnable but not queued: executing on another CPU right now.
        mp::send_ipi(k, IpiSet::RESCHEDULE);
    }

    // Abort everyone mid-send to the victim.
    let senders = core::mem::take(&mut k.tasks[idx].senders);
    for s in senders {
        ipc::abort_send(k, s);
    }

    unlink_everywhere(k, idx);

    arch::vm_destroy(&mut k.tasks[idx].vm);
    {
        let Kernel { pm, tasks, .. } = k;
        pm.free_task_pages(&mut tasks[idx]);
    }
    let tid = k.tasks[idx].tid;
    for l in k.irq_listeners.iter_mut() {
        if *l == Some(tid) {
            *l = None;
        }
    }

    if let Some(p) = k.tasks[idx].pager {
        let pi = k.task_find(p).expect("pager outlives its clients");
        k.tasks[pi].ref_count -= 1;
    }

    k.tasks[idx] = Task::unused();
    Ok(())
}

// Removes a task from every queue it could sit in. The C ancestry of this
// design unlinked intrusively in O(1); with index queues a bounded scan
// does the same job.
fn unlink_everywhere(k: &mut Kernel, idx: TaskIndex) {
    k.runqueue.retain(|&mut i| i != idx);
    for t in 0..NUM_TASKS_MAX {
        k.tasks[t].senders.retain(|&mut i| i != idx);
    }
    k.serial.waiters.retain(|&mut i| i != idx);
}

/// Ends the current task: report the reason to its pager and stop running.
/// The pager is expected to call [`destroy`].
pub fn exit(k: &mut Kernel, reason: i32) {
    let current = k.current();
    exit_on(k, current, reason);
}

/// Ends an arbitrary task; used for the current task's exits and for
/// protocol violations detected while the victim is blocked.
pub(crate) fn exit_on(k: &mut Kernel, idx: TaskIndex, reason: i32) {
    let pager = k.tasks[idx]
        .pager
        .expect("idle and the first user task cannot exit");
    let pi = k.task_find(pager).expect("pager outlives its clients");

    ktrace!(
        "task \"{}\" (tid={}) exiting, reason={}",
        k.tasks[idx].name(),
        k.tasks[idx].tid,
        reason
    );

    let msg = Message::new(
        EXCEPTION_MSG,
        &ExceptionPayload {
            task: k.tasks[idx].tid,
            reason,
        },
    );
    ipc::send_exception(k, idx, pi, msg);

    // Never scheduled again; the slot is reclaimed by the pager's destroy.
    k.tasks[idx].exited = true;
    k.tasks[idx].wait_for = IpcFilter::Deny;
    if k.tasks[idx].state == TaskState::Runnable {
        debug_assert!(!k.runqueue.contains(&idx));
        k.tasks[idx].state = TaskState::Blocked;
    }
}

/// Convenience wrapper for kernel-detected exceptions.
pub(crate) fn exit_on_exception(
    k: &mut Kernel,
    idx: TaskIndex,
    reason: ExceptionReason,
) {
    exit_on(k, idx, reason as i32);
}

/// Logs every in-use task and what it is waiting for. Wired to Ctrl-P on
/// the console; the first tool to reach for when the system deadlocks.
pub fn dump(k: &Kernel) {
    klog!("active tasks:");
    for idx in 0..NUM_TASKS_MAX {
        let t = &k.tasks[idx];
        match t.state {
            TaskState::Unused => {}
            TaskState::Runnable => {
                klog!("  #{}: {}: RUNNABLE", t.tid, t.name());
                for &s in &t.senders {
                    klog!(
                        "    blocked sender: #{}: {}",
                        k.tasks[s].tid,
                        k.tasks[s].name()
                    );
                }
            }
            TaskState::Blocked => match t.wait_for {
                IpcFilter::Deny => klog!(
                    "  #{}: {}: BLOCKED (send, serial read, or exited)",
                    t.tid,
                    t.name()
                ),
                IpcFilter::Any => {
                    klog!("  #{}: {}: BLOCKED (open receive)", t.tid, t.name())
                }
                IpcFilter::Task(peer) => klog!(
                    "  #{}: {}: BLOCKED (closed receive from #{})",
                    t.tid,
                    t.name(),
                    peer
                ),
            },
        }
    }
}

/// Sets up this CPU's idle task and makes it current.
pub(crate) fn init_percpu(k: &mut Kernel, cpu: usize) {
    let idx = idle_index(cpu);
    let mut idle = Task::unused();
    idle.tid = 0;
    idle.name = bounded_name("(idle)");
    idle.state = TaskState::Blocked;
    k.tasks[idx] = idle;
    k.cpus[cpu].idle_task = idx;
    k.cpus[cpu].current_task = idx;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::boot_kernel;
    use pretty_assertions::assert_eq;

    #[test]
    fn create_assigns_increasing_tids() {
        let mut k = boot_kernel();
        let a = create(&mut k, "a", 0x1000, Some(1)).unwrap();
        let b = create(&mut k, "b", 0x1000, Some(1)).unwrap();
        assert_eq!((a, b), (2, 3));
        assert_eq!(k.tasks[a as usize - 1].state(), TaskState::Runnable);
        assert_eq!(k.tasks[0].ref_count, 2);
    }

    #[test]
    fn create_at_capacity_fails_without_consuming_a_slot() {
        let mut k = boot_kernel();
        for i in 1..NUM_TASKS_MAX {
            create(&mut k, "filler", 0x1000, Some(1))
                .unwrap_or_else(|_| panic!("slot {i} should be free"));
        }
        assert_eq!(
            create(&mut k, "extra", 0x1000, Some(1)),
            Err(Error::TooManyTasks)
        );
        // Destroying one slot makes creation work again.
        let victim = k.task_find(2).unwrap();
        destroy(&mut k, victim).unwrap();
        assert!(create(&mut k, "again", 0x1000, Some(1)).is_ok());
    }

    #[test]
    fn scheduler_is_fifo_round_robin() {
        let mut k = boot_kernel();
        let a = create(&mut k, "a", 0x1000, Some(1)).unwrap() as usize - 1;
        let b = create(&mut k, "b", 0x1000, Some(1)).unwrap() as usize - 1;

        // Boot leaves task #1 current. Switching walks the queue in
        // creation order and reinserts the outgoing task at the tail.
        assert_eq!(k.current(), 0);
        switch(&mut k);
        assert_eq!(k.current(), a);
        switch(&mut k);
        assert_eq!(k.current(), b);
        switch(&mut k);
        assert_eq!(k.current(), 0);
    }

    #[test]
    fn blocked_current_falls_back_to_idle() {
        let mut k = boot_kernel();
        let current = k.current();
        block(&mut k, current);
        switch(&mut k);
        assert_eq!(k.current(), idle_index(0));
        // And back once someone becomes runnable.
        resume(&mut k, current);
        switch(&mut k);
        assert_eq!(k.current(), current);
    }

    #[test]
    fn switch_grants_a_fresh_quantum() {
        let mut k = boot_kernel();
        let a = create(&mut k, "a", 0x1000, Some(1)).unwrap() as usize - 1;
        switch(&mut k);
        assert_eq!(k.current(), a);
        assert_eq!(k.tasks[a].quantum, TASK_QUANTUM);
    }

    #[test]
    fn destroy_refuses_task_one_and_referenced_pagers() {
        let mut k = boot_kernel();
        let t = create(&mut k, "child", 0x1000, Some(1)).unwrap();
        assert_eq!(destroy(&mut k, 0), Err(Error::InvalidArg));

        // Task 2 pages task 3; destroying 2 must fail until 3 is gone.
        let g = create(&mut k, "grandchild", 0x1000, Some(t)).unwrap();
        let ti = k.task_find(t).unwrap();
        assert_eq!(destroy(&mut k, ti), Err(Error::StillUsed));
        let gi = k.task_find(g).unwrap();
        destroy(&mut k, gi).unwrap();
        destroy(&mut k, ti).unwrap();
        assert!(k.task_find(t).is_none());
    }

    #[test]
    fn destroy_reclaims_slot_and_runqueue_entry() {
        let mut k = boot_kernel();
        let t = create(&mut k, "victim", 0x1000, Some(1)).unwrap();
        let ti = k.task_find(t).unwrap();
        assert!(k.runqueue.contains(&ti));
        destroy(&mut k, ti).unwrap();
        assert!(!k.runqueue.contains(&ti));
        assert!(k.tasks[ti].is_unused());
        assert_eq!(k.tasks[0].ref_count, 0);
    }

    #[test]
    fn destroy_steals_victim_from_another_cpu() {
        let mut k = boot_kernel();
        let t = create(&mut k, "remote", 0x1000, Some(1)).unwrap();
        let ti = k.task_find(t).unwrap();

        // Bring CPU 1 online and let it run the victim.
        crate::startup::cpu_up(&mut k, 1);
        switch_on(&mut k, 1);
        assert_eq!(k.cpus[1].current_task, ti);
        assert!(!k.runqueue.contains(&ti));

        // Destroy from CPU 0: the reschedule IPI kicks it off CPU 1.
        destroy(&mut k, ti).unwrap();
        assert!(k.tasks[ti].is_unused());
        assert_ne!(k.cpus[1].current_task, ti);
    }

    #[test]
    fn exit_notifies_pager_and_parks_the_task() {
        let mut k = boot_kernel();
        let t = create(&mut k, "leaver", 0x1000, Some(1)).unwrap();
        let ti = k.task_find(t).unwrap();

        // The pager blocks in open receive first.
        let buf = crate::test_support::give_page(&mut k, 0);
        crate::test_support::recv_any(&mut k, 0, buf);

        exit_on(&mut k, ti, ExceptionReason::GraceExit as i32);
        assert_eq!(k.tasks[ti].state(), TaskState::Blocked);
        assert!(k.tasks[ti].exited);

        // The pager got the exception message immediately.
        let m = crate::test_support::read_message(&k, 0, buf);
        assert_eq!(m.kind, EXCEPTION_MSG);
        assert_eq!(m.src, t);
        let p: ExceptionPayload = m.payload().unwrap();
        assert_eq!(p.task, t);
        assert_eq!(p.reason, ExceptionReason::GraceExit as i32);
    }
}
