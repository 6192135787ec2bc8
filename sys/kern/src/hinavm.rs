// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interpreter tasks: a tiny kernel-mode stack machine.
//!
//! The `hinavm` syscall creates a task whose entry point is this
//! interpreter instead of user code, with the program copied into pages
//! the new task owns. It exists for running small bits of logic before a
//! filesystem is up, so the machine is deliberately minimal: a bounded
//! stack, a bounded step budget, and no access to anything but its own
//! program.

use arrayvec::ArrayVec;
use zerocopy::AsBytes;

use abi::{
    Error, ExceptionReason, PAddr, ProgramWord, Tid, UAddr, PAGE_SIZE,
    PROGRAM_WORDS_MAX,
};

use crate::pm::align_up;
use crate::task::{self, TaskKind};
use crate::umem;
use crate::{arch, Kernel, TaskIndex};

/// Stack depth available to a program.
pub const STACK_DEPTH: usize = 64;

/// Execution budget, in instructions; runaway programs are cut off.
pub const FUEL: usize = 10_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Op {
    Halt,
    Push,
    Drop,
    Add,
    Sub,
    Mul,
    Dup,
    Jmp,
    Bnz,
    Log,
}

impl Op {
    fn decode(raw: u32) -> Option<Op> {
        Some(match raw {
            0 => Op::Halt,
            1 => Op::Push,
            2 => Op::Drop,
            3 => Op::Add,
            4 => Op::Sub,
            5 => Op::Mul,
            6 => Op::Dup,
            7 => Op::Jmp,
            8 => Op::Bnz,
            9 => Op::Log,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmError {
    BadOpcode,
    BadJump,
    StackOverflow,
    StackUnderflow,
    OutOfFuel,
}

/// Runs a program to completion. The result is the top of stack at
/// `Halt` (0 with an empty stack).
pub fn execute(words: &[ProgramWord]) -> Result<i32, VmError> {
    let mut stack: ArrayVec<i32, STACK_DEPTH> = ArrayVec::new();
    let mut pc = 0usize;
    let mut fuel = FUEL;

    macro_rules! pop {
        () => {
            stack.pop().ok_or(VmError::StackUnderflow)?
        };
    }

    loop {
        if fuel == 0 {
            return Err(VmError::OutOfFuel);
        }
        fuel -= 1;

        let word = words.get(pc).ok_or(VmError::BadJump)?;
        let op = Op::decode(word.op).ok_or(VmError::BadOpcode)?;
        pc += 1;

        match op {
            Op::Halt => return Ok(stack.last().copied().unwrap_or(0)),
            Op::Push => stack
                .try_push(word.arg)
                .map_err(|_| VmError::StackOverflow)?,
            Op::Drop => {
                pop!();
            }
            Op::Add => {
                let (b, a) = (pop!(), pop!());
                stack.push(a.wrapping_add(b));
            }
            Op::Sub => {
                let (b, a) = (pop!(), pop!());
                stack.push(a.wrapping_sub(b));
            }
            Op::Mul => {
                let (b, a) = (pop!(), pop!());
                stack.push(a.wrapping_mul(b));
            }
            Op::Dup => {
                let top = *stack.last().ok_or(VmError::StackUnderflow)?;
                stack.try_push(top).map_err(|_| VmError::StackOverflow)?;
            }
            Op::Jmp => pc = branch_target(words, word.arg)?,
            Op::Bnz => {
                if pop!() != 0 {
                    pc = branch_target(words, word.arg)?;
                }
            }
            Op::Log => {
                let v = pop!();
                klog!("vm: {}", v);
                let _ = v;
            }
        }
    }
}

fn branch_target(words: &[ProgramWord], arg: i32) -> Result<usize, VmError> {
    let target = usize::try_from(arg).map_err(|_| VmError::BadJump)?;
    if target >= words.len() {
        return Err(VmError::BadJump);
    }
    Ok(target)
}

/// Reads a program out of user memory, bounds-checked.
pub fn read_program(
    k: &Kernel,
    caller: TaskIndex,
    uaddr: UAddr,
    num_words: usize,
) -> Result<ArrayVec<ProgramWord, PROGRAM_WORDS_MAX>, Error> {
    if num_words == 0 || num_words > PROGRAM_WORDS_MAX {
        return Err(Error::InvalidArg);
    }
    let mut raw = [0u8; PROGRAM_WORDS_MAX * core::mem::size_of::<ProgramWord>()];
    let len = num_words * core::mem::size_of::<ProgramWord>();
    umem::read_bytes(k, caller, uaddr, &mut raw[..len])?;

    let mut words = ArrayVec::new();
    for chunk in raw[..len].chunks_exact(core::mem::size_of::<ProgramWord>()) {
        let mut w = ProgramWord::default();
        w.as_bytes_mut().copy_from_slice(chunk);
        words.push(w);
    }
    Ok(words)
}

/// Creates an interpreter task. The program lands in freshly allocated
/// pages; ownership is assigned after the task record exists, since the
/// allocation necessarily happens first.
pub fn create(
    k: &mut Kernel,
    name: &str,
    words: &[ProgramWord],
    pager: Tid,
) -> Result<Tid, Error> {
    if words.is_empty() || words.len() > PROGRAM_WORDS_MAX {
        return Err(Error::InvalidArg);
    }

    let bytes = words.as_bytes();
    let size = align_up(bytes.len(), PAGE_SIZE);
    let paddr = {
        let Kernel { pm, machine, .. } = k;
        pm.alloc(size, None, abi::AllocFlags::empty(), machine)
            .ok_or(Error::NoMemory)?
    };
    arch::phys_slice_mut(&mut k.machine, paddr, bytes.len())
        .expect("fresh allocation is backed")
        .copy_from_slice(bytes);

    let tid = match task::create_with_kind(
        k,
        name,
        0,
        Some(pager),
        TaskKind::Interpreter {
            program: paddr,
            words: words.len(),
        },
    ) {
        Ok(tid) => tid,
        Err(e) => {
            k.pm.free(paddr, size, &mut k.tasks);
            return Err(e);
        }
    };

    let idx = k.task_find(tid).expect("task was just created");
    {
        let Kernel { pm, tasks, .. } = k;
        for off in (0..size).step_by(PAGE_SIZE) {
            pm.own_page(paddr + off, &mut tasks[idx]);
        }
    }
    ktrace!("created interpreter task \"{}\" (tid={})", name, tid);
    Ok(tid)
}

/// Entry trampoline: runs the task's program and exits the task with the
/// outcome. Scheduled like any other task; the program cannot block.
pub fn run_task(k: &mut Kernel, idx: TaskIndex) {
    let TaskKind::Interpreter { program, words } = k.tasks[idx].kind else {
        panic!("interpreter entry on a user task");
    };

    let len = words * core::mem::size_of::<ProgramWord>();
    let mut code: ArrayVec<ProgramWord, PROGRAM_WORDS_MAX> = ArrayVec::new();
    {
        let raw = arch::phys_slice(&k.machine, program, len)
            .expect("program pages are owned by the task");
        for chunk in raw.chunks_exact(core::mem::size_of::<ProgramWord>()) {
            let mut w = ProgramWord::default();
            w.as_bytes_mut().copy_from_slice(chunk);
            code.push(w);
        }
    }

    match execute(&code) {
        Ok(result) => {
            ktrace!(
                "vm task \"{}\" finished with {}",
                k.tasks[idx].name(),
                result
            );
            let _ = result;
            task::exit_on_exception(k, idx, ExceptionReason::GraceExit);
        }
        Err(e) => {
            klog!("vm task \"{}\" faulted: {:?}", k.tasks[idx].name(), e);
            let _ = e;
            task::exit_on_exception(k, idx, ExceptionReason::GraceExit);
        }
    }
}

/// Physical address of a task's program, if it is an interpreter task.
pub fn program_of(k: &Kernel, idx: TaskIndex) -> Option<PAddr> {
    match k.tasks[idx].kind {
        TaskKind::Interpreter { program, .. } => Some(program),
        TaskKind::User => None,
    }
}
