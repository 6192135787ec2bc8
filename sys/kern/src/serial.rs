// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial console: a byte sink for writes, a small receive ring, and a
//! FIFO of readers blocked waiting for input.
//!
//! Ctrl-P is intercepted before buffering and dumps the task table; it is
//! the debugging lifeline when the system wedges.

use arrayvec::ArrayVec;

use abi::{Error, UAddr, NUM_TASKS_MAX};

use crate::arch;
use crate::task::{self, TaskState};
use crate::umem;
use crate::{Kernel, TaskIndex};

/// Receive ring capacity, in bytes. Input beyond this evicts the oldest
/// bytes; a reader that falls this far behind has lost them anyway.
pub const RX_CAPACITY: usize = 128;

// Scratch size for chunked user copies on the write path.
const WRITE_CHUNK: usize = 128;

const CTRL_P: u8 = 0x10;

#[derive(Default)]
pub struct Serial {
    rx: ArrayVec<u8, RX_CAPACITY>,
    /// Tasks blocked in `serial_read`, in arrival order.
    pub(crate) waiters: ArrayVec<TaskIndex, NUM_TASKS_MAX>,
}

/// `serial_write`: copies the user buffer through kernel scratch in
/// chunks and pushes it to the console. Returns the byte count written.
pub fn write(
    k: &mut Kernel,
    caller: TaskIndex,
    uaddr: UAddr,
    len: usize,
) -> Result<isize, Error> {
    let mut scratch = [0u8; WRITE_CHUNK];
    let mut done = 0;
    while done < len {
        let chunk = WRITE_CHUNK.min(len - done);
        umem::read_bytes(k, caller, uaddr + done, &mut scratch[..chunk])?;
        for &b in &scratch[..chunk] {
            arch::serial_write(&mut k.machine, b);
        }
        done += chunk;
    }
    Ok(done as isize)
}

/// `serial_read`: hands over whatever input is buffered, up to `max_len`
/// bytes. With nothing buffered the caller parks until input arrives.
pub fn read(
    k: &mut Kernel,
    caller: TaskIndex,
    uaddr: UAddr,
    max_len: usize,
) -> Result<Option<isize>, Error> {
    if max_len == 0 {
        return Ok(Some(0));
    }
    if k.serial.rx.is_empty() {
        k.serial.waiters.push(caller);
        if k.tasks[caller].state() == TaskState::Runnable {
            task::block(k, caller);
        }
        return Ok(None);
    }
    drain_into(k, caller, uaddr, max_len).map(Some)
}

// Moves buffered input into a reader's buffer and reports the count.
fn drain_into(
    k: &mut Kernel,
    reader: TaskIndex,
    uaddr: UAddr,
    max_len: usize,
) -> Result<isize, Error> {
    let n = k.serial.rx.len().min(max_len);
    let mut chunk = [0u8; RX_CAPACITY];
    for (i, b) in k.serial.rx.drain(..n).enumerate() {
        chunk[i] = b;
    }
    umem::write_bytes(k, reader, uaddr, &chunk[..n])?;
    Ok(n as isize)
}

/// Console receive interrupt: pull everything the UART has, stash it in
/// the ring, and complete blocked readers in FIFO order.
pub fn handle_input(k: &mut Kernel) {
    while let Some(b) = arch::serial_read(&mut k.machine) {
        if b == CTRL_P {
            task::dump(k);
            continue;
        }
        if k.serial.rx.is_full() {
            k.serial.rx.remove(0);
        }
        k.serial.rx.push(b);
    }

    while !k.serial.rx.is_empty() && !k.serial.waiters.is_empty() {
        let reader = k.serial.waiters.remove(0);
        // The parked reader's buffer and bound sit in its saved args.
        let uaddr = k.tasks[reader].save.arg(0);
        let max_len = k.tasks[reader].save.arg(1);
        let ret = match drain_into(k, reader, uaddr, max_len) {
            Ok(n) => n,
            Err(e) => e.code(),
        };
        k.tasks[reader].save.set_ret(ret);
        task::resume(k, reader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn write_reaches_the_console() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "sh");
        let buf = give_page(&mut k, t);
        write_to(&mut k, t, buf, b"hello, console");
        let n = write(&mut k, t, buf, 14).unwrap();
        assert_eq!(n, 14);
        assert_eq!(&k.machine.console_out, b"hello, console");
    }

    #[test]
    fn read_returns_buffered_input() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "sh");
        let buf = give_page(&mut k, t);
        k.machine.push_input(b"ls\n");
        handle_input(&mut k);

        let n = read(&mut k, t, buf, 64).unwrap();
        assert_eq!(n, Some(3));
        assert_eq!(&read_from(&k, t, buf, 3), b"ls\n");
    }

    #[test]
    fn empty_ring_parks_the_reader_until_input() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "sh");
        let buf = give_page(&mut k, t);

        make_current(&mut k, t);
        k.tasks[t].save.set_args([buf, 16, 0, 0, 0], 0);
        assert_eq!(read(&mut k, t, buf, 16), Ok(None));
        assert_eq!(k.tasks[t].state(), TaskState::Blocked);
        task::switch(&mut k);

        k.machine.push_input(b"x");
        handle_input(&mut k);
        assert_eq!(k.tasks[t].state(), TaskState::Runnable);
        assert_eq!(k.tasks[t].save().ret(), Some(1));
        assert_eq!(&read_from(&k, t, buf, 1), b"x");
    }

    #[test]
    fn blocked_readers_wake_in_fifo_order() {
        let mut k = boot_kernel();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        let a_buf = give_page(&mut k, a);
        let b_buf = give_page(&mut k, b);

        for (t, buf) in [(a, a_buf), (b, b_buf)] {
            make_current(&mut k, t);
            k.tasks[t].save.set_args([buf, 8, 0, 0, 0], 0);
            assert_eq!(read(&mut k, t, buf, 8), Ok(None));
            task::switch(&mut k);
        }

        // One byte satisfies only the first reader.
        k.machine.push_input(b"q");
        handle_input(&mut k);
        assert_eq!(k.tasks[a].state(), TaskState::Runnable);
        assert_eq!(k.tasks[b].state(), TaskState::Blocked);
        assert_eq!(k.tasks[a].save().ret(), Some(1));
    }

    #[test]
    fn ctrl_p_dumps_instead_of_buffering() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "sh");
        let buf = give_page(&mut k, t);
        k.machine.push_input(&[CTRL_P, b'a']);
        handle_input(&mut k);
        let n = read(&mut k, t, buf, 8).unwrap();
        assert_eq!(n, Some(1));
        assert_eq!(&read_from(&k, t, buf, 1), b"a");
    }

    #[test]
    fn overflow_drops_the_oldest_bytes() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "sh");
        let buf = give_page(&mut k, t);
        let data: alloc::vec::Vec<u8> = (0..200u8).collect();
        k.machine.push_input(&data);
        handle_input(&mut k);

        let n = read(&mut k, t, buf, 256).unwrap();
        assert_eq!(n, Some(RX_CAPACITY as isize));
        let got = read_from(&k, t, buf, RX_CAPACITY);
        assert_eq!(got[0], 200 - RX_CAPACITY as u8);
        assert_eq!(got[RX_CAPACITY - 1], 199);
    }
}
