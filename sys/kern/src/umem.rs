// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted user memory.
//!
//! A user pointer confers no authority by itself: every access first
//! checks that the range lies inside the user-mappable window, then goes
//! through the architecture's checked copy, which walks the task's actual
//! translations. Any hole or permission mismatch surfaces as
//! `ERR_INVALID_UADDR`; nothing here panics on user input.

use arrayvec::ArrayString;
use zerocopy::AsBytes;

use abi::{Error, Message, UAddr, TASK_NAME_LEN};

use crate::arch;
use crate::{Kernel, TaskIndex};

fn check_range(uaddr: UAddr, len: usize) -> Result<(), Error> {
    if len == 0 {
        return Ok(());
    }
    let end = uaddr.checked_add(len).ok_or(Error::InvalidUaddr)?;
    if uaddr < arch::USER_BASE || end > arch::USER_TOP {
        return Err(Error::InvalidUaddr);
    }
    Ok(())
}

/// Copies bytes out of a task's address space.
pub fn read_bytes(
    k: &Kernel,
    idx: TaskIndex,
    uaddr: UAddr,
    dst: &mut [u8],
) -> Result<(), Error> {
    check_range(uaddr, dst.len())?;
    arch::copy_from_user(&k.machine, &k.tasks[idx].vm, uaddr, dst)
}

/// Copies bytes into a task's address space.
pub fn write_bytes(
    k: &mut Kernel,
    idx: TaskIndex,
    uaddr: UAddr,
    src: &[u8],
) -> Result<(), Error> {
    check_range(uaddr, src.len())?;
    let Kernel { machine, tasks, .. } = k;
    arch::copy_to_user(machine, &tasks[idx].vm, uaddr, src)
}

/// Reads a whole [`Message`] from a task's buffer.
pub fn read_message(
    k: &Kernel,
    idx: TaskIndex,
    uaddr: UAddr,
) -> Result<Message, Error> {
    let mut m = Message::default();
    read_bytes(k, idx, uaddr, m.as_bytes_mut())?;
    Ok(m)
}

/// Writes the task's inbox out to its buffer.
pub fn write_message(
    k: &mut Kernel,
    idx: TaskIndex,
    uaddr: UAddr,
) -> Result<(), Error> {
    let m = k.tasks[idx].message;
    write_bytes(k, idx, uaddr, m.as_bytes())
}

/// Reads a bounded task name: exactly [`TASK_NAME_LEN`] bytes, truncated
/// at the first NUL, with non-ASCII bytes replaced.
pub fn read_name(
    k: &Kernel,
    idx: TaskIndex,
    uaddr: UAddr,
) -> Result<ArrayString<TASK_NAME_LEN>, Error> {
    let mut raw = [0u8; TASK_NAME_LEN];
    read_bytes(k, idx, uaddr, &mut raw)?;
    let mut name = ArrayString::new();
    for &b in &raw {
        if b == 0 {
            break;
        }
        let c = if b.is_ascii_graphic() || b == b' ' {
            b as char
        } else {
            '?'
        };
        let _ = name.try_push(c);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use abi::PAGE_SIZE;

    #[test]
    fn rejects_ranges_outside_the_user_window() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "t");
        let mut buf = [0u8; 4];
        assert_eq!(
            read_bytes(&k, t, 0, &mut buf),
            Err(Error::InvalidUaddr)
        );
        assert_eq!(
            read_bytes(&k, t, arch::USER_TOP - 2, &mut buf),
            Err(Error::InvalidUaddr)
        );
        assert_eq!(
            write_bytes(&mut k, t, usize::MAX - 1, &[1, 2]),
            Err(Error::InvalidUaddr)
        );
    }

    #[test]
    fn rejects_unmapped_pages() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "t");
        let mut buf = [0u8; 4];
        assert_eq!(
            read_bytes(&k, t, 0x20_0000, &mut buf),
            Err(Error::InvalidUaddr)
        );
    }

    #[test]
    fn copies_across_page_boundaries() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "t");
        let a = give_page(&mut k, t);
        let b = give_page(&mut k, t);
        assert_eq!(b, a + PAGE_SIZE);

        let data: alloc::vec::Vec<u8> =
            (0..PAGE_SIZE + 64).map(|i| i as u8).collect();
        write_bytes(&mut k, t, a + PAGE_SIZE - 32, &data[..96]).unwrap();
        let mut back = [0u8; 96];
        read_bytes(&k, t, a + PAGE_SIZE - 32, &mut back).unwrap();
        assert_eq!(&back[..], &data[..96]);
    }

    #[test]
    fn name_copy_truncates_at_nul() {
        let mut k = boot_kernel();
        let t = spawn(&mut k, "t");
        let page = give_page(&mut k, t);
        let mut raw = [0u8; TASK_NAME_LEN];
        raw[..5].copy_from_slice(b"disk0");
        write_bytes(&mut k, t, page, &raw).unwrap();
        let name = read_name(&k, t, page).unwrap();
        assert_eq!(&*name, "disk0");
    }
}
