// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted simulator port.
//!
//! This port models the pieces of a machine the kernel core cares about:
//! physical memory contents behind a direct-mapped view, one page-table
//! handle per task, a console, interrupt enables, and the RTC. It exists
//! so the kernel can be developed and tested as an ordinary host crate;
//! the test suite drives trap entry points directly.
//!
//! One deliberate simplification: a reschedule IPI is serviced
//! synchronously at the send point, because the simulator cannot run CPUs
//! concurrently. On hardware the target CPU services it at its next
//! kernel-lock acquisition; the observable ordering under the big lock is
//! the same.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use abi::{
    BootInfo, Error, MapAttrs, PAddr, UAddr, IRQ_MAX, PAGE_SIZE,
};

use crate::Kernel;

/// Lowest user-mappable address; the zero page always faults.
pub const USER_BASE: UAddr = PAGE_SIZE;

/// One past the highest user-mappable address.
pub const USER_TOP: UAddr = 0x4000_0000;

/// Saved register state of a task, captured at trap entry: five syscall
/// arguments plus the call number, and the return-value register.
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    args: [usize; 5],
    sysnum: usize,
    ret: Option<isize>,
    /// User program counter; faults report it and restarts resume at it.
    pub pc: UAddr,
}

impl SavedState {
    /// Reads syscall argument register `n`.
    pub fn arg(&self, n: usize) -> usize {
        self.args[n]
    }

    pub fn sysnum(&self) -> usize {
        self.sysnum
    }

    /// Loads the argument registers, as the trap entry sequence does.
    pub fn set_args(&mut self, args: [usize; 5], sysnum: usize) {
        self.args = args;
        self.sysnum = sysnum;
        self.ret = None;
    }

    /// Writes the syscall return register.
    pub fn set_ret(&mut self, v: isize) {
        self.ret = Some(v);
    }

    /// The value the task will observe when it next runs, if its pending
    /// syscall has completed.
    pub fn ret(&self) -> Option<isize> {
        self.ret
    }
}

#[derive(Copy, Clone, Debug)]
struct Mapping {
    paddr: PAddr,
    attrs: MapAttrs,
}

/// A task's address space: the simulator's stand-in for a page table.
#[derive(Debug, Default)]
pub struct AddrSpace {
    pages: BTreeMap<UAddr, Mapping>,
}

/// Initializes an empty address space for a new task.
pub fn vm_init() -> AddrSpace {
    AddrSpace::default()
}

/// Tears down an address space. The page-record bookkeeping is reconciled
/// by the caller; this only drops the translations.
pub fn vm_destroy(space: &mut AddrSpace) {
    space.pages.clear();
}

/// Installs a translation. Fails if the page is already mapped; the kernel
/// requires an explicit unmap first so page refcounts stay balanced.
pub fn vm_map(
    space: &mut AddrSpace,
    uaddr: UAddr,
    paddr: PAddr,
    attrs: MapAttrs,
) -> Result<(), Error> {
    debug_assert_eq!(uaddr % PAGE_SIZE, 0);
    debug_assert_eq!(paddr % PAGE_SIZE, 0);
    if space.pages.contains_key(&uaddr) {
        return Err(Error::AlreadyUsed);
    }
    space.pages.insert(uaddr, Mapping { paddr, attrs });
    Ok(())
}

/// Removes a translation.
pub fn vm_unmap(space: &mut AddrSpace, uaddr: UAddr) -> Result<(), Error> {
    space
        .pages
        .remove(&uaddr)
        .map(|_| ())
        .ok_or(Error::NotFound)
}

/// Looks up the translation covering `uaddr`, if any.
pub fn vm_resolve(space: &AddrSpace, uaddr: UAddr) -> Option<(PAddr, MapAttrs)> {
    let page = uaddr & !(PAGE_SIZE - 1);
    space.pages.get(&page).map(|m| (m.paddr, m.attrs))
}

/// Whether `uaddr` lies in the window tasks may map.
pub fn is_mappable_uaddr(uaddr: UAddr) -> bool {
    (USER_BASE..USER_TOP).contains(&uaddr)
}

struct RamRange {
    base: PAddr,
    bytes: Vec<u8>,
}

/// The simulated machine: physical memory contents and device models.
pub struct Machine {
    ram: Vec<RamRange>,
    irq_enabled: [bool; IRQ_MAX],
    console_in: Vec<u8>,
    /// Everything the kernel wrote to the console.
    pub console_out: Vec<u8>,
    /// Value the RTC reports, seconds since the epoch.
    pub epoch: i64,
    /// Set once the kernel requests power-off.
    pub shutdown_requested: bool,
    /// Context switches taken, for scheduler assertions.
    pub context_switches: usize,
    /// TLB shootdowns requested, for unmap assertions.
    pub tlb_flushes: usize,
}

impl Machine {
    /// Builds a machine whose RAM matches the boot memory map. MMIO ranges
    /// get no byte backing; the kernel never memcpys device memory.
    pub fn new(bootinfo: &BootInfo) -> Machine {
        let ram = bootinfo
            .memory_map
            .frees()
            .iter()
            .map(|e| RamRange {
                base: e.paddr,
                bytes: vec![0xa5; e.size],
            })
            .collect();
        Machine {
            ram,
            irq_enabled: [false; IRQ_MAX],
            console_in: Vec::new(),
            console_out: Vec::new(),
            epoch: 0,
            shutdown_requested: false,
            context_switches: 0,
            tlb_flushes: 0,
        }
    }

    /// Queues console input, as if it arrived on the wire. The test
    /// harness follows this with the console interrupt path.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.console_in.extend_from_slice(bytes);
    }

    /// Whether the interrupt line is enabled at the controller.
    pub fn irq_enabled(&self, irq: usize) -> bool {
        self.irq_enabled[irq]
    }
}

/// Direct-mapped view of physical memory, read-only.
pub fn phys_slice(m: &Machine, paddr: PAddr, len: usize) -> Option<&[u8]> {
    for r in &m.ram {
        if paddr >= r.base && paddr + len <= r.base + r.bytes.len() {
            let off = paddr - r.base;
            return Some(&r.bytes[off..off + len]);
        }
    }
    None
}

/// Direct-mapped view of physical memory, writable.
pub fn phys_slice_mut(
    m: &mut Machine,
    paddr: PAddr,
    len: usize,
) -> Option<&mut [u8]> {
    for r in &mut m.ram {
        if paddr >= r.base && paddr + len <= r.base + r.bytes.len() {
            let off = paddr - r.base;
            return Some(&mut r.bytes[off..off + len]);
        }
    }
    None
}

fn user_chunks(
    uaddr: UAddr,
    len: usize,
) -> impl Iterator<Item = (UAddr, usize, usize)> {
    // Yields (page-relative address, offset into the buffer, chunk length)
    // for each page the range touches.
    let mut addr = uaddr;
    let mut off = 0;
    core::iter::from_fn(move || {
        if off >= len {
            return None;
        }
        let in_page = PAGE_SIZE - (addr % PAGE_SIZE);
        let chunk = in_page.min(len - off);
        let item = (addr, off, chunk);
        addr += chunk;
        off += chunk;
        Some(item)
    })
}

/// Checked copy out of a task's address space. Any hole or permission
/// mismatch along the way fails the whole copy.
pub fn copy_from_user(
    m: &Machine,
    space: &AddrSpace,
    uaddr: UAddr,
    dst: &mut [u8],
) -> Result<(), Error> {
    for (addr, off, chunk) in user_chunks(uaddr, dst.len()) {
        let (paddr, attrs) =
            vm_resolve(space, addr).ok_or(Error::InvalidUaddr)?;
        if !attrs.contains(MapAttrs::READ) {
            return Err(Error::InvalidUaddr);
        }
        let page_off = addr % PAGE_SIZE;
        let src = phys_slice(m, paddr + page_off, chunk)
            .ok_or(Error::InvalidUaddr)?;
        dst[off..off + chunk].copy_from_slice(src);
    }
    Ok(())
}

/// Checked copy into a task's address space.
pub fn copy_to_user(
    m: &mut Machine,
    space: &AddrSpace,
    uaddr: UAddr,
    src: &[u8],
) -> Result<(), Error> {
    for (addr, off, chunk) in user_chunks(uaddr, src.len()) {
        let (paddr, attrs) =
            vm_resolve(space, addr).ok_or(Error::InvalidUaddr)?;
        if !attrs.contains(MapAttrs::WRITE) {
            return Err(Error::InvalidUaddr);
        }
        let page_off = addr % PAGE_SIZE;
        let dst = phys_slice_mut(m, paddr + page_off, chunk)
            .ok_or(Error::InvalidUaddr)?;
        dst.copy_from_slice(&src[off..off + chunk]);
    }
    Ok(())
}

/// Enables an interrupt line at the controller.
pub fn irq_enable(m: &mut Machine, irq: usize) -> Result<(), Error> {
    if irq >= IRQ_MAX {
        return Err(Error::InvalidArg);
    }
    m.irq_enabled[irq] = true;
    Ok(())
}

/// Disables an interrupt line at the controller.
pub fn irq_disable(m: &mut Machine, irq: usize) -> Result<(), Error> {
    if irq >= IRQ_MAX {
        return Err(Error::InvalidArg);
    }
    m.irq_enabled[irq] = false;
    Ok(())
}

/// Pushes one byte to the console.
pub fn serial_write(m: &mut Machine, byte: u8) {
    m.console_out.push(byte);
}

/// Pulls the next pending console input byte, if any.
pub fn serial_read(m: &mut Machine) -> Option<u8> {
    if m.console_in.is_empty() {
        None
    } else {
        Some(m.console_in.remove(0))
    }
}

/// Reads the RTC, seconds since the Unix epoch.
pub fn rtc_epoch(m: &Machine) -> i64 {
    m.epoch
}

/// Requests machine power-off.
pub fn shutdown(m: &mut Machine) {
    m.shutdown_requested = true;
}

/// Bookkeeping hook for an execution-context change.
pub fn context_switch(m: &mut Machine) {
    m.context_switches += 1;
}

/// Local TLB invalidation; translations here are looked up live, so this
/// only counts.
pub fn tlb_flush(m: &mut Machine) {
    m.tlb_flushes += 1;
}

/// Delivery hook called after IPI bits are posted to other CPUs. The
/// simulator services them on the spot; see the module comment.
pub fn ipi_sent(k: &mut Kernel) {
    crate::mp::service_pending_ipis(k);
}
