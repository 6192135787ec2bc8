// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical page allocator.
//!
//! RAM and device memory are described by zones: contiguous physical
//! ranges with one record per page. A page record carries a refcount and a
//! weak owner reference; `ref_count == 0` means free, and an allocated RAM
//! page is additionally linked into its owning task's page chain so task
//! destruction can reclaim everything it held. The refcount (rather than a
//! plain bitmap) is what lets `vm_map` share one frame between a task and
//! its pager.
//!
//! The page chain is threaded through the page records themselves as
//! physical-address links, so it never forms a reference cycle with the
//! task table: the owner field is a TID, and chain surgery happens only
//! here, given the owning task's list head.

use alloc::vec::Vec;

use arrayvec::ArrayVec;

use abi::{
    AllocFlags, BootInfo, PAddr, Tid, MEMORY_MAP_ENTRIES_MAX, PAGE_SIZE,
};

use crate::arch;
use crate::task::Task;

const ZONES_MAX: usize = 2 * MEMORY_MAP_ENTRIES_MAX;

pub const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ZoneKind {
    /// General-purpose RAM, available to the allocator.
    Ram,
    /// Device registers; never allocated, mapped exclusively.
    Mmio,
}

/// One physical page.
#[derive(Debug)]
pub struct Page {
    pub ref_count: u32,
    /// Owning task, if any. `None` for kernel-owned and free pages.
    pub owner: Option<Tid>,
    /// Next page in the owner's chain.
    next: Option<PAddr>,
}

struct Zone {
    kind: ZoneKind,
    base: PAddr,
    pages: Vec<Page>,
}

impl Zone {
    fn contains(&self, paddr: PAddr) -> bool {
        paddr >= self.base
            && paddr < self.base + self.pages.len() * PAGE_SIZE
    }
}

/// Head and tail of a task's page chain. The links live in the page
/// records; all surgery goes through [`PhysMemory`].
#[derive(Copy, Clone, Debug, Default)]
pub struct PageList {
    head: Option<PAddr>,
    tail: Option<PAddr>,
}

impl PageList {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// All physical memory known to the kernel.
pub struct PhysMemory {
    zones: ArrayVec<Zone, ZONES_MAX>,
}

impl PhysMemory {
    /// Builds the zone list from the boot memory map. RAM and MMIO sizes
    /// must be page multiples; the loader guarantees this and we verify.
    pub fn new(bootinfo: &BootInfo) -> PhysMemory {
        let mut pm = PhysMemory {
            zones: ArrayVec::new(),
        };
        for e in bootinfo.memory_map.frees() {
            assert_eq!(e.size % PAGE_SIZE, 0);
            assert_eq!(e.paddr % PAGE_SIZE, 0);
            pm.add_zone(ZoneKind::Ram, e.paddr, e.size / PAGE_SIZE);
        }
        for e in bootinfo.memory_map.devices() {
            assert_eq!(e.size % PAGE_SIZE, 0);
            assert_eq!(e.paddr % PAGE_SIZE, 0);
            pm.add_zone(ZoneKind::Mmio, e.paddr, e.size / PAGE_SIZE);
        }
        pm
    }

    fn add_zone(&mut self, kind: ZoneKind, base: PAddr, num_pages: usize) {
        let mut pages = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            pages.push(Page {
                ref_count: 0,
                owner: None,
                next: None,
            });
        }
        self.zones.push(Zone { kind, base, pages });
    }

    /// Looks up the page record and zone kind for a physical address.
    pub fn page(&self, paddr: PAddr) -> Option<(&Page, ZoneKind)> {
        debug_assert_eq!(paddr % PAGE_SIZE, 0);
        self.zones.iter().find(|z| z.contains(paddr)).map(|z| {
            (&z.pages[(paddr - z.base) / PAGE_SIZE], z.kind)
        })
    }

    pub fn page_mut(&mut self, paddr: PAddr) -> Option<(&mut Page, ZoneKind)> {
        debug_assert_eq!(paddr % PAGE_SIZE, 0);
        self.zones.iter_mut().find(|z| z.contains(paddr)).map(|z| {
            let kind = z.kind;
            (&mut z.pages[(paddr - z.base) / PAGE_SIZE], kind)
        })
    }

    fn is_contiguously_free(zone: &Zone, start: usize, num_pages: usize) -> bool {
        if start + num_pages > zone.pages.len() {
            return false;
        }
        zone.pages[start..start + num_pages]
            .iter()
            .all(|p| p.ref_count == 0)
    }

    /// Allocates `size` bytes of physically contiguous pages.
    ///
    /// Zones are searched in order, candidate bases in ascending order.
    /// Each returned page gets `ref_count == 1`; with an `owner`, each is
    /// also linked into the owner's chain. Returns `None` when no run
    /// fits, after logging; callers translate that to `ERR_NO_MEMORY` or
    /// a zero paddr at the syscall boundary.
    pub fn alloc(
        &mut self,
        size: usize,
        owner: Option<&mut Task>,
        flags: AllocFlags,
        machine: &mut arch::Machine,
    ) -> Option<PAddr> {
        // A zero-byte request still takes a page; every allocation is page
        // granular.
        let aligned_size = align_up(size.max(1), PAGE_SIZE);
        let num_pages = aligned_size / PAGE_SIZE;

        let mut found = None;
        'zones: for (zi, zone) in self.zones.iter().enumerate() {
            if zone.kind != ZoneKind::Ram {
                continue;
            }
            for start in 0..zone.pages.len() {
                let paddr = zone.base + start * PAGE_SIZE;
                if flags.contains(AllocFlags::ALIGNED)
                    && paddr % aligned_size != 0
                {
                    continue;
                }
                if Self::is_contiguously_free(zone, start, num_pages) {
                    found = Some((zi, start, paddr));
                    break 'zones;
                }
            }
        }

        let Some((zi, start, paddr)) = found else {
            klog!("pm: out of memory ({} bytes requested)", aligned_size);
            return None;
        };

        let owner_tid = owner.as_ref().map(|t| t.tid());
        for i in 0..num_pages {
            let page = &mut self.zones[zi].pages[start + i];
            page.ref_count = 1;
            page.owner = owner_tid;
            page.next = None;
        }
        if let Some(owner) = owner {
            for i in 0..num_pages {
                let mut list = owner.pages;
                self.chain_push(&mut list, paddr + i * PAGE_SIZE);
                owner.pages = list;
            }
        }

        if flags.contains(AllocFlags::ZEROED) {
            arch::phys_slice_mut(machine, paddr, aligned_size)
                .expect("allocated range must be backed")
                .fill(0);
        }

        Some(paddr)
    }

    /// Retroactively assigns an owner to an already-allocated, ownerless
    /// page. Used when the allocation had to happen before the owning
    /// task's record existed.
    pub fn own_page(&mut self, paddr: PAddr, owner: &mut Task) {
        let tid = owner.tid();
        {
            let (page, _) = self.page_mut(paddr).expect("paddr must be known");
            assert_eq!(page.owner, None);
            assert_eq!(page.ref_count, 1);
            assert_eq!(page.next, None);
            page.owner = Some(tid);
        }
        let mut list = owner.pages;
        self.chain_push(&mut list, paddr);
        owner.pages = list;
    }

    /// Releases one reference on each page of `[paddr, paddr + size)`.
    /// Pages reaching zero references are unlinked from their owner's
    /// chain and become allocatable again.
    pub fn free(&mut self, paddr: PAddr, size: usize, tasks: &mut [Task]) {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        for off in (0..size).step_by(PAGE_SIZE) {
            self.free_page(paddr + off, tasks);
        }
    }

    fn free_page(&mut self, paddr: PAddr, tasks: &mut [Task]) {
        let (page, _) = self.page_mut(paddr).expect("paddr must be known");
        assert!(page.ref_count > 0, "freeing a free page");
        page.ref_count -= 1;
        if page.ref_count > 0 {
            return;
        }
        if let Some(owner) = page.owner.take() {
            let oi = owner as usize - 1;
            let mut list = tasks[oi].pages;
            self.chain_remove(&mut list, paddr);
            tasks[oi].pages = list;
        }
    }

    /// Drops one reference on every page a dying task holds, emptying its
    /// chain. A page still referenced elsewhere (its pager mapped it)
    /// stays allocated but loses its owner link.
    pub fn free_task_pages(&mut self, task: &mut Task) {
        let mut cur = task.pages.head;
        while let Some(paddr) = cur {
            let (page, _) = self.page_mut(paddr).expect("chained page");
            assert!(page.ref_count > 0);
            cur = page.next.take();
            page.ref_count -= 1;
            page.owner = None;
        }
        task.pages = PageList::default();
    }

    fn chain_push(&mut self, list: &mut PageList, paddr: PAddr) {
        debug_assert!(self.page(paddr).unwrap().0.next.is_none());
        match list.tail {
            None => {
                list.head = Some(paddr);
                list.tail = Some(paddr);
            }
            Some(tail) => {
                self.page_mut(tail).unwrap().0.next = Some(paddr);
                list.tail = Some(paddr);
            }
        }
    }

    fn chain_remove(&mut self, list: &mut PageList, paddr: PAddr) {
        let next = self.page_mut(paddr).unwrap().0.next.take();
        if list.head == Some(paddr) {
            list.head = next;
            if list.tail == Some(paddr) {
                list.tail = next;
            }
            return;
        }
        let mut prev = list.head.expect("page not in chain");
        loop {
            let prev_next = self.page(prev).unwrap().0.next;
            match prev_next {
                Some(cur) if cur == paddr => {
                    self.page_mut(prev).unwrap().0.next = next;
                    if list.tail == Some(paddr) {
                        list.tail = Some(prev);
                    }
                    return;
                }
                Some(cur) => prev = cur,
                None => panic!("page not in chain"),
            }
        }
    }

    /// Links an MMIO page onto its (exclusive) mapper's chain; `vm_map`
    /// has already validated exclusivity.
    pub(crate) fn link_page(&mut self, paddr: PAddr, owner: &mut Task) {
        let mut list = owner.pages;
        self.chain_push(&mut list, paddr);
        owner.pages = list;
    }

    /// Sum of refcounts a task's chain accounts for; test support.
    #[cfg(test)]
    pub fn chain_len(&self, list: &PageList) -> usize {
        let mut n = 0;
        let mut cur = list.head;
        while let Some(paddr) = cur {
            n += 1;
            cur = self.page(paddr).unwrap().0.next;
        }
        n
    }
}
