//! Zoned buddy page allocator.
//!
//! Physical memory is split into three zones (DMA, Normal, High). Each zone
//! keeps one descriptor per page frame and `MAX_ORDER + 1` singly linked free
//! lists threaded through those descriptors. A free block of order `k` is
//! aligned to `2^k` pages by absolute frame number, so its buddy is always
//! `pfn ^ (1 << k)`.
//!
//! Ownership: a block belongs to the allocator while it sits on a free list
//! and to the caller between `alloc` and `free`.

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use super::{pfn_to_frame, pfn_to_phys, phys_to_pfn, Pfn};
use crate::config::{KernelConfig, MAX_ORDER, PAGE_SIZE};
use crate::error::{KResult, KernelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    Dma,
    Normal,
    High,
}

impl ZoneKind {
    pub const ALL: [ZoneKind; 3] = [ZoneKind::Dma, ZoneKind::Normal, ZoneKind::High];

    fn index(self) -> usize {
        match self {
            ZoneKind::Dma => 0,
            ZoneKind::Normal => 1,
            ZoneKind::High => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ZoneKind::Dma => "DMA",
            ZoneKind::Normal => "Normal",
            ZoneKind::High => "High",
        }
    }

    /// Zones tried, in order, when `self` is the preferred zone.
    fn fallbacks(self) -> &'static [ZoneKind] {
        match self {
            ZoneKind::High => &[ZoneKind::High, ZoneKind::Normal, ZoneKind::Dma],
            ZoneKind::Normal => &[ZoneKind::Normal, ZoneKind::Dma],
            ZoneKind::Dma => &[ZoneKind::Dma],
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FrameFlags: u8 {
        /// First frame of a block (free or allocated).
        const HEAD     = 1 << 0;
        /// Block is on a free list.
        const FREE     = 1 << 1;
        /// Never handed out.
        const RESERVED = 1 << 2;
    }
}

const NIL: u32 = u32::MAX;

/// Per-frame descriptor. `next` is a zone-relative index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameDesc {
    flags: FrameFlags,
    order: u8,
    next: u32,
}

impl FrameDesc {
    const INTERIOR: FrameDesc = FrameDesc { flags: FrameFlags::empty(), order: 0, next: NIL };
    const RESERVED: FrameDesc = FrameDesc { flags: FrameFlags::RESERVED, order: 0, next: NIL };
}

/// A run of `2^order` contiguous frames handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBlock {
    pub zone: ZoneKind,
    pub pfn: Pfn,
    pub order: u8,
}

impl PageBlock {
    pub fn pages(&self) -> u64 {
        1 << self.order
    }

    pub fn size_bytes(&self) -> u64 {
        self.pages() * PAGE_SIZE
    }

    pub fn start_address(&self) -> PhysAddr {
        PhysAddr::new(pfn_to_phys(self.pfn))
    }

    /// First frame of the block.
    pub fn frame(&self) -> PhysFrame {
        pfn_to_frame(self.pfn)
    }

    /// The `index`-th frame of the block.
    pub fn frame_at(&self, index: u64) -> PhysFrame {
        debug_assert!(index < self.pages());
        pfn_to_frame(self.pfn + index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStats {
    pub kind: ZoneKind,
    pub total_pages: u64,
    pub free_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    kind: ZoneKind,
    start_pfn: Pfn,
    end_pfn: Pfn,
    frames: Vec<FrameDesc>,
    free_heads: [u32; MAX_ORDER + 1],
    free_pages: u64,
    managed_pages: u64,
}

impl Zone {
    /// Zone over `[start_pfn, end_pfn)`; frames below `usable_from` stay reserved.
    fn new(kind: ZoneKind, start_pfn: Pfn, end_pfn: Pfn, usable_from: Pfn) -> Zone {
        let len = end_pfn.saturating_sub(start_pfn) as usize;
        let mut zone = Zone {
            kind,
            start_pfn,
            end_pfn: start_pfn + len as u64,
            frames: vec![FrameDesc::RESERVED; len],
            free_heads: [NIL; MAX_ORDER + 1],
            free_pages: 0,
            managed_pages: 0,
        };
        let first = usable_from.max(start_pfn);
        if first < zone.end_pfn {
            zone.seed(first, zone.end_pfn);
        }
        zone
    }

    /// Carve `[first, end)` into maximal aligned blocks.
    fn seed(&mut self, first: Pfn, end: Pfn) {
        for pfn in first..end {
            *self.desc_mut(pfn) = FrameDesc::INTERIOR;
        }
        let mut pfn = first;
        while pfn < end {
            let mut order = MAX_ORDER;
            while order > 0 && (pfn & ((1 << order) - 1) != 0 || pfn + (1 << order) > end) {
                order -= 1;
            }
            self.mark_free(pfn, order);
            self.push_free(pfn, order);
            pfn += 1 << order;
        }
        self.managed_pages = end - first;
        self.free_pages = self.managed_pages;
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn
    }

    fn block_fits(&self, pfn: Pfn, order: usize) -> bool {
        pfn >= self.start_pfn && pfn + (1 << order) <= self.end_pfn
    }

    fn idx(&self, pfn: Pfn) -> u32 {
        (pfn - self.start_pfn) as u32
    }

    fn pfn_of(&self, idx: u32) -> Pfn {
        self.start_pfn + idx as u64
    }

    fn desc(&self, pfn: Pfn) -> &FrameDesc {
        &self.frames[(pfn - self.start_pfn) as usize]
    }

    fn desc_mut(&mut self, pfn: Pfn) -> &mut FrameDesc {
        &mut self.frames[(pfn - self.start_pfn) as usize]
    }

    fn mark_free(&mut self, pfn: Pfn, order: usize) {
        let d = self.desc_mut(pfn);
        d.flags = FrameFlags::HEAD | FrameFlags::FREE;
        d.order = order as u8;
    }

    fn push_free(&mut self, pfn: Pfn, order: usize) {
        let idx = self.idx(pfn);
        let head = self.free_heads[order];
        self.desc_mut(pfn).next = head;
        self.free_heads[order] = idx;
    }

    fn pop_free(&mut self, order: usize) -> Option<Pfn> {
        let idx = self.free_heads[order];
        if idx == NIL {
            return None;
        }
        let pfn = self.pfn_of(idx);
        let next = self.desc(pfn).next;
        self.free_heads[order] = next;
        self.desc_mut(pfn).next = NIL;
        Some(pfn)
    }

    /// Remove a specific block from its list. Returns false if absent.
    fn unlink_free(&mut self, pfn: Pfn, order: usize) -> bool {
        let target = self.idx(pfn);
        let mut cursor = self.free_heads[order];
        let mut prev = NIL;
        while cursor != NIL {
            let next = self.frames[cursor as usize].next;
            if cursor == target {
                if prev == NIL {
                    self.free_heads[order] = next;
                } else {
                    self.frames[prev as usize].next = next;
                }
                self.frames[cursor as usize].next = NIL;
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    pub fn alloc(&mut self, order: usize) -> Option<Pfn> {
        if order > MAX_ORDER {
            return None;
        }
        let mut current = order;
        let pfn = loop {
            if current > MAX_ORDER {
                return None;
            }
            if let Some(pfn) = self.pop_free(current) {
                break pfn;
            }
            current += 1;
        };

        // Split, returning upper halves to the lower lists.
        while current > order {
            current -= 1;
            let buddy = pfn + (1 << current);
            self.mark_free(buddy, current);
            self.push_free(buddy, current);
        }

        let d = self.desc_mut(pfn);
        d.flags = FrameFlags::HEAD;
        d.order = order as u8;
        self.free_pages -= 1 << order;
        Some(pfn)
    }

    pub fn free(&mut self, pfn: Pfn, order: usize) {
        if order > MAX_ORDER || !self.block_fits(pfn, order) || pfn & ((1 << order) - 1) != 0 {
            panic!("buddy: bad free of pfn {:#x} order {} in zone {}", pfn, order, self.kind.name());
        }
        let d = *self.desc(pfn);
        if d.flags != FrameFlags::HEAD || d.order as usize != order {
            panic!(
                "buddy: pfn {:#x} order {} is not an allocated block (double free or order mismatch)",
                pfn, order
            );
        }

        let released = 1u64 << order;
        let mut base = pfn;
        let mut order = order;
        *self.desc_mut(base) = FrameDesc::INTERIOR;

        while order < MAX_ORDER {
            let buddy = base ^ (1 << order);
            if !self.block_fits(buddy, order) {
                break;
            }
            let b = *self.desc(buddy);
            if b.flags != (FrameFlags::HEAD | FrameFlags::FREE) || b.order as usize != order {
                break;
            }
            if !self.unlink_free(buddy, order) {
                panic!("buddy: free block pfn {:#x} order {} missing from its list", buddy, order);
            }
            *self.desc_mut(buddy) = FrameDesc::INTERIOR;
            base = base.min(buddy);
            order += 1;
        }

        self.mark_free(base, order);
        self.push_free(base, order);
        self.free_pages += released;
    }

    /// Heads of the free list of `order`, front to back.
    pub fn free_list(&self, order: usize) -> Vec<Pfn> {
        let mut out = Vec::new();
        let mut cursor = self.free_heads[order];
        while cursor != NIL {
            out.push(self.pfn_of(cursor));
            cursor = self.frames[cursor as usize].next;
        }
        out
    }

    pub fn stats(&self) -> ZoneStats {
        ZoneStats { kind: self.kind, total_pages: self.managed_pages, free_pages: self.free_pages }
    }
}

pub struct BuddyAllocator {
    zones: [Zone; 3],
}

impl BuddyAllocator {
    /// Build all zones from the machine layout. Memory under
    /// `config.reserved_low` is never handed out.
    pub fn new(config: &KernelConfig) -> Self {
        let total = phys_to_pfn(config.total_memory);
        let dma_end = phys_to_pfn(config.dma_end).min(total);
        let normal_end = phys_to_pfn(config.normal_end).min(total);
        let usable = phys_to_pfn(config.reserved_low);

        let allocator = BuddyAllocator {
            zones: [
                Zone::new(ZoneKind::Dma, 0, dma_end, usable),
                Zone::new(ZoneKind::Normal, dma_end, normal_end, usable),
                Zone::new(ZoneKind::High, normal_end, total, usable),
            ],
        };
        for zone in allocator.zones.iter() {
            let s = zone.stats();
            crate::log_info!(
                "buddy: zone {} pfn {:#x}..{:#x}, {} free pages",
                zone.kind.name(),
                zone.start_pfn,
                zone.end_pfn,
                s.free_pages
            );
        }
        allocator
    }

    pub fn zone(&self, kind: ZoneKind) -> &Zone {
        &self.zones[kind.index()]
    }

    pub fn zone_of(&self, pfn: Pfn) -> Option<ZoneKind> {
        self.zones.iter().find(|z| z.contains(pfn)).map(|z| z.kind)
    }

    /// Take a block of `2^order` pages from exactly `zone`.
    pub fn alloc(&mut self, zone: ZoneKind, order: usize) -> Option<PageBlock> {
        self.zones[zone.index()]
            .alloc(order)
            .map(|pfn| PageBlock { zone, pfn, order: order as u8 })
    }

    /// Take a block from `preferred`, falling back to lower zones.
    pub fn alloc_fallback(&mut self, preferred: ZoneKind, order: usize) -> KResult<PageBlock> {
        preferred
            .fallbacks()
            .iter()
            .find_map(|&zone| self.alloc(zone, order))
            .ok_or(KernelError::OutOfMemory)
    }

    /// Allocation on a path that cannot continue without it.
    pub fn alloc_mandatory(&mut self, preferred: ZoneKind, order: usize) -> PageBlock {
        match self.alloc_fallback(preferred, order) {
            Ok(block) => block,
            Err(_) => panic!("buddy: out of memory for mandatory order-{} allocation", order),
        }
    }

    pub fn free(&mut self, block: PageBlock) {
        self.zones[block.zone.index()].free(block.pfn, block.order as usize);
    }

    pub fn stats(&self) -> [ZoneStats; 3] {
        [self.zones[0].stats(), self.zones[1].stats(), self.zones[2].stats()]
    }

    pub fn total_pages(&self) -> u64 {
        self.zones.iter().map(|z| z.managed_pages).sum()
    }

    pub fn free_pages(&self) -> u64 {
        self.zones.iter().map(|z| z.free_pages).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small() -> BuddyAllocator {
        BuddyAllocator::new(&KernelConfig::small())
    }

    #[test]
    fn zones_follow_layout() {
        let buddy = small();
        // DMA: 1 MiB minus the 256 KiB reserved.
        assert_eq!(buddy.zone(ZoneKind::Dma).stats().total_pages, 192);
        assert_eq!(buddy.zone(ZoneKind::Normal).stats().total_pages, 1792);
        assert_eq!(buddy.zone(ZoneKind::High).stats().total_pages, 2048);
        assert_eq!(buddy.zone_of(0x100), Some(ZoneKind::Normal));
        assert_eq!(buddy.zone_of(0x10), Some(ZoneKind::Dma));
        assert_eq!(buddy.zone_of(0x1_0000), None);
    }

    #[test]
    fn seeded_blocks_are_aligned() {
        let buddy = small();
        for kind in ZoneKind::ALL {
            let zone = buddy.zone(kind);
            for order in 0..=MAX_ORDER {
                for pfn in zone.free_list(order) {
                    assert_eq!(pfn & ((1 << order) - 1), 0, "pfn {:#x} order {}", pfn, order);
                }
            }
        }
    }

    #[test]
    fn single_page_round_trip_restores_zone_exactly() {
        let mut buddy = small();
        let before = buddy.zone(ZoneKind::Normal).clone();

        let block = buddy.alloc(ZoneKind::Normal, 0).unwrap();
        assert_ne!(*buddy.zone(ZoneKind::Normal), before);
        buddy.free(block);

        assert_eq!(*buddy.zone(ZoneKind::Normal), before);
    }

    #[test]
    fn buddies_coalesce_into_higher_order() {
        let mut buddy = small();
        let a = buddy.alloc(ZoneKind::Normal, 0).unwrap();
        let b = buddy.alloc(ZoneKind::Normal, 0).unwrap();
        assert_eq!(a.pfn ^ 1, b.pfn);
        // Pin the order-1 neighbour so the merge stops at order 1.
        let pin = buddy.alloc(ZoneKind::Normal, 1).unwrap();
        assert_eq!(pin.pfn, a.pfn.min(b.pfn) + 2);

        buddy.free(a);
        buddy.free(b);

        let zone = buddy.zone(ZoneKind::Normal);
        let merged = a.pfn.min(b.pfn);
        assert_eq!(zone.free_list(1).iter().filter(|&&p| p == merged).count(), 1);
        assert!(!zone.free_list(0).contains(&a.pfn));
        assert!(!zone.free_list(0).contains(&b.pfn));
    }

    #[test]
    fn fallback_moves_to_lower_zone() {
        let mut cfg = KernelConfig::small();
        cfg.total_memory = cfg.normal_end;
        let mut buddy = BuddyAllocator::new(&cfg);
        assert_eq!(buddy.zone(ZoneKind::High).stats().total_pages, 0);
        let block = buddy.alloc_fallback(ZoneKind::High, 0).unwrap();
        assert_eq!(block.zone, ZoneKind::Normal);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut buddy = small();
        while buddy.alloc(ZoneKind::Dma, 0).is_some() {}
        assert_eq!(buddy.zone(ZoneKind::Dma).stats().free_pages, 0);
        assert_eq!(buddy.alloc_fallback(ZoneKind::Dma, 0), Err(KernelError::OutOfMemory));
        assert!(buddy.alloc(ZoneKind::Normal, MAX_ORDER + 1).is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut buddy = small();
        let block = buddy.alloc(ZoneKind::Normal, 2).unwrap();
        buddy.free(block);
        buddy.free(block);
    }

    #[test]
    #[should_panic(expected = "order mismatch")]
    fn freeing_with_wrong_order_is_fatal() {
        let mut buddy = small();
        let block = buddy.alloc(ZoneKind::Normal, 2).unwrap();
        buddy.free(PageBlock { order: 1, ..block });
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn mandatory_allocation_panics_when_exhausted() {
        let mut buddy = small();
        buddy.alloc_mandatory(ZoneKind::Dma, MAX_ORDER);
    }

    proptest! {
        #[test]
        fn alloc_free_sequences_conserve_pages(ops in proptest::collection::vec((0usize..4, any::<bool>()), 1..64)) {
            let mut buddy = small();
            let pristine = buddy.zone(ZoneKind::Normal).clone();
            let total_free = buddy.zone(ZoneKind::Normal).stats().free_pages;
            let mut held: Vec<PageBlock> = Vec::new();

            for (order, release) in ops {
                if release && !held.is_empty() {
                    let block = held.swap_remove(0);
                    buddy.free(block);
                } else if let Some(block) = buddy.alloc(ZoneKind::Normal, order) {
                    for other in &held {
                        let disjoint = block.pfn + block.pages() <= other.pfn
                            || other.pfn + other.pages() <= block.pfn;
                        prop_assert!(disjoint);
                    }
                    held.push(block);
                }
                let in_use: u64 = held.iter().map(|b| b.pages()).sum();
                prop_assert_eq!(buddy.zone(ZoneKind::Normal).stats().free_pages + in_use, total_free);
            }

            for block in held.drain(..) {
                buddy.free(block);
            }
            prop_assert_eq!(buddy.zone(ZoneKind::Normal).clone(), pristine);
        }
    }
}
