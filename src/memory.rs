// Named-region block allocator.
//
// Each region is a contiguous buffer carved into blocks. A block is
// described by a header {offset, size-including-header, free flag,
// optional tag}; blocks are kept in address order, so the list
// itself is the prev/next chain. Allocation is first-fit with block
// splitting; free coalesces with the following block and then the
// preceding one. There is no compaction: handles stay valid until
// freed.

use std::collections::HashMap;


// Space reserved in front of every block for its bookkeeping,
// mirrored into the accounting so usage figures match the medium.
pub const HEADER_SIZE: usize = 32;

// A split only happens when the remainder can hold a header plus a
// minimally useful payload.
const MIN_SPLIT: usize = HEADER_SIZE + 8;


#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Static,
    Dynamic,
    Tool,
    Resource,
    System,
}


#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RegionStats {
    pub total: usize,
    pub used: usize,
    pub peak: usize,
    pub alloc_count: u32,
    pub free_count: u32,
    pub fragment_count: u32,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Handle {
    pub region: RegionKind,
    // Offset of the data area, just past the block header.
    pub offset: usize,
    pub size: usize,
}


#[derive(Clone, Debug, PartialEq)]
pub enum MemError {
    NoSuchRegion,
    OutOfMemory,
    BadHandle,
    DoubleFree,
}

pub type Result<T> = core::result::Result<T, MemError>;


#[derive(Clone, Debug)]
struct Block {
    offset: usize,
    size: usize,           // includes HEADER_SIZE
    free: bool,
    tag: Option<String>,
}


struct Region {
    kind: RegionKind,
    buffer: Vec<u8>,
    blocks: Vec<Block>,    // address order
    stats: RegionStats,
}

impl Region {
    fn new(kind: RegionKind, size: usize) -> Region {
        Region {
            kind,
            buffer: vec![0; size],
            blocks: vec![Block {
                offset: 0,
                size,
                free: true,
                tag: None,
            }],
            stats: RegionStats {
                total: size,
                ..RegionStats::default()
            },
        }
    }

    fn allocate(&mut self, size: usize, tag: Option<&str>) -> Result<Handle> {
        let total = size + HEADER_SIZE;

        let index = self.blocks
            .iter()
            .position(|b| b.free && b.size >= total)
            .ok_or(MemError::OutOfMemory)?;

        if self.blocks[index].size >= total + MIN_SPLIT {
            let remainder = Block {
                offset: self.blocks[index].offset + total,
                size: self.blocks[index].size - total,
                free: true,
                tag: None,
            };
            self.blocks[index].size = total;
            self.blocks.insert(index + 1, remainder);
            self.stats.fragment_count += 1;
        }

        let block = &mut self.blocks[index];
        block.free = false;
        block.tag = tag.map(String::from);

        self.stats.used += block.size;
        self.stats.alloc_count += 1;
        if self.stats.used > self.stats.peak {
            self.stats.peak = self.stats.used;
        }

        Ok(Handle {
            region: self.kind,
            offset: block.offset + HEADER_SIZE,
            size,
        })
    }

    fn release(&mut self, handle: Handle) -> Result<()> {
        let start = handle.offset
            .checked_sub(HEADER_SIZE)
            .ok_or(MemError::BadHandle)?;

        let index = self.blocks
            .iter()
            .position(|b| b.offset == start)
            .ok_or(MemError::BadHandle)?;

        if self.blocks[index].free {
            return Err(MemError::DoubleFree);
        }

        self.blocks[index].free = true;
        self.blocks[index].tag = None;
        self.stats.used -= self.blocks[index].size;
        self.stats.free_count += 1;

        // Merge with the following block first, then the preceding
        // one, exactly one pass each.
        if index + 1 < self.blocks.len() && self.blocks[index + 1].free {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
            self.stats.fragment_count =
                self.stats.fragment_count.saturating_sub(1);
        }

        if index > 0 && self.blocks[index - 1].free {
            let merged = self.blocks.remove(index);
            self.blocks[index - 1].size += merged.size;
            self.stats.fragment_count =
                self.stats.fragment_count.saturating_sub(1);
        }

        Ok(())
    }

    fn sweep(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                let next = self.blocks.remove(i + 1);
                self.blocks[i].size += next.size;
                self.stats.fragment_count =
                    self.stats.fragment_count.saturating_sub(1);
            } else {
                i += 1;
            }
        }
    }
}


pub struct MemoryManager {
    regions: HashMap<RegionKind, Region>,
}

impl MemoryManager {
    pub fn new(layout: &[(RegionKind, usize)]) -> MemoryManager {
        let mut regions = HashMap::new();
        for &(kind, size) in layout {
            regions.insert(kind, Region::new(kind, size));
        }
        MemoryManager { regions }
    }

    pub fn allocate(
        &mut self,
        kind: RegionKind,
        size: usize,
        tag: Option<&str>
    ) -> Result<Handle> {
        self.regions
            .get_mut(&kind)
            .ok_or(MemError::NoSuchRegion)?
            .allocate(size, tag)
    }

    pub fn free(&mut self, handle: Handle) -> Result<()> {
        self.regions
            .get_mut(&handle.region)
            .ok_or(MemError::NoSuchRegion)?
            .release(handle)
    }

    pub fn data(&self, handle: Handle) -> Result<&[u8]> {
        let region = self.regions
            .get(&handle.region)
            .ok_or(MemError::NoSuchRegion)?;
        region.buffer
            .get(handle.offset..handle.offset + handle.size)
            .ok_or(MemError::BadHandle)
    }

    pub fn data_mut(&mut self, handle: Handle) -> Result<&mut [u8]> {
        let region = self.regions
            .get_mut(&handle.region)
            .ok_or(MemError::NoSuchRegion)?;
        region.buffer
            .get_mut(handle.offset..handle.offset + handle.size)
            .ok_or(MemError::BadHandle)
    }

    pub fn stats(&self, kind: RegionKind) -> Option<RegionStats> {
        self.regions.get(&kind).map(|r| r.stats)
    }

    // Opportunistic merge of adjacent free blocks. Deliberately no
    // compaction: live handles are never moved.
    pub fn optimize(&mut self, kind: Option<RegionKind>) {
        for region in self.regions.values_mut() {
            if kind.map_or(true, |k| k == region.kind) {
                region.sweep();
            }
        }
    }

    pub fn total_free(&self) -> usize {
        self.regions
            .values()
            .map(|r| r.stats.total - r.stats.used)
            .sum()
    }

    pub fn total_size(&self) -> usize {
        self.regions.values().map(|r| r.stats.total).sum()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::RegionKind::*;

    fn manager() -> MemoryManager {
        MemoryManager::new(&[(Dynamic, 4096), (Tool, 1024)])
    }

    #[test]
    fn test_alloc_and_stats() {
        let mut mm = manager();
        let h = mm.allocate(Dynamic, 100, Some("scratch")).unwrap();
        assert_eq!(h.size, 100);

        let stats = mm.stats(Dynamic).unwrap();
        assert_eq!(stats.used, 100 + HEADER_SIZE);
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.peak, stats.used);
    }

    #[test]
    fn test_free_restores_usage() {
        let mut mm = manager();
        let h = mm.allocate(Dynamic, 100, None).unwrap();
        mm.free(h).unwrap();

        let stats = mm.stats(Dynamic).unwrap();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free_count, 1);
        // Fully coalesced back to one spanning block.
        assert_eq!(stats.fragment_count, 0);
    }

    #[test]
    fn test_first_fit_reuses_hole() {
        let mut mm = manager();
        let a = mm.allocate(Dynamic, 100, None).unwrap();
        let _b = mm.allocate(Dynamic, 100, None).unwrap();
        mm.free(a).unwrap();

        // The freed hole is in front; first-fit must hand it back.
        let c = mm.allocate(Dynamic, 100, None).unwrap();
        assert_eq!(c.offset, HEADER_SIZE);
    }

    #[test]
    fn test_coalesce_with_neighbors() {
        let mut mm = manager();
        let a = mm.allocate(Dynamic, 64, None).unwrap();
        let b = mm.allocate(Dynamic, 64, None).unwrap();
        let c = mm.allocate(Dynamic, 64, None).unwrap();

        mm.free(a).unwrap();
        mm.free(c).unwrap();
        mm.free(b).unwrap();

        // All three holes and the tail must have merged: a fresh
        // allocation spanning nearly the region succeeds.
        let big = mm.allocate(Dynamic, 4096 - HEADER_SIZE, None);
        assert!(big.is_ok());
    }

    #[test]
    fn test_exhaustion() {
        let mut mm = manager();
        assert_eq!(
            mm.allocate(Tool, 4096, None),
            Err(MemError::OutOfMemory)
        );
    }

    #[test]
    fn test_double_free() {
        let mut mm = manager();
        let h = mm.allocate(Tool, 16, None).unwrap();
        mm.free(h).unwrap();
        assert_eq!(mm.free(h), Err(MemError::DoubleFree));
    }

    #[test]
    fn test_data_access() {
        let mut mm = manager();
        let h = mm.allocate(Tool, 4, None).unwrap();
        mm.data_mut(h).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(mm.data(h).unwrap(), &[1, 2, 3, 4]);
    }
}
