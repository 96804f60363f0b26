/*!
Shared plumbing for the set-associative caches.

Geometry
- `set_lsb` sets the cache-line size; bank and set numbers are sliced out of
  the address like:
  [ MSB <-----------------> LSB ]
  [ ... SETS  BANKS  CACHE_LINE ]
- `num_sets` counts the sets of all banks together.

LRU
- Each set keeps its ways in recency order: index 0 is the LRU way, the last
  index is the MRU way. Promotion removes the way and re-pushes it at the
  back, which preserves the relative order of everything else.
*/

pub mod l1;
pub mod l2;

pub use l1::CacheL1;
pub use l2::CacheL2;

/// Address slicing shared by L1 and L2.
#[derive(Clone, Copy, Debug)]
pub struct CacheGeometry {
    pub set_lsb: u32,
    pub num_banks: u32,
    pub num_sets: u32,
    pub num_ways: u32,
}

impl CacheGeometry {
    pub fn set_of(&self, address: u64) -> usize {
        ((address >> self.set_lsb) % self.num_sets as u64) as usize
    }

    pub fn tag_of(&self, address: u64) -> u64 {
        (address >> self.set_lsb) / self.num_sets as u64
    }

    pub fn bank_of(&self, address: u64) -> usize {
        ((address >> self.set_lsb) % self.num_banks as u64) as usize
    }

    /// Reconstruct the line-aligned address stored under (set, tag).
    pub fn line_addr(&self, set: usize, tag: u64) -> u64 {
        (tag * self.num_sets as u64 + set as u64) << self.set_lsb
    }
}

/// Access counters common to both cache levels.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub num_rd_access: u64,
    pub num_rd_miss: u64,
    pub num_wr_access: u64,
    pub num_wr_miss: u64,
    pub num_ev_coherency: u64,
    pub num_ev_capacity: u64,
    /// Received coherency accesses.
    pub num_coherency_access: u64,
    /// S/E -> M upgrade requests.
    pub num_upgrade_req: u64,
    pub num_bypass: u64,
    pub num_nack: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_round_trips_line_addresses() {
        let g = CacheGeometry {
            set_lsb: 6,
            num_banks: 1,
            num_sets: 64,
            num_ways: 4,
        };
        let addr = 0x26C8u64;
        let set = g.set_of(addr);
        let tag = g.tag_of(addr);
        assert_eq!(g.line_addr(set, tag), (addr >> 6) << 6);
    }
}
