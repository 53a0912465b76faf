pub const EMM_CACHE_SIZE: usize = 32;

/// Ring of checksums of recently forwarded EMMs. Once full, every insert
/// overwrites the oldest entry.
#[derive(Debug, Clone)]
pub struct EmmCache {
    entries: [u32; EMM_CACHE_SIZE],
    write: usize,
    count: usize,
}

impl Default for EmmCache {
    fn default() -> Self {
        Self {
            entries: [0; EMM_CACHE_SIZE],
            write: 0,
            count: 0,
        }
    }
}

impl EmmCache {
    pub fn contains(&self, crc: u32) -> bool {
        self.entries[..self.count].contains(&crc)
    }

    pub fn insert(&mut self, crc: u32) {
        self.entries[self.write] = crc;
        self.write = (self.write + 1) % EMM_CACHE_SIZE;
        self.count = (self.count + 1).min(EMM_CACHE_SIZE);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let mut cache = EmmCache::default();
        assert!(!cache.contains(0));
        for crc in 1..=EMM_CACHE_SIZE as u32 {
            cache.insert(crc);
        }
        assert_eq!(cache.len(), EMM_CACHE_SIZE);
        assert!(cache.contains(1));

        cache.insert(100);
        assert_eq!(cache.len(), EMM_CACHE_SIZE);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(100));
    }
}
