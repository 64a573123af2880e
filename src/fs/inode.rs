use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use log::warn;

use crate::buffer::block_cache::BlockCache;
use crate::storage::device::{sector_constants::SECTOR_SIZE, SectorId};

// An inode over a contiguous on-disk extent. The logical length is fixed at
// creation; writes never grow the extent. References are duplicated by
// cloning the Arc and released by dropping it.
pub struct Inode {
    // First sector of the extent.
    start: SectorId,
    // Logical length in bytes.
    length: u64,
    // Writes return 0 bytes while this count is raised. Shared by every
    // handle open on this inode.
    deny_write_cnt: AtomicU32,
    cache: Arc<BlockCache>,
}

impl Inode {
    pub fn new(start: SectorId, length: u64, cache: Arc<BlockCache>) -> Arc<Self> {
        Arc::new(Inode {
            start,
            length,
            deny_write_cnt: AtomicU32::new(0),
            cache,
        })
    }

    // Sector holding byte OFS, or None past the end of the file.
    pub fn byte_to_sector(&self, ofs: u64) -> Option<SectorId> {
        (ofs < self.length).then(|| self.start + (ofs / SECTOR_SIZE as u64) as u32)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    // Writes BUF at byte offset OFS, returning the bytes actually written.
    // Short when the extent ends before the requested range, zero while
    // writes are denied.
    pub fn write_at(&self, buf: &[u8], mut ofs: u64) -> usize {
        if self.deny_write_cnt.load(Ordering::Acquire) > 0 {
            return 0;
        }

        let mut written = 0;
        while written < buf.len() {
            // Sector to write, starting byte offset within that sector.
            let Some(sector) = self.byte_to_sector(ofs) else {
                break;
            };
            let sector_ofs = (ofs % SECTOR_SIZE as u64) as usize;

            // Bytes left in the file vs bytes left in the sector.
            let inode_left = (self.length - ofs) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let min_left = inode_left.min(sector_left);

            let chunk = (buf.len() - written).min(min_left);
            if chunk == 0 {
                break;
            }

            let src = &buf[written..written + chunk];
            if let Err(err) = self.cache.write_sector(sector, sector_ofs, src) {
                warn!("write at sector {sector} failed, stopping short: {err:#}");
                break;
            }

            ofs += chunk as u64;
            written += chunk;
        }
        written
    }

    // Raises the shared write-deny hold. Every raise must be paired with
    // exactly one allow_write.
    pub fn deny_write(&self) {
        self.deny_write_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn allow_write(&self) {
        let prev = self.deny_write_cnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "allow_write without a matching deny_write");
    }

    pub fn deny_write_cnt(&self) -> u32 {
        self.deny_write_cnt.load(Ordering::Acquire)
    }
}
