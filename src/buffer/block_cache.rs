use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex,
};

use anyhow::Result;
use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use hashlink::LinkedHashMap;
use log::debug;

use crate::storage::{
    device::{sector_constants::SECTOR_SIZE, BlockDevice, SectorId},
    disk::scheduler::{DiskData, DiskRequest, DiskScheduler, IoFuture, IoStatus, BACKGROUND_DEADLINE},
};

// How many sector-sized staging buffers the recycle pool retains.
const SPARE_BUFFERS: usize = 8;

// A read-ahead admitted to the disk scheduler but not yet promoted into the
// cache proper.
struct PrefetchSlot {
    buffer: Arc<Mutex<Box<[u8]>>>,
    done_flag: Arc<AtomicU8>,
}

// Write-through cache of whole sectors with bounded capacity and background
// read-ahead through the disk scheduler.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    scheduler: Arc<DiskScheduler>,

    // Cached sectors in least-recently-used order, oldest at the front.
    cached: Mutex<LinkedHashMap<SectorId, Box<[u8]>>>,
    capacity: usize,

    // Outstanding read-ahead requests keyed by target sector.
    in_flight: DashMap<SectorId, PrefetchSlot>,

    // Recycled staging buffers.
    spare: ArrayQueue<Box<[u8]>>,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, scheduler: Arc<DiskScheduler>, capacity: usize) -> Self {
        assert!(capacity > 0);

        BlockCache {
            device,
            scheduler,
            cached: Mutex::new(LinkedHashMap::with_capacity(capacity)),
            capacity,
            in_flight: DashMap::new(),
            spare: ArrayQueue::new(SPARE_BUFFERS),
        }
    }

    fn take_buffer(&self) -> Box<[u8]> {
        self.spare
            .pop()
            .unwrap_or_else(|| vec![0u8; SECTOR_SIZE].into_boxed_slice())
    }

    // Copies one whole sector into DST, going to the device only when neither
    // the cache nor a completed read-ahead has it. Blocking.
    pub fn read_sector(&self, sector: SectorId, dst: &mut [u8]) -> Result<()> {
        assert_eq!(dst.len(), SECTOR_SIZE);

        let mut cached = self.cached.lock().unwrap();
        if let Some(data) = cached.remove(&sector) {
            dst.copy_from_slice(&data);
            // Re-insert at the back: most recently used.
            cached.insert(sector, data);
            return Ok(());
        }

        let data = match self.try_promote(sector) {
            Some(data) => data,
            None => {
                let mut data = self.take_buffer();
                if let Err(err) = self.device.read_sector(sector, &mut data) {
                    let _ = self.spare.push(data);
                    return Err(err);
                }
                data
            }
        };

        dst.copy_from_slice(&data);
        cached.insert(sector, data);
        self.evict_past_capacity(&mut cached);
        Ok(())
    }

    // Write-through update of one sector's bytes at SECTOR_OFS. Partial
    // updates read-modify-write; whole-sector overwrites skip the read.
    pub fn write_sector(&self, sector: SectorId, sector_ofs: usize, src: &[u8]) -> Result<()> {
        assert!(sector_ofs + src.len() <= SECTOR_SIZE);

        // A stale read-ahead must not resurface over this update.
        self.in_flight.remove(&sector);

        let mut cached = self.cached.lock().unwrap();
        let mut data = match cached.remove(&sector) {
            Some(data) => data,
            None => {
                let mut data = self.take_buffer();
                if sector_ofs != 0 || src.len() != SECTOR_SIZE {
                    if let Err(err) = self.device.read_sector(sector, &mut data) {
                        let _ = self.spare.push(data);
                        return Err(err);
                    }
                }
                data
            }
        };

        data[sector_ofs..sector_ofs + src.len()].copy_from_slice(src);
        if let Err(err) = self.device.write_sector(sector, &data) {
            let _ = self.spare.push(data);
            return Err(err);
        }

        cached.insert(sector, data);
        self.evict_past_capacity(&mut cached);
        Ok(())
    }

    // Fire-and-forget read-ahead. Never blocks the caller and never reports
    // back; a later read_sector picks the staged sector up if it completed.
    pub fn hint_prefetch(&self, sector: SectorId) {
        if sector >= self.device.num_sectors() {
            return;
        }
        if self.cached.lock().unwrap().contains_key(&sector) {
            return;
        }
        if self.in_flight.contains_key(&sector) {
            return;
        }

        let buffer = Arc::new(Mutex::new(self.take_buffer()));
        let IoFuture { flag, waker } = self.scheduler.create_future();
        let request = DiskRequest {
            sector,
            data: DiskData::Read(Arc::clone(&buffer)),
            deadline: BACKGROUND_DEADLINE,
            done_flag: Arc::clone(&flag),
            waker,
        };

        self.in_flight.insert(
            sector,
            PrefetchSlot {
                buffer,
                done_flag: flag,
            },
        );
        self.scheduler.schedule(request);
        debug!("read-ahead admitted for sector {sector}");
    }

    pub fn is_cached(&self, sector: SectorId) -> bool {
        self.cached.lock().unwrap().contains_key(&sector)
    }

    pub fn prefetch_in_flight(&self, sector: SectorId) -> bool {
        self.in_flight.contains_key(&sector)
    }

    // True once an admitted read-ahead for SECTOR has completed successfully.
    pub fn prefetch_ready(&self, sector: SectorId) -> bool {
        self.in_flight
            .get(&sector)
            .map(|slot| IoStatus::from_u8(slot.done_flag.load(Ordering::Acquire)) == IoStatus::Success)
            .unwrap_or(false)
    }

    // Claims the staged buffer of a finished read-ahead, if there is one.
    fn try_promote(&self, sector: SectorId) -> Option<Box<[u8]>> {
        let status = {
            let slot = self.in_flight.get(&sector)?;
            IoStatus::from_u8(slot.done_flag.load(Ordering::Acquire))
        };
        if !status.is_done() {
            return None;
        }

        let (_, slot) = self.in_flight.remove(&sector)?;
        if status != IoStatus::Success {
            return None;
        }

        // The worker released its claim before announcing completion, so the
        // staging buffer has a single owner again.
        let buffer = Arc::try_unwrap(slot.buffer).ok()?;
        Some(buffer.into_inner().unwrap())
    }

    fn evict_past_capacity(&self, cached: &mut LinkedHashMap<SectorId, Box<[u8]>>) {
        while cached.len() > self.capacity {
            if let Some((_, evicted)) = cached.pop_front() {
                let _ = self.spare.push(evicted);
            }
        }
    }
}
