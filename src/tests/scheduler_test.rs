#[cfg(test)]
pub mod test {
    use std::sync::{atomic::Ordering, mpsc, Arc, Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    use anyhow::Result;
    use bytes::Bytes;

    use crate::storage::device::{sector_constants::SECTOR_SIZE, BlockDevice, MemDisk, SectorId};
    use crate::storage::disk::scheduler::{
        DiskData, DiskRequest, DiskScheduler, IoFuture, IoStatus,
    };

    // Records service order and can hold the worker inside a service call,
    // so a test controls when the queue is next sampled.
    struct GateDisk {
        inner: MemDisk,
        serviced: Mutex<Vec<SectorId>>,
        gate: (Mutex<bool>, Condvar),
    }

    impl GateDisk {
        fn new(num_sectors: u32) -> Self {
            GateDisk {
                inner: MemDisk::new(num_sectors),
                serviced: Mutex::new(Vec::new()),
                gate: (Mutex::new(false), Condvar::new()),
            }
        }

        fn close_gate(&self) {
            *self.gate.0.lock().unwrap() = true;
        }

        fn open_gate(&self) {
            *self.gate.0.lock().unwrap() = false;
            self.gate.1.notify_all();
        }

        fn wait_at_gate(&self) {
            let (lock, opened) = &self.gate;
            let mut closed = lock.lock().unwrap();
            while *closed {
                closed = opened.wait(closed).unwrap();
            }
        }

        fn serviced(&self) -> Vec<SectorId> {
            self.serviced.lock().unwrap().clone()
        }
    }

    impl BlockDevice for GateDisk {
        fn read_sector(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
            self.wait_at_gate();
            self.serviced.lock().unwrap().push(sector);
            self.inner.read_sector(sector, buf)
        }

        fn write_sector(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
            self.wait_at_gate();
            self.serviced.lock().unwrap().push(sector);
            self.inner.write_sector(sector, buf)
        }

        fn num_sectors(&self) -> u32 {
            self.inner.num_sectors()
        }
    }

    fn write_request(
        scheduler: &DiskScheduler,
        sector: SectorId,
        deadline: u64,
    ) -> (IoFuture, DiskRequest) {
        let future = scheduler.create_future();
        let request = DiskRequest {
            sector,
            data: DiskData::Write(Bytes::from(vec![sector as u8; SECTOR_SIZE])),
            deadline,
            done_flag: Arc::clone(&future.flag),
            waker: Arc::clone(&future.waker),
        };
        (future, request)
    }

    // Parks the worker inside the service of a throwaway request so the
    // requests enqueued afterwards are all pending together.
    fn park_worker(disk: &GateDisk, scheduler: &DiskScheduler) -> IoFuture {
        disk.close_gate();
        let (decoy_done, decoy) = write_request(scheduler, 99, 0);
        scheduler.schedule(decoy);
        while scheduler.pending_len() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        decoy_done
    }

    #[tokio::main]
    #[test]
    async fn services_in_deadline_order() {
        let disk = Arc::new(GateDisk::new(128));
        let scheduler = DiskScheduler::new(disk.clone());

        let decoy_done = park_worker(&disk, &scheduler);

        let mut futures = Vec::new();
        for (sector, deadline) in [(3, 30), (1, 10), (2, 20)] {
            let (future, request) = write_request(&scheduler, sector, deadline);
            scheduler.schedule(request);
            futures.push(future);
        }

        disk.open_gate();
        assert_eq!(decoy_done.await, IoStatus::Success);
        for future in futures {
            assert_eq!(future.await, IoStatus::Success);
        }

        assert_eq!(disk.serviced(), vec![99, 1, 2, 3]);
    }

    #[tokio::main]
    #[test]
    async fn equal_deadlines_service_in_arrival_order() {
        let disk = Arc::new(GateDisk::new(128));
        let scheduler = DiskScheduler::new(disk.clone());

        let decoy_done = park_worker(&disk, &scheduler);

        let mut futures = Vec::new();
        for sector in [5, 6, 7] {
            let (future, request) = write_request(&scheduler, sector, 7);
            scheduler.schedule(request);
            futures.push(future);
        }

        disk.open_gate();
        assert_eq!(decoy_done.await, IoStatus::Success);
        for future in futures {
            assert_eq!(future.await, IoStatus::Success);
        }

        assert_eq!(disk.serviced(), vec![99, 5, 6, 7]);
    }

    #[tokio::main]
    #[test]
    async fn concurrent_enqueue_loses_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let disk = Arc::new(GateDisk::new((THREADS * PER_THREAD) as u32));
        let scheduler = Arc::new(DiskScheduler::new(disk.clone()));

        let (tx, rx) = mpsc::channel();
        let mut producers = Vec::new();
        for t in 0..THREADS {
            let scheduler = Arc::clone(&scheduler);
            let tx = tx.clone();
            producers.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let sector = (t * PER_THREAD + i) as SectorId;
                    let future = scheduler.create_future();
                    let request = DiskRequest {
                        sector,
                        data: DiskData::Write(Bytes::from(vec![1u8; SECTOR_SIZE])),
                        deadline: (sector % 17) as u64,
                        done_flag: Arc::clone(&future.flag),
                        waker: Arc::clone(&future.waker),
                    };
                    scheduler.schedule(request);
                    tx.send(future).unwrap();
                }
            }));
        }
        drop(tx);

        for producer in producers {
            producer.join().unwrap();
        }
        for future in rx {
            assert_eq!(future.await, IoStatus::Success);
        }

        // Every admitted request was serviced exactly once.
        let mut serviced = disk.serviced();
        serviced.sort_unstable();
        let expected: Vec<SectorId> = (0..(THREADS * PER_THREAD) as u32).collect();
        assert_eq!(serviced, expected);
    }

    #[tokio::main]
    #[test]
    async fn device_error_reaches_the_waiter() {
        let disk = Arc::new(MemDisk::new(4));
        let scheduler = DiskScheduler::new(disk);

        let future = scheduler.create_future();
        let buffer = Arc::new(Mutex::new(vec![0u8; SECTOR_SIZE].into_boxed_slice()));
        let request = DiskRequest {
            // Past the end of the disk.
            sector: 77,
            data: DiskData::Read(Arc::clone(&buffer)),
            deadline: 1,
            done_flag: Arc::clone(&future.flag),
            waker: Arc::clone(&future.waker),
        };
        scheduler.schedule(request);

        assert_eq!(future.await, IoStatus::ReadError);
    }

    #[test]
    fn shutdown_drains_the_queue() {
        let disk = Arc::new(GateDisk::new(16));
        let mut scheduler = DiskScheduler::new(disk.clone());

        disk.close_gate();
        let (_decoy_done, decoy) = write_request(&scheduler, 0, 0);
        scheduler.schedule(decoy);
        while scheduler.pending_len() > 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let mut flags = Vec::new();
        for sector in 1..5 {
            let (future, request) = write_request(&scheduler, sector, sector as u64);
            scheduler.schedule(request);
            flags.push(future.flag);
        }

        disk.open_gate();
        scheduler.shutdown();

        for flag in flags {
            assert_eq!(
                IoStatus::from_u8(flag.load(Ordering::Acquire)),
                IoStatus::Success
            );
        }
        assert_eq!(disk.serviced(), vec![0, 1, 2, 3, 4]);
    }
}
