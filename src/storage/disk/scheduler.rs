use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Condvar, Mutex,
    },
    task::{Poll, Waker},
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, warn};

use crate::storage::device::{BlockDevice, SectorId};

// Deadline class for read-ahead and other background work. Ordered behind
// every finite-deadline request, FIFO among itself.
pub const BACKGROUND_DEADLINE: u64 = u64::MAX;

// How long the worker dozes when the queue is empty. An enqueue wakes it
// early through the condvar; the timeout is only the backstop.
const IDLE_POLL: Duration = Duration::from_millis(10);

// States of an I/O operation, packed into the request's atomic flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Pending = 0,
    Success = 1,
    WriteError = 2,
    ReadError = 3,
}

impl IoStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => IoStatus::Success,
            2 => IoStatus::WriteError,
            3 => IoStatus::ReadError,
            _ => IoStatus::Pending,
        }
    }

    pub fn is_done(self) -> bool {
        self != IoStatus::Pending
    }
}

// Resolves once the worker has serviced the request, reporting how the
// operation ended. Device errors reach the waiter here, never get dropped.
pub struct IoFuture {
    pub flag: Arc<AtomicU8>,
    pub waker: Arc<Mutex<Option<Waker>>>,
}

impl Future for IoFuture {
    type Output = IoStatus;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        // The waker must be parked before the flag is sampled, or a
        // completion between the two would never wake this task.
        {
            let mut waker_guard = self.waker.lock().unwrap();
            *waker_guard = Some(cx.waker().clone());
        }

        match IoStatus::from_u8(self.flag.load(Ordering::Acquire)) {
            IoStatus::Pending => Poll::Pending,
            status => Poll::Ready(status),
        }
    }
}

// Payload of a disk request. The variant is the operation; the queue carries
// the caller's buffer reference and never copies it.
pub enum DiskData {
    Write(Bytes),
    Read(Arc<Mutex<Box<[u8]>>>),
}

// A request admitted to the scheduler. Fields are set once by the caller and
// stay untouched until the worker dequeues the request for service.
pub struct DiskRequest {
    pub sector: SectorId,
    pub data: DiskData,

    // Urgency key: lower is serviced first.
    pub deadline: u64,

    // Completion side-channel, usually cloned out of an IoFuture.
    pub done_flag: Arc<AtomicU8>,
    pub waker: Arc<Mutex<Option<Waker>>>,
}

// Heap entry. Deadline first, admission order second, so equal deadlines are
// serviced in arrival order.
struct Pending {
    deadline: u64,
    seq: u64,
    request: DiskRequest,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct PendingQueue {
    heap: BinaryHeap<Reverse<Pending>>,
    next_seq: u64,
    shutdown: bool,
}

// Orders outstanding disk requests by deadline and drives a single worker
// thread that services them one at a time, earliest deadline first.
pub struct DiskScheduler {
    device: Arc<dyn BlockDevice>,
    queue: Arc<(Mutex<PendingQueue>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let queue = Arc::new((
            Mutex::new(PendingQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let mut scheduler = Self {
            device,
            queue,
            worker: None,
        };

        scheduler.start_worker();
        scheduler
    }

    fn start_worker(&mut self) {
        let queue = Arc::clone(&self.queue);
        let device = Arc::clone(&self.device);

        self.worker = Some(std::thread::spawn(move || {
            let (lock, on_enqueue) = &*queue;
            let mut state = lock.lock().unwrap();
            loop {
                if let Some(Reverse(pending)) = state.heap.pop() {
                    // Service strictly outside the lock so enqueuers never
                    // wait behind device latency.
                    drop(state);
                    service(&device, pending.request);
                    state = lock.lock().unwrap();
                } else if state.shutdown {
                    break;
                } else {
                    state = on_enqueue.wait_timeout(state, IDLE_POLL).unwrap().0;
                }
            }
        }));
    }

    // Creates a future tracking the status of a disk request.
    pub fn create_future(&self) -> IoFuture {
        IoFuture {
            flag: Arc::new(AtomicU8::new(IoStatus::Pending as u8)),
            waker: Arc::new(Mutex::new(None)),
        }
    }

    // Admits a request, keeping the pending set ordered by (deadline,
    // arrival). Safe from any number of threads; never blocks past the
    // queue lock.
    pub fn schedule(&self, request: DiskRequest) {
        let (lock, on_enqueue) = &*self.queue;
        let mut state = lock.lock().unwrap();
        assert!(!state.shutdown, "schedule after shutdown");

        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Pending {
            deadline: request.deadline,
            seq,
            request,
        }));
        drop(state);

        on_enqueue.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.queue.0.lock().unwrap().heap.len()
    }

    // Drains whatever is still queued, then stops the worker. An admitted
    // request always runs to completion.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        {
            let mut state = self.queue.0.lock().unwrap();
            state.shutdown = true;
        }
        self.queue.1.notify_all();

        worker.join().expect("disk worker panicked");
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn service(device: &Arc<dyn BlockDevice>, request: DiskRequest) {
    let DiskRequest {
        sector,
        data,
        done_flag,
        waker,
        ..
    } = request;

    let status = match data {
        DiskData::Write(payload) => match device.write_sector(sector, &payload) {
            Ok(()) => IoStatus::Success,
            Err(err) => {
                warn!("write of sector {sector} failed: {err:#}");
                IoStatus::WriteError
            }
        },
        DiskData::Read(buffer) => {
            let result = {
                let mut target = buffer.lock().unwrap();
                device.read_sector(sector, &mut target)
            };
            // The target buffer must be released before completion is
            // announced; read-ahead promotion relies on being its sole
            // holder afterwards.
            drop(buffer);
            match result {
                Ok(()) => IoStatus::Success,
                Err(err) => {
                    warn!("read of sector {sector} failed: {err:#}");
                    IoStatus::ReadError
                }
            }
        }
    };
    debug!("serviced sector {sector}: {status:?}");

    done_flag.store(status as u8, Ordering::Release);
    let taken_waker = waker.lock().unwrap().take();
    if let Some(waker) = taken_waker {
        waker.wake();
    }
}
