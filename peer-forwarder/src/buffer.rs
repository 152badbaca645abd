use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use crate::codec::Destination;
use crate::event::Record;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("timed out after {0:?} waiting for buffer space")]
    Timeout(Duration),
    #[error("cannot write {requested} records to a buffer of capacity {capacity}")]
    SizeOverflow { requested: usize, capacity: usize },
}

/// Returned with every read; hand it back to [`Buffer::checkpoint`] once the records are
/// processed to release the space they held.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct CheckpointState {
    num_records: usize,
}

impl CheckpointState {
    pub fn num_records(&self) -> usize {
        self.num_records
    }
}

#[derive(Debug)]
pub struct ReadBatch {
    pub records: Vec<Record>,
    pub checkpoint: CheckpointState,
}

/// The bounded-buffer contract the pipeline engine reads and writes through.
#[async_trait]
pub trait Buffer: Send + Sync {
    async fn write(&self, record: Record, timeout: Duration) -> Result<(), BufferError>;
    async fn write_all(&self, records: Vec<Record>, timeout: Duration)
        -> Result<(), BufferError>;
    async fn read(&self, max_size: usize, max_wait: Duration) -> ReadBatch;
    fn checkpoint(&self, state: CheckpointState);
    fn is_empty(&self) -> bool;
}

/// Bounded queue that receives both the records this node keeps and the records its peers
/// forward to it.
///
/// A slot is taken on write and only given back on checkpoint, so queued plus in-flight
/// records never exceed the capacity. Writers wait on a fair semaphore: a large batch
/// waiting for space is not overtaken by later single writes.
pub struct ReceiveBuffer {
    capacity: usize,
    queue: Mutex<VecDeque<Record>>,
    space: Semaphore,
    readable: Notify,
    in_flight: AtomicUsize,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Semaphore::new(capacity),
            readable: Notify::new(),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records waiting to be read.
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn drain(&self, max_size: usize) -> ReadBatch {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let count = max_size.min(queue.len());
        let records: Vec<Record> = queue.drain(..count).collect();
        self.in_flight.fetch_add(count, Ordering::AcqRel);

        ReadBatch {
            records,
            checkpoint: CheckpointState { num_records: count },
        }
    }
}

#[async_trait]
impl Buffer for ReceiveBuffer {
    async fn write(&self, record: Record, timeout: Duration) -> Result<(), BufferError> {
        self.write_all(vec![record], timeout).await
    }

    /// Admits every record or none of them.
    async fn write_all(
        &self,
        records: Vec<Record>,
        timeout: Duration,
    ) -> Result<(), BufferError> {
        if records.is_empty() {
            return Ok(());
        }

        let overflow = BufferError::SizeOverflow {
            requested: records.len(),
            capacity: self.capacity,
        };
        if records.len() > self.capacity {
            return Err(overflow);
        }
        let slots = u32::try_from(records.len()).map_err(|_| overflow)?;

        let permit = tokio::time::timeout(timeout, self.space.acquire_many(slots))
            .await
            .map_err(|_| BufferError::Timeout(timeout))?
            // The semaphore is never closed.
            .map_err(|_| BufferError::Timeout(timeout))?;
        permit.forget();

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(records);
        self.readable.notify_one();

        Ok(())
    }

    /// Returns up to `max_size` records, waiting at most `max_wait` for the first one.
    async fn read(&self, max_size: usize, max_wait: Duration) -> ReadBatch {
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.readable.notified();
            let batch = self.drain(max_size);
            if !batch.records.is_empty() || max_size == 0 {
                return batch;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.drain(max_size);
            }
        }
    }

    fn checkpoint(&self, state: CheckpointState) {
        if state.num_records == 0 {
            return;
        }
        self.in_flight.fetch_sub(state.num_records, Ordering::AcqRel);
        self.space.add_permits(state.num_records);
    }

    fn is_empty(&self) -> bool {
        self.len() == 0 && self.in_flight() == 0
    }
}

/// One receive buffer per (pipeline, plugin) destination hosted on this node.
pub struct ReceiveBufferRegistry {
    capacity: usize,
    buffers: DashMap<Destination, Arc<ReceiveBuffer>>,
}

impl ReceiveBufferRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, destination: &Destination) -> Arc<ReceiveBuffer> {
        self.buffers
            .entry(destination.clone())
            .or_insert_with(|| Arc::new(ReceiveBuffer::new(self.capacity)))
            .clone()
    }

    /// Creates the buffer of `destination`, or returns `None` if it already exists.
    pub fn create(&self, destination: &Destination) -> Option<Arc<ReceiveBuffer>> {
        match self.buffers.entry(destination.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let buffer = Arc::new(ReceiveBuffer::new(self.capacity));
                entry.insert(buffer.clone());
                Some(buffer)
            }
        }
    }

    pub fn get(&self, destination: &Destination) -> Option<Arc<ReceiveBuffer>> {
        self.buffers
            .get(destination)
            .map(|buffer| buffer.value().clone())
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.buffers.iter().map(|entry| entry.key().clone()).collect()
    }
}
