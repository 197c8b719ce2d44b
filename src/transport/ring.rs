//! The raw SPSC ring buffer backing the shared-memory fast path.
//!
//! `write_pos`/`read_pos` are progress counters, not occupancy: they only
//! grow, and the physical byte offset in the backing segment is always
//! `pos % capacity`. This keeps the "how much has been written vs. read"
//! question (`write_pos - read_pos`) simple even across many wraps.

use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const MAGIC: u32 = 0x5242_5348; // "RBSH"
const VERSION: u32 = 1;
const PAGE_SIZE: usize = 4096;

pub const MIN_CAPACITY: usize = 4 * 1024;
pub const MAX_CAPACITY: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum RingError {
    Full,
    InsufficientData,
    Io(String),
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingError::Full => write!(f, "ring buffer full"),
            RingError::InsufficientData => write!(f, "insufficient data available"),
            RingError::Io(e) => write!(f, "ring buffer I/O error: {e}"),
        }
    }
}

#[repr(C)]
struct RingHeader {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU64,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
}

impl RingHeader {
    const SIZE: usize = std::mem::size_of::<Self>();
}

/// Rounds a requested capacity up to a page boundary and clamps it to the
/// spec's documented range (`4 KiB ..= 16 MiB`).
pub fn normalize_capacity(requested: usize) -> usize {
    let clamped = requested.clamp(MIN_CAPACITY, MAX_CAPACITY);
    clamped.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// One side of a shared-memory ring. Both the creator and the opener end up
/// with an instance of this type; only the creator writes the header.
pub struct RingBuffer {
    shmem: Shmem,
    capacity: usize,
}

// `Shmem` holds a raw pointer internally and isn't `Send`/`Sync` by default;
// both writer and reader only ever touch disjoint atomics once initialized,
// and the handshake guarantees single-producer/single-consumer per ring.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn create(os_id: &str, requested_capacity: usize) -> Result<Self, RingError> {
        let capacity = normalize_capacity(requested_capacity);
        let shmem = ShmemConf::new()
            .size(RingHeader::SIZE + capacity)
            .os_id(os_id)
            .create()
            .map_err(|e| RingError::Io(e.to_string()))?;
        let ring = Self { shmem, capacity };
        let header = ring.header();
        header.magic.store(MAGIC, Ordering::Relaxed);
        header.version.store(VERSION, Ordering::Relaxed);
        header.capacity.store(capacity as u64, Ordering::Relaxed);
        header.write_pos.store(0, Ordering::Relaxed);
        header.read_pos.store(0, Ordering::Relaxed);
        Ok(ring)
    }

    pub fn open(os_id: &str) -> Result<Self, RingError> {
        let shmem = match ShmemConf::new().os_id(os_id).open() {
            Ok(s) => s,
            Err(ShmemError::MapOpenFailed(_)) | Err(ShmemError::LinkOpenFailed(_)) => {
                return Err(RingError::Io(format!("segment {os_id} not found")))
            }
            Err(e) => return Err(RingError::Io(e.to_string())),
        };
        if shmem.len() <= RingHeader::SIZE {
            return Err(RingError::Io("segment too small for ring header".into()));
        }
        let capacity = shmem.len() - RingHeader::SIZE;
        let ring = Self { shmem, capacity };
        let header = ring.header();
        if header.magic.load(Ordering::Relaxed) != MAGIC {
            return Err(RingError::Io("bad ring magic".into()));
        }
        Ok(ring)
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.shmem.as_ptr() as *const RingHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.shmem.as_ptr().add(RingHeader::SIZE) }
    }

    fn occupancy(&self) -> u64 {
        let header = self.header();
        header.write_pos.load(Ordering::Acquire) - header.read_pos.load(Ordering::Acquire)
    }

    /// Appends `data` as a single contiguous run if there's room; otherwise
    /// `RingError::Full` and the caller falls back through the transport's
    /// state machine. Never partially writes.
    pub fn write_bytes(&self, data: &[u8]) -> Result<(), RingError> {
        let header = self.header();
        let capacity = self.capacity as u64;
        let free = capacity - self.occupancy();
        if (data.len() as u64) > free {
            return Err(RingError::Full);
        }
        let write_pos = header.write_pos.load(Ordering::Acquire);
        let ptr = self.data_ptr();
        for (i, byte) in data.iter().enumerate() {
            let offset = (write_pos + i as u64) % capacity;
            unsafe { *ptr.add(offset as usize) = *byte };
        }
        header
            .write_pos
            .store(write_pos + data.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Reads up to `max` available bytes. Errors with `InsufficientData`
    /// when nothing is available yet (not a fault, just "try later").
    pub fn read_chunk(&self, max: usize) -> Result<Vec<u8>, RingError> {
        let header = self.header();
        let available = self.occupancy();
        if available == 0 {
            return Err(RingError::InsufficientData);
        }
        let capacity = self.capacity as u64;
        let to_read = available.min(max as u64);
        let read_pos = header.read_pos.load(Ordering::Acquire);
        let ptr = self.data_ptr();
        let mut out = Vec::with_capacity(to_read as usize);
        for i in 0..to_read {
            let offset = (read_pos + i) % capacity;
            out.push(unsafe { *ptr.add(offset as usize) });
        }
        header
            .read_pos
            .store(read_pos + to_read, Ordering::Release);
        Ok(out)
    }

    /// Drains every byte currently available, regardless of chunk size.
    /// Used on fallback, where the remaining bytes must be recovered in full.
    pub fn drain_all(&self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match self.read_chunk(4096) {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(RingError::InsufficientData) => break,
                Err(_) => break,
            }
        }
        out
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_progress_counters_not_occupancy() {
        let name = format!("broker-ring-test-{}", std::process::id());
        let ring = RingBuffer::create(&name, MIN_CAPACITY).unwrap();
        let payload = vec![7u8; 1024];
        for _ in 0..10 {
            ring.write_bytes(&payload).unwrap();
            let out = ring.read_chunk(1024).unwrap();
            assert_eq!(out, payload);
        }
        // After writing and reading k bytes repeatedly, the ring behaves like fresh:
        // occupancy is zero and the next write succeeds at full capacity.
        assert_eq!(ring.occupancy(), 0);
        ring.write_bytes(&vec![1u8; MIN_CAPACITY]).unwrap();
    }

    #[test]
    fn full_ring_rejects_write() {
        let name = format!("broker-ring-test-full-{}", std::process::id());
        let ring = RingBuffer::create(&name, MIN_CAPACITY).unwrap();
        ring.write_bytes(&vec![0u8; MIN_CAPACITY]).unwrap();
        let err = ring.write_bytes(&[1]).unwrap_err();
        assert!(matches!(err, RingError::Full));
    }

    #[test]
    fn empty_ring_read_is_insufficient_data() {
        let name = format!("broker-ring-test-empty-{}", std::process::id());
        let ring = RingBuffer::create(&name, MIN_CAPACITY).unwrap();
        let err = ring.read_chunk(128).unwrap_err();
        assert!(matches!(err, RingError::InsufficientData));
    }
}
