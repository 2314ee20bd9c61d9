//! Named shared-memory inboxes and registries.
//!
//! An inbox is a ring of length-prefixed messages in a named region; one
//! process drains it, any number enqueue. A registry is a named set of live
//! addresses that peers scan to discover local components and nodes.
//!
//! Layout and protocol must match bit-exactly across processes; see the
//! offset constants below.

use crate::error::TransportError;
use jaus_wire::{Address, Stream, MAX_PACKET_SIZE};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Default inbox size for a node manager.
pub const NODE_INBOX_SIZE: usize = 4 * 1024 * 1024;
/// Default inbox size for an ordinary component.
pub const COMPONENT_INBOX_SIZE: usize = 2 * 1024 * 1024;

/// Region control block, one u32 per slot.
const OFF_MAGIC: usize = 0;
const OFF_CAPACITY: usize = 4;
const OFF_LOCK: usize = 8;
const OFF_WRITE_POS: usize = 12;
const OFF_READ_POS: usize = 16;
const OFF_READ_COUNT: usize = 20;
const CONTROL_SIZE: usize = 24;

const INBOX_MAGIC: u32 = 0x4A4D_5351;
const REGISTRY_MAGIC: u32 = 0x4A52_4547;

/// Length word that tells the reader to wrap to the start of the ring.
const SKIP_TO_START: u32 = u32::MAX;

/// Shared-memory name of an address's inbox, zero-padded dotted form.
pub fn inbox_name(id: Address) -> String {
    format!("{:03}.{:03}.{:03}.{:03}_Inbox", id.subsystem, id.node, id.component, id.instance)
}

/// Registry of components on one node.
pub fn component_registry_name(subsystem: u8, node: u8) -> String {
    format!("{subsystem:03}.{node:03}_ComponentRegistry")
}

/// Registry of node managers on one host, scoped by subsystem.
pub fn node_registry_name(subsystem: u8) -> String {
    format!("{subsystem:03}_NodeRegistry")
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// A named region plus typed access to its control block.
struct Region {
    shmem: Shmem,
}

// The region is only ever touched through atomics and locked byte copies;
// the raw pointer itself is position-independent per process.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn create(name: &str, size: usize) -> Result<Self, TransportError> {
        match ShmemConf::new().os_id(name).size(size).create() {
            Ok(shmem) => Ok(Self { shmem }),
            Err(ShmemError::MappingIdExists) => Self::open(name),
            Err(e) => Err(TransportError::ConnectionFailure(format!(
                "shared memory create {name}: {e}"
            ))),
        }
    }

    fn open(name: &str) -> Result<Self, TransportError> {
        let shmem = ShmemConf::new().os_id(name).open().map_err(|e| {
            TransportError::ConnectionFailure(format!("shared memory open {name}: {e}"))
        })?;
        Ok(Self { shmem })
    }

    fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    fn atomic(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= self.shmem.len());
        unsafe { &*(self.base().add(offset) as *const AtomicU32) }
    }

    /// Spin until the region lock is ours. Contention windows are short
    /// (one memcpy), so spinning with periodic yields is enough.
    fn lock(&self) -> RegionGuard<'_> {
        let lock = self.atomic(OFF_LOCK);
        let mut spins = 0u32;
        while lock.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed).is_err() {
            spins += 1;
            if spins % 128 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        RegionGuard { region: self }
    }
}

struct RegionGuard<'a> {
    region: &'a Region,
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.atomic(OFF_LOCK).store(0, Ordering::Release);
    }
}

/// A message inbox in named shared memory.
///
/// Invariants: a message never wraps around the end of the ring (a
/// `SKIP_TO_START` length word sends the reader back to offset zero
/// instead), and the ring is never filled completely so `read == write`
/// always means empty.
pub struct MessageBox {
    region: Region,
    capacity: usize,
    /// Region this handle is allowed to drain; writers leave it false.
    owner: bool,
}

impl MessageBox {
    /// Create (or attach to an existing) inbox for `id`. The creating
    /// process becomes the reader.
    pub fn create_inbox(id: Address, size: usize) -> Result<Self, TransportError> {
        if size < 2 * MAX_PACKET_SIZE {
            return Err(TransportError::InvalidValue("inbox smaller than two packets"));
        }
        let region = Region::create(&inbox_name(id), CONTROL_SIZE + size)?;
        let capacity = region.shmem.len() - CONTROL_SIZE;
        if region.atomic(OFF_MAGIC).load(Ordering::Acquire) != INBOX_MAGIC {
            region.atomic(OFF_CAPACITY).store(capacity as u32, Ordering::Relaxed);
            region.atomic(OFF_LOCK).store(0, Ordering::Relaxed);
            region.atomic(OFF_WRITE_POS).store(0, Ordering::Relaxed);
            region.atomic(OFF_READ_POS).store(0, Ordering::Relaxed);
            region.atomic(OFF_READ_COUNT).store(0, Ordering::Relaxed);
            region.atomic(OFF_MAGIC).store(INBOX_MAGIC, Ordering::Release);
        }
        Ok(Self { region, capacity, owner: true })
    }

    /// Attach to another process's inbox for writing.
    pub fn open_inbox(id: Address) -> Result<Self, TransportError> {
        let region = Region::open(&inbox_name(id))?;
        if region.atomic(OFF_MAGIC).load(Ordering::Acquire) != INBOX_MAGIC {
            return Err(TransportError::BadRegion);
        }
        let capacity = region.atomic(OFF_CAPACITY).load(Ordering::Relaxed) as usize;
        if capacity == 0 || capacity > region.shmem.len() - CONTROL_SIZE {
            return Err(TransportError::BadRegion);
        }
        Ok(Self { region, capacity, owner: false })
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.region.base().add(CONTROL_SIZE) }
    }

    /// Append one message. Fails with `QueueFull` when the reader has
    /// fallen too far behind, `MessageTooLarge` when the message can never
    /// fit.
    pub fn enqueue(&self, message: &[u8]) -> Result<(), TransportError> {
        let record = align4(4 + message.len());
        // One slack record keeps read == write unambiguous, plus room for a
        // skip word at the end of the ring.
        if record + 8 > self.capacity {
            return Err(TransportError::MessageTooLarge);
        }

        let _guard = self.region.lock();
        let mut write = self.region.atomic(OFF_WRITE_POS).load(Ordering::Relaxed) as usize;
        let read = self.region.atomic(OFF_READ_POS).load(Ordering::Acquire) as usize;

        if write >= read {
            // Free region is [write, capacity) then [0, read).
            if self.capacity - write < record + 4 {
                // Not enough room before the end; wrap. The skip word always
                // fits because records are 4-byte aligned.
                if record + 4 > read {
                    return Err(TransportError::QueueFull);
                }
                unsafe {
                    let p = self.data_ptr().add(write);
                    (p as *mut u32).write_unaligned(SKIP_TO_START.to_le());
                }
                write = 0;
            }
        }
        if write < read && read - write < record + 4 {
            return Err(TransportError::QueueFull);
        }

        unsafe {
            let p = self.data_ptr().add(write);
            (p as *mut u32).write_unaligned((message.len() as u32).to_le());
            std::ptr::copy_nonoverlapping(message.as_ptr(), p.add(4), message.len());
        }
        self.region
            .atomic(OFF_WRITE_POS)
            .store((write + record) as u32, Ordering::Release);
        Ok(())
    }

    pub fn enqueue_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        self.enqueue(stream.as_slice())
    }

    /// Remove the oldest message, if any. Also bumps the activity counter,
    /// which is what liveness probes watch; callers poll this even when the
    /// inbox is empty.
    pub fn dequeue(&self) -> Result<Option<Stream>, TransportError> {
        let _guard = self.region.lock();
        self.region.atomic(OFF_READ_COUNT).fetch_add(1, Ordering::Relaxed);

        let mut read = self.region.atomic(OFF_READ_POS).load(Ordering::Relaxed) as usize;
        let write = self.region.atomic(OFF_WRITE_POS).load(Ordering::Acquire) as usize;
        if read == write {
            return Ok(None);
        }

        let mut len = unsafe {
            u32::from_le((self.data_ptr().add(read) as *const u32).read_unaligned())
        };
        if len == SKIP_TO_START {
            read = 0;
            if read == write {
                return Ok(None);
            }
            len = unsafe {
                u32::from_le((self.data_ptr().add(read) as *const u32).read_unaligned())
            };
        }
        let len = len as usize;
        if len > self.capacity {
            // Corrupt record; resynchronize by resetting the ring.
            self.region.atomic(OFF_READ_POS).store(write as u32, Ordering::Release);
            return Err(TransportError::BadRegion);
        }

        let mut data = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr().add(read + 4), data.as_mut_ptr(), len);
        }
        self.region
            .atomic(OFF_READ_POS)
            .store((read + align4(4 + len)) as u32, Ordering::Release);
        Ok(Some(Stream::from_bytes(data)))
    }

    /// Liveness probe: sample the activity counter twice across `window`
    /// and report whether anyone advanced it. Used both for address-conflict
    /// detection at init and for the discovery sweep.
    pub fn is_active(&self, window: Duration) -> bool {
        let before = self.region.atomic(OFF_READ_COUNT).load(Ordering::Acquire);
        std::thread::sleep(window);
        let after = self.region.atomic(OFF_READ_COUNT).load(Ordering::Acquire);
        before != after
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maximum addresses one registry can hold.
const REGISTRY_SLOTS: usize = 64;

/// A named set of live addresses. Entries are added by their owner at init
/// and removed on clean shutdown; peers purge entries whose inbox can no
/// longer be opened.
pub struct Registry {
    region: Region,
}

impl Registry {
    pub fn open(name: &str) -> Result<Self, TransportError> {
        let region = Region::create(name, CONTROL_SIZE + REGISTRY_SLOTS * 4)?;
        if region.atomic(OFF_MAGIC).load(Ordering::Acquire) != REGISTRY_MAGIC {
            region.atomic(OFF_LOCK).store(0, Ordering::Relaxed);
            region.atomic(OFF_CAPACITY).store(REGISTRY_SLOTS as u32, Ordering::Relaxed);
            region.atomic(OFF_WRITE_POS).store(0, Ordering::Relaxed); // entry count
            region.atomic(OFF_MAGIC).store(REGISTRY_MAGIC, Ordering::Release);
        }
        Ok(Self { region })
    }

    fn slot(&self, index: usize) -> &AtomicU32 {
        self.region.atomic(CONTROL_SIZE + index * 4)
    }

    fn count(&self) -> usize {
        (self.region.atomic(OFF_WRITE_POS).load(Ordering::Acquire) as usize).min(REGISTRY_SLOTS)
    }

    /// Add `id`. `takeover` permits replacing an existing entry, used after
    /// a liveness probe has shown the previous owner dead.
    pub fn register(&self, id: Address, takeover: bool) -> Result<(), TransportError> {
        let _guard = self.region.lock();
        let count = self.count();
        for i in 0..count {
            if Address::from_u32(self.slot(i).load(Ordering::Relaxed)) == id {
                if takeover {
                    return Ok(());
                }
                return Err(TransportError::AddressConflict);
            }
        }
        if count >= REGISTRY_SLOTS {
            return Err(TransportError::RegistryFull);
        }
        self.slot(count).store(id.to_u32(), Ordering::Relaxed);
        self.region.atomic(OFF_WRITE_POS).store(count as u32 + 1, Ordering::Release);
        Ok(())
    }

    pub fn unregister(&self, id: Address) {
        let _guard = self.region.lock();
        let count = self.count();
        for i in 0..count {
            if Address::from_u32(self.slot(i).load(Ordering::Relaxed)) == id {
                // Swap-remove with the last entry.
                let last = self.slot(count - 1).load(Ordering::Relaxed);
                self.slot(i).store(last, Ordering::Relaxed);
                self.region
                    .atomic(OFF_WRITE_POS)
                    .store(count as u32 - 1, Ordering::Release);
                return;
            }
        }
    }

    pub fn list(&self) -> Vec<Address> {
        let _guard = self.region.lock();
        (0..self.count())
            .map(|i| Address::from_u32(self.slot(i).load(Ordering::Relaxed)))
            .collect()
    }

    pub fn contains(&self, id: Address) -> bool {
        self.list().contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address(component: u8) -> Address {
        // Unique per process so parallel test runs don't collide.
        let pid = std::process::id();
        Address::new((pid % 200) as u8 + 1, (pid / 200 % 200) as u8 + 1, component, 1)
    }

    #[test]
    fn fifo_across_handles() {
        let id = test_address(101);
        let inbox = MessageBox::create_inbox(id, 2 * MAX_PACKET_SIZE).unwrap();
        let outbox = MessageBox::open_inbox(id).unwrap();

        outbox.enqueue(b"first").unwrap();
        outbox.enqueue(b"second").unwrap();
        assert_eq!(inbox.dequeue().unwrap().unwrap().as_slice(), b"first");
        assert_eq!(inbox.dequeue().unwrap().unwrap().as_slice(), b"second");
        assert!(inbox.dequeue().unwrap().is_none());
    }

    #[test]
    fn wraparound_never_splits_a_message() {
        let id = test_address(102);
        let inbox = MessageBox::create_inbox(id, 2 * MAX_PACKET_SIZE).unwrap();
        let payload = vec![0xA5u8; 3000];

        // Cycle enough messages to force several wraps.
        for round in 0..12 {
            inbox.enqueue(&payload).unwrap();
            let out = inbox.dequeue().unwrap().expect("message present");
            assert_eq!(out.len(), payload.len(), "round {round}");
            assert!(out.as_slice().iter().all(|&b| b == 0xA5));
        }
        assert!(inbox.dequeue().unwrap().is_none());
    }

    #[test]
    fn full_inbox_rejects_writes_until_drained() {
        let id = test_address(103);
        let inbox = MessageBox::create_inbox(id, 2 * MAX_PACKET_SIZE).unwrap();
        let payload = vec![1u8; 1024];

        let mut accepted = 0;
        while inbox.enqueue(&payload).is_ok() {
            accepted += 1;
            assert!(accepted < 10_000, "ring never reported full");
        }
        assert!(accepted > 0);
        // Wrapping needs room for the skip word too, so drain two records.
        inbox.dequeue().unwrap().unwrap();
        inbox.dequeue().unwrap().unwrap();
        inbox.enqueue(&payload).unwrap();
    }

    #[test]
    fn registry_conflict_and_takeover() {
        let name = format!("{:03}_test_registry_{}", 99, std::process::id());
        let registry = Registry::open(&name).unwrap();
        let id = test_address(104);

        registry.register(id, false).unwrap();
        assert!(matches!(
            registry.register(id, false),
            Err(TransportError::AddressConflict)
        ));
        registry.register(id, true).unwrap();
        assert!(registry.contains(id));
        registry.unregister(id);
        assert!(!registry.contains(id));
    }
}
