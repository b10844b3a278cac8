//! Shared-memory region carrying the current input between processes.
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::mem::size_of;
use std::slice;
use thiserror::Error;

/// Header at the start of the region. Host-native layout; the region never
/// leaves the machine.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedMemHeader {
    /// Byte length of the payload that follows the header.
    pub value_len: u64,
    /// Calls to the user function since the current RPC began. Reset to 0 by
    /// the client before each call.
    pub count: i64,
    /// PRNG state captured by the worker before it began mutating.
    pub rand_state: u64,
    pub rand_inc: u64,
}

#[derive(Debug, Error)]
pub enum MemError {
    #[error("shared memory mapping: {0}")]
    Shmem(#[from] ShmemError),
    #[error("mapping of {got} bytes cannot hold the {want}-byte header")]
    TooSmall { got: usize, want: usize },
}

/// A fixed-size mapping shared between the coordinator and one worker.
///
/// Access is sequential by protocol: only the current holder of the
/// single-permit slot touches it. There is no locking inside the region.
pub struct SharedMem {
    shm: Shmem,
    os_id: String,
}

// The mapping is only ever touched by the permit holder; moving the handle
// between supervisor threads is part of the design.
unsafe impl Send for SharedMem {}

impl SharedMem {
    /// Creates (or re-opens, when racing a leftover mapping) the region. The
    /// creating side owns the mapping and unlinks it on drop.
    pub fn create(os_id: &str, size: usize) -> Result<SharedMem, MemError> {
        if size <= size_of::<SharedMemHeader>() {
            return Err(MemError::TooSmall {
                got: size,
                want: size_of::<SharedMemHeader>(),
            });
        }
        let shm = match ShmemConf::new().os_id(os_id).size(size).create() {
            Ok(mut shm) => {
                shm.set_owner(true);
                shm
            }
            Err(ShmemError::MappingIdExists) => {
                let mut shm = ShmemConf::new().os_id(os_id).size(size).open()?;
                shm.set_owner(true);
                shm
            }
            Err(e) => return Err(e.into()),
        };
        Ok(SharedMem {
            shm,
            os_id: os_id.to_string(),
        })
    }

    /// Opens an existing region by name; used by worker processes.
    pub fn open(os_id: &str) -> Result<SharedMem, MemError> {
        let shm = ShmemConf::new().os_id(os_id).open()?;
        Ok(SharedMem {
            shm,
            os_id: os_id.to_string(),
        })
    }

    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    pub fn size(&self) -> usize {
        self.shm.len()
    }

    /// Payload capacity: region size minus the header. This bound is derived
    /// identically in both processes, which mutation replay relies on.
    pub fn capacity(&self) -> usize {
        self.size() - size_of::<SharedMemHeader>()
    }

    pub fn header(&self) -> &SharedMemHeader {
        unsafe { &*(self.shm.as_ptr() as *const SharedMemHeader) }
    }

    pub fn header_mut(&mut self) -> &mut SharedMemHeader {
        unsafe { &mut *(self.shm.as_ptr() as *mut SharedMemHeader) }
    }

    fn payload(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(
                self.shm.as_ptr().add(size_of::<SharedMemHeader>()),
                self.capacity(),
            )
        }
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            slice::from_raw_parts_mut(
                self.shm.as_ptr().add(size_of::<SharedMemHeader>()),
                self.capacity(),
            )
        }
    }

    /// Borrows the current value bytes.
    pub fn value(&self) -> &[u8] {
        let len = self.header().value_len as usize;
        assert!(len <= self.capacity(), "value_len {} exceeds capacity", len);
        &self.payload()[..len]
    }

    /// Owned copy of the current value bytes.
    pub fn value_copy(&self) -> Vec<u8> {
        self.value().to_vec()
    }

    /// Copies `value` into the region and updates `value_len`.
    pub fn set_value(&mut self, value: &[u8]) {
        assert!(
            value.len() <= self.capacity(),
            "value of {} bytes exceeds capacity {}",
            value.len(),
            self.capacity()
        );
        self.payload_mut()[..value.len()].copy_from_slice(value);
        self.header_mut().value_len = value.len() as u64;
    }
}
