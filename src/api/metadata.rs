//! Per-packet metadata and raw receive descriptors.

use std::time::{Duration, SystemTime};

/// Metadata reported by the driver for each received packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    /// Captured length in bytes.
    pub length: u32,
    /// Receive timestamp, nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// Port the packet was received on.
    pub portnum: u32,
    /// Length of the packet in ring memory, including alignment padding.
    /// This is what gets handed back to the driver on return.
    pub length_data: u32,
    /// Hash computed by the NIC for RSS.
    pub hw_hash: u32,
}

impl Meta {
    pub fn system_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_nanos(self.timestamp)
    }
}

/// A non-owning view of one packet in driver memory.
///
/// The view carries no lifetime of its own: safe access to its bytes is only
/// offered through [`Batch`](crate::ring::Batch) and
/// [`Receiver`](crate::receiver::Receiver), whose borrows end before the
/// memory is handed back to the driver.
#[derive(Clone, Copy, Debug)]
pub struct RecvDesc {
    ptr: *const u8,
    meta: Meta,
}

// The pointee is driver memory, which is not tied to any thread.
unsafe impl Send for RecvDesc {}

impl RecvDesc {
    /// # Safety
    ///
    /// `ptr` must address at least `meta.length` readable bytes which stay
    /// valid until the descriptor is returned to the driver that produced it.
    pub unsafe fn from_raw(ptr: *const u8, meta: Meta) -> Self {
        Self { ptr, meta }
    }

    pub fn len(&self) -> usize {
        self.meta.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.meta.length == 0
    }

    pub fn length_data(&self) -> u32 {
        self.meta.length_data
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// # Safety
    ///
    /// The descriptor must not have been returned to the driver, and the
    /// returned slice must not outlive that return.
    pub(crate) unsafe fn bytes<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.meta.length == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.meta.length as usize) }
    }
}

/// Queue occupancy of a ring, in bytes, as of the last bulk receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingQInfo {
    /// Bytes waiting to be borrowed.
    pub avail: usize,
    /// Bytes borrowed and not yet returned.
    pub borrowed: usize,
    /// Bytes free for the NIC to fill.
    pub free: usize,
}
