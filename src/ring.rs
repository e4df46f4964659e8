//! Borrow-many/return-many management of one receive ring.

use log::{trace, warn};

use crate::api::{Driver, Meta, RecvDesc, Result, RingQInfo, Timeout};
use crate::handle::Ring;
use crate::lifecycle::State;

/// The packets of one reload. Valid until the owning [`BatchReader`] reloads
/// or returns its memory.
#[derive(Clone, Copy)]
pub struct Batch<'a> {
    descs: &'a [RecvDesc],
}

impl<'a> Batch<'a> {
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&'a [u8]> {
        // SAFETY: the batch borrows its reader, which only gives memory back
        // through `&mut self`.
        self.descs.get(idx).map(|d| unsafe { d.bytes() })
    }

    pub fn meta(&self, idx: usize) -> Option<&'a Meta> {
        self.descs.get(idx).map(|d| d.meta())
    }

    pub fn descs(&self) -> &'a [RecvDesc] {
        self.descs
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &'a [u8]> + 'a {
        // SAFETY: see `get`.
        self.descs.iter().map(|d| unsafe { d.bytes() })
    }
}

/// Borrows batches of packets from a ring and gives them back.
///
/// At most one batch is outstanding: [`reload`](Self::reload) returns the
/// previous batch before borrowing the next one. With a burst of 1 the
/// single-receive primitive is used and memory is released implicitly by the
/// next receive.
pub struct BatchReader<'r, D: Driver> {
    ring: &'r mut Ring<D>,
    timeout: Timeout,
    burst: usize,
    descs: Vec<RecvDesc>,
    /// Sum of `length_data` not yet given back.
    borrowed: u64,
    qinfo: RingQInfo,
}

impl<'r, D: Driver> BatchReader<'r, D> {
    /// A `burst` of 0 is treated as 1.
    pub fn new(ring: &'r mut Ring<D>, timeout: Timeout, burst: usize) -> Self {
        let burst = burst.max(1);
        Self {
            ring,
            timeout,
            burst,
            descs: Vec::with_capacity(burst),
            borrowed: 0,
            qinfo: RingQInfo::default(),
        }
    }

    pub fn ring(&self) -> &Ring<D> {
        self.ring
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Bytes borrowed from the ring and not yet returned.
    pub fn borrowed(&self) -> u64 {
        self.borrowed
    }

    /// Queue information reported by the last bulk receive.
    pub fn qinfo(&self) -> RingQInfo {
        self.qinfo
    }

    pub fn batch(&self) -> Batch<'_> {
        Batch { descs: &self.descs }
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Returns the current batch, then borrows up to `burst` packets.
    ///
    /// Fails with [`Error::WouldBlock`](crate::errors::Error::WouldBlock) if
    /// nothing arrived within the timeout. If giving the previous batch back
    /// fails, it stays borrowed and the next reload tries again.
    pub fn reload(&mut self) -> Result<usize> {
        self.return_many()?;
        self.descs.clear();

        let driver = self.ring.driver();
        if self.burst == 1 {
            let desc = driver.recv_one(self.ring.id(), self.timeout)?;
            self.descs.push(desc);
        } else {
            self.qinfo = driver.recv_many(self.ring.id(), self.timeout, &mut self.descs, self.burst)?;
            self.borrowed = self.descs.iter().map(|d| d.length_data() as u64).sum();
        }
        trace!(
            "ring {}: borrowed {} packets, {} bytes",
            u32::from(self.ring.id()),
            self.descs.len(),
            self.borrowed
        );
        Ok(self.descs.len())
    }

    /// Gives the current batch back to the ring. Does nothing when nothing
    /// is borrowed.
    pub fn return_many(&mut self) -> Result<()> {
        if self.borrowed == 0 {
            return Ok(());
        }
        self.ring.driver().return_many(self.ring.id(), self.borrowed)?;
        self.borrowed = 0;
        self.descs.clear();
        Ok(())
    }
}

impl<D: Driver> Drop for BatchReader<'_, D> {
    fn drop(&mut self) {
        if self.ring.state() == State::Closed {
            return;
        }
        if let Err(e) = self.return_many() {
            warn!("ring {}: return on drop failed: {e}", u32::from(self.ring.id()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HandleOptions;
    use crate::handle::Handle;
    use crate::mem::MemDriver;
    use std::sync::Arc;

    fn setup() -> (Arc<MemDriver>, Handle<MemDriver>) {
        let driver = Arc::new(MemDriver::with_ports(1));
        let h = Handle::open(driver.clone(), 0, &HandleOptions::default().num_rings(1)).unwrap();
        (driver, h)
    }

    #[test]
    fn test_reload_and_return() {
        let (driver, h) = setup();
        let mut ring = h.open_ring().unwrap();
        h.start().unwrap();
        for i in 0..5u8 {
            driver.push(0, &[i; 60]).unwrap();
        }
        let mut reader = BatchReader::new(&mut ring, Timeout::Millis(10), 4);
        assert_eq!(reader.reload().unwrap(), 4);
        assert!(reader.borrowed() >= 4 * 60);
        let firsts: Vec<u8> = reader.batch().iter().map(|p| p[0]).collect();
        assert_eq!(firsts, [0, 1, 2, 3]);
        assert_eq!(reader.reload().unwrap(), 1);
        assert_eq!(reader.batch().get(0).unwrap()[0], 4);
        reader.return_many().unwrap();
        assert_eq!(reader.borrowed(), 0);
        assert!(reader.is_empty());
        assert_eq!(driver.ring_borrowed(0, 0), 0);
    }

    #[test]
    fn test_return_many_idempotent() {
        let (driver, h) = setup();
        let mut ring = h.open_ring().unwrap();
        h.start().unwrap();
        driver.push(0, &[0xaa; 64]).unwrap();
        let mut reader = BatchReader::new(&mut ring, Timeout::Millis(10), 8);
        reader.reload().unwrap();
        reader.return_many().unwrap();
        reader.return_many().unwrap();
        reader.return_many().unwrap();
        assert_eq!(driver.return_calls(), 1);
    }

    #[test]
    fn test_would_block() {
        let (_driver, h) = setup();
        let mut ring = h.open_ring().unwrap();
        h.start().unwrap();
        let mut reader = BatchReader::new(&mut ring, Timeout::Millis(0), 8);
        assert!(reader.reload().unwrap_err().is_would_block());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_single_mode_never_returns() {
        let (driver, h) = setup();
        let mut ring = h.open_ring().unwrap();
        h.start().unwrap();
        for i in 0..3u8 {
            driver.push(0, &[i; 60]).unwrap();
        }
        let mut reader = BatchReader::new(&mut ring, Timeout::Millis(10), 1);
        for i in 0..3u8 {
            assert_eq!(reader.reload().unwrap(), 1);
            assert_eq!(reader.batch().get(0).unwrap()[0], i);
        }
        assert_eq!(reader.borrowed(), 0);
        drop(reader);
        assert_eq!(driver.return_calls(), 0);
    }

    #[test]
    fn test_qinfo() {
        let (driver, h) = setup();
        let mut ring = h.open_ring().unwrap();
        h.start().unwrap();
        for _ in 0..3 {
            driver.push(0, &[0; 100]).unwrap();
        }
        let mut reader = BatchReader::new(&mut ring, Timeout::Millis(10), 2);
        reader.reload().unwrap();
        let q = reader.qinfo();
        assert_eq!(q.borrowed as u64, reader.borrowed());
        assert!(q.avail > 0);
    }
}
