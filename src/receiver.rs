//! Cursor over the packets of a ring.

use std::time::SystemTime;

use log::debug;

use crate::api::{Driver, Meta, RecvDesc, Result, RingQInfo, Timeout};
use crate::bpf;
use crate::errors::Error;
use crate::filter::{Filter, PacketFilter};
use crate::handle::Ring;
use crate::lifecycle::State;
use crate::ring::BatchReader;

/// Capture details of the current packet, in the shape packet decoders
/// usually expect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureInfo {
    pub timestamp: SystemTime,
    pub capture_length: usize,
    pub length: usize,
    pub interface_index: u32,
}

impl From<&Meta> for CaptureInfo {
    fn from(meta: &Meta) -> Self {
        Self {
            timestamp: meta.system_time(),
            capture_length: meta.length as usize,
            length: meta.length as usize,
            interface_index: meta.portnum,
        }
    }
}

/// Walks the packets of a ring one at a time, reloading batches and
/// skipping packets rejected by the attached filter.
///
/// ```ignore
/// let mut rx = ring.receiver(Duration::from_millis(100), 64);
/// rx.set_bpf(65535, "tcp and port 80")?;
/// while rx.loop_next() {
///     handle(rx.data(), rx.metadata());
/// }
/// match rx.take_err() {
///     Some(Error::EndOfStream) | None => {}
///     Some(e) => return Err(e.into()),
/// }
/// ```
///
/// The bytes returned by [`data`](Self::data) live in driver memory and are
/// only valid until the next call to [`next`](Self::next); copy them out to
/// keep them. Dropping the receiver returns its borrowed memory.
pub struct Receiver<'r, D: Driver> {
    reader: BatchReader<'r, D>,
    filter: Option<Filter>,
    results: Vec<u32>,
    /// Next packet of the batch to look at.
    pos: usize,
    current: Option<usize>,
    err: Option<Error>,
}

impl<'r, D: Driver> Receiver<'r, D> {
    pub fn new(ring: &'r mut Ring<D>, timeout: Timeout, burst: usize) -> Self {
        let reader = BatchReader::new(ring, timeout, burst);
        let burst = reader.burst();
        Self {
            reader,
            filter: None,
            results: Vec::with_capacity(burst),
            pos: 0,
            current: None,
            err: None,
        }
    }

    /// Advances to the next packet passing the filter. On `false`,
    /// [`err`](Self::err) tells why.
    pub fn next(&mut self) -> bool {
        self.current = None;
        loop {
            while self.pos < self.reader.len() {
                let idx = self.pos;
                self.pos += 1;
                if self.filter.is_none() || self.results[idx] != 0 {
                    self.current = Some(idx);
                    return true;
                }
            }
            if let Err(e) = self.reload() {
                self.err = Some(e);
                return false;
            }
        }
    }

    /// Like [`next`](Self::next), but keeps polling through timeouts and
    /// driver interrupts. Only returns `false` on a terminal error.
    pub fn loop_next(&mut self) -> bool {
        loop {
            if self.next() {
                return true;
            }
            if self.err.as_ref().is_none_or(Error::is_terminal) {
                return false;
            }
        }
    }

    fn reload(&mut self) -> Result<()> {
        if !self.reader.ring().is_operational() {
            return Err(Error::EndOfStream);
        }
        // The reader drops its batch even when the reload fails.
        self.pos = 0;
        match self.reader.reload() {
            Ok(_) => {}
            Err(Error::Interrupted) if !self.reader.ring().is_operational() => {
                return Err(Error::EndOfStream);
            }
            Err(e) => return Err(e),
        }
        self.err = None;
        if let Some(filter) = &self.filter {
            filter.filter_batch(&self.reader.batch(), &mut self.results);
        }
        Ok(())
    }

    /// Bytes of the current packet, empty if there is none.
    pub fn data(&self) -> &[u8] {
        self.current
            .and_then(|idx| self.reader.batch().get(idx))
            .unwrap_or(&[])
    }

    pub fn metadata(&self) -> Option<&Meta> {
        self.recv_desc().map(RecvDesc::meta)
    }

    pub fn recv_desc(&self) -> Option<&RecvDesc> {
        self.current.and_then(|idx| self.reader.batch().descs().get(idx))
    }

    /// Filter verdict for the current packet. Always 0 without a filter.
    pub fn filter_result(&self) -> u32 {
        match (&self.filter, self.current) {
            (Some(_), Some(idx)) => self.results[idx],
            _ => 0,
        }
    }

    /// The error that made the last [`next`](Self::next) fail.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }

    /// Packets left in the current batch, filtered or not.
    pub fn avail(&self) -> usize {
        self.reader.len() - self.pos
    }

    pub fn ring_qinfo(&self) -> RingQInfo {
        self.reader.qinfo()
    }

    pub fn state(&self) -> State {
        self.reader.ring().state()
    }

    /// Attaches `filter`, replacing the previous one. Packets left in the
    /// current batch are evaluated against it right away.
    pub fn set_filter(&mut self, filter: impl Into<Filter>) {
        let filter = filter.into();
        debug!(
            "ring {}: filter {filter:?} attached",
            u32::from(self.reader.ring().id())
        );
        filter.filter_batch(&self.reader.batch(), &mut self.results);
        self.filter = Some(filter);
    }

    /// Compiles `expr` and attaches it. The current filter is kept if
    /// compilation fails.
    pub fn set_bpf(&mut self, snaplen: u32, expr: &str) -> Result<()> {
        let prog = bpf::compile(snaplen, expr)?;
        self.set_filter(prog);
        Ok(())
    }

    pub fn clear_filter(&mut self) -> Option<Filter> {
        self.filter.take()
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Returns borrowed packets to the ring, including those not yet seen.
    /// Does nothing once the ring is closed or when nothing is borrowed.
    pub fn free(&mut self) -> Result<()> {
        self.current = None;
        if self.reader.ring().state() == State::Closed {
            return Ok(());
        }
        self.reader.return_many()?;
        self.pos = self.reader.len();
        Ok(())
    }

    /// Next packet without copying. The slice is valid until the next call.
    pub fn zero_copy_read(&mut self) -> Result<(&[u8], CaptureInfo)> {
        if !self.loop_next() {
            return Err(self.err.take().unwrap_or(Error::EndOfStream));
        }
        let ci = self.metadata().map(CaptureInfo::from);
        match ci {
            Some(ci) => Ok((self.data(), ci)),
            None => Err(Error::EndOfStream),
        }
    }

    /// Next packet, copied out of ring memory.
    pub fn read_packet(&mut self) -> Result<(Vec<u8>, CaptureInfo)> {
        let (data, ci) = self.zero_copy_read()?;
        Ok((data.to_vec(), ci))
    }
}
