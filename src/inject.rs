//! Packet injection.

use std::sync::Arc;

use log::{debug, warn};

use crate::api::{Driver, InjectId, MAX_INJECT_LEN, Result, Timeout};
use crate::errors::Error;
use crate::lifecycle::{Canceller, State, StateCell};

/// An open injection handle on a port.
pub struct InjectHandle<D: Driver> {
    driver: Arc<D>,
    id: InjectId,
    port: u32,
    state: triomphe::Arc<StateCell>,
}

impl<D: Driver> InjectHandle<D> {
    /// `flags` are passed to the driver untouched; 0 for defaults.
    pub fn open(driver: Arc<D>, port: u32, flags: u32) -> Result<Self> {
        let id = driver.inject_open(port, flags)?;
        debug!("port {port}: injection handle {} opened", u32::from(id));
        Ok(Self {
            driver,
            id,
            port,
            state: triomphe::Arc::new(StateCell::new()),
        })
    }

    pub fn id(&self) -> InjectId {
        self.id
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn sender(&self, timeout: impl Into<Timeout>) -> Sender<'_, D> {
        Sender {
            handle: self,
            timeout: timeout.into(),
        }
    }

    /// Stops every sender of this handle. Sends already inside the driver
    /// finish within their timeout.
    pub fn canceller(&self) -> Canceller {
        let state = self.state.clone();
        Canceller::new(move || {
            state.advance(State::NonOperational);
            Ok(())
        })
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state.get() == State::Closed {
            return Ok(());
        }
        self.driver.inject_close(self.id)?;
        self.state.advance(State::Closed);
        debug!("port {}: injection handle {} closed", self.port, self.id.0);
        Ok(())
    }
}

impl<D: Driver> Drop for InjectHandle<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("port {}: injection close on drop failed: {e}", self.port);
        }
    }
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_INJECT_LEN {
        return Err(Error::TooBigPacket(len));
    }
    Ok(())
}

/// Sends complete Ethernet frames (without CRC) through an
/// [`InjectHandle`].
///
/// Every call fails with [`Error::WouldBlock`] if send resources did not
/// free up within the timeout, and with [`Error::EndOfStream`] once the
/// handle is cancelled.
pub struct Sender<'h, D: Driver> {
    handle: &'h InjectHandle<D>,
    timeout: Timeout,
}

impl<D: Driver> Sender<'_, D> {
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    fn driver(&self) -> Result<&D> {
        if !self.handle.state.is_operational() {
            return Err(Error::EndOfStream);
        }
        Ok(&self.handle.driver)
    }

    pub fn send(&self, pkt: &[u8]) -> Result<()> {
        check_len(pkt.len())?;
        self.driver()?.inject_send(self.handle.id, self.timeout, pkt)
    }

    /// Sends one frame assembled from `frags`.
    pub fn send_vec(&self, frags: &[&[u8]]) -> Result<()> {
        check_len(frags.iter().map(|f| f.len()).sum())?;
        self.driver()?
            .inject_send_v(self.handle.id, self.timeout, frags)
    }

    /// Sends `pkts` in order. Returns the first error, with the packets
    /// before it sent.
    pub fn send_bulk(&self, pkts: &[&[u8]]) -> Result<()> {
        if let Some(big) = pkts.iter().find(|p| p.len() > MAX_INJECT_LEN) {
            return Err(Error::TooBigPacket(big.len()));
        }
        self.driver()?
            .inject_send_bulk(self.handle.id, self.timeout, pkts)
    }

    /// Sends `pkt` at least `delay_ns` after the start of the previous
    /// packet. Fails with [`Error::NotSupported`] without pacing hardware.
    pub fn sched(&self, pkt: &[u8], delay_ns: u64) -> Result<()> {
        check_len(pkt.len())?;
        self.driver()?
            .inject_sched(self.handle.id, self.timeout, pkt, delay_ns)
    }

    pub fn sched_vec(&self, frags: &[&[u8]], delay_ns: u64) -> Result<()> {
        check_len(frags.iter().map(|f| f.len()).sum())?;
        self.driver()?
            .inject_sched_v(self.handle.id, self.timeout, frags, delay_ns)
    }

    /// Like [`send`](Self::send), retrying while the driver has no send
    /// resources.
    pub fn loop_send(&self, pkt: &[u8]) -> Result<()> {
        loop {
            match self.send(pkt) {
                Err(Error::WouldBlock) => continue,
                r => return r,
            }
        }
    }
}
