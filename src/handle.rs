//! Device handles and their receive rings.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::api::{Driver, HandleId, HandleOptions, Result, RingId, Timeout};
use crate::errors::Error;
use crate::lifecycle::{Canceller, State, StateCell};
use crate::receiver::Receiver;

struct Shared<D: Driver> {
    driver: Arc<D>,
    id: HandleId,
    port: u32,
    state: StateCell,
    rings: Mutex<BTreeSet<RingId>>,
}

impl<D: Driver> Shared<D> {
    fn cancel(&self) -> Result<()> {
        if self.state.advance(State::NonOperational) == State::Operational {
            debug!("port {}: cancelled", self.port);
            self.driver.interrupt(self.id)?;
        }
        Ok(())
    }
}

impl<D: Driver> Drop for Shared<D> {
    fn drop(&mut self) {
        if self.state.get() == State::Closed {
            return;
        }
        if let Err(e) = self.driver.close_handle(self.id) {
            warn!("port {}: close on drop failed: {e}", self.port);
        }
    }
}

/// An open capture port.
///
/// Every [`Ring`] opened from the handle shares its lifecycle flag: once the
/// handle is cancelled, all of its rings report end of stream.
pub struct Handle<D: Driver> {
    shared: triomphe::Arc<Shared<D>>,
}

impl<D: Driver> Handle<D> {
    /// Opens `port` for capture. Delivery begins after [`start`](Self::start).
    pub fn open(driver: Arc<D>, port: u32, opts: &HandleOptions) -> Result<Self> {
        let id = driver.open_handle(port, opts)?;
        debug!("port {port}: opened with {opts:?}");
        Ok(Self {
            shared: triomphe::Arc::new(Shared {
                driver,
                id,
                port,
                state: StateCell::new(),
                rings: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    /// Driver-side id of the handle.
    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    pub fn port(&self) -> u32 {
        self.shared.port
    }

    pub fn state(&self) -> State {
        self.shared.state.get()
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.shared.driver
    }

    /// Number of rings currently open.
    pub fn rings(&self) -> usize {
        self.shared.rings.lock().len()
    }

    pub fn start(&self) -> Result<()> {
        if !self.shared.state.is_operational() {
            return Err(Error::EndOfStream);
        }
        self.shared.driver.start(self.shared.id)?;
        debug!("port {}: started", self.shared.port);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if self.shared.state.get() == State::Closed {
            return Err(Error::EndOfStream);
        }
        self.shared.driver.stop(self.shared.id)?;
        debug!("port {}: stopped", self.shared.port);
        Ok(())
    }

    /// Opens the next available ring.
    pub fn open_ring(&self) -> Result<Ring<D>> {
        self.open_ring_inner(None)
    }

    /// Opens ring `id` specifically. Fails with [`Error::Busy`] if it is
    /// already open.
    pub fn open_ring_id(&self, id: u32) -> Result<Ring<D>> {
        self.open_ring_inner(Some(id))
    }

    fn open_ring_inner(&self, id: Option<u32>) -> Result<Ring<D>> {
        let mut rings = self.shared.rings.lock();
        if !self.shared.state.is_operational() {
            return Err(Error::EndOfStream);
        }
        let ring = self.shared.driver.open_ring(self.shared.id, id)?;
        rings.insert(ring);
        debug!("port {}: ring {} opened", self.shared.port, ring.0);
        Ok(Ring {
            shared: self.shared.clone(),
            id: ring,
            state: StateCell::new(),
        })
    }

    pub fn canceller(&self) -> Canceller {
        let shared = self.shared.clone();
        Canceller::new(move || shared.cancel())
    }

    /// Same as firing [`canceller`](Self::canceller).
    pub fn cancel(&self) -> Result<()> {
        self.shared.cancel()
    }

    /// Closes the device.
    ///
    /// Fails with [`Error::Busy`] while any ring is still open; the caller is
    /// expected to close them and try again. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let rings = self.shared.rings.lock();
        if self.shared.state.get() == State::Closed {
            return Ok(());
        }
        if !rings.is_empty() {
            return Err(Error::Busy("rings still open"));
        }
        self.shared.driver.close_handle(self.shared.id)?;
        self.shared.state.advance(State::Closed);
        debug!("port {}: closed", self.shared.port);
        Ok(())
    }
}

/// A receive ring of a [`Handle`].
///
/// Owned by one consumer thread at a time.
pub struct Ring<D: Driver> {
    shared: triomphe::Arc<Shared<D>>,
    id: RingId,
    state: StateCell,
}

impl<D: Driver> fmt::Debug for Ring<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("id", &self.id)
            .field("port", &self.shared.port)
            .field("state", &self.state())
            .finish()
    }
}

impl<D: Driver> Ring<D> {
    pub fn id(&self) -> RingId {
        self.id
    }

    pub fn port(&self) -> u32 {
        self.shared.port
    }

    /// The more advanced of the ring's own state and its handle's.
    #[inline]
    pub fn state(&self) -> State {
        self.state.get().max(self.shared.state.get())
    }

    #[inline]
    pub fn is_operational(&self) -> bool {
        self.state() == State::Operational
    }

    pub(crate) fn driver(&self) -> &D {
        &self.shared.driver
    }

    /// A cursor over this ring borrowing up to `burst` packets per reload.
    pub fn receiver(&mut self, timeout: impl Into<Timeout>, burst: usize) -> Receiver<'_, D> {
        Receiver::new(self, timeout.into(), burst)
    }

    pub fn canceller(&self) -> Canceller {
        let shared = self.shared.clone();
        Canceller::new(move || shared.cancel())
    }

    /// Closes the ring. All packet memory borrowed from it is reclaimed by
    /// the driver. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let mut rings = self.shared.rings.lock();
        if !rings.contains(&self.id) {
            self.state.advance(State::Closed);
            return Ok(());
        }
        self.shared.driver.close_ring(self.id)?;
        rings.remove(&self.id);
        self.state.advance(State::Closed);
        debug!("port {}: ring {} closed", self.shared.port, self.id.0);
        Ok(())
    }
}

impl<D: Driver> Drop for Ring<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("port {}: ring {} close on drop failed: {e}", self.shared.port, self.id.0);
        }
    }
}
