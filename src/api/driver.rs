//! The capture driver seam.

use super::Result;
use super::metadata::{RecvDesc, RingQInfo};
use super::options::{HandleOptions, IfAddr};
use super::timeout::Timeout;
use crate::errors::Error;

/// Opaque identifier of an open device handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub(crate) u32);

/// Opaque identifier of an open receive ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingId(pub(crate) u32);

/// Opaque identifier of an open injection handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InjectId(pub(crate) u32);

macro_rules! id_conversions {
    ($($ty:ident),*) => {
        $(
            impl From<u32> for $ty {
                fn from(val: u32) -> Self {
                    Self(val)
                }
            }

            impl From<$ty> for u32 {
                fn from(val: $ty) -> u32 {
                    val.0
                }
            }
        )*
    };
}

id_conversions!(HandleId, RingId, InjectId);

/// A kernel-bypass capture driver.
///
/// Implementations own every device, ring and injection resource; the rest of
/// the crate only ever holds the ids handed out here. All methods take `&self`
/// so that rings of one handle can be served from different threads.
///
/// # Borrowing
///
/// Descriptors returned by [`recv_many`](Driver::recv_many) stay valid until
/// the caller gives their `length_data` back through
/// [`return_many`](Driver::return_many), in receive order. A descriptor from
/// [`recv_one`](Driver::recv_one) stays valid until the next receive on the
/// same ring.
pub trait Driver: Send + Sync + 'static {
    /// One-time library initialisation.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Enumerates the capture-capable ports.
    fn ifaddrs(&self) -> Result<Vec<IfAddr>>;

    fn open_handle(&self, port: u32, opts: &HandleOptions) -> Result<HandleId>;

    /// Starts packet delivery to the handle's rings.
    fn start(&self, handle: HandleId) -> Result<()>;

    fn stop(&self, handle: HandleId) -> Result<()>;

    /// Fails with [`Error::Busy`] while rings are still open.
    fn close_handle(&self, handle: HandleId) -> Result<()>;

    /// Opens the next free ring, or the ring `id` when given.
    fn open_ring(&self, handle: HandleId, id: Option<u32>) -> Result<RingId>;

    fn close_ring(&self, ring: RingId) -> Result<()>;

    /// Receives a single packet. Its memory is released by the next receive.
    fn recv_one(&self, ring: RingId, timeout: Timeout) -> Result<RecvDesc>;

    /// Borrows up to `max` packets, appending them to `out`.
    ///
    /// Returns [`Error::WouldBlock`] when nothing arrived within `timeout`.
    fn recv_many(
        &self,
        ring: RingId,
        timeout: Timeout,
        out: &mut Vec<RecvDesc>,
        max: usize,
    ) -> Result<RingQInfo>;

    /// Gives `data_qlen` bytes of borrowed ring memory back, oldest first.
    fn return_many(&self, ring: RingId, data_qlen: u64) -> Result<()>;

    /// Wakes every call blocked on the handle's rings with
    /// [`Error::Interrupted`].
    ///
    /// Drivers that are woken by process signals instead may leave this as a
    /// no-op.
    fn interrupt(&self, _handle: HandleId) -> Result<()> {
        Ok(())
    }

    fn inject_open(&self, _port: u32, _flags: u32) -> Result<InjectId> {
        Err(Error::NotSupported)
    }

    fn inject_send(&self, _inj: InjectId, _timeout: Timeout, _pkt: &[u8]) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Sends every packet of `pkts` in order, stopping at the first failure.
    fn inject_send_bulk(&self, inj: InjectId, timeout: Timeout, pkts: &[&[u8]]) -> Result<()> {
        pkts.iter()
            .try_for_each(|pkt| self.inject_send(inj, timeout, pkt))
    }

    /// Sends one frame assembled from `frags`.
    fn inject_send_v(&self, _inj: InjectId, _timeout: Timeout, _frags: &[&[u8]]) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Sends `pkt` at least `delay_ns` after the start of the prior packet.
    fn inject_sched(
        &self,
        _inj: InjectId,
        _timeout: Timeout,
        _pkt: &[u8],
        _delay_ns: u64,
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn inject_sched_v(
        &self,
        _inj: InjectId,
        _timeout: Timeout,
        _frags: &[&[u8]],
        _delay_ns: u64,
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn inject_close(&self, _inj: InjectId) -> Result<()> {
        Err(Error::NotSupported)
    }
}
