//! Packet filters a [`Receiver`](crate::receiver::Receiver) can apply while
//! reloading.

pub mod l4;

use std::fmt;

use crate::bpf::Program;
use crate::ring::Batch;

pub use l4::{PortFilter, Transport, tcp_port_filter, udp_port_filter};

/// Decides whether a packet is kept. Zero drops the packet, anything else
/// keeps it.
pub trait PacketFilter: Send + Sync {
    fn filter(&self, pkt: &[u8]) -> u32;

    /// Evaluates every packet of `batch`, replacing the contents of `results`
    /// with one entry per packet.
    fn filter_batch(&self, batch: &Batch<'_>, results: &mut Vec<u32>) {
        results.clear();
        results.extend(batch.iter().map(|pkt| self.filter(pkt)));
    }
}

/// A filter attached to a receiver.
pub enum Filter {
    /// Compiled BPF program.
    Bpf(Program),
    /// TCP/UDP port fast path.
    Port(PortFilter),
    Closure(Box<dyn Fn(&[u8]) -> u32 + Send + Sync>),
}

impl Filter {
    pub fn from_fn(f: impl Fn(&[u8]) -> u32 + Send + Sync + 'static) -> Self {
        Filter::Closure(Box::new(f))
    }
}

impl PacketFilter for Filter {
    #[inline]
    fn filter(&self, pkt: &[u8]) -> u32 {
        match self {
            Filter::Bpf(prog) => prog.execute(pkt),
            Filter::Port(f) => f.filter(pkt),
            Filter::Closure(f) => f(pkt),
        }
    }

    fn filter_batch(&self, batch: &Batch<'_>, results: &mut Vec<u32>) {
        match self {
            Filter::Bpf(prog) => prog.execute_batch(batch, results),
            Filter::Port(f) => f.filter_batch(batch, results),
            Filter::Closure(f) => {
                results.clear();
                results.extend(batch.iter().map(|pkt| f(pkt)));
            }
        }
    }
}

impl From<Program> for Filter {
    fn from(prog: Program) -> Self {
        Filter::Bpf(prog)
    }
}

impl From<PortFilter> for Filter {
    fn from(f: PortFilter) -> Self {
        Filter::Port(f)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Bpf(prog) => f.debug_tuple("Bpf").field(&prog.len()).finish(),
            Filter::Port(p) => f.debug_tuple("Port").field(p).finish(),
            Filter::Closure(_) => f.write_str("Closure"),
        }
    }
}
