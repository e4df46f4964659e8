//! Zero-copy packet capture over kernel-bypass NICs.
//!
//! A [`Handle`] opens a port; each of its [`Ring`]s is drained by one thread
//! through a [`Receiver`], which borrows packets in bulk, hands them out one
//! at a time and gives the memory back on the next reload. Filters attach to
//! receivers: a TCP/UDP [port filter](filter::tcp_port_filter) or a compiled
//! [BPF program](bpf::compile).

pub mod api;
pub mod bpf;
pub mod errors;
pub mod filter;
pub mod handle;
pub mod inject;
pub mod lifecycle;
pub mod mem;
pub mod receiver;
pub mod ring;
#[cfg(feature = "snf")]
pub mod snf;

pub use api::{Driver, HandleFlags, HandleOptions, IfAddr, Meta, Result, RssFlags, Timeout};
pub use errors::Error;
pub use filter::{Filter, PacketFilter};
pub use handle::{Handle, Ring};
pub use inject::{InjectHandle, Sender};
pub use lifecycle::{Canceller, State};
pub use mem::MemDriver;
pub use receiver::Receiver;
