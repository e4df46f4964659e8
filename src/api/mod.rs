//! Driver-facing interface and the value types shared by every backend.

mod driver;
mod metadata;
mod options;
mod timeout;

pub use driver::{Driver, HandleId, InjectId, RingId};
pub use metadata::{Meta, RecvDesc, RingQInfo};
pub use options::{HandleFlags, HandleOptions, IfAddr, LinkState, RssFlags, port_mask};
pub use timeout::Timeout;

pub type Result<T> = std::result::Result<T, crate::errors::Error>;

/// Largest frame accepted by the injection path.
pub const MAX_INJECT_LEN: usize = 9000;

/// Returns the capture port whose interface name is `name`.
pub fn find_ifaddr_by_name<'a>(ifaddrs: &'a [IfAddr], name: &str) -> Option<&'a IfAddr> {
    ifaddrs.iter().find(|i| i.name == name)
}

/// Returns the capture port owning `mac`.
pub fn find_ifaddr_by_mac<'a>(
    ifaddrs: &'a [IfAddr],
    mac: &eui48::MacAddress,
) -> Option<&'a IfAddr> {
    ifaddrs.iter().find(|i| &i.mac == mac)
}
