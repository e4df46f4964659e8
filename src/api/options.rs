//! Handle configuration and port descriptions.

use std::env;
use std::fmt;

use bitflags::bitflags;
use eui48::MacAddress;
use log::warn;

bitflags! {
    /// Header fields that feed the receive-side scaling hash.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RssFlags: u32 {
        const IP = 0x01;
        const SRC_PORT = 0x10;
        const DST_PORT = 0x20;
        const GTP = 0x40;
        const GRE = 0x80;
    }
}

bitflags! {
    /// Device open flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// Allow more than one process to open the port.
        const PSHARED = 0x1;
        /// Interpret the port number as a port mask.
        const AGGREGATE_PORTMASK = 0x2;
        /// Deliver every packet to every ring instead of spreading by RSS.
        const RX_DUPLICATE = 0x300;
    }
}

/// Options used when opening a device handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleOptions {
    /// Number of rings to allocate. 0 lets the driver choose.
    pub num_rings: u32,
    /// Data ring memory shared by all rings. Values below 1 MiB are read as
    /// megabytes; 0 lets the driver choose.
    pub data_ring_size: u64,
    pub flags: HandleFlags,
    pub rss: RssFlags,
    /// Application id used for multi-application duplication.
    pub app_id: Option<i32>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            num_rings: 0,
            data_ring_size: 0,
            flags: HandleFlags::empty(),
            rss: RssFlags::IP | RssFlags::SRC_PORT | RssFlags::DST_PORT,
            app_id: None,
        }
    }
}

impl HandleOptions {
    /// Defaults overridden by `SNF_NUM_RINGS`, `SNF_DATARING_SIZE`,
    /// `SNF_FLAGS` and `SNF_APP_ID`.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(n) = env_number("SNF_NUM_RINGS") {
            opts.num_rings = n as u32;
        }
        if let Some(n) = env_number("SNF_DATARING_SIZE") {
            opts.data_ring_size = n;
        }
        if let Some(n) = env_number("SNF_FLAGS") {
            opts.flags = HandleFlags::from_bits_retain(n as u32);
        }
        if let Some(n) = env_number("SNF_APP_ID") {
            opts.app_id = Some(n as i32);
        }
        opts
    }

    pub fn num_rings(mut self, n: u32) -> Self {
        self.num_rings = n;
        self
    }

    pub fn data_ring_size(mut self, size: u64) -> Self {
        self.data_ring_size = size;
        self
    }

    /// ORs `flags` into the current set.
    pub fn flags(mut self, flags: HandleFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn rss(mut self, rss: RssFlags) -> Self {
        self.rss = rss;
        self
    }

    pub fn app_id(mut self, id: i32) -> Self {
        self.app_id = Some(id);
        self
    }

    /// Data ring size in bytes, if one was requested.
    pub fn data_ring_bytes(&self) -> Option<u64> {
        match self.data_ring_size {
            0 => None,
            n if n < 1 << 20 => Some(n << 20),
            n => Some(n),
        }
    }
}

fn env_number(key: &str) -> Option<u64> {
    let val = env::var(key).ok()?;
    let parsed = match val.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => val.parse(),
    };
    match parsed {
        Ok(n) => Some(n),
        Err(e) => {
            warn!("ignoring {key}={val}: {e}");
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

/// A capture-capable port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IfAddr {
    /// Interface name, as in `ip link`.
    pub name: String,
    pub portnum: u32,
    pub max_rings: u32,
    pub mac: MacAddress,
    /// Maximum number of injection handles.
    pub max_inject: u32,
    pub link_state: LinkState,
    /// Link speed in bits per second.
    pub link_speed: u64,
}

impl fmt::Display for IfAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={},name={},hwaddr={},maxRings={},maxInject={},linkState={:?},linkSpeed={}",
            self.portnum,
            self.name,
            self.mac.to_hex_string(),
            self.max_rings,
            self.max_inject,
            self.link_state,
            self.link_speed
        )
    }
}

/// Returns `(linkup, valid)` port masks; bit N stands for port N.
pub fn port_mask(ifaddrs: &[IfAddr]) -> (u32, u32) {
    ifaddrs.iter().fold((0, 0), |(up, valid), ifa| {
        let bit = 1u32.checked_shl(ifa.portnum).unwrap_or(0);
        let up = if ifa.link_state == LinkState::Up { up | bit } else { up };
        (up, valid | bit)
    })
}
