//! A [`Driver`] living entirely in process memory.
//!
//! Packets enter through [`MemDriver::push`] or through injection, which
//! loops back into the receive rings of a port. Everything else behaves like
//! a capture card: rings only fill after `start`, borrowed memory counts
//! against the data ring until returned, and a full ring drops.

mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use eui48::MacAddress;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::api::{
    Driver, HandleFlags, HandleId, HandleOptions, IfAddr, InjectId, LinkState, Meta, RecvDesc,
    Result, RingId, RingQInfo, RssFlags, Timeout,
};
use crate::errors::Error;
use crate::filter::l4::flow_fields;
use queue::{Packet, RingQueue};

/// Data ring memory of a handle when none is requested.
const DEFAULT_DATA_RING: u64 = 16 << 20;

/// A simulated port.
#[derive(Clone, Debug)]
pub struct PortConfig {
    pub name: String,
    pub mac: MacAddress,
    pub max_rings: u32,
    pub max_inject: u32,
    pub link_state: LinkState,
    pub link_speed: u64,
    /// Port that receives what is injected here.
    pub loopback: Option<u32>,
}

impl PortConfig {
    /// `memN` with a ring per CPU (at least 8), looped back onto itself.
    pub fn new(portnum: u32) -> Self {
        let mut mac = [0x02, 0, 0, 0, 0, 0];
        mac[2..].copy_from_slice(&portnum.to_be_bytes());
        Self {
            name: format!("mem{portnum}"),
            mac: MacAddress::new(mac),
            max_rings: num_cpus::get().max(8) as u32,
            max_inject: 4,
            link_state: LinkState::Up,
            link_speed: 10_000_000_000,
            loopback: Some(portnum),
        }
    }

    pub fn max_rings(mut self, n: u32) -> Self {
        self.max_rings = n;
        self
    }

    pub fn max_inject(mut self, n: u32) -> Self {
        self.max_inject = n;
        self
    }

    pub fn loopback(mut self, port: Option<u32>) -> Self {
        self.loopback = port;
        self
    }

    pub fn link_state(mut self, state: LinkState) -> Self {
        self.link_state = state;
        self
    }
}

struct RingSlot {
    handle: HandleId,
    port: u32,
    index: u32,
    queue: Mutex<RingQueue>,
    ready: Condvar,
}

struct HandleEntry {
    port: u32,
    opts: HandleOptions,
    started: bool,
    /// Open ring per ring index.
    rings: Vec<Option<Arc<RingSlot>>>,
    ring_capacity: u64,
}

#[derive(Default)]
struct Registry {
    next_id: u32,
    handles: HashMap<HandleId, HandleEntry>,
    rings: HashMap<RingId, Arc<RingSlot>>,
    injects: HashMap<InjectId, u32>,
}

impl Registry {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn handle(&mut self, h: HandleId) -> Result<&mut HandleEntry> {
        self.handles
            .get_mut(&h)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown handle {}", h.0)))
    }
}

/// In-memory capture driver.
///
/// ```ignore
/// let driver = Arc::new(MemDriver::with_ports(1));
/// let handle = Handle::open(driver.clone(), 0, &HandleOptions::default())?;
/// handle.start()?;
/// driver.push(0, &frame)?;
/// ```
pub struct MemDriver {
    ports: Vec<PortConfig>,
    reg: Mutex<Registry>,
    /// Last timestamp handed out, to keep them strictly increasing.
    clock: AtomicU64,
    return_calls: AtomicU64,
}

impl MemDriver {
    pub fn new(ports: Vec<PortConfig>) -> Self {
        Self {
            ports,
            reg: Mutex::new(Registry::default()),
            clock: AtomicU64::new(0),
            return_calls: AtomicU64::new(0),
        }
    }

    /// `n` ports with default settings.
    pub fn with_ports(n: u32) -> Self {
        Self::new((0..n).map(PortConfig::new).collect())
    }

    fn port(&self, port: u32) -> Result<&PortConfig> {
        self.ports.get(port as usize).ok_or(Error::NoDevice(port))
    }

    fn slot(&self, ring: RingId) -> Result<Arc<RingSlot>> {
        self.reg
            .lock()
            .rings
            .get(&ring)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown ring {}", ring.0)))
    }

    fn timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        let prev = self
            .clock
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// Delivers `pkt` as if it arrived on `port`. Only started handles see
    /// it; a full ring drops it.
    pub fn push(&self, port: u32, pkt: &[u8]) -> Result<()> {
        self.port(port)?;
        let ts = self.timestamp();
        let reg = self.reg.lock();
        for entry in reg.handles.values().filter(|e| e.port == port && e.started) {
            let hash = rss_hash(entry.opts.rss, pkt);
            let meta = Meta {
                timestamp: ts,
                portnum: port,
                hw_hash: hash,
                ..Meta::default()
            };
            let duplicate = entry.opts.flags.contains(HandleFlags::RX_DUPLICATE);
            let n = entry.rings.len() as u32;
            for (i, slot) in entry.rings.iter().enumerate() {
                let Some(slot) = slot else { continue };
                if !duplicate && hash % n != i as u32 {
                    continue;
                }
                let mut q = slot.queue.lock();
                if q.push(Packet::new(pkt, meta)) {
                    slot.ready.notify_one();
                } else {
                    trace!("port {port}: ring {} full, dropped", slot.index);
                }
            }
        }
        Ok(())
    }

    /// Bytes currently borrowed from ring `index` of the first handle open
    /// on `port`. 0 if there is no such ring.
    pub fn ring_borrowed(&self, port: u32, index: u32) -> u64 {
        self.with_ring(port, index, |q| q.borrowed_bytes())
    }

    /// Packets ring `index` on `port` dropped for lack of memory.
    pub fn ring_dropped(&self, port: u32, index: u32) -> u64 {
        self.with_ring(port, index, |q| q.dropped)
    }

    fn with_ring(&self, port: u32, index: u32, f: impl Fn(&RingQueue) -> u64) -> u64 {
        let reg = self.reg.lock();
        reg.rings
            .values()
            .find(|s| s.port == port && s.index == index)
            .map_or(0, |s| f(&s.queue.lock()))
    }

    /// Number of `return_many` calls served so far.
    pub fn return_calls(&self) -> u64 {
        self.return_calls.load(Ordering::Relaxed)
    }

    /// Waits until `slot` has a packet, the timeout expires or the handle is
    /// interrupted.
    fn wait_ready<'a>(
        slot: &'a RingSlot,
        timeout: Timeout,
    ) -> Result<parking_lot::MutexGuard<'a, RingQueue>> {
        let mut q = slot.queue.lock();
        q.release_single();
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        while !q.has_pending() {
            if q.interrupted {
                q.interrupted = false;
                return Err(Error::Interrupted);
            }
            match deadline {
                None => slot.ready.wait(&mut q),
                Some(deadline) => {
                    if slot.ready.wait_until(&mut q, deadline).timed_out() && !q.has_pending() {
                        if q.interrupted {
                            q.interrupted = false;
                            return Err(Error::Interrupted);
                        }
                        return Err(Error::WouldBlock);
                    }
                }
            }
        }
        Ok(q)
    }
}

/// Flow hash over the fields selected by `rss`, symmetric in direction.
fn rss_hash(rss: RssFlags, pkt: &[u8]) -> u32 {
    let Some((src, dst, sport, dport)) = flow_fields(pkt) else {
        return 0;
    };
    let mut h = 0u32;
    if rss.contains(RssFlags::IP) {
        h ^= u32::from_be_bytes(src) ^ u32::from_be_bytes(dst);
    }
    if rss.contains(RssFlags::SRC_PORT) {
        h ^= sport as u32;
    }
    if rss.contains(RssFlags::DST_PORT) {
        h ^= dport as u32;
    }
    h = h.wrapping_mul(0x9e37_79b1);
    h ^ (h >> 16)
}

impl Driver for MemDriver {
    fn ifaddrs(&self) -> Result<Vec<IfAddr>> {
        Ok(self
            .ports
            .iter()
            .enumerate()
            .map(|(i, p)| IfAddr {
                name: p.name.clone(),
                portnum: i as u32,
                max_rings: p.max_rings,
                mac: p.mac,
                max_inject: p.max_inject,
                link_state: p.link_state,
                link_speed: p.link_speed,
            })
            .collect())
    }

    fn open_handle(&self, port: u32, opts: &HandleOptions) -> Result<HandleId> {
        let cfg = self.port(port)?;
        let num_rings = opts.num_rings.max(1);
        if num_rings > cfg.max_rings {
            return Err(Error::InvalidArgument(format!(
                "{num_rings} rings requested, port {port} has {}",
                cfg.max_rings
            )));
        }
        let mut reg = self.reg.lock();
        let shared = opts.flags.contains(HandleFlags::PSHARED);
        let conflict = reg
            .handles
            .values()
            .any(|e| e.port == port && !(shared && e.opts.flags.contains(HandleFlags::PSHARED)));
        if conflict {
            return Err(Error::Busy("port opened exclusively"));
        }
        let data_ring = opts.data_ring_bytes().unwrap_or(DEFAULT_DATA_RING);
        let id = HandleId(reg.next_id());
        reg.handles.insert(
            id,
            HandleEntry {
                port,
                opts: opts.clone(),
                started: false,
                rings: vec![None; num_rings as usize],
                ring_capacity: data_ring / num_rings as u64,
            },
        );
        debug!("port {port}: handle {} with {num_rings} rings", id.0);
        Ok(id)
    }

    fn start(&self, handle: HandleId) -> Result<()> {
        self.reg.lock().handle(handle)?.started = true;
        Ok(())
    }

    fn stop(&self, handle: HandleId) -> Result<()> {
        self.reg.lock().handle(handle)?.started = false;
        Ok(())
    }

    fn close_handle(&self, handle: HandleId) -> Result<()> {
        let mut reg = self.reg.lock();
        if reg.handle(handle)?.rings.iter().any(Option::is_some) {
            return Err(Error::Busy("rings still open"));
        }
        reg.handles.remove(&handle);
        Ok(())
    }

    fn open_ring(&self, handle: HandleId, id: Option<u32>) -> Result<RingId> {
        let mut reg = self.reg.lock();
        let ring = RingId(reg.next_id());
        let entry = reg.handle(handle)?;
        let index = match id {
            Some(i) if i as usize >= entry.rings.len() => {
                return Err(Error::InvalidArgument(format!("no ring {i}")));
            }
            Some(i) if entry.rings[i as usize].is_some() => {
                return Err(Error::Busy("ring already open"));
            }
            Some(i) => i as usize,
            None => entry
                .rings
                .iter()
                .position(Option::is_none)
                .ok_or(Error::Busy("no free ring"))?,
        };
        let slot = Arc::new(RingSlot {
            handle,
            port: entry.port,
            index: index as u32,
            queue: Mutex::new(RingQueue::new(entry.ring_capacity)),
            ready: Condvar::new(),
        });
        entry.rings[index] = Some(slot.clone());
        reg.rings.insert(ring, slot);
        Ok(ring)
    }

    fn close_ring(&self, ring: RingId) -> Result<()> {
        let mut reg = self.reg.lock();
        let slot = reg
            .rings
            .remove(&ring)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown ring {}", ring.0)))?;
        if let Some(entry) = reg.handles.get_mut(&slot.handle) {
            entry.rings[slot.index as usize] = None;
        }
        Ok(())
    }

    fn recv_one(&self, ring: RingId, timeout: Timeout) -> Result<RecvDesc> {
        let slot = self.slot(ring)?;
        let mut q = Self::wait_ready(&slot, timeout)?;
        q.recv_one().ok_or(Error::WouldBlock)
    }

    fn recv_many(
        &self,
        ring: RingId,
        timeout: Timeout,
        out: &mut Vec<RecvDesc>,
        max: usize,
    ) -> Result<RingQInfo> {
        let slot = self.slot(ring)?;
        let mut q = Self::wait_ready(&slot, timeout)?;
        q.recv_many(out, max);
        Ok(q.qinfo())
    }

    fn return_many(&self, ring: RingId, data_qlen: u64) -> Result<()> {
        let slot = self.slot(ring)?;
        self.return_calls.fetch_add(1, Ordering::Relaxed);
        if !slot.queue.lock().give_back(data_qlen) {
            return Err(Error::InvalidArgument(format!(
                "returning {data_qlen} bytes, more than borrowed"
            )));
        }
        Ok(())
    }

    fn interrupt(&self, handle: HandleId) -> Result<()> {
        let reg = self.reg.lock();
        let entry = reg
            .handles
            .get(&handle)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown handle {}", handle.0)))?;
        for slot in entry.rings.iter().flatten() {
            slot.queue.lock().interrupted = true;
            slot.ready.notify_all();
        }
        Ok(())
    }

    fn inject_open(&self, port: u32, _flags: u32) -> Result<InjectId> {
        let cfg = self.port(port)?;
        let mut reg = self.reg.lock();
        let open = reg.injects.values().filter(|&&p| p == port).count();
        if open >= cfg.max_inject as usize {
            return Err(Error::Busy("no free injection handle"));
        }
        let id = InjectId(reg.next_id());
        reg.injects.insert(id, port);
        Ok(id)
    }

    fn inject_send(&self, inj: InjectId, _timeout: Timeout, pkt: &[u8]) -> Result<()> {
        let port = self
            .reg
            .lock()
            .injects
            .get(&inj)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown injection handle {}", inj.0)))?;
        match self.port(port)?.loopback {
            Some(target) => self.push(target, pkt),
            None => Ok(()),
        }
    }

    fn inject_send_v(&self, inj: InjectId, timeout: Timeout, frags: &[&[u8]]) -> Result<()> {
        self.inject_send(inj, timeout, &frags.concat())
    }

    /// The delay is not simulated.
    fn inject_sched(
        &self,
        inj: InjectId,
        timeout: Timeout,
        pkt: &[u8],
        _delay_ns: u64,
    ) -> Result<()> {
        self.inject_send(inj, timeout, pkt)
    }

    fn inject_sched_v(
        &self,
        inj: InjectId,
        timeout: Timeout,
        frags: &[&[u8]],
        _delay_ns: u64,
    ) -> Result<()> {
        self.inject_send(inj, timeout, &frags.concat())
    }

    fn inject_close(&self, inj: InjectId) -> Result<()> {
        self.reg
            .lock()
            .injects
            .remove(&inj)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown injection handle {}", inj.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::l4::tests::{TCP_PACKET, UDP_PACKET};
    use std::thread;
    use std::time::Duration;

    fn open(d: &MemDriver, opts: &HandleOptions) -> HandleId {
        let h = d.open_handle(0, opts).unwrap();
        d.start(h).unwrap();
        h
    }

    #[test]
    fn test_ifaddrs() {
        let d = MemDriver::with_ports(2);
        let ifs = d.ifaddrs().unwrap();
        assert_eq!(ifs.len(), 2);
        assert_eq!(ifs[1].name, "mem1");
        assert_eq!(ifs[1].portnum, 1);
        assert_eq!(ifs[1].mac.to_hex_string(), "02:00:00:00:00:01");
        assert!(matches!(d.open_handle(2, &HandleOptions::default()), Err(Error::NoDevice(2))));
    }

    #[test]
    fn test_not_started_drops() {
        let d = MemDriver::with_ports(1);
        let h = d.open_handle(0, &HandleOptions::default()).unwrap();
        let r = d.open_ring(h, None).unwrap();
        d.push(0, &TCP_PACKET).unwrap();
        let mut out = Vec::new();
        assert!(d.recv_many(r, Timeout::Millis(1), &mut out, 4).unwrap_err().is_would_block());
        d.start(h).unwrap();
        d.push(0, &TCP_PACKET).unwrap();
        assert_eq!(d.recv_many(r, Timeout::Millis(1), &mut out, 4).unwrap().borrowed, 128);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_exclusive_open() {
        let d = MemDriver::with_ports(1);
        let _h = d.open_handle(0, &HandleOptions::default()).unwrap();
        let shared = HandleOptions::default().flags(HandleFlags::PSHARED);
        assert!(d.open_handle(0, &shared).unwrap_err().is_busy());

        let d = MemDriver::with_ports(1);
        d.open_handle(0, &shared).unwrap();
        d.open_handle(0, &shared).unwrap();
        assert!(d.open_handle(0, &HandleOptions::default()).unwrap_err().is_busy());
    }

    #[test]
    fn test_rss_keeps_flows_together() {
        let d = MemDriver::with_ports(1);
        let h = open(&d, &HandleOptions::default().num_rings(2));
        let r0 = d.open_ring(h, Some(0)).unwrap();
        let r1 = d.open_ring(h, Some(1)).unwrap();
        for _ in 0..4 {
            d.push(0, &TCP_PACKET).unwrap();
        }
        let mut out = Vec::new();
        let got = [r0, r1].map(|r| {
            let before = out.len();
            let _ = d.recv_many(r, Timeout::Millis(1), &mut out, 8);
            out.len() - before
        });
        assert!(got == [4, 0] || got == [0, 4], "{got:?}");
        let hash = rss_hash(HandleOptions::default().rss, &TCP_PACKET);
        assert!(out.iter().all(|desc| desc.meta().hw_hash == hash));
    }

    #[test]
    fn test_rss_is_symmetric() {
        let mut reply = TCP_PACKET;
        reply[26..30].copy_from_slice(&TCP_PACKET[30..34]);
        reply[30..34].copy_from_slice(&TCP_PACKET[26..30]);
        reply[34..36].copy_from_slice(&TCP_PACKET[36..38]);
        reply[36..38].copy_from_slice(&TCP_PACKET[34..36]);
        let rss = HandleOptions::default().rss;
        assert_eq!(rss_hash(rss, &TCP_PACKET), rss_hash(rss, &reply));
        assert_eq!(rss_hash(rss, &[0; 10]), 0);
    }

    #[test]
    fn test_rx_duplicate() {
        let d = MemDriver::with_ports(1);
        let opts = HandleOptions::default()
            .num_rings(2)
            .flags(HandleFlags::RX_DUPLICATE);
        let h = open(&d, &opts);
        let rings = [d.open_ring(h, None).unwrap(), d.open_ring(h, None).unwrap()];
        d.push(0, &UDP_PACKET).unwrap();
        for r in rings {
            let desc = d.recv_one(r, Timeout::Millis(1)).unwrap();
            assert_eq!(desc.len(), UDP_PACKET.len());
        }
    }

    #[test]
    fn test_interrupt_wakes_blocked_receive() {
        let d = Arc::new(MemDriver::with_ports(1));
        let h = open(&d, &HandleOptions::default());
        let r = d.open_ring(h, None).unwrap();
        let waiter = {
            let d = d.clone();
            thread::spawn(move || {
                let mut out = Vec::new();
                d.recv_many(r, Timeout::Infinite, &mut out, 1).map(|_| ())
            })
        };
        thread::sleep(Duration::from_millis(20));
        d.interrupt(h).unwrap();
        let res = waiter.join().unwrap();
        assert!(matches!(res, Err(Error::Interrupted)));
    }

    #[test]
    fn test_infinite_wakes_on_data() {
        let d = Arc::new(MemDriver::with_ports(1));
        let h = open(&d, &HandleOptions::default());
        let r = d.open_ring(h, None).unwrap();
        let waiter = {
            let d = d.clone();
            thread::spawn(move || d.recv_one(r, Timeout::Infinite).map(|desc| desc.len()))
        };
        thread::sleep(Duration::from_millis(20));
        d.push(0, &UDP_PACKET).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), UDP_PACKET.len());
    }

    #[test]
    fn test_return_more_than_borrowed() {
        let d = MemDriver::with_ports(1);
        let h = open(&d, &HandleOptions::default());
        let r = d.open_ring(h, None).unwrap();
        d.push(0, &UDP_PACKET).unwrap();
        let mut out = Vec::new();
        d.recv_many(r, Timeout::Millis(1), &mut out, 4).unwrap();
        assert!(d.return_many(r, 1 << 20).is_err());
        d.return_many(r, 128).unwrap();
        assert_eq!(d.ring_borrowed(0, 0), 0);
    }

    #[test]
    fn test_timestamps_increase() {
        let d = MemDriver::with_ports(1);
        let h = open(&d, &HandleOptions::default());
        let r = d.open_ring(h, None).unwrap();
        for _ in 0..16 {
            d.push(0, &UDP_PACKET).unwrap();
        }
        let mut out = Vec::new();
        d.recv_many(r, Timeout::Millis(1), &mut out, 16).unwrap();
        assert!(out.windows(2).all(|w| w[0].meta().timestamp < w[1].meta().timestamp));
    }

    #[test]
    fn test_close_handle_with_rings() {
        let d = MemDriver::with_ports(1);
        let h = open(&d, &HandleOptions::default());
        let r = d.open_ring(h, None).unwrap();
        assert!(d.close_handle(h).unwrap_err().is_busy());
        d.close_ring(r).unwrap();
        d.close_handle(h).unwrap();
        assert!(d.close_handle(h).is_err());
    }

    #[test]
    fn test_inject_limits() {
        let d = MemDriver::new(vec![PortConfig::new(0).max_inject(1).loopback(None)]);
        let inj = d.inject_open(0, 0).unwrap();
        assert!(d.inject_open(0, 0).unwrap_err().is_busy());
        d.inject_send(inj, Timeout::Millis(1), &TCP_PACKET).unwrap();
        d.inject_close(inj).unwrap();
        assert!(d.inject_close(inj).is_err());
    }
}
