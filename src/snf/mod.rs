//! [`Driver`] over the vendor capture library, `libsnf`.
//!
//! Raw library handles never leave this module: handles, rings and injection
//! handles live in per-driver tables and the ids handed out are indices
//! into them.

mod ffi;

use std::ffi::CStr;
use std::ptr;
use std::sync::{Arc, OnceLock};

use eui48::MacAddress;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::api::{
    Driver, HandleId, HandleOptions, IfAddr, InjectId, LinkState, Meta, RecvDesc, Result, RingId,
    RingQInfo, Timeout,
};
use crate::errors::Error;
use ffi::*;

/// Maps a library return code to a result.
fn check(rc: i32) -> Result<()> {
    match rc {
        0 => Ok(()),
        rc => Err(Error::from_errno(rc.abs())),
    }
}

#[derive(Clone, Copy)]
struct Raw(*mut libc::c_void);

// Library handles may be used from any thread; a ring is only ever driven by
// the thread owning its `Ring`.
unsafe impl Send for Raw {}
unsafe impl Sync for Raw {}

/// Slots addressed by index. Freed slots are reused.
struct Table<T> {
    slots: Vec<Option<T>>,
}

impl<T: Clone> Table<T> {
    const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn insert(&mut self, val: T) -> u32 {
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = Some(val);
                i as u32
            }
            None => {
                self.slots.push(Some(val));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn get(&self, idx: u32) -> Result<T> {
        self.slots
            .get(idx as usize)
            .and_then(Clone::clone)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown id {idx}")))
    }

    fn remove(&mut self, idx: u32) -> Option<T> {
        self.slots.get_mut(idx as usize).and_then(Option::take)
    }
}

struct RingEntry {
    raw: Raw,
    /// Scratch space for bulk receives.
    reqs: Mutex<Vec<snf_recv_req>>,
}

static INIT: OnceLock<i32> = OnceLock::new();

/// The hardware driver.
///
/// Blocked receives are woken by process signals, not by
/// [`Driver::interrupt`]: pair cancellation with a finite timeout.
pub struct SnfDriver {
    handles: Mutex<Table<Raw>>,
    rings: Mutex<Table<Arc<RingEntry>>>,
    injects: Mutex<Table<Raw>>,
}

impl SnfDriver {
    /// Initialises the library once per process.
    pub fn new() -> Result<Self> {
        let driver = Self {
            handles: Mutex::new(Table::new()),
            rings: Mutex::new(Table::new()),
            injects: Mutex::new(Table::new()),
        };
        driver.init()?;
        Ok(driver)
    }

    fn ring(&self, ring: RingId) -> Result<Arc<RingEntry>> {
        self.rings.lock().get(ring.0)
    }

    fn inject(&self, inj: InjectId) -> Result<Raw> {
        self.injects.lock().get(inj.0)
    }
}

fn fragments(frags: &[&[u8]]) -> (Vec<snf_pkt_fragment>, u32) {
    let vec: Vec<_> = frags
        .iter()
        .map(|f| snf_pkt_fragment {
            ptr: f.as_ptr().cast(),
            length: f.len() as u32,
        })
        .collect();
    let hint = frags.iter().map(|f| f.len() as u32).sum();
    (vec, hint)
}

fn desc(req: &snf_recv_req) -> RecvDesc {
    let meta = Meta {
        length: req.length,
        timestamp: req.timestamp,
        portnum: req.portnum,
        length_data: req.length_data,
        hw_hash: req.hw_hash,
    };
    // SAFETY: the library keeps the packet mapped until its bytes are
    // returned, or until the next single receive on the ring.
    unsafe { RecvDesc::from_raw(req.pkt_addr as *const u8, meta) }
}

impl From<&snf_ring_qinfo> for RingQInfo {
    fn from(q: &snf_ring_qinfo) -> Self {
        Self {
            avail: q.q_avail,
            borrowed: q.q_borrowed,
            free: q.q_free,
        }
    }
}

impl Driver for SnfDriver {
    fn init(&self) -> Result<()> {
        let rc = *INIT.get_or_init(|| unsafe { snf_init(SNF_VERSION_API) });
        check(rc)
    }

    fn ifaddrs(&self) -> Result<Vec<IfAddr>> {
        let mut head: *mut snf_ifaddrs = ptr::null_mut();
        check(unsafe { snf_getifaddrs(&mut head) })?;
        let mut out = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            // SAFETY: the list stays valid until freed below.
            let ifa = unsafe { &*cur };
            let name = if ifa.snf_ifa_name.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(ifa.snf_ifa_name) }
                    .to_string_lossy()
                    .into_owned()
            };
            out.push(IfAddr {
                name,
                portnum: ifa.snf_ifa_portnum,
                max_rings: ifa.snf_ifa_maxrings.max(0) as u32,
                mac: MacAddress::new(ifa.snf_ifa_macaddr),
                max_inject: ifa.snf_ifa_maxinject.max(0) as u32,
                link_state: if ifa.snf_ifa_link_state == SNF_LINK_UP {
                    LinkState::Up
                } else {
                    LinkState::Down
                },
                link_speed: ifa.snf_ifa_link_speed,
            });
            cur = ifa.snf_ifa_next;
        }
        unsafe { snf_freeifaddrs(head) };
        Ok(out)
    }

    fn open_handle(&self, port: u32, opts: &HandleOptions) -> Result<HandleId> {
        if let Some(id) = opts.app_id {
            check(unsafe { snf_set_app_id(id) })?;
        }
        let rss = snf_rss_params {
            mode: SNF_RSS_FLAGS,
            params: snf_rss_union {
                rss_flags: opts.rss.bits() as i32,
            },
        };
        let mut dev = ptr::null_mut();
        check(unsafe {
            snf_open(
                port,
                opts.num_rings as i32,
                &rss,
                opts.data_ring_size as i64,
                opts.flags.bits() as i32,
                &mut dev,
            )
        })?;
        let id = self.handles.lock().insert(Raw(dev));
        debug!("snf: port {port} opened as handle {id}");
        Ok(HandleId(id))
    }

    fn start(&self, handle: HandleId) -> Result<()> {
        let dev = self.handles.lock().get(handle.0)?;
        check(unsafe { snf_start(dev.0) })
    }

    fn stop(&self, handle: HandleId) -> Result<()> {
        let dev = self.handles.lock().get(handle.0)?;
        check(unsafe { snf_stop(dev.0) })
    }

    fn close_handle(&self, handle: HandleId) -> Result<()> {
        let mut handles = self.handles.lock();
        let dev = handles.get(handle.0)?;
        check(unsafe { snf_close(dev.0) })?;
        handles.remove(handle.0);
        Ok(())
    }

    fn open_ring(&self, handle: HandleId, id: Option<u32>) -> Result<RingId> {
        let dev = self.handles.lock().get(handle.0)?;
        let mut raw = ptr::null_mut();
        let id = id.map_or(-1, |i| i as i32);
        check(unsafe { snf_ring_open_id(dev.0, id, &mut raw) })?;
        let entry = Arc::new(RingEntry {
            raw: Raw(raw),
            reqs: Mutex::new(Vec::new()),
        });
        Ok(RingId(self.rings.lock().insert(entry)))
    }

    fn close_ring(&self, ring: RingId) -> Result<()> {
        let mut rings = self.rings.lock();
        let entry = rings.get(ring.0)?;
        check(unsafe { snf_ring_close(entry.raw.0) })?;
        rings.remove(ring.0);
        Ok(())
    }

    fn recv_one(&self, ring: RingId, timeout: Timeout) -> Result<RecvDesc> {
        let entry = self.ring(ring)?;
        let mut req = snf_recv_req::default();
        check(unsafe { snf_ring_recv(entry.raw.0, timeout.as_millis(), &mut req) })?;
        Ok(desc(&req))
    }

    fn recv_many(
        &self,
        ring: RingId,
        timeout: Timeout,
        out: &mut Vec<RecvDesc>,
        max: usize,
    ) -> Result<RingQInfo> {
        let entry = self.ring(ring)?;
        let mut reqs = entry.reqs.lock();
        reqs.resize(max, snf_recv_req::default());
        let mut got = 0;
        let mut qinfo = snf_ring_qinfo::default();
        check(unsafe {
            snf_ring_recv_many(
                entry.raw.0,
                timeout.as_millis(),
                reqs.as_mut_ptr(),
                max as i32,
                &mut got,
                &mut qinfo,
            )
        })?;
        out.extend(reqs[..got.max(0) as usize].iter().map(desc));
        Ok(RingQInfo::from(&qinfo))
    }

    fn return_many(&self, ring: RingId, data_qlen: u64) -> Result<()> {
        let entry = self.ring(ring)?;
        let qlen = u32::try_from(data_qlen)
            .map_err(|_| Error::InvalidArgument(format!("return of {data_qlen} bytes")))?;
        check(unsafe { snf_ring_return_many(entry.raw.0, qlen, ptr::null_mut()) })
    }

    fn inject_open(&self, port: u32, flags: u32) -> Result<InjectId> {
        let mut raw = ptr::null_mut();
        check(unsafe { snf_inject_open(port as i32, flags as i32, &mut raw) })?;
        Ok(InjectId(self.injects.lock().insert(Raw(raw))))
    }

    fn inject_send(&self, inj: InjectId, timeout: Timeout, pkt: &[u8]) -> Result<()> {
        let raw = self.inject(inj)?;
        check(unsafe {
            snf_inject_send(
                raw.0,
                timeout.as_millis(),
                0,
                pkt.as_ptr().cast(),
                pkt.len() as u32,
            )
        })
    }

    fn inject_send_v(&self, inj: InjectId, timeout: Timeout, frags: &[&[u8]]) -> Result<()> {
        let raw = self.inject(inj)?;
        let (mut vec, hint) = fragments(frags);
        check(unsafe {
            snf_inject_send_v(
                raw.0,
                timeout.as_millis(),
                0,
                vec.as_mut_ptr(),
                vec.len() as i32,
                hint,
            )
        })
    }

    fn inject_sched(
        &self,
        inj: InjectId,
        timeout: Timeout,
        pkt: &[u8],
        delay_ns: u64,
    ) -> Result<()> {
        let raw = self.inject(inj)?;
        check(unsafe {
            snf_inject_sched(
                raw.0,
                timeout.as_millis(),
                0,
                pkt.as_ptr().cast(),
                pkt.len() as u32,
                delay_ns,
            )
        })
    }

    fn inject_sched_v(
        &self,
        inj: InjectId,
        timeout: Timeout,
        frags: &[&[u8]],
        delay_ns: u64,
    ) -> Result<()> {
        let raw = self.inject(inj)?;
        let (mut vec, hint) = fragments(frags);
        check(unsafe {
            snf_inject_sched_v(
                raw.0,
                timeout.as_millis(),
                0,
                vec.as_mut_ptr(),
                vec.len() as i32,
                hint,
                delay_ns,
            )
        })
    }

    fn inject_close(&self, inj: InjectId) -> Result<()> {
        let mut injects = self.injects.lock();
        let raw = injects.get(inj.0)?;
        check(unsafe { snf_inject_close(raw.0) })?;
        injects.remove(inj.0);
        Ok(())
    }
}

impl Drop for SnfDriver {
    fn drop(&mut self) {
        let left = self.rings.get_mut().slots.iter().flatten().count()
            + self.handles.get_mut().slots.iter().flatten().count();
        if left > 0 {
            warn!("snf: driver dropped with {left} handles or rings open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_reuses_slots() {
        let mut t = Table::new();
        assert_eq!(t.insert('a'), 0);
        assert_eq!(t.insert('b'), 1);
        assert_eq!(t.remove(0), Some('a'));
        assert!(t.get(0).is_err());
        assert_eq!(t.insert('c'), 0);
        assert_eq!(t.get(1).unwrap(), 'b');
        assert_eq!(t.remove(7), None);
    }

    #[test]
    fn test_check() {
        assert!(check(0).is_ok());
        assert!(check(libc::EAGAIN).unwrap_err().is_would_block());
        assert!(check(-libc::EBUSY).unwrap_err().is_busy());
    }

    #[test]
    fn test_desc_from_req() {
        let buf = [7u8; 60];
        let req = snf_recv_req {
            pkt_addr: buf.as_ptr() as *mut _,
            length: 60,
            timestamp: 42,
            portnum: 1,
            length_data: 64,
            hw_hash: 9,
        };
        let d = desc(&req);
        assert_eq!(d.len(), 60);
        assert_eq!(d.length_data(), 64);
        assert_eq!(d.meta().timestamp, 42);
        assert_eq!(d.as_ptr(), buf.as_ptr());
    }
}
