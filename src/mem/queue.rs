use std::collections::VecDeque;

use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer};

use crate::api::{Meta, RecvDesc, RingQInfo};

/// Ring memory is handed out in multiples of this.
pub(super) const DATA_ALIGN: u32 = 64;
/// Upper bound on the packet slots of one ring.
const MAX_SLOTS: usize = 1 << 14;

pub(super) struct Packet {
    data: Box<[u8]>,
    meta: Meta,
}

impl Packet {
    pub(super) fn new(data: &[u8], mut meta: Meta) -> Self {
        meta.length = data.len() as u32;
        meta.length_data = (data.len() as u32).div_ceil(DATA_ALIGN).max(1) * DATA_ALIGN;
        Self {
            data: data.into(),
            meta,
        }
    }

    fn length_data(&self) -> u64 {
        self.meta.length_data as u64
    }

    fn desc(&self) -> RecvDesc {
        // SAFETY: the boxed bytes do not move when the packet does, and the
        // packet is kept in `borrowed` or `single` until given back.
        unsafe { RecvDesc::from_raw(self.data.as_ptr(), self.meta) }
    }
}

/// Packets of one ring: waiting, borrowed in bulk, or held by a single
/// receive.
pub(super) struct RingQueue {
    pending: HeapRb<Packet>,
    pending_bytes: u64,
    borrowed: VecDeque<Packet>,
    borrowed_bytes: u64,
    single: Option<Packet>,
    capacity: u64,
    pub(super) dropped: u64,
    /// Set by an interrupt, consumed by the next blocked receive.
    pub(super) interrupted: bool,
}

impl RingQueue {
    pub(super) fn new(capacity: u64) -> Self {
        let slots = (capacity / DATA_ALIGN as u64).clamp(1, MAX_SLOTS as u64) as usize;
        Self {
            pending: HeapRb::new(slots),
            pending_bytes: 0,
            borrowed: VecDeque::new(),
            borrowed_bytes: 0,
            single: None,
            capacity,
            dropped: 0,
            interrupted: false,
        }
    }

    pub(super) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(super) fn borrowed_bytes(&self) -> u64 {
        self.borrowed_bytes
    }

    /// Queues `pkt`, dropping it if the ring is out of memory.
    pub(super) fn push(&mut self, pkt: Packet) -> bool {
        let need = pkt.length_data();
        if self.pending_bytes + self.borrowed_bytes + need > self.capacity {
            self.dropped += 1;
            return false;
        }
        if self.pending.try_push(pkt).is_err() {
            self.dropped += 1;
            return false;
        }
        self.pending_bytes += need;
        true
    }

    /// The packet of the previous single receive is released by the next
    /// receive of either kind.
    pub(super) fn release_single(&mut self) {
        self.single = None;
    }

    pub(super) fn recv_one(&mut self) -> Option<RecvDesc> {
        let pkt = self.pending.try_pop()?;
        self.pending_bytes -= pkt.length_data();
        let desc = pkt.desc();
        self.single = Some(pkt);
        Some(desc)
    }

    pub(super) fn recv_many(&mut self, out: &mut Vec<RecvDesc>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            let Some(pkt) = self.pending.try_pop() else {
                break;
            };
            self.pending_bytes -= pkt.length_data();
            self.borrowed_bytes += pkt.length_data();
            out.push(pkt.desc());
            self.borrowed.push_back(pkt);
            n += 1;
        }
        n
    }

    /// Gives back the oldest borrowed packets covering `bytes`. Returns
    /// false if more was returned than borrowed.
    pub(super) fn give_back(&mut self, bytes: u64) -> bool {
        if bytes > self.borrowed_bytes {
            return false;
        }
        let mut left = bytes;
        while let Some(front) = self.borrowed.front() {
            let len = front.length_data();
            if len > left {
                break;
            }
            left -= len;
            self.borrowed_bytes -= len;
            self.borrowed.pop_front();
        }
        true
    }

    pub(super) fn qinfo(&self) -> RingQInfo {
        let used = self.pending_bytes + self.borrowed_bytes;
        RingQInfo {
            avail: self.pending_bytes as usize,
            borrowed: self.borrowed_bytes as usize,
            free: self.capacity.saturating_sub(used) as usize,
        }
    }
}
