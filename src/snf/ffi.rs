//! Declarations from `snf.h`.
#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_void};

pub(super) const SNF_VERSION_API: u16 = 8;

pub(super) const SNF_RSS_FLAGS: c_int = 0;

pub(super) const SNF_LINK_UP: c_int = 1;

pub(super) type snf_handle_t = *mut c_void;
pub(super) type snf_ring_t = *mut c_void;
pub(super) type snf_inject_t = *mut c_void;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(super) struct snf_recv_req {
    pub pkt_addr: *mut c_void,
    pub length: u32,
    pub timestamp: u64,
    pub portnum: u32,
    pub length_data: u32,
    pub hw_hash: u32,
}

// Only the scratch vector of a ring moves between threads; the pointee is
// ring memory owned by the library.
unsafe impl Send for snf_recv_req {}

impl Default for snf_recv_req {
    fn default() -> Self {
        Self {
            pkt_addr: std::ptr::null_mut(),
            length: 0,
            timestamp: 0,
            portnum: 0,
            length_data: 0,
            hw_hash: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct snf_ring_qinfo {
    pub q_avail: usize,
    pub q_borrowed: usize,
    pub q_free: usize,
}

#[repr(C)]
pub(super) struct snf_ifaddrs {
    pub snf_ifa_next: *mut snf_ifaddrs,
    pub snf_ifa_name: *const c_char,
    pub snf_ifa_portnum: u32,
    pub snf_ifa_maxrings: c_int,
    pub snf_ifa_macaddr: [u8; 6],
    _pad: [u8; 2],
    pub snf_ifa_maxinject: c_int,
    pub snf_ifa_link_state: c_int,
    pub snf_ifa_link_speed: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct snf_rss_hash_fn {
    pub hash_fn: *mut c_void,
    pub context: *mut c_void,
}

#[repr(C)]
pub(super) union snf_rss_union {
    pub rss_flags: c_int,
    pub rss_fn: snf_rss_hash_fn,
}

#[repr(C)]
pub(super) struct snf_rss_params {
    pub mode: c_int,
    pub params: snf_rss_union,
}

#[repr(C)]
pub(super) struct snf_pkt_fragment {
    pub ptr: *const c_void,
    pub length: u32,
}

#[link(name = "snf")]
unsafe extern "C" {
    pub(super) fn snf_init(api_version: u16) -> c_int;
    pub(super) fn snf_set_app_id(id: c_int) -> c_int;
    pub(super) fn snf_getifaddrs(ifaddrs_o: *mut *mut snf_ifaddrs) -> c_int;
    pub(super) fn snf_freeifaddrs(ifaddrs: *mut snf_ifaddrs);
    pub(super) fn snf_open(
        portnum: u32,
        num_rings: c_int,
        rss_params: *const snf_rss_params,
        dataring_sz: i64,
        flags: c_int,
        devhandle: *mut snf_handle_t,
    ) -> c_int;
    pub(super) fn snf_start(devhandle: snf_handle_t) -> c_int;
    pub(super) fn snf_stop(devhandle: snf_handle_t) -> c_int;
    pub(super) fn snf_close(devhandle: snf_handle_t) -> c_int;
    pub(super) fn snf_ring_open_id(
        devhandle: snf_handle_t,
        ring_id: c_int,
        ringh: *mut snf_ring_t,
    ) -> c_int;
    pub(super) fn snf_ring_close(ringh: snf_ring_t) -> c_int;
    pub(super) fn snf_ring_recv(
        ringh: snf_ring_t,
        timeout_ms: c_int,
        recv_req: *mut snf_recv_req,
    ) -> c_int;
    pub(super) fn snf_ring_recv_many(
        ring: snf_ring_t,
        timeout_ms: c_int,
        req_vector: *mut snf_recv_req,
        nreq_in: c_int,
        nreq_out: *mut c_int,
        qinfo: *mut snf_ring_qinfo,
    ) -> c_int;
    pub(super) fn snf_ring_return_many(
        ring: snf_ring_t,
        data_qlen: u32,
        qinfo: *mut snf_ring_qinfo,
    ) -> c_int;
    pub(super) fn snf_inject_open(portnum: c_int, flags: c_int, handle: *mut snf_inject_t)
    -> c_int;
    pub(super) fn snf_inject_send(
        inj: snf_inject_t,
        timeout_ms: c_int,
        flags: c_int,
        pkt: *const c_void,
        length: u32,
    ) -> c_int;
    pub(super) fn snf_inject_sched(
        inj: snf_inject_t,
        timeout_ms: c_int,
        flags: c_int,
        pkt: *const c_void,
        length: u32,
        delay_ns: u64,
    ) -> c_int;
    pub(super) fn snf_inject_send_v(
        inj: snf_inject_t,
        timeout_ms: c_int,
        flags: c_int,
        frags_vec: *mut snf_pkt_fragment,
        nfrags: c_int,
        length_hint: u32,
    ) -> c_int;
    pub(super) fn snf_inject_sched_v(
        inj: snf_inject_t,
        timeout_ms: c_int,
        flags: c_int,
        frags_vec: *mut snf_pkt_fragment,
        nfrags: c_int,
        length_hint: u32,
        delay_ns: u64,
    ) -> c_int;
    pub(super) fn snf_inject_close(inj: snf_inject_t) -> c_int;
}
