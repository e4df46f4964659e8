//! Header peeling for the TCP/UDP port fast path.
//!
//! Every `peel_*` function looks at the start of `p` and returns the length
//! of the header found there, or `None` if `p` can't hold a well-formed one.
//! Field accessors assume the header was peeled first.

use super::PacketFilter;

pub const ETHERNET_HDR_LEN: usize = 14;
pub const VLAN_HDR_LEN: usize = 4;
pub const MPLS_HDR_LEN: usize = 4;
pub const MAC_ADDR_LEN: usize = 6;
pub const IPV4_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_VLAN: u16 = 0x8100;
pub const ETHER_TYPE_IPV6: u16 = 0x86dd;
pub const ETHER_TYPE_MPLS: u16 = 0x8847;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

#[inline]
fn be16(p: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([p[at], p[at + 1]])
}

#[inline]
pub fn peel_ethernet(p: &[u8]) -> Option<usize> {
    (p.len() >= ETHERNET_HDR_LEN).then_some(ETHERNET_HDR_LEN)
}

pub fn ethernet_dst(p: &[u8]) -> [u8; MAC_ADDR_LEN] {
    let mut addr = [0; MAC_ADDR_LEN];
    addr.copy_from_slice(&p[..MAC_ADDR_LEN]);
    addr
}

pub fn ethernet_src(p: &[u8]) -> [u8; MAC_ADDR_LEN] {
    let mut addr = [0; MAC_ADDR_LEN];
    addr.copy_from_slice(&p[MAC_ADDR_LEN..2 * MAC_ADDR_LEN]);
    addr
}

#[inline]
pub fn ethernet_ether_type(p: &[u8]) -> u16 {
    be16(p, 2 * MAC_ADDR_LEN)
}

#[inline]
pub fn peel_vlan(p: &[u8]) -> Option<usize> {
    (p.len() >= VLAN_HDR_LEN).then_some(VLAN_HDR_LEN)
}

/// Ether type following a VLAN tag.
#[inline]
pub fn vlan_ether_type(p: &[u8]) -> u16 {
    be16(p, 2)
}

pub fn vlan_id(p: &[u8]) -> u16 {
    be16(p, 0) & 0x0fff
}

#[inline]
pub fn peel_mpls(p: &[u8]) -> Option<usize> {
    (p.len() >= MPLS_HDR_LEN).then_some(MPLS_HDR_LEN)
}

/// Whether the label is the last one of the stack.
pub fn mpls_bottom_of_stack(p: &[u8]) -> bool {
    p[2] & 0x01 != 0
}

/// Checks version, header length and that the whole datagram is present.
#[inline]
pub fn peel_ipv4(p: &[u8]) -> Option<usize> {
    if p.len() < IPV4_HDR_LEN {
        return None;
    }
    let version = p[0] >> 4;
    let hdr_len = ((p[0] & 0x0f) as usize) << 2;
    if version != 4 || hdr_len < IPV4_HDR_LEN || hdr_len > p.len() {
        return None;
    }
    let total_len = be16(p, 2) as usize;
    (p.len() >= total_len).then_some(hdr_len)
}

#[inline]
pub fn ipv4_proto(p: &[u8]) -> u8 {
    p[9]
}

pub fn ipv4_src(p: &[u8]) -> [u8; 4] {
    [p[12], p[13], p[14], p[15]]
}

pub fn ipv4_dst(p: &[u8]) -> [u8; 4] {
    [p[16], p[17], p[18], p[19]]
}

#[inline]
pub fn peel_tcp(p: &[u8]) -> Option<usize> {
    if p.len() < TCP_HDR_LEN {
        return None;
    }
    let data_offset = ((p[12] & 0xf0) >> 2) as usize;
    (data_offset >= TCP_HDR_LEN && p.len() >= data_offset).then_some(data_offset)
}

#[inline]
pub fn tcp_src_port(p: &[u8]) -> u16 {
    be16(p, 0)
}

#[inline]
pub fn tcp_dst_port(p: &[u8]) -> u16 {
    be16(p, 2)
}

/// Checks the length field against the remaining bytes.
#[inline]
pub fn peel_udp(p: &[u8]) -> Option<usize> {
    if p.len() < UDP_HDR_LEN {
        return None;
    }
    let total_len = be16(p, 4) as usize;
    (total_len >= UDP_HDR_LEN && p.len() >= total_len).then_some(UDP_HDR_LEN)
}

#[inline]
pub fn udp_src_port(p: &[u8]) -> u16 {
    be16(p, 0)
}

#[inline]
pub fn udp_dst_port(p: &[u8]) -> u16 {
    be16(p, 2)
}

/// Skips Ethernet and any number of stacked VLAN tags. Returns the final
/// ether type and the remaining bytes.
#[inline]
pub fn peel_link(p: &[u8]) -> Option<(u16, &[u8])> {
    let off = peel_ethernet(p)?;
    let mut ether_type = ethernet_ether_type(p);
    let mut p = &p[off..];
    while ether_type == ETHER_TYPE_VLAN {
        let off = peel_vlan(p)?;
        ether_type = vlan_ether_type(p);
        p = &p[off..];
    }
    Some((ether_type, p))
}

/// Returns the IPv4 protocol and the transport bytes.
#[inline]
fn peel_to_transport(p: &[u8]) -> Option<(u8, &[u8])> {
    let (ether_type, p) = peel_link(p)?;
    // IPv6 is not handled on this path.
    if ether_type != ETHER_TYPE_IPV4 {
        return None;
    }
    let off = peel_ipv4(p)?;
    Some((ipv4_proto(p), &p[off..]))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Matches IPv4 TCP or UDP packets whose source or destination port is
/// `port`. Malformed or truncated packets never match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortFilter {
    pub transport: Transport,
    pub port: u16,
}

pub fn tcp_port_filter(port: u16) -> PortFilter {
    PortFilter {
        transport: Transport::Tcp,
        port,
    }
}

pub fn udp_port_filter(port: u16) -> PortFilter {
    PortFilter {
        transport: Transport::Udp,
        port,
    }
}

impl PortFilter {
    pub fn matches(&self, p: &[u8]) -> bool {
        let Some((proto, p)) = peel_to_transport(p) else {
            return false;
        };
        match self.transport {
            Transport::Tcp => {
                proto == IPPROTO_TCP
                    && peel_tcp(p).is_some()
                    && (tcp_src_port(p) == self.port || tcp_dst_port(p) == self.port)
            }
            Transport::Udp => {
                proto == IPPROTO_UDP
                    && peel_udp(p).is_some()
                    && (udp_src_port(p) == self.port || udp_dst_port(p) == self.port)
            }
        }
    }
}

impl PacketFilter for PortFilter {
    #[inline]
    fn filter(&self, pkt: &[u8]) -> u32 {
        self.matches(pkt) as u32
    }
}

/// Layer 4 fields used to spread flows across rings. Zeroes for anything
/// that isn't IPv4.
pub(crate) fn flow_fields(p: &[u8]) -> Option<([u8; 4], [u8; 4], u16, u16)> {
    let (ether_type, p) = peel_link(p)?;
    if ether_type != ETHER_TYPE_IPV4 {
        return None;
    }
    let off = peel_ipv4(p)?;
    let (src, dst) = (ipv4_src(p), ipv4_dst(p));
    let l4 = &p[off..];
    let ports = match ipv4_proto(p) {
        IPPROTO_TCP if peel_tcp(l4).is_some() => (tcp_src_port(l4), tcp_dst_port(l4)),
        IPPROTO_UDP if peel_udp(l4).is_some() => (udp_src_port(l4), udp_dst_port(l4)),
        _ => (0, 0),
    };
    Some((src, dst, ports.0, ports.1))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TCP_PACKET: [u8; 74] = [
        0xd4, 0xe6, 0xb7, 0x51, 0xa3, 0x11, 0xf8, 0x1a, 0x67, 0x1b, 0x3e, 0xf5, 0x08, 0x00,
        // ipv4
        0x45, 0x00, 0x00, 0x3c, 0x68, 0x07, 0x00, 0x00, 0x64, 0x06, 0xfe, 0x08, 0x40, 0xe9,
        0xa5, 0x66, 0x0a, 0x2a, 0x00, 0x33,
        // tcp, options included
        0x00, 0x50, 0xbd, 0xfc, 0x4a, 0x22, 0x5f, 0xc4, 0x14, 0x1f, 0xab, 0xc3, 0xa0, 0x12,
        0xeb, 0x20, 0xed, 0xec, 0x00, 0x00, 0x02, 0x04, 0x05, 0x64, 0x04, 0x02, 0x08, 0x0a,
        0x64, 0x9a, 0x66, 0xfa, 0x00, 0x36, 0x8a, 0xa4, 0x01, 0x03, 0x03, 0x08,
    ];

    pub(crate) const UDP_PACKET: [u8; 79] = [
        0xf8, 0x1a, 0x67, 0x1b, 0x3e, 0xf5, 0xd4, 0xe6, 0xb7, 0x51, 0xa3, 0x11, 0x08, 0x00,
        // ipv4
        0x45, 0x00, 0x00, 0x41, 0x8a, 0xbc, 0x40, 0x00, 0x40, 0x11, 0x9b, 0x68, 0x0a, 0x2a,
        0x00, 0x33, 0x0a, 0x2a, 0x00, 0x01,
        // udp
        0x80, 0x0a, 0x00, 0x35, 0x00, 0x2d, 0x22, 0xee,
        // dns query
        0xf2, 0x1c, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x63,
        0x6c, 0x69, 0x65, 0x6e, 0x74, 0x73, 0x33, 0x06, 0x67, 0x6f, 0x6f, 0x67, 0x6c, 0x65,
        0x03, 0x63, 0x6f, 0x6d, 0x00, 0x00, 0x1c, 0x00, 0x01,
    ];

    /// Inserts `tags` VLAN tags after the MAC addresses.
    fn with_vlans(pkt: &[u8], tags: usize) -> Vec<u8> {
        let mut out = pkt[..12].to_vec();
        for i in 0..tags {
            out.extend_from_slice(&[0x81, 0x00, 0x00, 10 + i as u8]);
        }
        out.extend_from_slice(&pkt[12..]);
        out
    }

    #[test]
    fn test_udp_filter() {
        assert_eq!(udp_port_filter(0x35).filter(&UDP_PACKET), 1);
        assert_eq!(udp_port_filter(0x800a).filter(&UDP_PACKET), 1);
        assert_eq!(udp_port_filter(0x20).filter(&UDP_PACKET), 0);
        assert_eq!(tcp_port_filter(0x35).filter(&UDP_PACKET), 0);
    }

    #[test]
    fn test_tcp_filter() {
        assert_eq!(tcp_port_filter(0x50).filter(&TCP_PACKET), 1);
        assert_eq!(tcp_port_filter(0xbdfc).filter(&TCP_PACKET), 1);
        assert_eq!(tcp_port_filter(0x51).filter(&TCP_PACKET), 0);
        assert_eq!(udp_port_filter(0x50).filter(&TCP_PACKET), 0);
    }

    #[test]
    fn test_short_buffers_never_match() {
        for len in 0..ETHERNET_HDR_LEN {
            assert_eq!(tcp_port_filter(0x50).filter(&TCP_PACKET[..len]), 0);
            assert_eq!(udp_port_filter(0x35).filter(&UDP_PACKET[..len]), 0);
        }
    }

    #[test]
    fn test_truncated_never_match() {
        for len in 0..TCP_PACKET.len() {
            assert_eq!(tcp_port_filter(0x50).filter(&TCP_PACKET[..len]), 0, "len {len}");
        }
        for len in 0..UDP_PACKET.len() {
            assert_eq!(udp_port_filter(0x35).filter(&UDP_PACKET[..len]), 0, "len {len}");
        }
    }

    #[test]
    fn test_stacked_vlans() {
        for tags in 1..=3 {
            let pkt = with_vlans(&TCP_PACKET, tags);
            assert_eq!(tcp_port_filter(0x50).filter(&pkt), 1);
            assert_eq!(tcp_port_filter(0x51).filter(&pkt), 0);
            let pkt = with_vlans(&UDP_PACKET, tags);
            assert_eq!(udp_port_filter(0x35).filter(&pkt), 1);
        }
        // Tag announced but cut short.
        let pkt = with_vlans(&TCP_PACKET, 2);
        assert_eq!(tcp_port_filter(0x50).filter(&pkt[..16]), 0);
    }

    #[test]
    fn test_ipv6_is_not_matched() {
        let mut pkt = TCP_PACKET;
        pkt[12] = 0x86;
        pkt[13] = 0xdd;
        assert_eq!(tcp_port_filter(0x50).filter(&pkt), 0);
    }

    #[test]
    fn test_bad_ipv4_header() {
        let mut pkt = TCP_PACKET;
        pkt[14] = 0x44;
        assert_eq!(tcp_port_filter(0x50).filter(&pkt), 0);
        let mut pkt = TCP_PACKET;
        pkt[14] = 0x65;
        assert_eq!(tcp_port_filter(0x50).filter(&pkt), 0);
        // Total length beyond the buffer.
        let mut pkt = TCP_PACKET;
        pkt[17] = 0x3d;
        assert_eq!(tcp_port_filter(0x50).filter(&pkt), 0);
    }

    #[test]
    fn test_bad_udp_length() {
        let mut pkt = UDP_PACKET;
        pkt[39] = 0x07;
        assert_eq!(udp_port_filter(0x35).filter(&pkt), 0);
        let mut pkt = UDP_PACKET;
        pkt[39] = 0x2e;
        assert_eq!(udp_port_filter(0x35).filter(&pkt), 0);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(ethernet_dst(&TCP_PACKET), [0xd4, 0xe6, 0xb7, 0x51, 0xa3, 0x11]);
        assert_eq!(ethernet_src(&TCP_PACKET), [0xf8, 0x1a, 0x67, 0x1b, 0x3e, 0xf5]);
        let ip = &UDP_PACKET[14..];
        assert_eq!(ipv4_src(ip), [10, 42, 0, 51]);
        assert_eq!(ipv4_dst(ip), [10, 42, 0, 1]);
        assert_eq!(
            flow_fields(&UDP_PACKET),
            Some(([10, 42, 0, 51], [10, 42, 0, 1], 0x800a, 0x35))
        );
    }

    #[test]
    fn test_mpls() {
        let label = [0x00, 0x01, 0x41, 0x40];
        assert_eq!(peel_mpls(&label), Some(MPLS_HDR_LEN));
        assert!(mpls_bottom_of_stack(&label));
        assert_eq!(peel_mpls(&label[..3]), None);
    }
}
