use etherparse::PacketBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use snf_rs::bpf;
use snf_rs::filter::{PacketFilter, tcp_port_filter, udp_port_filter};

fn frame(rng: &mut StdRng, tcp: bool, src_port: u16, dst_port: u16) -> Vec<u8> {
    let src: [u8; 4] = rng.random();
    let dst: [u8; 4] = rng.random();
    let eth = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2]).ipv4(src, dst, 64);
    let payload = vec![0x5a; rng.random_range(0..64)];
    let mut out = Vec::new();
    if tcp {
        eth.tcp(src_port, dst_port, rng.random(), 1024)
            .write(&mut out, &payload)
            .unwrap();
    } else {
        eth.udp(src_port, dst_port).write(&mut out, &payload).unwrap();
    }
    out
}

/// Ports drawn from a small set so that matches are common.
fn port(rng: &mut StdRng) -> u16 {
    [53, 80, 443, 8080, rng.random()][rng.random_range(0..5)]
}

#[test]
fn bpf_agrees_with_port_filter() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let progs = [80u16, 53, 443].map(|p| {
        (
            p,
            bpf::compile(1, &format!("tcp and port {p}")).unwrap(),
            bpf::compile(1, &format!("udp and port {p}")).unwrap(),
        )
    });
    for _ in 0..500 {
        let tcp = rng.random_bool(0.5);
        let (sport, dport) = (port(&mut rng), port(&mut rng));
        let pkt = frame(&mut rng, tcp, sport, dport);
        for (p, tcp_prog, udp_prog) in &progs {
            assert_eq!(tcp_prog.execute(&pkt), tcp_port_filter(*p).filter(&pkt));
            assert_eq!(udp_prog.execute(&pkt), udp_port_filter(*p).filter(&pkt));
        }
    }
}

/// TCP frame to `dst_port` whose source port is neither `dst_port` nor the one after it.
fn tcp_to(dst_port: u16) -> Vec<u8> {
    let mut out = Vec::new();
    PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(dst_port.wrapping_add(2), dst_port, 1, 1024)
        .write(&mut out, &[])
        .unwrap();
    out
}

#[test]
fn port_filter_matches_exact_dst_port() {
    for p in 0..u16::MAX {
        let pkt = tcp_to(p);
        assert_eq!(tcp_port_filter(p).filter(&pkt), 1, "port {p}");
        assert_eq!(tcp_port_filter(p + 1).filter(&pkt), 0, "port {p}");
    }
}

#[test]
fn compiled_dst_port_matches_exact_port() {
    let mut rng = StdRng::seed_from_u64(0xd57);
    let mut ports: Vec<u16> = (0..200).map(|_| rng.random_range(0..u16::MAX)).collect();
    ports.extend([0, 1, 80, 65533, 65534]);
    for p in ports {
        let pkt = tcp_to(p);
        let hit = bpf::compile(1, &format!("tcp and dst port {p}")).unwrap();
        let next = bpf::compile(1, &format!("tcp and dst port {}", p + 1)).unwrap();
        assert_eq!(hit.execute(&pkt), 1, "port {p}");
        assert_eq!(next.execute(&pkt), 0, "port {p}");
        assert_eq!(hit.execute(&pkt), tcp_port_filter(p).filter(&pkt));
    }
}

#[test]
fn truncated_frames_never_match() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..100 {
        let tcp = rng.random_bool(0.5);
        let pkt = frame(&mut rng, tcp, 80, 80);
        let filter = if tcp { tcp_port_filter(80) } else { udp_port_filter(80) };
        assert_eq!(filter.filter(&pkt), 1);
        let len = rng.random_range(0..pkt.len());
        assert_eq!(filter.filter(&pkt[..len]), 0, "len {len} of {}", pkt.len());
    }
}

#[test]
fn garbage_is_handled() {
    let mut rng = StdRng::seed_from_u64(1);
    let progs: Vec<_> = [
        "tcp and port 80",
        "ip[0] & 0xf != 5",
        "ether[12:2] = 0x800 and ip[9] = 17",
        "vlan and udp",
        "ip6 or arp",
        "len > 100 and tcp[13] & 0x02 != 0",
        "net 10.0.0.0/8 and not host 10.1.2.3",
    ]
    .iter()
    .map(|e| bpf::compile(65535, e).unwrap())
    .collect();
    let mut results = Vec::new();
    for _ in 0..200 {
        let len = rng.random_range(0..128);
        let mut pkt = vec![0u8; len];
        rng.fill(&mut pkt[..]);
        if len > 13 && rng.random_bool(0.7) {
            pkt[12] = 0x08;
            pkt[13] = 0x00;
        }
        for prog in &progs {
            prog.execute_many([pkt.as_slice()], &mut results);
            assert_eq!(results.len(), 1);
            assert!(results[0] == 0 || results[0] == 65535);
        }
        let _ = tcp_port_filter(80).filter(&pkt);
    }
}
