use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use etherparse::PacketBuilder;

use snf_rs::filter::{PacketFilter, tcp_port_filter, udp_port_filter};
use snf_rs::ring::BatchReader;
use snf_rs::{
    Error, Handle, HandleFlags, HandleOptions, InjectHandle, MemDriver, State, Timeout, bpf,
};

fn tcp(src_port: u16, dst_port: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(src_port, dst_port, 7, 1024);
    let mut out = Vec::new();
    builder.write(&mut out, &[1, 2, 3, 4]).unwrap();
    out
}

fn udp(src_port: u16, dst_port: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 3], 64)
        .udp(src_port, dst_port);
    let mut out = Vec::new();
    builder.write(&mut out, &[9; 12]).unwrap();
    out
}

/// `pkt` with two 802.1Q tags after the MAC addresses.
fn double_tagged(pkt: &[u8]) -> Vec<u8> {
    let mut out = pkt[..12].to_vec();
    out.extend_from_slice(&[0x81, 0x00, 0x00, 10, 0x81, 0x00, 0x00, 20]);
    out.extend_from_slice(&pkt[12..]);
    out
}

fn started(rings: u32) -> (Arc<MemDriver>, Handle<MemDriver>) {
    let driver = Arc::new(MemDriver::with_ports(1));
    let h = Handle::open(driver.clone(), 0, &HandleOptions::default().num_rings(rings)).unwrap();
    h.start().unwrap();
    (driver, h)
}

#[test]
fn port_filter_on_built_frames() {
    let f = tcp_port_filter(80);
    assert_eq!(f.filter(&tcp(5555, 80)), 1);
    assert_eq!(f.filter(&tcp(80, 5555)), 1);
    assert_eq!(tcp_port_filter(81).filter(&tcp(5555, 80)), 0);
    assert_eq!(f.filter(&udp(5555, 80)), 0);
    assert_eq!(udp_port_filter(80).filter(&udp(5555, 80)), 1);
    assert_eq!(f.filter(&double_tagged(&tcp(1000, 80))), 1);
    assert_eq!(f.filter(&double_tagged(&tcp(1000, 81))), 0);
    for len in 0..14 {
        assert_eq!(f.filter(&tcp(5555, 80)[..len]), 0);
    }
}

#[test]
fn bpf_and_port_filter_agree() {
    let prog = bpf::compile(1, "tcp and port 80").unwrap();
    let frames = [
        tcp(5555, 80),
        tcp(80, 1),
        tcp(81, 82),
        udp(80, 80),
        udp(53, 5353),
    ];
    for frame in &frames {
        assert_eq!(prog.execute(frame), tcp_port_filter(80).filter(frame));
    }
    let prog = bpf::compile(65535, "udp and port 80").unwrap();
    assert_eq!(prog.execute(&tcp(5555, 80)), 0);
    assert_eq!(prog.execute(&udp(5555, 80)), 65535);
}

#[test]
fn batch_results_match_inputs() {
    let (driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    for i in 0..10 {
        driver.push(0, &tcp(4000 + i, 80)).unwrap();
    }
    let prog = bpf::compile(1514, "tcp dst port 80").unwrap();
    let mut reader = BatchReader::new(&mut ring, Timeout::Millis(10), 16);
    assert_eq!(reader.reload().unwrap(), 10);
    let mut results = Vec::new();
    prog.execute_batch(&reader.batch(), &mut results);
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|&r| r == 1514));
}

#[test]
fn double_return_is_noop() {
    let (driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    driver.push(0, &udp(1, 2)).unwrap();
    let mut reader = BatchReader::new(&mut ring, Timeout::Millis(10), 8);
    reader.reload().unwrap();
    reader.return_many().unwrap();
    reader.return_many().unwrap();
    drop(reader);
    assert_eq!(driver.return_calls(), 1);
    assert_eq!(driver.ring_borrowed(0, 0), 0);
}

#[test]
fn cancel_ends_stream_within_one_reload() {
    let (driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    for _ in 0..3 {
        driver.push(0, &tcp(1, 80)).unwrap();
    }
    let cancel = ring.canceller();
    {
        let mut rx = ring.receiver(Timeout::Infinite, 8);
        assert!(rx.next());
        cancel.cancel().unwrap();
        cancel.cancel().unwrap();
        // The rest of the batch is already borrowed.
        assert!(rx.next());
        assert!(rx.next());
        assert!(!rx.next());
        assert!(rx.err().unwrap().is_end_of_stream());
        assert_eq!(rx.state(), State::NonOperational);
    }
    ring.close().unwrap();
    assert_eq!(ring.state(), State::Closed);
    h.close().unwrap();
    assert_eq!(driver.ring_borrowed(0, 0), 0);
}

#[test]
fn zero_timeout_does_not_block() {
    let (_driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    let mut rx = ring.receiver(Timeout::Millis(0), 8);
    let start = Instant::now();
    assert!(!rx.next());
    assert!(rx.err().unwrap().is_would_block());
    // Floored to 1 ms, plus scheduling slack.
    assert!(start.elapsed() < Duration::from_millis(20));
}

#[test]
fn infinite_timeout_waits_for_data() {
    let (driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    let pusher = {
        let driver = driver.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            driver.push(0, &udp(7, 7)).unwrap();
        })
    };
    let start = Instant::now();
    let mut rx = ring.receiver(Timeout::Infinite, 8);
    assert!(rx.next());
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(rx.data(), udp(7, 7).as_slice());
    pusher.join().unwrap();
}

#[test]
fn infinite_timeout_woken_by_cancel() {
    let (_driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    let cancel = h.canceller();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cancel.cancel().unwrap();
    });
    let mut rx = ring.receiver(Timeout::Infinite, 8);
    assert!(!rx.loop_next());
    assert!(matches!(rx.err(), Some(Error::EndOfStream)));
    canceller.join().unwrap();
}

#[test]
fn rss_spreads_flows_and_keeps_them_together() {
    let (driver, h) = started(4);
    let mut rings: Vec<_> = (0..4).map(|_| h.open_ring().unwrap()).collect();
    for flow in 0..64 {
        for _ in 0..3 {
            driver.push(0, &udp(10_000 + flow, 53)).unwrap();
        }
    }
    let mut total = 0;
    let mut busy_rings = 0;
    for ring in &mut rings {
        let mut rx = ring.receiver(Timeout::Millis(1), 256);
        let mut seen = std::collections::HashMap::<u16, usize>::new();
        while rx.next() {
            let sport = u16::from_be_bytes([rx.data()[34], rx.data()[35]]);
            *seen.entry(sport).or_default() += 1;
        }
        // Every flow lands whole on one ring.
        assert!(seen.values().all(|&n| n == 3));
        total += seen.values().sum::<usize>();
        busy_rings += usize::from(!seen.is_empty());
    }
    assert_eq!(total, 64 * 3);
    assert!(busy_rings > 1);
}

#[test]
fn duplicate_delivers_to_every_ring() {
    let driver = Arc::new(MemDriver::with_ports(1));
    let opts = HandleOptions::default()
        .num_rings(2)
        .flags(HandleFlags::RX_DUPLICATE);
    let h = Handle::open(driver.clone(), 0, &opts).unwrap();
    h.start().unwrap();
    let mut r0 = h.open_ring_id(0).unwrap();
    let mut r1 = h.open_ring_id(1).unwrap();
    driver.push(0, &tcp(1, 2)).unwrap();
    for ring in [&mut r0, &mut r1] {
        let (data, ci) = ring.receiver(Timeout::Millis(10), 4).read_packet().unwrap();
        assert_eq!(data, tcp(1, 2));
        assert_eq!(ci.interface_index, 0);
    }
}

#[test]
fn stopped_handle_receives_nothing() {
    let (driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    h.stop().unwrap();
    driver.push(0, &tcp(1, 2)).unwrap();
    let mut rx = ring.receiver(Timeout::Millis(1), 4);
    assert!(!rx.next());
    assert!(rx.err().unwrap().is_would_block());
}

#[test]
fn injected_frames_are_captured() {
    let (driver, h) = started(1);
    let mut ring = h.open_ring().unwrap();
    let inj = InjectHandle::open(driver.clone(), 0, 0).unwrap();
    let tx = inj.sender(Timeout::Millis(10));
    tx.send(&tcp(1, 80)).unwrap();
    tx.send(&udp(1, 80)).unwrap();

    let mut rx = ring.receiver(Timeout::Millis(10), 8);
    rx.set_bpf(96, "tcp port 80").unwrap();
    assert!(rx.next());
    assert_eq!(rx.data(), tcp(1, 80).as_slice());
    assert_eq!(rx.filter_result(), 96);
    assert!(!rx.next());
}

#[test]
fn small_data_ring_drops() {
    let driver = Arc::new(MemDriver::with_ports(1));
    // 1 MiB for the whole handle, so 1 MiB for its only ring.
    let opts = HandleOptions::default().num_rings(1).data_ring_size(1);
    let h = Handle::open(driver.clone(), 0, &opts).unwrap();
    h.start().unwrap();
    let _ring = h.open_ring().unwrap();
    let big = vec![0u8; 4096];
    for _ in 0..300 {
        driver.push(0, &big).unwrap();
    }
    assert_eq!(driver.ring_dropped(0, 0), 300 - 256);
}
