//! Packet generator over an injection handle.
//!
//! Emits UDP/IPv4 frames at a requested rate until the count is reached or
//! Ctrl-C. On the in-memory driver the frames loop back into a capture ring
//! of the same port, and the number received is printed at the end.
//!
//! Example:
//! ```bash
//! cargo run --release --example pktgen -- \
//!     --dst-mac 02:00:00:00:00:02 --src-ip 10.0.0.1 --dst-ip 10.0.0.2 \
//!     -l 128 -n 100000 -r 50000
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use eui48::MacAddress;
use etherparse::PacketBuilder;
use log::info;

use snf_rs::{Driver, Error, Handle, HandleOptions, InjectHandle, MemDriver, Ring, Timeout};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port to inject on.
    #[clap(short, long, default_value_t = 0)]
    port: u32,

    /// Total number of packets to send (0 = until Ctrl-C).
    #[clap(short = 'n', long, default_value_t = 1000)]
    count: u64,

    /// Packet rate in pps (0 = flat-out).
    #[clap(short, long, default_value_t = 0)]
    rate: u64,

    /// Frame length in bytes, all headers included.
    #[clap(short, long, default_value_t = 60)]
    len: usize,

    /// Fragments each frame is sent in (1 sends it whole).
    #[clap(long, default_value_t = 1)]
    frags: usize,

    /// Send timeout in milliseconds.
    #[clap(short, long, default_value_t = 100)]
    timeout_ms: u32,

    #[clap(long)]
    src_mac: Option<MacAddress>,

    #[clap(long)]
    dst_mac: MacAddress,

    #[clap(long)]
    src_ip: Ipv4Addr,

    #[clap(long)]
    dst_ip: Ipv4Addr,

    #[clap(long, default_value_t = 1234)]
    src_port: u16,

    #[clap(long, default_value_t = 1234)]
    dst_port: u16,

    /// Use the hardware driver instead of the in-memory one.
    #[cfg(feature = "snf")]
    #[clap(long)]
    snf: bool,
}

/// A UDP/IPv4/Ethernet frame of exactly `args.len` bytes.
fn build_packet(args: &Args) -> Result<Vec<u8>> {
    let src_mac = args.src_mac.unwrap_or_else(MacAddress::nil);
    let builder = PacketBuilder::ethernet2(src_mac.to_array(), args.dst_mac.to_array())
        .ipv4(args.src_ip.octets(), args.dst_ip.octets(), 64)
        .udp(args.src_port, args.dst_port);

    let header_len = builder.size(0);
    if header_len > args.len {
        bail!(
            "frame length {} is smaller than the headers ({header_len})",
            args.len
        );
    }
    let payload = vec![0u8; args.len - header_len];
    let mut packet = Vec::with_capacity(args.len);
    builder.write(&mut packet, &payload)?;
    Ok(packet)
}

fn run_tx<D: Driver>(driver: Arc<D>, args: &Args, stop: &AtomicBool) -> Result<u64> {
    let pkt = build_packet(args)?;
    let chunk = pkt.len().div_ceil(args.frags.max(1)).max(1);
    let frags: Vec<&[u8]> = pkt.chunks(chunk).collect();

    let inj = InjectHandle::open(driver, args.port, 0)?;
    let tx = inj.sender(Timeout::Millis(args.timeout_ms));
    let gap = (args.rate > 0).then(|| Duration::from_nanos(1_000_000_000 / args.rate));

    let start = Instant::now();
    let mut sent = 0u64;
    while !stop.load(Ordering::Relaxed) && (args.count == 0 || sent < args.count) {
        let res = if frags.len() > 1 {
            tx.send_vec(&frags)
        } else {
            tx.loop_send(&pkt)
        };
        match res {
            Ok(()) => sent += 1,
            Err(Error::WouldBlock) => continue,
            Err(e) => return Err(e).context("injecting"),
        }
        if let Some(gap) = gap {
            let due = start + gap.saturating_mul(sent.min(u32::MAX as u64) as u32);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                std::thread::sleep(wait);
            }
        }
    }
    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
    info!("sent {sent} packets in {elapsed:.3}s ({:.0} pps)", sent as f64 / elapsed);
    Ok(sent)
}

/// Drains whatever looped back into the capture ring.
fn count_looped<D: Driver>(ring: &mut Ring<D>) -> Result<u64> {
    let mut rx = ring.receiver(Timeout::Millis(10), 256);
    let mut n = 0;
    while rx.next() {
        n += 1;
    }
    match rx.take_err() {
        Some(Error::WouldBlock) | None => Ok(n),
        Some(e) => Err(e.into()),
    }
}

pub fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }

    #[cfg(feature = "snf")]
    if args.snf {
        let driver = Arc::new(snf_rs::snf::SnfDriver::new()?);
        run_tx(driver, &args, &stop)?;
        return Ok(());
    }

    let driver = Arc::new(MemDriver::with_ports(args.port + 1));
    // Size the capture side to hold everything sent.
    let ring_bytes = (args.count.max(1) * (args.len as u64).div_ceil(64).max(1) * 64).max(1 << 20);
    let opts = HandleOptions::default().num_rings(1).data_ring_size(ring_bytes);
    let handle = Handle::open(driver.clone(), args.port, &opts)?;
    let mut ring = handle.open_ring()?;
    handle.start()?;

    let sent = run_tx(driver.clone(), &args, &stop)?;
    let looped = count_looped(&mut ring)?;
    info!(
        "{looped} of {sent} packets looped back, {} dropped",
        driver.ring_dropped(args.port, 0)
    );
    Ok(())
}
