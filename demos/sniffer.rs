//! Multi-ring receive loop.
//!
//! Opens a port with one thread per ring, applies an optional BPF filter and
//! prints per-second packet rates until Ctrl-C. Without the `snf` feature the
//! port is served by the in-memory driver and fed with generated UDP
//! traffic.
//!
//! Example:
//! ```bash
//! RUST_LOG=debug cargo run --release --example sniffer -- \
//!     -r 4 --filter "udp and dst port 4000" --synthetic 8
//! cargo run --example sniffer -- --filter "tcp port 80" --dump
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use etherparse::{NetHeaders, PacketBuilder, PacketHeaders};
use log::{error, info, warn};

use snf_rs::api::find_ifaddr_by_name;
use snf_rs::{Driver, Error, Handle, HandleOptions, MemDriver, Ring, Timeout, bpf};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port number to capture on.
    #[clap(short, long, default_value_t = 0)]
    port: u32,

    /// Interface name; overrides --port.
    #[clap(short, long)]
    interface: Option<String>,

    /// Number of rings, one receiving thread each.
    #[clap(short, long, default_value_t = 1)]
    rings: u32,

    /// Packets borrowed per reload.
    #[clap(short, long, default_value_t = 64)]
    burst: usize,

    /// Receive timeout in milliseconds; negative blocks forever.
    #[clap(short, long, default_value_t = 100)]
    timeout_ms: i64,

    /// BPF filter expression (tcpdump syntax).
    #[clap(short, long)]
    filter: Option<String>,

    #[clap(long, default_value_t = 65535)]
    snaplen: u32,

    /// Print the compiled filter and exit.
    #[clap(long)]
    dump: bool,

    /// Print source and destination of every accepted packet.
    #[clap(short, long)]
    debug: bool,

    /// Flows generated into the in-memory port (0 disables the generator).
    #[clap(long, default_value_t = 4)]
    synthetic: u16,

    /// Use the hardware driver instead of the in-memory one.
    #[cfg(feature = "snf")]
    #[clap(long)]
    snf: bool,
}

fn print_addrs(frame: &[u8]) -> Option<String> {
    let headers = PacketHeaders::from_ethernet_slice(frame).ok()?;
    match headers.net? {
        NetHeaders::Ipv4(hdr, _) => Some(format!(
            "{} > {}",
            Ipv4Addr::from(hdr.source),
            Ipv4Addr::from(hdr.destination)
        )),
        NetHeaders::Ipv6(hdr, _) => Some(format!(
            "{} > {}",
            std::net::Ipv6Addr::from(hdr.source),
            std::net::Ipv6Addr::from(hdr.destination)
        )),
        _ => None,
    }
}

fn udp_frame(flow: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(10_000 + flow, 4000);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload)?;
    Ok(out)
}

/// Pushes `flows` UDP flows into `port` until `stop` is set.
fn generate(driver: Arc<MemDriver>, port: u32, flows: u16, stop: Arc<AtomicBool>) -> Result<()> {
    let frames = (0..flows)
        .map(|f| udp_frame(f, &[0xab; 18]))
        .collect::<Result<Vec<_>>>()?;
    while !stop.load(Ordering::Relaxed) {
        for frame in &frames {
            driver.push(port, frame)?;
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn run<D: Driver>(driver: Arc<D>, port: u32, args: &Args, stop: Arc<AtomicBool>) -> Result<()> {
    let prog = match &args.filter {
        Some(expr) => Some(bpf::compile(args.snaplen, expr)?),
        None => None,
    };

    let opts = HandleOptions::from_env().num_rings(args.rings);
    let handle = Handle::open(driver, port, &opts)?;
    let mut rings = (0..args.rings)
        .map(|_| handle.open_ring())
        .collect::<snf_rs::Result<Vec<_>>>()?;

    let cancel = handle.canceller();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
            if let Err(e) = cancel.cancel() {
                error!("cancel failed: {e}");
            }
        })
        .context("setting Ctrl-C handler")?;
    }

    handle.start()?;
    info!("port {port}: capturing on {} rings", args.rings);

    let totals: Vec<AtomicU64> = (0..args.rings).map(|_| AtomicU64::new(0)).collect();
    let timeout = Timeout::from_millis(args.timeout_ms);

    let results = thread::scope(|s| {
        let workers: Vec<_> = rings
            .iter_mut()
            .zip(&totals)
            .map(|(ring, total)| {
                let prog = prog.clone();
                s.spawn(move || receive(ring, total, prog, timeout, args))
            })
            .collect();

        s.spawn(|| {
            let mut old = 0;
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let sum: u64 = totals.iter().map(|c| c.load(Ordering::Relaxed)).sum();
                println!("pkt/sec: {}", sum.saturating_sub(old));
                old = sum;
            }
        });

        let results: Vec<_> = workers.into_iter().map(|w| w.join()).collect();
        stop.store(true, Ordering::SeqCst);
        results
    });
    for res in results {
        match res {
            Ok(res) => res?,
            Err(_) => bail!("receiver thread panicked"),
        }
    }

    for mut ring in rings {
        ring.close()?;
    }
    handle.close()?;
    let total: u64 = totals.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    info!("port {port}: {total} packets accepted");
    Ok(())
}

fn receive<D: Driver>(
    ring: &mut Ring<D>,
    total: &AtomicU64,
    prog: Option<bpf::Program>,
    timeout: Timeout,
    args: &Args,
) -> snf_rs::Result<()> {
    let id = u32::from(ring.id());
    let mut rx = ring.receiver(timeout, args.burst);
    if let Some(prog) = prog {
        rx.set_filter(prog);
    }
    while rx.loop_next() {
        total.fetch_add(1, Ordering::Relaxed);
        if args.debug {
            if let Some(addrs) = print_addrs(rx.data()) {
                println!("ring {id}: {addrs}");
            }
        }
    }
    match rx.take_err() {
        Some(Error::EndOfStream) | None => Ok(()),
        Some(e) => Err(e),
    }
}

fn resolve_port<D: Driver>(driver: &D, args: &Args) -> Result<u32> {
    let Some(name) = &args.interface else {
        return Ok(args.port);
    };
    let ifaddrs = driver.ifaddrs()?;
    match find_ifaddr_by_name(&ifaddrs, name) {
        Some(ifa) => Ok(ifa.portnum),
        None => bail!("no capture port named {name}"),
    }
}

pub fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.dump {
        let expr = args.filter.as_deref().unwrap_or("");
        print!("{}", bpf::compile(args.snaplen, expr)?.disassemble());
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));

    #[cfg(feature = "snf")]
    if args.snf {
        let driver = Arc::new(snf_rs::snf::SnfDriver::new()?);
        let port = resolve_port(driver.as_ref(), &args)?;
        return run(driver, port, &args, stop);
    }

    let driver = Arc::new(MemDriver::with_ports(args.port + 1));
    let port = resolve_port(driver.as_ref(), &args)?;
    let generator = (args.synthetic > 0).then(|| {
        let driver = driver.clone();
        let stop = stop.clone();
        let flows = args.synthetic;
        thread::spawn(move || generate(driver, port, flows, stop))
    });

    let res = run(driver, port, &args, stop.clone());
    stop.store(true, Ordering::SeqCst);
    if let Some(generator) = generator {
        match generator.join() {
            Ok(Err(e)) => warn!("generator stopped: {e:#}"),
            Err(_) => warn!("generator panicked"),
            Ok(Ok(())) => {}
        }
    }
    res
}
