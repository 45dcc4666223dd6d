// =============================================================================
// THREATMAP — Load Test Tool
// =============================================================================
// Generates synthetic Palo Alto syslog traffic (RFC 5424 structured data,
// free-form key=value and CSV variants, deny/allow mixed) and floods the
// ingest server's UDP port at a configurable rate.
// =============================================================================

use clap::Parser;
use rand::Rng;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "threatmap-loadtest")]
#[command(about = "Syslog flood tool for the ThreatMap ingest server")]
struct Args {
    /// Target syslog address
    #[arg(long, default_value = "127.0.0.1:514")]
    target: String,

    /// Messages per second
    #[arg(long, default_value_t = 1000)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Fraction of messages with deny/drop/block actions (0.0 - 1.0)
    #[arg(long, default_value_t = 0.7)]
    deny_ratio: f64,

    /// Fraction of deliberately malformed messages (0.0 - 1.0)
    #[arg(long, default_value_t = 0.05)]
    garbage_ratio: f64,
}

struct Counters {
    sent: AtomicU64,
    deny: AtomicU64,
    allow: AtomicU64,
    garbage: AtomicU64,
    send_errors: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            deny: AtomicU64::new(0),
            allow: AtomicU64::new(0),
            garbage: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }
}

const DENY_ACTIONS: [&str; 3] = ["deny", "drop", "block"];
const ALLOW_ACTIONS: [&str; 3] = ["allow", "permit", "alert"];
const THREATS: [&str; 6] = ["trojan", "spyware", "brute-force", "dos", "flood", "portscan"];

fn random_public_ip(rng: &mut impl Rng) -> String {
    // Documentation + common public ranges so geo lookups get variety.
    match rng.gen_range(0..4) {
        0 => format!("203.0.113.{}", rng.gen_range(1..255)),
        1 => format!("198.51.100.{}", rng.gen_range(1..255)),
        2 => format!("8.8.{}.{}", rng.gen_range(0..255), rng.gen_range(1..255)),
        _ => format!(
            "185.{}.{}.{}",
            rng.gen_range(1..255),
            rng.gen_range(0..255),
            rng.gen_range(1..255)
        ),
    }
}

fn build_message(
    rng: &mut impl Rng,
    deny_ratio: f64,
    garbage_ratio: f64,
    counters: &Counters,
) -> String {
    if rng.gen_bool(garbage_ratio) {
        counters.garbage.fetch_add(1, Ordering::Relaxed);
        return "corrupted relay output with no recognizable structure".to_string();
    }
    let deny = rng.gen_bool(deny_ratio);
    let action = if deny {
        counters.deny.fetch_add(1, Ordering::Relaxed);
        DENY_ACTIONS[rng.gen_range(0..DENY_ACTIONS.len())]
    } else {
        counters.allow.fetch_add(1, Ordering::Relaxed);
        ALLOW_ACTIONS[rng.gen_range(0..ALLOW_ACTIONS.len())]
    };
    let src = random_public_ip(rng);
    let dst = format!("10.20.{}.{}", rng.gen_range(0..255), rng.gen_range(1..255));
    let threat = THREATS[rng.gen_range(0..THREATS.len())];

    match rng.gen_range(0..3) {
        // RFC 5424 structured data
        0 => format!(
            "<14>1 2024-01-26T10:00:00Z PA-5220 - - - \
             [pan@0 src={src} dst={dst} action={action} threat_type={threat} dport={} proto=tcp] hit",
            rng.gen_range(1..65535)
        ),
        // Legacy free-form key=value
        1 => format!(
            "<14>Jan 26 10:00:00 pa-fw threat: src={src} dst={dst} action={action} threat_type={threat}"
        ),
        // Palo Alto CSV (34 columns)
        _ => {
            let mut cols = vec!["0".to_string(); 34];
            cols[0] = "1".into();
            cols[1] = "2024/01/26 10:00:00".into();
            cols[3] = "THREAT".into();
            cols[4] = threat.to_string();
            cols[7] = src;
            cols[8] = dst;
            cols[30] = action.to_string();
            cols[33] = threat.to_string();
            cols.join(",")
        }
    }
}

fn main() {
    let args = Args::parse();

    println!("=== ThreatMap Load Test ===");
    println!("Target:      {}", args.target);
    println!("Rate:        {} msg/s", args.rate);
    println!("Duration:    {}s", args.duration);
    println!("Deny ratio:  {:.0}%", args.deny_ratio * 100.0);
    println!("Garbage:     {:.0}%", args.garbage_ratio * 100.0);
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").unwrap_or_else(|e| {
        eprintln!("cannot open sender socket: {e}");
        std::process::exit(1);
    });
    if let Err(e) = socket.connect(&args.target) {
        eprintln!("cannot resolve target {}: {e}", args.target);
        std::process::exit(1);
    }

    let counters = Counters::new();
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("Sending...\n");
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let payload = build_message(&mut rng, args.deny_ratio, args.garbage_ratio, &counters);
        counters.sent.fetch_add(1, Ordering::Relaxed);
        if socket.send(payload.as_bytes()).is_err() {
            counters.send_errors.fetch_add(1, Ordering::Relaxed);
        }

        tick += 1;
        if tick % 5000 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} deny={} allow={} garbage={} err={} ({:.0} msg/s)",
                elapsed,
                sent,
                counters.deny.load(Ordering::Relaxed),
                counters.allow.load(Ordering::Relaxed),
                counters.garbage.load(Ordering::Relaxed),
                counters.send_errors.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        // Rate pacing
        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    println!("\n=== Results ===");
    println!("Duration:    {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:  {}", sent);
    println!("Deny-class:  {}", counters.deny.load(Ordering::Relaxed));
    println!("Allow-class: {}", counters.allow.load(Ordering::Relaxed));
    println!("Garbage:     {}", counters.garbage.load(Ordering::Relaxed));
    println!("Send errors: {}", counters.send_errors.load(Ordering::Relaxed));
    println!("Throughput:  {:.1} msg/s", sent as f64 / elapsed.as_secs_f64());
}
