//! Subscriber - pops records from a shared memory queue and reports latency
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --example subscriber -- --mode borrow
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use shmq_core::Queue;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const HEADER_SIZE: usize = 64;

/// Weight of the newest sample in the moving average
const ALPHA: f64 = 0.1;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Poll with try_pop
    Poll,
    /// Block in pop
    Blocking,
    /// Poll with zero-copy borrow
    Borrow,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Queue name shared with the publisher
    #[arg(short, long, default_value = "/my_queue_example_2")]
    name: String,

    /// How records are taken off the queue
    #[arg(short, long, value_enum, default_value_t = Mode::Poll)]
    mode: Mode,

    /// Stop after this many records (0 runs until killed)
    #[arg(long, default_value_t = 0)]
    count: u64,
}

/// Running transfer-time statistics
struct Stats {
    average_ms: Option<f64>,
    received: u64,
    expected: Option<u64>,
    window_start: Instant,
    window_count: u64,
}

impl Stats {
    fn new() -> Self {
        Self {
            average_ms: None,
            received: 0,
            expected: None,
            window_start: Instant::now(),
            window_count: 0,
        }
    }

    fn record(&mut self, header: &[u8]) {
        self.received += 1;
        self.window_count += 1;

        let Some((msg_num, sent_us)) = parse_header(header) else {
            warn!("Failed to parse header: {:?}", String::from_utf8_lossy(header));
            return;
        };
        if let Some(expected) = self.expected {
            if msg_num != expected {
                warn!("Message ID mismatch. Expected: {}, Got: {}", expected, msg_num);
            }
        }
        self.expected = Some(msg_num + 1);

        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        if sent_us == 0 || sent_us > now_us {
            warn!("Invalid timestamp: {}", sent_us);
            return;
        }
        let transfer_ms = (now_us - sent_us) as f64 / 1000.0;
        let average = match self.average_ms {
            Some(avg) => (1.0 - ALPHA) * avg + ALPHA * transfer_ms,
            None => transfer_ms,
        };
        self.average_ms = Some(average);

        info!(
            "Received: Message #{} transfer {:.3} ms, running average {:.3} ms",
            msg_num, transfer_ms, average
        );
    }

    fn maybe_report(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(10) {
            return;
        }
        let rate = self.window_count as f64 / elapsed.as_secs_f64();
        info!(
            "Processed {} records in {:.2} s ({:.2} records/s)",
            self.window_count,
            elapsed.as_secs_f64(),
            rate
        );
        self.window_start = Instant::now();
        self.window_count = 0;
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let queue = Queue::open(&args.name).context("Failed to open queue")?;
    info!(
        "Subscriber started on {}: {} x {} bytes, mode {:?}",
        queue.name(),
        queue.max_elements(),
        queue.element_size(),
        args.mode
    );

    let mut buffer = vec![0u8; queue.element_size()];
    let header_len = HEADER_SIZE.min(queue.element_size());
    let mut stats = Stats::new();

    while args.count == 0 || stats.received < args.count {
        let got = match args.mode {
            Mode::Blocking => {
                queue.pop(&mut buffer)?;
                stats.record(&buffer[..header_len]);
                true
            }
            Mode::Poll => {
                let got = queue.try_pop(&mut buffer)?;
                if got {
                    stats.record(&buffer[..header_len]);
                }
                got
            }
            Mode::Borrow => match queue.borrow()? {
                Some(slot) => {
                    stats.record(&slot[..header_len]);
                    true
                }
                None => false,
            },
        };

        if !got {
            thread::sleep(Duration::from_millis(1));
        }
        stats.maybe_report();
    }

    info!("Received {} records", stats.received);
    Ok(())
}

/// Parse `Message #<n> <timestamp_us>` from a NUL-padded header
fn parse_header(header: &[u8]) -> Option<(u64, u128)> {
    let end = header.iter().position(|&b| b == 0).unwrap_or(header.len());
    let text = std::str::from_utf8(&header[..end]).ok()?;
    let rest = text.strip_prefix("Message #")?;
    let mut parts = rest.split_whitespace();
    let msg_num = parts.next()?.parse().ok()?;
    let timestamp = parts.next()?.parse().ok()?;
    Some((msg_num, timestamp))
}
