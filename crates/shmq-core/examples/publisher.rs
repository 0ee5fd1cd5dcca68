//! Publisher - pushes timestamped records into a shared memory queue
//!
//! Each record starts with a `Message #<n> <timestamp_us>` header padded to
//! 64 bytes; the rest is filler.
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --example publisher -- --delay-ms 10
//! cargo run --example publisher -- --cleanup
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use shmq_core::Queue;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const HEADER_SIZE: usize = 64;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Queue name shared with the subscriber
    #[arg(short, long, default_value = "/my_queue_example_2")]
    name: String,

    /// Number of slots in the queue
    #[arg(long, default_value_t = 10)]
    max_elements: usize,

    /// Size of every record in bytes
    #[arg(long, default_value_t = 512 * 1024)]
    element_size: usize,

    /// Delay between records in milliseconds
    #[arg(short, long, default_value_t = 100)]
    delay_ms: u64,

    /// Stop after this many records (0 runs until killed)
    #[arg(long, default_value_t = 0)]
    count: u64,

    /// Remove the queue and exit
    #[arg(short, long)]
    cleanup: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.cleanup {
        info!("Cleaning up queue {}", args.name);
        return Queue::destroy(&args.name).context("Failed to destroy queue");
    }
    if args.element_size < HEADER_SIZE {
        bail!(
            "element size {} is smaller than the {} byte header",
            args.element_size,
            HEADER_SIZE
        );
    }

    // Leftovers from a previous run would make create fail
    Queue::destroy(&args.name).context("Failed to remove stale queue")?;
    let queue = Queue::create(&args.name, args.max_elements, args.element_size)
        .context("Failed to create queue")?;

    info!(
        "Publisher started on {}: {} x {} bytes, delay {} ms",
        queue.name(),
        queue.max_elements(),
        queue.element_size(),
        args.delay_ms
    );

    let mut record = vec![0u8; args.element_size];
    fill(&mut record[HEADER_SIZE..]);

    let mut counter = 0u64;
    while args.count == 0 || counter < args.count {
        let timestamp_us = SystemTime::now().duration_since(UNIX_EPOCH)?.as_micros();
        write_header(&mut record[..HEADER_SIZE], counter, timestamp_us);

        if queue.push(&record)? {
            info!("Published: Message #{}", counter);
        } else {
            warn!("Published (with drop): Message #{}", counter);
        }

        counter += 1;
        thread::sleep(Duration::from_millis(args.delay_ms));
    }

    info!("Published {} records, removing queue", counter);
    drop(queue);
    Queue::destroy(&args.name).context("Failed to destroy queue")?;
    Ok(())
}

fn write_header(header: &mut [u8], counter: u64, timestamp_us: u128) {
    let text = format!("Message #{} {}", counter, timestamp_us);
    let len = text.len().min(header.len() - 1);
    header.fill(0);
    header[..len].copy_from_slice(&text.as_bytes()[..len]);
}

/// Cheap xorshift filler, only there so records are not all zeros
fn fill(buf: &mut [u8]) {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    for byte in buf {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = state as u8;
    }
}
