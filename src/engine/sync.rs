//! Synchronous driver
//!
//! Each worker performs blocking positional reads and writes, gated by the
//! shared token bucket so the number of in-flight operations across all
//! workers never exceeds the global queue depth. This is the baseline
//! driver: always available, no kernel setup, and with QD tokens spread
//! over N workers it still generates real concurrency.

use super::token::TokenBucket;
use super::{
    run_to_completion, since_epoch_ns, Engine, Params, RunResult, Shared, Span, TraceBuffer,
    WorkerOutcome, FRONTIER_DRAINED,
};
use crate::stats::LatencyHistogram;
use crate::util::buffer::AlignedBuffer;
use crate::Result;
use anyhow::{bail, Context};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Buffer alignment for O_DIRECT; page alignment satisfies every logical
/// block size in practice.
pub(crate) const BUFFER_ALIGNMENT: usize = 4096;

pub struct SyncEngine;

impl SyncEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for SyncEngine {
    fn run(&self, params: &Params) -> Result<RunResult> {
        params.validate()?;
        let (workers, qd) = params.normalized_concurrency();

        let shared = Shared::new();
        let bucket = TokenBucket::new(qd);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let params = params.clone();
            let bucket = bucket.clone();
            let done = shared.done.clone();
            let ops = shared.ops.clone();
            let epoch = shared.epoch;
            handles.push(std::thread::spawn(move || {
                run_worker(id, &params, &bucket, &done, &ops, epoch)
            }));
        }

        run_to_completion(params, &shared, handles)
    }
}

/// Open the target the way this workload needs it
pub(crate) fn open_target(params: &Params) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if params.read_pct < 100 {
        options.write(true);
    }
    if params.direct {
        options.custom_flags(libc::O_DIRECT);
    }
    options
        .open(&params.path)
        .with_context(|| format!("failed to open {}", params.path.display()))
}

/// Target size via seek-to-end; works for both regular files and block
/// devices (where metadata length is zero).
pub(crate) fn target_size(file: &mut File) -> Result<u64> {
    let size = file.seek(SeekFrom::End(0)).context("failed to size target")?;
    file.seek(SeekFrom::Start(0))?;
    Ok(size)
}

/// Next I/O offset: uniform over block indices when random, a wrapping
/// block walk otherwise. Always block-aligned and within
/// `[0, (max_blocks - 1) * block_size]`.
#[inline]
pub(crate) fn next_offset(
    rng: &mut Xoshiro256PlusPlus,
    random: bool,
    io_count: u64,
    max_blocks: u64,
    block_size: u64,
) -> u64 {
    if random {
        rng.gen_range(0..max_blocks) * block_size
    } else {
        (io_count * block_size) % (max_blocks * block_size)
    }
}

/// Per-operation read/write draw (Bernoulli against the read percentage)
#[inline]
pub(crate) fn draw_is_read(rng: &mut Xoshiro256PlusPlus, read_pct: u8) -> bool {
    if read_pct >= 100 {
        return true;
    }
    read_pct > 0 && rng.gen_range(0..100u8) < read_pct
}

/// Worker RNG seed: wall-clock nanos xor the worker id
pub(crate) fn worker_seed(id: usize) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ id as u64
}

fn run_worker(
    id: usize,
    params: &Params,
    bucket: &TokenBucket,
    done: &AtomicBool,
    ops: &AtomicU64,
    epoch: Instant,
) -> WorkerOutcome {
    match worker_loop(id, params, bucket, done, ops, epoch) {
        Ok((io_count, latency)) => WorkerOutcome {
            io_count,
            latency,
            err: None,
        },
        Err(err) => WorkerOutcome {
            io_count: 0,
            latency: LatencyHistogram::new(),
            err: Some(err),
        },
    }
}

fn worker_loop(
    id: usize,
    params: &Params,
    bucket: &TokenBucket,
    done: &AtomicBool,
    ops: &AtomicU64,
    epoch: Instant,
) -> Result<(u64, LatencyHistogram)> {
    let mut file = open_target(params)?;
    let size = target_size(&mut file)?;
    let block_size = params.block_size as u64;
    let max_blocks = size / block_size;
    if max_blocks == 0 {
        bail!("file too small for block size {}", params.block_size);
    }

    let mut buffer = AlignedBuffer::new(params.block_size, BUFFER_ALIGNMENT);
    if params.read_pct < 100 {
        buffer.fill_random(worker_seed(id));
    }

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(worker_seed(id));
    let mut latency = LatencyHistogram::new();
    let mut trace = TraceBuffer::new(params.trace.clone(), id);
    let mut io_count = 0u64;

    loop {
        if !bucket.acquire(done) {
            trace.flush();
            return Ok((io_count, latency));
        }

        let offset = next_offset(&mut rng, params.random, io_count, max_blocks, block_size);
        let is_read = draw_is_read(&mut rng, params.read_pct);

        let io_start = Instant::now();
        let transferred = if is_read {
            read_full_at(&file, buffer.as_mut_slice(), offset)
        } else {
            write_full_at(&file, buffer.as_slice(), offset)
        };
        bucket.release();
        let io_end = Instant::now();

        latency.record_duration(io_end.duration_since(io_start));
        trace.push(
            Span {
                start_ns: since_epoch_ns(epoch, io_start),
                end_ns: since_epoch_ns(epoch, io_end),
            },
            // One in-flight op per token and it just completed, so there is
            // nothing outstanding at emission time.
            || FRONTIER_DRAINED,
        );

        match transferred {
            Ok(n) if n > 0 => {
                io_count += 1;
                ops.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(err) => {
                trace.flush();
                return Err(err);
            }
        }
    }
}

/// Positional read, retrying partial transfers; a short return means EOF.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file
            .read_at(&mut buf[total..], offset + total as u64)
            .with_context(|| format!("pread failed at offset {}", offset))?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Positional write, retrying partial transfers.
fn write_full_at(file: &File, buf: &[u8], offset: u64) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file
            .write_at(&buf[total..], offset + total as u64)
            .with_context(|| format!("pwrite failed at offset {}", offset))?;
        total += n;
    }
    Ok(total)
}
