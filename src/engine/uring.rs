//! Submission-ring driver (io_uring)
//!
//! Each worker owns a ring sized to its share of the global queue depth and
//! a buffer arena with one block-sized window per queue slot. The loop
//! keeps the ring full, submits prepared entries in one syscall, waits for
//! at least one completion, then drains everything that is ready.

use super::sync::{draw_is_read, next_offset, open_target, target_size, worker_seed, BUFFER_ALIGNMENT};
use super::{
    partition_queue_depth, run_to_completion, since_epoch_ns, Engine, Params, RunResult, Shared,
    Span, TraceBuffer, WorkerOutcome, FRONTIER_DRAINED,
};
use crate::stats::LatencyHistogram;
use crate::util::buffer::AlignedBuffer;
use crate::Result;
use anyhow::{bail, Context};
use io_uring::{opcode, types, IoUring};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

pub struct UringEngine;

impl UringEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UringEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for UringEngine {
    fn run(&self, params: &Params) -> Result<RunResult> {
        params.validate()?;
        let (workers, qd) = params.normalized_concurrency();
        let slots = partition_queue_depth(workers, qd);

        let shared = Shared::new();
        let mut handles = Vec::with_capacity(workers);
        for (id, worker_qd) in slots.into_iter().enumerate() {
            let params = params.clone();
            let done = shared.done.clone();
            let ops = shared.ops.clone();
            let epoch = shared.epoch;
            handles.push(std::thread::spawn(move || {
                match worker_loop(id, &params, worker_qd, &done, &ops, epoch) {
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
            }));
        }

        run_to_completion(params, &shared, handles)
    }
}

/// Minimum start timestamp among requests still in flight, as the frontier
/// promise for a trace batch.
fn min_inflight_start(start_times: &[Option<Instant>], epoch: Instant) -> u64 {
    start_times
        .iter()
        .flatten()
        .min()
        .map(|t| since_epoch_ns(epoch, *t))
        .unwrap_or(FRONTIER_DRAINED)
}

fn worker_loop(
    id: usize,
    params: &Params,
    qd: usize,
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
    let fd = file.as_raw_fd();

    let mut ring = IoUring::new(qd as u32).context("failed to set up io_uring")?;

    // Slot i owns bytes [i * block_size, (i + 1) * block_size) of the arena.
    let mut arena = AlignedBuffer::new(params.block_size * qd, BUFFER_ALIGNMENT);
    if params.read_pct < 100 {
        arena.fill_random(worker_seed(id));
    }

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(worker_seed(id));
    let mut latency = LatencyHistogram::new();
    let mut trace = TraceBuffer::new(params.trace.clone(), id);

    let mut free_slots: Vec<usize> = (0..qd).collect();
    let mut start_times: Vec<Option<Instant>> = vec![None; qd];
    let mut in_flight = 0usize;
    let mut io_count = 0u64;
    let mut last_offset = rng.gen_range(0..max_blocks) * block_size;

    loop {
        // Fill every free slot with a prepared submission.
        while in_flight < qd {
            let slot = match free_slots.pop() {
                Some(slot) => slot,
                None => break,
            };

            let offset = if params.random {
                next_offset(&mut rng, true, io_count, max_blocks, block_size)
            } else {
                let offset = last_offset;
                last_offset = (last_offset + block_size) % size;
                offset
            };
            let is_read = draw_is_read(&mut rng, params.read_pct);

            // SAFETY: each slot's window stays valid and exclusively owned
            // by its in-flight operation until the completion is reaped.
            let buf_ptr = unsafe { arena.as_mut_ptr().add(slot * params.block_size) };
            let entry = if is_read {
                opcode::Read::new(types::Fd(fd), buf_ptr, params.block_size as u32)
                    .offset(offset)
                    .build()
                    .user_data(slot as u64)
            } else {
                opcode::Write::new(types::Fd(fd), buf_ptr as *const u8, params.block_size as u32)
                    .offset(offset)
                    .build()
                    .user_data(slot as u64)
            };

            // SAFETY: the entry's buffer outlives the operation (see above).
            let pushed = unsafe { ring.submission().push(&entry).is_ok() };
            if !pushed {
                free_slots.push(slot);
                break;
            }
            start_times[slot] = Some(Instant::now());
            in_flight += 1;
        }

        // Submit everything prepared and wait for at least one completion.
        loop {
            match ring.submit_and_wait(1) {
                Ok(_) => break,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e).context("io_uring submit failed"),
            }
        }

        // Drain all ready completions.
        let completed: Vec<(u64, i32)> = ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (user_data, res) in completed {
            let slot = user_data as usize;
            if res < 0 {
                return Err(std::io::Error::from_raw_os_error(-res))
                    .with_context(|| format!("io_uring operation failed in slot {}", slot));
            }

            let io_end = Instant::now();
            if let Some(io_start) = start_times[slot].take() {
                latency.record_duration(io_end.duration_since(io_start));
                trace.push(
                    Span {
                        start_ns: since_epoch_ns(epoch, io_start),
                        end_ns: since_epoch_ns(epoch, io_end),
                    },
                    || min_inflight_start(&start_times, epoch),
                );
            }
            io_count += 1;
            ops.fetch_add(1, Ordering::Relaxed);
            in_flight -= 1;
            free_slots.push(slot);
        }

        if done.load(Ordering::Acquire) {
            trace.flush();
            return Ok((io_count, latency));
        }
    }
}
