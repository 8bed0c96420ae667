//! Asynchronous-syscall driver (Linux native AIO)
//!
//! Structurally identical to the ring driver, but submission and reaping go
//! through io_submit/io_getevents. Raw syscalls are used instead of the
//! libaio C library to keep MIT license compatibility (libaio is LGPL).
//!
//! `io_getevents` is called with `min_nr = 1` only when every slot is in
//! flight; otherwise `min_nr = 0`, so submission is never blocked behind
//! completions while free slots remain.

use super::sync::{draw_is_read, next_offset, open_target, target_size, worker_seed, BUFFER_ALIGNMENT};
use super::{
    partition_queue_depth, run_to_completion, since_epoch_ns, Engine, Params, RunResult, Shared,
    Span, TraceBuffer, WorkerOutcome, FRONTIER_DRAINED,
};
use crate::stats::LatencyHistogram;
use crate::util::buffer::AlignedBuffer;
use crate::Result;
use anyhow::{bail, Context};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Kernel iocb layout (64-bit little-endian targets)
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoControlBlock {
    data: u64,
    key: u32,
    aio_rw_flags: u32,
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_setup, maxevents as libc::c_long, ctxp) as libc::c_int
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_destroy, ctx) as libc::c_int
}

unsafe fn io_submit(
    ctx: AioContext,
    nr: libc::c_long,
    iocbpp: *mut *mut IoControlBlock,
) -> libc::c_int {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp) as libc::c_int
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_int {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout) as libc::c_int
}

/// AIO context that tears itself down on every exit path
struct AioHandle {
    ctx: AioContext,
}

impl AioHandle {
    fn new(queue_depth: usize) -> Result<Self> {
        let mut ctx: AioContext = 0;
        let rc = unsafe { io_setup(queue_depth as libc::c_int, &mut ctx) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("io_setup failed with queue depth {}", queue_depth));
        }
        Ok(Self { ctx })
    }
}

impl Drop for AioHandle {
    fn drop(&mut self) {
        unsafe {
            io_destroy(self.ctx);
        }
    }
}

pub struct LibaioEngine;

impl LibaioEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LibaioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for LibaioEngine {
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

    let aio = AioHandle::new(qd)?;

    let mut arena = AlignedBuffer::new(params.block_size * qd, BUFFER_ALIGNMENT);
    if params.read_pct < 100 {
        arena.fill_random(worker_seed(id));
    }

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(worker_seed(id));
    let mut latency = LatencyHistogram::new();
    let mut trace = TraceBuffer::new(params.trace.clone(), id);

    let mut free_slots: Vec<usize> = (0..qd).collect();
    let mut start_times: Vec<Option<Instant>> = vec![None; qd];
    let mut iocbs: Vec<IoControlBlock> = vec![IoControlBlock::default(); qd];
    let mut iocb_ptrs: Vec<*mut IoControlBlock> = vec![ptr::null_mut(); qd];
    let mut events: Vec<IoEvent> = vec![IoEvent::default(); qd];

    let mut in_flight = 0usize;
    let mut io_count = 0u64;
    let mut last_offset = rng.gen_range(0..max_blocks) * block_size;

    loop {
        // Prepare a control block for every free slot.
        let mut submit_count = 0usize;
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

            let buf_addr = unsafe { arena.as_mut_ptr().add(slot * params.block_size) } as u64;
            iocbs[slot] = IoControlBlock {
                data: slot as u64,
                aio_fildes: fd as u32,
                lio_opcode: if is_read { IOCB_CMD_PREAD } else { IOCB_CMD_PWRITE },
                buf: buf_addr,
                nbytes: params.block_size as u64,
                offset: offset as i64,
                ..IoControlBlock::default()
            };
            iocb_ptrs[submit_count] = &mut iocbs[slot];
            start_times[slot] = Some(Instant::now());
            submit_count += 1;
            in_flight += 1;
        }

        if submit_count > 0 {
            // SAFETY: the control blocks and their buffers stay alive and
            // untouched until the matching events are reaped.
            let submitted =
                unsafe { io_submit(aio.ctx, submit_count as libc::c_long, iocb_ptrs.as_mut_ptr()) };
            if submitted < 0 {
                return Err(std::io::Error::last_os_error()).context("io_submit failed");
            }
            if submitted as usize != submit_count {
                bail!("io_submit accepted {} of {} requests", submitted, submit_count);
            }
        }

        if in_flight > 0 {
            let min_nr: libc::c_long = if in_flight == qd { 1 } else { 0 };
            let reaped = unsafe {
                io_getevents(
                    aio.ctx,
                    min_nr,
                    qd as libc::c_long,
                    events.as_mut_ptr(),
                    ptr::null_mut(),
                )
            };
            if reaped < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(err).context("io_getevents failed");
                }
            } else {
                for event in &events[..reaped as usize] {
                    let slot = event.data as usize;
                    if event.res < 0 {
                        return Err(std::io::Error::from_raw_os_error(-event.res as i32))
                            .with_context(|| format!("aio operation failed in slot {}", slot));
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
            }
        }

        if done.load(Ordering::Acquire) {
            trace.flush();
            return Ok((io_count, latency));
        }
    }
}
