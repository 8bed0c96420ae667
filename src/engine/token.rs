//! Global in-flight-operations cap
//!
//! A bounded channel pre-filled with one token per queue slot. Workers
//! acquire exactly one token before issuing an I/O and release it after
//! completion regardless of success, so the number of concurrent operations
//! across all workers never exceeds the global queue depth.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often a blocked acquire re-checks the shutdown flag.
const ACQUIRE_POLL: Duration = Duration::from_millis(10);

/// Token bucket shared by all workers of one run
#[derive(Clone)]
pub struct TokenBucket {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl TokenBucket {
    /// Create a bucket holding `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            tx.send(()).expect("filling a fresh bounded channel cannot fail");
        }
        Self { tx, rx }
    }

    /// Acquire one token, or return `false` when the run is stopping
    ///
    /// Acquisition is the workers' only pure-wait cancellation point; the
    /// shutdown flag is observed within one poll interval.
    pub fn acquire(&self, done: &AtomicBool) -> bool {
        loop {
            if done.load(Ordering::Acquire) {
                return false;
            }
            match self.rx.recv_timeout(ACQUIRE_POLL) {
                Ok(()) => return true,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Return one token
    pub fn release(&self) {
        // Can only fail if the bucket is over-released, which would be a
        // worker accounting bug; dropping the token is the safe outcome.
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_acquire_release() {
        let bucket = TokenBucket::new(2);
        let done = AtomicBool::new(false);

        assert!(bucket.acquire(&done));
        assert!(bucket.acquire(&done));
        bucket.release();
        assert!(bucket.acquire(&done));
    }

    #[test]
    fn test_acquire_observes_shutdown() {
        let bucket = TokenBucket::new(1);
        let done = AtomicBool::new(false);
        assert!(bucket.acquire(&done));

        // Bucket is empty; a second acquire must unblock on the flag.
        done.store(true, Ordering::Release);
        assert!(!bucket.acquire(&done));
    }

    #[test]
    fn test_concurrency_never_exceeds_capacity() {
        let capacity = 4;
        let bucket = TokenBucket::new(capacity);
        let done = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let bucket = bucket.clone();
            let done = done.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if !bucket.acquire(&done) {
                        return;
                    }
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::yield_now();
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    bucket.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= capacity);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
